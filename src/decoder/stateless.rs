// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless refers to the backend API targeted by these decoders: the
//! decoder itself holds all the decoding state (DPB, POC recurrence,
//! reference bookkeeping) so the backend doesn't need to. The
//! [`StatelessDecoder`] struct is the basis: it combines a codec with a
//! backend, after which pre-parsed stream units can be submitted through the
//! codec-specific `decode` method.

pub mod h264;

use thiserror::Error;

use crate::decoder::BlockingMode;
use crate::decoder::DecodedHandle;
use crate::decoder::ReadyFramesQueue;
use crate::decoder::StreamInfo;
use crate::decoder::SurfacePool;
use crate::Resolution;

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Error returned by the `decode` method of a stateless decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A structured syntax element carried a value the decoding process
    /// cannot work with. Fatal to the current access unit; decoding can
    /// resume at the next one.
    #[error("invalid syntax element: {0}")]
    InvalidSyntax(String),
    /// The stream requires a profile this decoder does not implement.
    /// Raised on SPS activation, before any picture of the sequence is
    /// decoded.
    #[error("unsupported profile_idc {0}")]
    UnsupportedProfile(u8),
    /// The stream uses a chroma format this decoder does not implement.
    /// Raised on SPS activation, before any picture of the sequence is
    /// decoded.
    #[error("unsupported chroma_format_idc {0}")]
    UnsupportedChromaFormat(u8),
    /// No output surface is available for a new picture. The caller must
    /// drain pending frames and retry the same unit.
    #[error("not enough output buffers available to continue, need {0} more")]
    NotEnoughOutputBuffers(usize),
    /// The DPB is over capacity and the bumping process cannot make room.
    /// Fatal for the current picture only; prior DPB state is preserved.
    #[error("DPB is over capacity and no stored picture can be bumped")]
    DpbOverflow,
    #[error(transparent)]
    DecoderError(#[from] anyhow::Error),
    #[error(transparent)]
    BackendError(#[from] StatelessBackendError),
}

/// Stream-level state of a stateless decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum DecodingState {
    /// The decoder ignores every unit until stream parameters pass by.
    #[default]
    AwaitingStreamInfo,
    /// The decoder is processing units.
    Decoding,
    /// The decoder was flushed and resumes at the next IDR picture.
    Reset,
}

/// Common trait of all stateless decoder backends, providing the
/// codec-independent surface plumbing.
pub trait StatelessDecoderBackend {
    /// The type of handle the backend hands back for a decoded picture.
    type Handle: DecodedHandle;

    /// Returns the current stream parameters, once known.
    fn stream_info(&self) -> Option<&StreamInfo>;

    /// Returns the surface pool in use by the backend.
    fn surface_pool(&mut self) -> &mut dyn SurfacePool;
}

/// The backend-specific object a codec carries for the picture currently
/// being decoded, from `new_picture` to `submit_picture`.
pub trait StatelessDecoderBackendPicture<Codec: StatelessCodec> {
    /// Backend-specific type representing a picture being decoded. Backends
    /// with no such state can use `()`.
    type Picture;
}

pub trait StatelessCodec: Sized {
    /// State the decoder keeps for this codec, typed by the backend's
    /// handle and picture types.
    type DecoderState<H: DecodedHandle, P>;
}

/// A struct that serves as a basis to implement a stateless decoder.
///
/// The codec type selects the decoding logic and its state; the backend is
/// the interface to the accelerator that performs the actual decode. This
/// struct only manages the stream-level state and the queue of frames in
/// output order; all algorithmic work lives with the codec.
pub struct StatelessDecoder<C, B>
where
    C: StatelessCodec,
    B: StatelessDecoderBackend + StatelessDecoderBackendPicture<C>,
{
    /// The current coded resolution.
    coded_resolution: Resolution,

    /// Whether to wait for the backend after submitting a picture.
    blocking_mode: BlockingMode,

    /// Frames in output order, ready for the client.
    ready_queue: ReadyFramesQueue<B::Handle>,

    decoding_state: DecodingState,

    /// Set once the end of the stream has been processed; reported through
    /// an event after the last frame.
    stream_ended: bool,

    /// The backend performing the actual decoding.
    backend: B,

    /// Codec-specific state.
    codec: C::DecoderState<B::Handle, B::Picture>,
}

impl<C, B> StatelessDecoder<C, B>
where
    C: StatelessCodec,
    B: StatelessDecoderBackend + StatelessDecoderBackendPicture<C>,
    C::DecoderState<B::Handle, B::Picture>: Default,
{
    pub fn new(backend: B, blocking_mode: BlockingMode) -> Self {
        Self {
            backend,
            blocking_mode,
            coded_resolution: Default::default(),
            decoding_state: Default::default(),
            stream_ended: false,
            ready_queue: Default::default(),
            codec: Default::default(),
        }
    }
}

impl<C, B> StatelessDecoder<C, B>
where
    C: StatelessCodec,
    B: StatelessDecoderBackend + StatelessDecoderBackendPicture<C>,
{
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.backend.stream_info()
    }

    pub fn surface_pool(&mut self) -> &mut dyn SurfacePool {
        self.backend.surface_pool()
    }
}
