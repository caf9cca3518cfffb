// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod stateless;

use std::collections::VecDeque;

use crate::decoder::stateless::StatelessBackendResult;
use crate::Resolution;

/// Current stream parameters, as derived from the active SPS.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Minimum number of surfaces required to decode the stream: the DPB
    /// plus a scratch margin for the picture being decoded.
    pub min_num_surfaces: usize,
    pub coded_resolution: Resolution,
    pub display_resolution: Resolution,
}

/// Instructs the decoder on whether it should block until a submitted
/// picture is fully decoded by the accelerator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// The handle type produced by a decoder backend for a decoded picture.
///
/// The handle is cheap to clone and remains valid while the picture is used
/// as a reference; this crate never inspects the pixels behind it.
pub trait DecodedHandle {
    /// Returns the timestamp of the picture.
    fn timestamp(&self) -> u64;

    /// Returns the coded resolution at the time this handle was decoded.
    fn coded_resolution(&self) -> Resolution;

    /// Returns `true` if this handle has been completely decoded.
    fn is_ready(&self) -> bool;

    /// Wait until this handle has been completely rendered.
    fn sync(&self) -> StatelessBackendResult<()>;
}

/// The pool the backend acquires output surfaces from, one per picture.
///
/// The pool is a bounded resource: when it runs dry the decoder returns a
/// backpressure error instead of blocking, and the caller retries after
/// draining pending output.
pub trait SurfacePool {
    fn coded_resolution(&self) -> Resolution;

    fn set_coded_resolution(&mut self, resolution: Resolution);

    /// Number of surfaces currently available for new pictures.
    fn num_free_surfaces(&self) -> usize;

    /// Total number of surfaces managed by the pool.
    fn num_managed_surfaces(&self) -> usize;
}

/// Events that can be retrieved using the `next_event` method of a decoder.
#[derive(Debug)]
pub enum DecoderEvent<H> {
    /// The next frame in output (POC) order has been decoded.
    FrameReady(H),
    /// The end of the stream was processed and all frames were emitted.
    StreamEnded,
}

/// Queue of decoded frames waiting to be handed to the client, in output
/// order.
pub(crate) struct ReadyFramesQueue<T> {
    queue: VecDeque<T>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<T> ReadyFramesQueue<T> {
    pub fn push(&mut self, handle: T) {
        self.queue.push_back(handle)
    }
}

impl<T> Extend<T> for ReadyFramesQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows draining the queue like an iterator without consuming it.
impl<'a, T> Iterator for &'a mut ReadyFramesQueue<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.pop_front()
    }
}
