// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateful core of an H.264 elementary-stream decoder.
//!
//! This crate implements the parts of an H.264 decoder that carry state
//! across access units: the decoded picture buffer (DPB), the picture order
//! count (POC) computation of clause 8.2.1, reference picture list
//! construction and modification (clause 8.2.4), and reference picture
//! marking (clause 8.2.5).
//!
//! Bitstream parsing and actual picture decoding are external collaborators.
//! The parser hands in structured syntax elements
//! ([`codec::h264::syntax::StreamUnit`]); the accelerator receives fully
//! populated reference lists and per-slice parameters through the
//! [`decoder::stateless::h264::StatelessH264DecoderBackend`] trait and never
//! exposes pixel data back to this crate.
//!
//! Pictures are handed to the accelerator in decode order and emitted for
//! output in POC order; those are two distinct guarantees and both are
//! upheld by the [`decoder::stateless::StatelessDecoder`] driving the DPB
//! bumping process.

pub mod codec;
pub mod decoder;

/// Frame resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(res: (u32, u32)) -> Self {
        Self {
            width: res.0,
            height: res.1,
        }
    }
}
