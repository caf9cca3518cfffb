// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dummy backend that lets the decode coordinator run in isolation. It
//! records what the coordinator hands over so tests can assert on the
//! decode-order side of the pipeline.

use std::rc::Rc;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::Slice;
use crate::codec::h264::syntax::Sps;
use crate::decoder::stateless::h264::StatelessH264DecoderBackend;
use crate::decoder::stateless::h264::H264;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackend;
use crate::decoder::stateless::StatelessDecoderBackendPicture;
use crate::decoder::BlockingMode;
use crate::decoder::DecodedHandle;
use crate::decoder::StreamInfo;
use crate::decoder::SurfacePool;
use crate::Resolution;

/// What the backend knows about one submitted picture.
pub struct FrameRecord {
    timestamp: u64,
}

#[derive(Clone)]
pub struct Handle(Rc<FrameRecord>);

impl DecodedHandle for Handle {
    fn timestamp(&self) -> u64 {
        self.0.timestamp
    }

    fn coded_resolution(&self) -> Resolution {
        Resolution::from((320, 200))
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn sync(&self) -> StatelessBackendResult<()> {
        Ok(())
    }
}

pub struct Pool {
    free: usize,
    resolution: Resolution,
}

impl SurfacePool for Pool {
    fn coded_resolution(&self) -> Resolution {
        self.resolution
    }

    fn set_coded_resolution(&mut self, resolution: Resolution) {
        self.resolution = resolution;
    }

    fn num_free_surfaces(&self) -> usize {
        self.free
    }

    fn num_managed_surfaces(&self) -> usize {
        16
    }
}

pub struct Picture {
    timestamp: u64,
    poc: i32,
    num_slices: usize,
}

pub struct Backend {
    stream_info: Option<StreamInfo>,
    pool: Pool,
    /// (timestamp, poc, num_slices) per submitted picture, in decode order.
    pub submitted: Vec<(u64, i32, usize)>,
    /// (list0 len, list1 len) per decoded slice.
    pub ref_list_sizes: Vec<(usize, usize)>,
}

impl Backend {
    pub fn new() -> Self {
        Self {
            stream_info: None,
            pool: Pool {
                free: 16,
                resolution: Default::default(),
            },
            submitted: vec![],
            ref_list_sizes: vec![],
        }
    }

    pub fn without_free_surfaces() -> Self {
        let mut backend = Self::new();
        backend.pool.free = 0;
        backend
    }
}

impl StatelessDecoderBackend for Backend {
    type Handle = Handle;

    fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    fn surface_pool(&mut self) -> &mut dyn SurfacePool {
        &mut self.pool
    }
}

impl StatelessDecoderBackendPicture<H264> for Backend {
    type Picture = Picture;
}

impl StatelessH264DecoderBackend for Backend {
    fn new_sequence(&mut self, sps: &Rc<Sps>) -> StatelessBackendResult<()> {
        let resolution = Resolution::from((sps.width(), sps.height()));

        self.stream_info = Some(StreamInfo {
            min_num_surfaces: sps.max_dpb_frames() + 4,
            coded_resolution: resolution,
            display_resolution: resolution,
        });

        Ok(())
    }

    fn new_picture(
        &mut self,
        picture: &PictureData,
        timestamp: u64,
    ) -> StatelessBackendResult<Self::Picture> {
        Ok(Picture {
            timestamp,
            poc: picture.pic_order_cnt,
            num_slices: 0,
        })
    }

    fn new_field_picture(
        &mut self,
        picture: &PictureData,
        timestamp: u64,
        _: &Self::Handle,
    ) -> StatelessBackendResult<Self::Picture> {
        Ok(Picture {
            timestamp,
            poc: picture.pic_order_cnt,
            num_slices: 0,
        })
    }

    fn start_picture(
        &mut self,
        picture: &mut Self::Picture,
        picture_data: &PictureData,
        _: &Sps,
        _: &Pps,
        _: &Dpb<Self::Handle>,
        _: &Slice,
    ) -> StatelessBackendResult<()> {
        picture.poc = picture_data.pic_order_cnt;
        Ok(())
    }

    fn decode_slice(
        &mut self,
        picture: &mut Self::Picture,
        _: &Slice,
        _: &Sps,
        _: &Pps,
        ref_pic_list0: &[Option<DpbEntry<Self::Handle>>],
        ref_pic_list1: &[Option<DpbEntry<Self::Handle>>],
    ) -> StatelessBackendResult<()> {
        picture.num_slices += 1;
        self.ref_list_sizes
            .push((ref_pic_list0.len(), ref_pic_list1.len()));
        Ok(())
    }

    fn submit_picture(&mut self, picture: Self::Picture) -> StatelessBackendResult<Self::Handle> {
        self.submitted
            .push((picture.timestamp, picture.poc, picture.num_slices));

        Ok(Handle(Rc::new(FrameRecord {
            timestamp: picture.timestamp,
        })))
    }
}

impl StatelessDecoder<H264, Backend> {
    /// Creates a new instance of the decoder using the dummy backend.
    pub(crate) fn new_dummy(blocking_mode: BlockingMode) -> Self {
        Self::new(Backend::new(), blocking_mode)
    }
}
