// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 decode coordination.
//!
//! This module drives one access unit at a time through the stateful
//! pipeline: picture boundary detection (7.4.1.2.4), POC derivation (8.2.1),
//! reference list construction (8.2.4), hand-off to the accelerator
//! backend, reference marking (8.2.5) and DPB admission/bumping (C.4.5).
//!
//! Input arrives pre-parsed as [`StreamUnit`]s; this module never touches
//! the bitstream itself.

#[cfg(test)]
mod dummy;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use log::debug;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::dpb::StorePictureError;
use crate::codec::h264::marking;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::poc::PocState;
use crate::codec::h264::rpl;
use crate::codec::h264::rpl::ReferencePicLists;
use crate::codec::h264::syntax::MaxLongTermFrameIdx;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::Profile;
use crate::codec::h264::syntax::Slice;
use crate::codec::h264::syntax::Sps;
use crate::codec::h264::syntax::StreamUnit;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::DecodingState;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessCodec;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackend;
use crate::decoder::stateless::StatelessDecoderBackendPicture;
use crate::decoder::BlockingMode;
use crate::decoder::DecodedHandle;
use crate::decoder::DecoderEvent;
use crate::Resolution;

/// Accelerator methods specific to H.264. The backend receives fully
/// derived parameters and reference lists and performs the actual decode;
/// it never reports pixel data back.
pub trait StatelessH264DecoderBackend:
    StatelessDecoderBackend + StatelessDecoderBackendPicture<H264>
{
    /// Called when a new SPS is activated.
    fn new_sequence(&mut self, sps: &Rc<Sps>) -> StatelessBackendResult<()>;

    /// Called when the decoder determined that a new frame or field was
    /// found. This is where the backend acquires a surface for it.
    fn new_picture(
        &mut self,
        picture: &PictureData,
        timestamp: u64,
    ) -> StatelessBackendResult<Self::Picture>;

    /// Called for the second field of a complementary pair. Both fields
    /// decode to the surface of `first_field` and are presented together.
    fn new_field_picture(
        &mut self,
        picture: &PictureData,
        timestamp: u64,
        first_field: &Self::Handle,
    ) -> StatelessBackendResult<Self::Picture>;

    /// Called once per picture, before any slice is submitted.
    fn start_picture(
        &mut self,
        picture: &mut Self::Picture,
        picture_data: &PictureData,
        sps: &Sps,
        pps: &Pps,
        dpb: &Dpb<Self::Handle>,
        slice: &Slice,
    ) -> StatelessBackendResult<()>;

    /// Called once per slice with its final reference picture lists.
    /// `None` entries are missing-reference markers the backend must skip.
    #[allow(clippy::too_many_arguments)]
    fn decode_slice(
        &mut self,
        picture: &mut Self::Picture,
        slice: &Slice,
        sps: &Sps,
        pps: &Pps,
        ref_pic_list0: &[Option<DpbEntry<Self::Handle>>],
        ref_pic_list1: &[Option<DpbEntry<Self::Handle>>],
    ) -> StatelessBackendResult<()>;

    /// Called when all slices of `picture` have been submitted. Returns the
    /// handle the DPB retains for referencing and output.
    fn submit_picture(&mut self, picture: Self::Picture) -> StatelessBackendResult<Self::Handle>;
}

/// State of the picture being currently decoded, kept between slices of the
/// same access unit.
pub struct CurrentPicState<H, P> {
    /// Data for the current picture as derived from its first slice.
    pic: PictureData,
    /// Backend-specific state for the picture.
    backend_pic: P,
    /// Initial reference picture lists, derived once and shared by all the
    /// picture's slices.
    ref_pic_lists: ReferencePicLists<H>,
    /// First slice of the picture, the anchor of the 7.4.1.2.4 boundary
    /// checks.
    first_slice: Slice,
}

/// State of the H.264 decode coordinator.
pub struct H264DecoderState<H: DecodedHandle, P> {
    /// Parameter sets delivered by the external parser, keyed by id.
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,

    /// The decoded picture buffer.
    dpb: Dpb<H>,

    /// POC recurrence state (8.2.1).
    poc: PocState,

    cur_sps_id: u8,
    cur_pps_id: u8,

    /// MaxLongTermFrameIdx, driven by MMCO ops 4 and 5 and by IDR marking.
    max_long_term_frame_idx: MaxLongTermFrameIdx,

    /// A non-reference first field that could not enter the DPB, cached
    /// until its second field arrives so both are output together.
    last_field: Option<(Rc<RefCell<PictureData>>, H)>,

    /// The picture currently accumulating slices, if any.
    cur_pic: Option<CurrentPicState<H, P>>,
}

impl<H: DecodedHandle, P> Default for H264DecoderState<H, P> {
    fn default() -> Self {
        H264DecoderState {
            active_spses: Default::default(),
            active_ppses: Default::default(),
            dpb: Default::default(),
            poc: Default::default(),
            cur_sps_id: Default::default(),
            cur_pps_id: Default::default(),
            max_long_term_frame_idx: Default::default(),
            last_field: None,
            cur_pic: None,
        }
    }
}

impl<H: DecodedHandle + Clone, P> H264DecoderState<H, P> {
    fn get_sps(&self, id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&id)
    }

    fn get_pps(&self, id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&id)
    }

    /// Drains the DPB, returning the handles of all frames still pending
    /// output.
    fn drain(&mut self) -> Vec<H> {
        let handles = self.dpb.drain().into_iter().flatten().collect();
        self.last_field = None;
        handles
    }

    /// Find the first field of the pair the picture started by `slice`
    /// completes, if any.
    #[allow(clippy::type_complexity)]
    fn find_first_field(
        &self,
        slice: &Slice,
    ) -> anyhow::Result<Option<(Rc<RefCell<PictureData>>, H)>> {
        let mut prev_field = None;

        if self.dpb.interlaced() {
            if self.last_field.is_some() {
                prev_field = self.last_field.clone();
            } else if let Some(last_entry) = self.dpb.entries().last() {
                // The last stored picture may be an as-yet unpaired field.
                let prev_pic = last_entry.pic.borrow();

                if !matches!(prev_pic.field, Field::Frame) && prev_pic.other_field().is_none() {
                    if let Some(handle) = &last_entry.handle {
                        prev_field = Some((last_entry.pic.clone(), handle.clone()));
                    }
                }
            }
        }

        if !slice.header.field_pic_flag {
            if let Some(prev_field) = prev_field {
                let field = prev_field.0.borrow().field;
                return Err(anyhow!(
                    "expecting complementary field {:?}, got a frame",
                    field.opposite()
                ));
            }
        }

        let prev_field = match prev_field {
            None => return Ok(None),
            Some(prev_field) => prev_field,
        };

        let prev_field_pic = prev_field.0.borrow();

        if prev_field_pic.frame_num != i32::from(slice.header.frame_num) {
            return Err(anyhow!(
                "the previous field's frame_num {} differs from the current field's {}",
                prev_field_pic.frame_num,
                slice.header.frame_num
            ));
        }

        let cur_field = slice.header.field();
        if cur_field == prev_field_pic.field {
            let field = prev_field_pic.field;
            return Err(anyhow!(
                "expecting complementary field {:?}, got {:?}",
                field.opposite(),
                field
            ));
        }

        drop(prev_field_pic);
        Ok(Some(prev_field))
    }
}

pub struct H264;

impl StatelessCodec for H264 {
    type DecoderState<H: DecodedHandle, P> = H264DecoderState<H, P>;
}

impl<B> StatelessDecoder<H264, B>
where
    B: StatelessH264DecoderBackend,
    B::Handle: Clone,
{
    /// Submits one pre-parsed stream unit, in decoding order.
    ///
    /// Returns [`DecodeError::NotEnoughOutputBuffers`] when a new picture
    /// cannot start for lack of a free surface; the caller must drain
    /// pending events and retry the same unit.
    pub fn decode(&mut self, timestamp: u64, unit: StreamUnit) -> Result<(), DecodeError> {
        match unit {
            StreamUnit::Sps(sps) => self.process_sps(sps),
            StreamUnit::Pps(pps) => {
                self.codec.active_ppses.insert(pps.pic_parameter_set_id, pps);
                Ok(())
            }
            StreamUnit::Slice(slice) => self.process_slice(timestamp, slice),
            StreamUnit::SequenceEnd => self.finish_sequence(),
            StreamUnit::StreamEnd => {
                self.finish_sequence()?;
                self.stream_ended = true;
                self.decoding_state = DecodingState::Reset;
                Ok(())
            }
        }
    }

    /// Flushes the decoder: the current picture is discarded, pending
    /// frames are drained in output order, and every recurrence counter is
    /// reset. Decoding resumes at the next IDR picture.
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        if self.codec.cur_pic.take().is_some() {
            debug!("Dropping the incomplete picture in flight on flush");
        }

        let handles = self.codec.drain();
        self.ready_queue.extend(handles);

        self.codec.poc.reset();
        self.codec.max_long_term_frame_idx = Default::default();
        self.decoding_state = DecodingState::Reset;

        Ok(())
    }

    /// Returns the next pending event: a frame in output order, or the
    /// end-of-stream notification once all frames are out.
    pub fn next_event(&mut self) -> Option<DecoderEvent<B::Handle>> {
        if let Some(handle) = (&mut self.ready_queue).next() {
            return Some(DecoderEvent::FrameReady(handle));
        }

        if self.stream_ended {
            self.stream_ended = false;
            return Some(DecoderEvent::StreamEnded);
        }

        None
    }

    /// Fails fast on streams this decoder cannot handle, before any
    /// picture of the sequence is admitted.
    fn check_capabilities(sps: &Sps) -> Result<(), DecodeError> {
        let supported_profile = sps.profile_idc == Profile::Baseline as u8
            || sps.profile_idc == Profile::Main as u8
            || sps.profile_idc == Profile::High as u8;

        if !supported_profile {
            return Err(DecodeError::UnsupportedProfile(sps.profile_idc));
        }

        // 4:2:0 only.
        if sps.chroma_format_idc != 1 {
            return Err(DecodeError::UnsupportedChromaFormat(sps.chroma_format_idc));
        }

        Ok(())
    }

    fn negotiation_possible(&self, sps: &Sps) -> bool {
        let resolution = Resolution {
            width: sps.width(),
            height: sps.height(),
        };

        self.coded_resolution != resolution
            || self.codec.dpb.max_num_pics() != sps.max_dpb_frames()
            || self.codec.dpb.interlaced() != sps.interlaced()
    }

    /// Applies the parameters of `sps` to the decoder.
    fn apply_sps(&mut self, sps: &Sps) {
        let max_dpb_frames = sps.max_dpb_frames();

        let max_num_reorder_frames = sps.max_num_reorder_frames() as usize;
        let max_num_reorder_frames = if max_num_reorder_frames > max_dpb_frames {
            0
        } else {
            max_num_reorder_frames
        };

        let resolution = Resolution {
            width: sps.width(),
            height: sps.height(),
        };

        self.coded_resolution = resolution;
        self.backend.surface_pool().set_coded_resolution(resolution);

        self.codec
            .dpb
            .set_limits(max_dpb_frames, max_num_reorder_frames);
        self.codec.dpb.set_interlaced(sps.interlaced());
    }

    fn process_sps(&mut self, sps: Rc<Sps>) -> Result<(), DecodeError> {
        Self::check_capabilities(&sps)?;

        let negotiation_needed = self.negotiation_possible(&sps);

        self.codec
            .active_spses
            .insert(sps.seq_parameter_set_id, Rc::clone(&sps));

        if negotiation_needed {
            // The stream parameters change: the in-flight picture and the
            // DPB belong to the previous sequence.
            if let Some(cur_pic) = self.codec.cur_pic.take() {
                self.finish_picture(cur_pic)?;
            }
            let handles = self.codec.drain();
            self.ready_queue.extend(handles);

            self.backend.new_sequence(&sps)?;
            self.apply_sps(&sps);
        }

        if matches!(self.decoding_state, DecodingState::AwaitingStreamInfo) {
            self.decoding_state = DecodingState::Decoding;
        }

        Ok(())
    }

    fn finish_sequence(&mut self) -> Result<(), DecodeError> {
        if let Some(cur_pic) = self.codec.cur_pic.take() {
            self.finish_picture(cur_pic)?;
        }

        let handles = self.codec.drain();
        self.ready_queue.extend(handles);

        Ok(())
    }

    fn process_slice(&mut self, timestamp: u64, slice: Slice) -> Result<(), DecodeError> {
        match self.decoding_state {
            DecodingState::AwaitingStreamInfo => {
                debug!("Skipping slice: no stream information yet");
                return Ok(());
            }
            DecodingState::Reset => {
                if !slice.nalu.idr_pic_flag {
                    debug!("Skipping slice while waiting for an IDR picture");
                    return Ok(());
                }
                self.decoding_state = DecodingState::Decoding;
            }
            DecodingState::Decoding => (),
        }

        let is_new_picture = match &self.codec.cur_pic {
            Some(cur_pic) => self.is_new_picture(cur_pic, &slice)?,
            None => true,
        };

        if !is_new_picture {
            let mut cur_pic = self.codec.cur_pic.take().unwrap();
            self.handle_slice(&mut cur_pic, &slice)?;
            self.codec.cur_pic = Some(cur_pic);
            return Ok(());
        }

        // Starting a picture acquires a surface; apply backpressure before
        // touching any state so the caller can retry the same unit.
        if self.backend.surface_pool().num_free_surfaces() == 0 {
            return Err(DecodeError::NotEnoughOutputBuffers(1));
        }

        if let Some(prev_pic) = self.codec.cur_pic.take() {
            self.finish_picture(prev_pic)?;
        }

        let mut cur_pic = self.begin_picture(timestamp, &slice)?;
        self.handle_slice(&mut cur_pic, &slice)?;
        self.codec.cur_pic = Some(cur_pic);

        Ok(())
    }

    /// Detection of the first VCL NAL unit of a primary coded picture
    /// (7.4.1.2.4): any mismatch on the checklist starts a new picture.
    fn is_new_picture(
        &self,
        cur_pic: &CurrentPicState<B::Handle, B::Picture>,
        slice: &Slice,
    ) -> Result<bool, DecodeError> {
        let prev_hdr = &cur_pic.first_slice.header;
        let hdr = &slice.header;

        if hdr.frame_num != prev_hdr.frame_num
            || hdr.pic_parameter_set_id != prev_hdr.pic_parameter_set_id
            || hdr.field_pic_flag != prev_hdr.field_pic_flag
        {
            return Ok(true);
        }

        if hdr.field_pic_flag
            && prev_hdr.field_pic_flag
            && hdr.bottom_field_flag != prev_hdr.bottom_field_flag
        {
            return Ok(true);
        }

        // nal_ref_idc parity: one of them is a reference, the other not.
        if (cur_pic.first_slice.nalu.ref_idc != 0) != (slice.nalu.ref_idc != 0) {
            return Ok(true);
        }

        let pps = self.codec.get_pps(hdr.pic_parameter_set_id).ok_or_else(|| {
            DecodeError::InvalidSyntax(format!(
                "no active PPS with id {}",
                hdr.pic_parameter_set_id
            ))
        })?;

        match pps.sps.pic_order_cnt_type {
            0 => {
                if hdr.pic_order_cnt_lsb != prev_hdr.pic_order_cnt_lsb {
                    return Ok(true);
                }
                if pps.bottom_field_pic_order_in_frame_present_flag
                    && !hdr.field_pic_flag
                    && hdr.delta_pic_order_cnt_bottom != prev_hdr.delta_pic_order_cnt_bottom
                {
                    return Ok(true);
                }
            }
            1 => {
                if hdr.delta_pic_order_cnt != prev_hdr.delta_pic_order_cnt {
                    return Ok(true);
                }
            }
            _ => (),
        }

        if slice.nalu.idr_pic_flag != cur_pic.first_slice.nalu.idr_pic_flag {
            return Ok(true);
        }

        if slice.nalu.idr_pic_flag && hdr.idr_pic_id != prev_hdr.idr_pic_id {
            return Ok(true);
        }

        Ok(false)
    }

    /// 8.2.5.2: synthesize and store "non-existing" frames for a gap in
    /// frame_num.
    fn handle_frame_num_gap(
        &mut self,
        sps: &Sps,
        frame_num: i32,
        timestamp: u64,
    ) -> Result<(), DecodeError> {
        if self.codec.dpb.is_empty() {
            return Ok(());
        }

        debug!("frame_num gap detected");

        if !sps.gaps_in_frame_num_value_allowed_flag {
            return Err(DecodeError::InvalidSyntax(format!(
                "invalid frame_num {}, assuming unintentional picture loss",
                frame_num
            )));
        }

        let max_frame_num = sps.max_frame_num() as i32;
        let mut unused_short_term_frame_num =
            (self.codec.poc.prev_ref_frame_num + 1) % max_frame_num;

        while unused_short_term_frame_num != frame_num {
            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num, timestamp);
            self.codec
                .poc
                .compute_pic_order_count(sps, &mut pic)
                .map_err(|e| DecodeError::InvalidSyntax(e.to_string()))?;

            self.codec
                .dpb
                .update_pic_nums(unused_short_term_frame_num, max_frame_num, &pic);

            marking::sliding_window_marking(&mut self.codec.dpb, &mut pic, sps)?;

            self.codec.dpb.remove_unused();
            let bumped: Vec<_> = self
                .codec
                .dpb
                .bump_as_needed(&pic)
                .into_iter()
                .flatten()
                .collect();
            self.ready_queue.extend(bumped);

            let pic_rc = Rc::new(RefCell::new(pic));

            if self.codec.dpb.interlaced() {
                let other_field = PictureData::split_frame(&pic_rc);

                self.add_to_dpb(pic_rc, None)?;
                self.add_to_dpb(other_field, None)?;
            } else {
                self.add_to_dpb(pic_rc, None)?;
            }

            unused_short_term_frame_num += 1;
            unused_short_term_frame_num %= max_frame_num;
        }

        Ok(())
    }

    /// Called once per picture to start it.
    fn begin_picture(
        &mut self,
        timestamp: u64,
        slice: &Slice,
    ) -> Result<CurrentPicState<B::Handle, B::Picture>, DecodeError> {
        if slice.nalu.idr_pic_flag {
            self.codec.poc.prev_ref_frame_num = 0;
        }

        let hdr = &slice.header;
        let frame_num = i32::from(hdr.frame_num);

        self.codec.cur_pps_id = hdr.pic_parameter_set_id;
        let pps = self
            .codec
            .get_pps(self.codec.cur_pps_id)
            .ok_or_else(|| {
                DecodeError::InvalidSyntax(format!(
                    "no active PPS with id {}",
                    hdr.pic_parameter_set_id
                ))
            })?
            .clone();

        let sps = Rc::clone(&pps.sps);
        self.codec.cur_sps_id = sps.seq_parameter_set_id;

        let max_frame_num = sps.max_frame_num() as i32;
        if frame_num != self.codec.poc.prev_ref_frame_num
            && frame_num != (self.codec.poc.prev_ref_frame_num + 1) % max_frame_num
        {
            self.handle_frame_num_gap(&sps, frame_num, timestamp)?;
        }

        let first_field = self.codec.find_first_field(slice)?;

        let mut pic = PictureData::new_from_slice(slice, &sps, timestamp);

        if let Some((first_field, _)) = &first_field {
            pic.set_first_field_to(first_field);
        }

        self.codec
            .poc
            .compute_pic_order_count(&sps, &mut pic)
            .map_err(|e| DecodeError::InvalidSyntax(e.to_string()))?;

        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            // C.4.5.3, clause 2: an IDR either outputs everything still
            // pending or discards it, by no_output_of_prior_pics_flag.
            if !pic.ref_pic_marking.no_output_of_prior_pics_flag {
                let handles = self.codec.drain();
                self.ready_queue.extend(handles);
            } else {
                self.codec.dpb.clear();
                self.codec.last_field = None;
            }
        }

        self.codec.dpb.update_pic_nums(frame_num, max_frame_num, &pic);
        let ref_pic_lists = rpl::build_ref_pic_lists(&self.codec.dpb, &pic);

        debug!("Decode picture POC {}", pic.pic_order_cnt);

        let mut backend_pic = match &first_field {
            Some((_, handle)) => self.backend.new_field_picture(&pic, timestamp, handle)?,
            None => self.backend.new_picture(&pic, timestamp)?,
        };

        self.backend.start_picture(
            &mut backend_pic,
            &pic,
            &sps,
            &pps,
            &self.codec.dpb,
            slice,
        )?;

        Ok(CurrentPicState {
            pic,
            backend_pic,
            ref_pic_lists,
            first_slice: slice.clone(),
        })
    }

    /// Handles one slice of the current picture.
    fn handle_slice(
        &mut self,
        cur_pic: &mut CurrentPicState<B::Handle, B::Picture>,
        slice: &Slice,
    ) -> Result<(), DecodeError> {
        let pps = self
            .codec
            .get_pps(self.codec.cur_pps_id)
            .ok_or_else(|| {
                DecodeError::InvalidSyntax(format!("no active PPS with id {}", self.codec.cur_pps_id))
            })?
            .clone();
        let sps = Rc::clone(&pps.sps);

        let slice_lists = rpl::create_slice_ref_pic_lists(
            &self.codec.dpb,
            &cur_pic.pic,
            &slice.header,
            self.codec.max_long_term_frame_idx,
            &cur_pic.ref_pic_lists,
        )
        .map_err(|e| DecodeError::InvalidSyntax(e.to_string()))?;

        self.backend.decode_slice(
            &mut cur_pic.backend_pic,
            slice,
            &sps,
            &pps,
            &slice_lists.ref_pic_list0,
            &slice_lists.ref_pic_list1,
        )?;

        Ok(())
    }

    /// 8.2.5: reference picture marking for a finished reference picture.
    fn reference_pic_marking(&mut self, pic: &mut PictureData) -> Result<(), DecodeError> {
        // 8.2.5.1, IDR rules.
        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            self.codec.dpb.mark_all_as_unused_for_ref();

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm, false);
                pic.long_term_frame_idx = 0;
                self.codec.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                pic.set_reference(Reference::ShortTerm, false);
                self.codec.max_long_term_frame_idx =
                    MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }

            return Ok(());
        }

        if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            marking::execute_adaptive_marking(
                &mut self.codec.dpb,
                pic,
                &mut self.codec.max_long_term_frame_idx,
            );
        } else {
            let sps = self
                .codec
                .get_sps(self.codec.cur_sps_id)
                .ok_or_else(|| {
                    DecodeError::InvalidSyntax(format!(
                        "no active SPS with id {}",
                        self.codec.cur_sps_id
                    ))
                })?
                .clone();
            marking::sliding_window_marking(&mut self.codec.dpb, pic, &sps)?;
        }

        Ok(())
    }

    fn add_to_dpb(
        &mut self,
        pic: Rc<RefCell<PictureData>>,
        handle: Option<B::Handle>,
    ) -> Result<(), DecodeError> {
        self.codec
            .dpb
            .add_picture(pic, handle, &mut self.codec.last_field)
            .map_err(|e| match e {
                StorePictureError::DpbIsFull => DecodeError::DpbOverflow,
                e => DecodeError::DecoderError(anyhow::Error::new(e)),
            })
    }

    /// Routes a picture that did not enter the DPB straight to the output
    /// queue, pairing fields as needed.
    fn add_to_ready_queue(&mut self, pic_rc: Rc<RefCell<PictureData>>, handle: B::Handle) {
        let pic = pic_rc.borrow();

        if matches!(pic.field, Field::Frame) {
            assert!(self.codec.last_field.is_none());

            self.ready_queue.push(handle);
        } else {
            match &self.codec.last_field {
                None => {
                    assert!(!pic.is_second_field());
                    drop(pic);

                    // Cache the field and wait for its pair.
                    self.codec.last_field = Some((pic_rc, handle));
                }
                Some(last_field)
                    if pic.is_second_field()
                        && pic
                            .other_field()
                            .map_or(false, |of| Rc::ptr_eq(&of, &last_field.0)) =>
                {
                    if let Some((field_pic, field_handle)) = self.codec.last_field.take() {
                        field_pic.borrow_mut().set_second_field_to(&pic_rc);
                        self.ready_queue.push(field_handle);
                    }
                }
                _ => {
                    // The last field is not paired with this one.
                    self.codec.last_field = None;
                }
            }
        }
    }

    /// Finishes the current picture: submit to the accelerator, run
    /// reference marking, and admit into the DPB per C.4.5.1/C.4.5.2.
    fn finish_picture(
        &mut self,
        pic: CurrentPicState<B::Handle, B::Picture>,
    ) -> Result<(), DecodeError> {
        debug!("Finishing picture POC {}", pic.pic.pic_order_cnt);

        // Hand-off in decode order; output order is the DPB's business.
        let handle = self.backend.submit_picture(pic.backend_pic)?;

        if self.blocking_mode == BlockingMode::Blocking {
            handle.sync()?;
        }

        let mut pic = pic.pic;

        if pic.is_ref() {
            self.reference_pic_marking(&mut pic)?;
            self.codec.poc.save_ref_pic(&pic);
        }

        self.codec.poc.save_pic(&pic);
        self.codec.dpb.remove_unused();

        if pic.has_mmco_5 {
            // C.4.5.3, clause 3.
            let handles = self.codec.drain();
            self.ready_queue.extend(handles);
        }

        // C.4.5.3, clauses 1, 4, 5 and 6.
        let bumped: Vec<_> = self
            .codec
            .dpb
            .bump_as_needed(&pic)
            .into_iter()
            .flatten()
            .collect();
        self.ready_queue.extend(bumped);

        let pic_rc = Rc::new(RefCell::new(pic));
        let pic = pic_rc.borrow();

        // C.4.5.1: a reference picture always enters the DPB (room was made
        // above). C.4.5.2: a non-reference picture enters only while there
        // is an empty frame buffer after bumping smaller POCs; otherwise it
        // is output directly.
        if pic.is_second_field_of_complementary_ref_pair()
            || pic.is_ref()
            || self.codec.dpb.has_empty_frame_buffer()
        {
            if self.codec.dpb.interlaced() && matches!(pic.field, Field::Frame) {
                drop(pic);

                // Split the frame into two complementary fields so that
                // per-field reference marking works uniformly.
                let other_field = PictureData::split_frame(&pic_rc);
                let other_field_handle = handle.clone();

                self.add_to_dpb(pic_rc, Some(handle))?;
                self.add_to_dpb(other_field, Some(other_field_handle))?;
            } else {
                drop(pic);
                self.add_to_dpb(pic_rc, Some(handle))?;
            }
        } else {
            drop(pic);
            self.add_to_ready_queue(pic_rc, handle);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::dummy::Backend;
    use super::*;
    use crate::codec::h264::syntax::Level;
    use crate::codec::h264::syntax::Mmco;
    use crate::codec::h264::syntax::NaluHeader;
    use crate::codec::h264::syntax::PpsBuilder;
    use crate::codec::h264::syntax::RefPicMarking;
    use crate::codec::h264::syntax::SliceHeaderBuilder;
    use crate::codec::h264::syntax::SliceType;
    use crate::codec::h264::syntax::SpsBuilder;

    fn test_sps() -> SpsBuilder {
        SpsBuilder::new()
            .seq_parameter_set_id(0)
            .profile_idc(Profile::High)
            .level_idc(Level::L4)
            .resolution(64, 64)
            .chroma_format_idc(1)
            .max_num_ref_frames(2)
            .frame_mbs_only_flag(true)
            .max_frame_num(16)
            .pic_order_cnt_type(0)
            .max_pic_order_cnt_lsb(256)
    }

    fn slice(pps: &Pps, frame_num: u16, lsb: u16, idr: bool, ref_idc: u8) -> Slice {
        let hdr = SliceHeaderBuilder::new(pps)
            .slice_type(if idr { SliceType::I } else { SliceType::P })
            .frame_num(frame_num)
            .pic_order_cnt_lsb(lsb)
            .build();

        let nal_unit_type = if idr { 5 } else { 1 };

        Slice {
            header: hdr,
            nalu: NaluHeader::new(nal_unit_type, ref_idc, 0, 1024).unwrap(),
        }
    }

    fn decoder_with_sps(sps: Rc<Sps>) -> (StatelessDecoder<H264, Backend>, Rc<Pps>) {
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();
        let mut decoder = StatelessDecoder::<H264, Backend>::new_dummy(BlockingMode::Blocking);
        decoder.decode(0, StreamUnit::Sps(sps)).unwrap();
        decoder.decode(0, StreamUnit::Pps(Rc::clone(&pps))).unwrap();
        (decoder, pps)
    }

    fn new_decoder() -> (StatelessDecoder<H264, Backend>, Rc<Pps>) {
        decoder_with_sps(test_sps().build())
    }

    /// Drains pending events, returning the output frame timestamps and
    /// whether the stream-end event fired.
    fn frames_out(decoder: &mut StatelessDecoder<H264, Backend>) -> (Vec<u64>, bool) {
        let mut timestamps = vec![];
        let mut ended = false;

        while let Some(event) = decoder.next_event() {
            match event {
                DecoderEvent::FrameReady(handle) => timestamps.push(handle.timestamp()),
                DecoderEvent::StreamEnded => ended = true,
            }
        }

        (timestamps, ended)
    }

    // Decoding well past the DPB capacity must keep the buffer bounded:
    // the sliding window unmarks old references and bumping evicts them.
    #[test]
    fn dpb_capacity_is_never_exceeded() {
        let _ = env_logger::builder().is_test(true).try_init();

        let (mut decoder, pps) = new_decoder();

        decoder
            .decode(0, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();

        let dpb_size = decoder.codec.dpb.max_num_pics();
        assert_eq!(dpb_size, 16);

        for i in 1..=(dpb_size as u64 + 5) {
            let s = slice(&pps, (i % 16) as u16, (i * 2) as u16, false, 1);
            decoder.decode(i, StreamUnit::Slice(s)).unwrap();
            assert!(decoder.codec.dpb.len() <= dpb_size);
        }
    }

    #[test]
    fn frames_output_in_poc_order() {
        let (mut decoder, pps) = new_decoder();

        // Decode order POC: 0, 8, 4, 2, 6.
        decoder
            .decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();
        decoder
            .decode(2, StreamUnit::Slice(slice(&pps, 1, 8, false, 1)))
            .unwrap();
        decoder
            .decode(3, StreamUnit::Slice(slice(&pps, 2, 4, false, 1)))
            .unwrap();
        decoder
            .decode(4, StreamUnit::Slice(slice(&pps, 3, 2, false, 1)))
            .unwrap();
        decoder
            .decode(5, StreamUnit::Slice(slice(&pps, 4, 6, false, 1)))
            .unwrap();
        decoder.decode(6, StreamUnit::StreamEnd).unwrap();

        // Submission to the backend happened in decode order.
        let submitted: Vec<_> = decoder.backend.submitted.iter().map(|s| s.0).collect();
        assert_eq!(submitted, vec![1, 2, 3, 4, 5]);

        // Output follows POC order: 0, 2, 4, 6, 8.
        let (timestamps, ended) = frames_out(&mut decoder);
        assert_eq!(timestamps, vec![1, 4, 3, 5, 2]);
        assert!(ended);
    }

    #[test]
    fn slices_accumulate_until_a_picture_boundary() {
        let (mut decoder, pps) = new_decoder();

        let first = slice(&pps, 0, 0, true, 1);
        let mut second = first.clone();
        second.header.first_mb_in_slice = 8;

        decoder.decode(1, StreamUnit::Slice(first)).unwrap();
        decoder.decode(1, StreamUnit::Slice(second)).unwrap();
        // Different frame_num: picture boundary.
        decoder
            .decode(2, StreamUnit::Slice(slice(&pps, 1, 4, false, 1)))
            .unwrap();
        decoder.decode(3, StreamUnit::StreamEnd).unwrap();

        assert_eq!(decoder.backend.submitted.len(), 2);
        let (_, _, num_slices) = decoder.backend.submitted[0];
        assert_eq!(num_slices, 2);
        let (_, _, num_slices) = decoder.backend.submitted[1];
        assert_eq!(num_slices, 1);

        // The P slice saw exactly num_ref_idx_l0_active_minus1 + 1 entries
        // in its list 0 and none in list 1.
        assert_eq!(*decoder.backend.ref_list_sizes.last().unwrap(), (1, 0));
    }

    #[test]
    fn idr_flushes_dpb_and_resets_poc_recurrence() {
        let (mut decoder, pps) = new_decoder();

        decoder
            .decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();
        for i in 2..=4u64 {
            let s = slice(&pps, (i - 1) as u16, ((i - 1) * 2) as u16, false, 1);
            decoder.decode(i, StreamUnit::Slice(s)).unwrap();
        }

        let mut second_idr = slice(&pps, 0, 0, true, 1);
        second_idr.header.idr_pic_id = 1;
        decoder.decode(5, StreamUnit::Slice(second_idr)).unwrap();

        // Everything prior to the IDR was drained in POC order.
        let (timestamps, _) = frames_out(&mut decoder);
        assert_eq!(timestamps, vec![1, 2, 3, 4]);
        assert!(decoder.codec.dpb.is_empty());

        // Finish the IDR by starting another picture: the POC recurrence
        // must restart from zero regardless of prior stream state.
        decoder
            .decode(6, StreamUnit::Slice(slice(&pps, 1, 2, false, 1)))
            .unwrap();
        assert_eq!(decoder.codec.poc.prev_ref_pic_order_cnt_msb, 0);
        assert_eq!(decoder.codec.poc.prev_ref_pic_order_cnt_lsb, 0);
        assert_eq!(decoder.codec.dpb.len(), 1);
    }

    #[test]
    fn mmco_5_empties_dpb_and_rebases_poc() {
        let (mut decoder, pps) = new_decoder();

        decoder
            .decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();

        let mut s = slice(&pps, 1, 120, false, 1);
        s.header.dec_ref_pic_marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            ops: vec![Mmco::UnmarkAll],
            ..Default::default()
        };
        decoder.decode(2, StreamUnit::Slice(s)).unwrap();

        decoder.decode(3, StreamUnit::SequenceEnd).unwrap();

        assert!(decoder.codec.poc.prev_ref_has_mmco_5);
        assert_eq!(decoder.codec.poc.prev_ref_frame_num, 0);
        assert!(decoder.codec.dpb.is_empty());

        // The IDR went out on the MMCO 5 drain, the rebased picture after.
        let (timestamps, _) = frames_out(&mut decoder);
        assert_eq!(timestamps, vec![1, 2]);
    }

    #[test]
    fn stream_end_event_follows_the_last_frame() {
        let (mut decoder, pps) = new_decoder();

        decoder
            .decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();
        decoder.decode(2, StreamUnit::StreamEnd).unwrap();

        assert!(matches!(
            decoder.next_event(),
            Some(DecoderEvent::FrameReady(_))
        ));
        assert!(matches!(decoder.next_event(), Some(DecoderEvent::StreamEnded)));
        assert!(decoder.next_event().is_none());
    }

    #[test]
    fn unsupported_streams_fail_before_any_picture() {
        let mut decoder = StatelessDecoder::<H264, Backend>::new_dummy(BlockingMode::Blocking);

        let sps = test_sps().profile_idc(Profile::High422P).build();
        assert!(matches!(
            decoder.decode(0, StreamUnit::Sps(sps)),
            Err(DecodeError::UnsupportedProfile(122))
        ));

        let sps = test_sps().chroma_format_idc(2).build();
        assert!(matches!(
            decoder.decode(0, StreamUnit::Sps(sps)),
            Err(DecodeError::UnsupportedChromaFormat(2))
        ));

        assert!(decoder.backend.submitted.is_empty());
    }

    #[test]
    fn no_free_surfaces_applies_backpressure() {
        let backend = Backend::without_free_surfaces();
        let mut decoder = StatelessDecoder::<H264, Backend>::new(backend, BlockingMode::Blocking);

        let sps = test_sps().build();
        let pps = PpsBuilder::new(Rc::clone(&sps)).build();
        decoder.decode(0, StreamUnit::Sps(sps)).unwrap();
        decoder.decode(0, StreamUnit::Pps(Rc::clone(&pps))).unwrap();

        assert!(matches!(
            decoder.decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1))),
            Err(DecodeError::NotEnoughOutputBuffers(1))
        ));
    }

    #[test]
    fn frame_num_gap_synthesizes_non_existing_refs() {
        let sps = test_sps()
            .gaps_in_frame_num_value_allowed_flag(true)
            .build();
        let (mut decoder, pps) = decoder_with_sps(sps);

        decoder
            .decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();
        // frame_num jumps from 0 to 3: frames 1 and 2 are synthesized.
        decoder
            .decode(2, StreamUnit::Slice(slice(&pps, 3, 6, false, 1)))
            .unwrap();

        assert_eq!(decoder.codec.dpb.len(), 3);
        let non_existing = decoder
            .codec
            .dpb
            .entries()
            .iter()
            .filter(|e| e.pic.borrow().nonexisting)
            .count();
        assert_eq!(non_existing, 2);
    }

    #[test]
    fn frame_num_gap_is_an_error_when_gaps_are_disallowed() {
        let (mut decoder, pps) = new_decoder();

        decoder
            .decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();

        assert!(matches!(
            decoder.decode(2, StreamUnit::Slice(slice(&pps, 3, 6, false, 1))),
            Err(DecodeError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn flush_resets_and_resumes_on_idr() {
        let (mut decoder, pps) = new_decoder();

        decoder
            .decode(1, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();
        decoder
            .decode(2, StreamUnit::Slice(slice(&pps, 1, 2, false, 1)))
            .unwrap();

        decoder.flush().unwrap();
        let (timestamps, _) = frames_out(&mut decoder);
        // The picture in flight is dropped; only the finished one drains.
        assert_eq!(timestamps, vec![1]);

        // Non-IDR input is skipped until the next IDR.
        decoder
            .decode(3, StreamUnit::Slice(slice(&pps, 2, 4, false, 1)))
            .unwrap();
        assert!(decoder.codec.cur_pic.is_none());

        decoder
            .decode(4, StreamUnit::Slice(slice(&pps, 0, 0, true, 1)))
            .unwrap();
        assert!(decoder.codec.cur_pic.is_some());
    }
}
