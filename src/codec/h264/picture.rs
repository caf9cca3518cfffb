// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use log::debug;

use crate::codec::h264::syntax::RefPicMarking;
use crate::codec::h264::syntax::Slice;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity.
    pub fn opposite(self) -> Self {
        match self {
            Field::Frame => Field::Frame,
            Field::Top => Field::Bottom,
            Field::Bottom => Field::Top,
        }
    }
}

/// Reference class of a picture. A picture is short-term or long-term but
/// never both; `long_term_frame_idx` and `long_term_pic_num` are only
/// meaningful in the `LongTerm` state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// Data associated with an H.264 picture: the slice header values the
/// stateful algorithms need, plus the derived numbering and marking state
/// that clauses 8.2.1, 8.2.4 and 8.2.5 mutate while the picture lives in the
/// DPB.
#[derive(Debug, Default)]
pub struct PictureData {
    pub pic_order_cnt_type: u8,
    pub pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,

    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    /// PicOrderCnt(this): the minimum of the field order counts present in
    /// the picture.
    pub pic_order_cnt: i32,

    pub frame_num: i32,
    pub frame_num_offset: i32,
    /// FrameNumWrap, derived by 8.2.4.1 relative to the current picture.
    pub frame_num_wrap: i32,
    /// PicNum, derived by 8.2.4.1. Only meaningful while short-term.
    pub pic_num: i32,

    /// Only meaningful while long-term.
    pub long_term_frame_idx: u32,
    /// LongTermPicNum, derived by 8.2.4.1. Only meaningful while long-term.
    pub long_term_pic_num: u32,

    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    /// Coding type of the first slice of the picture.
    pub pic_type: SliceType,

    pub field: Field,

    /// An inferred frame synthesized for a gap in frame_num (8.2.5.2). Such
    /// frames are short-term references but are never output and have no
    /// backing surface.
    pub nonexisting: bool,

    /// Whether the picture is eligible for output at all. Always set for
    /// decoded pictures, never for non-existing ones.
    pub output_flag: bool,
    /// Whether the picture still awaits output from the DPB.
    pub needed_for_output: bool,

    pub has_mmco_5: bool,

    pub ref_pic_marking: RefPicMarking,

    /// Presentation timestamp, passed through to the output handle.
    pub timestamp: u64,

    pub(crate) reference: Reference,

    // The other field of a complementary pair, if any. `Weak` in one
    // direction would still leak on a cycle of two `Rc`s, so both directions
    // are `Weak` and the DPB keeps the pictures alive.
    pub(crate) other_field: Option<Weak<RefCell<PictureData>>>,
    pub(crate) is_second_field: bool,
}

impl PictureData {
    /// Builds the picture state for a new frame or field started by `slice`.
    pub fn new_from_slice(slice: &Slice, sps: &Sps, timestamp: u64) -> Self {
        let hdr = &slice.header;

        let is_idr = if slice.nalu.idr_pic_flag {
            IsIdr::Yes {
                idr_pic_id: hdr.idr_pic_id,
            }
        } else {
            IsIdr::No
        };

        let reference = if slice.nalu.ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        // If delta_pic_order_cnt[..] are absent they are inferred to be 0,
        // which Default already provides on the header.
        PictureData {
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb: i32::from(hdr.pic_order_cnt_lsb),
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0: hdr.delta_pic_order_cnt[0],
            delta_pic_order_cnt1: hdr.delta_pic_order_cnt[1],
            frame_num: i32::from(hdr.frame_num),
            nal_ref_idc: slice.nalu.ref_idc,
            is_idr,
            pic_type: hdr.slice_type,
            field: hdr.field(),
            output_flag: true,
            ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            timestamp,
            reference,
            ..Default::default()
        }
    }

    /// Builds a "non-existing" frame inferred for a frame_num gap, as per
    /// 8.2.5.2. It takes part in reference marking but is never output.
    pub fn new_non_existing(frame_num: i32, timestamp: u64) -> Self {
        PictureData {
            frame_num,
            nonexisting: true,
            nal_ref_idc: 1,
            field: Field::Frame,
            timestamp,
            reference: Reference::ShortTerm,
            ..Default::default()
        }
    }

    /// Whether the picture is a reference, either short-term or long-term.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Changes the reference class of this picture, optionally propagating
    /// it to the other field of its complementary pair.
    pub fn set_reference(&mut self, reference: Reference, apply_to_other_field: bool) {
        debug!(
            "Set reference of POC {} to {:?} (apply to other field: {})",
            self.pic_order_cnt, reference, apply_to_other_field
        );

        self.reference = reference;

        if apply_to_other_field {
            if let Some(other_field) = self.other_field() {
                other_field.borrow_mut().reference = reference;
            }
        }
    }

    /// Whether this picture is the second field of a complementary pair in
    /// decoding order.
    pub fn is_second_field(&self) -> bool {
        self.is_second_field
    }

    /// The other field of the complementary pair, if the pair exists and its
    /// other half is still alive.
    pub fn other_field(&self) -> Option<Rc<RefCell<PictureData>>> {
        self.other_field.as_ref().and_then(Weak::upgrade)
    }

    /// Whether this is the second field of a complementary pair whose first
    /// field is a reference picture.
    pub fn is_second_field_of_complementary_ref_pair(&self) -> bool {
        self.is_second_field
            && self
                .other_field()
                .map(|f| f.borrow().is_ref())
                .unwrap_or(false)
    }

    /// Links this picture as the second field of `first_field`.
    pub fn set_first_field_to(&mut self, first_field: &Rc<RefCell<PictureData>>) {
        self.other_field = Some(Rc::downgrade(first_field));
        self.is_second_field = true;
    }

    /// Links `second_field` as the pair of this (first) field.
    pub fn set_second_field_to(&mut self, second_field: &Rc<RefCell<PictureData>>) {
        self.other_field = Some(Rc::downgrade(second_field));
        self.is_second_field = false;
    }

    /// Splits a decoded frame into a complementary field pair, turning
    /// `frame` into its first field in output order and returning the newly
    /// created second field. Both fields share the same backing surface;
    /// splitting makes per-field reference marking uniform on interlaced
    /// streams.
    pub fn split_frame(frame: &Rc<RefCell<PictureData>>) -> Rc<RefCell<PictureData>> {
        let mut first = frame.borrow_mut();

        assert!(matches!(first.field, Field::Frame));
        assert!(first.other_field.is_none());

        debug!(
            "Splitting frame with POC {} into complementary fields",
            first.pic_order_cnt
        );

        // The field with the smaller order count precedes the other one.
        let (first_field, second_field) =
            if first.top_field_order_cnt <= first.bottom_field_order_cnt {
                (Field::Top, Field::Bottom)
            } else {
                (Field::Bottom, Field::Top)
            };

        let second_poc = std::cmp::max(first.top_field_order_cnt, first.bottom_field_order_cnt);

        let second = Rc::new(RefCell::new(PictureData {
            pic_order_cnt_type: first.pic_order_cnt_type,
            top_field_order_cnt: first.top_field_order_cnt,
            bottom_field_order_cnt: first.bottom_field_order_cnt,
            pic_order_cnt: second_poc,
            frame_num: first.frame_num,
            frame_num_offset: first.frame_num_offset,
            nal_ref_idc: first.nal_ref_idc,
            is_idr: first.is_idr,
            pic_type: first.pic_type,
            field: second_field,
            nonexisting: first.nonexisting,
            output_flag: first.output_flag,
            timestamp: first.timestamp,
            reference: first.reference,
            other_field: Some(Rc::downgrade(frame)),
            is_second_field: true,
            ..Default::default()
        }));

        first.field = first_field;
        first.pic_order_cnt =
            std::cmp::min(first.top_field_order_cnt, first.bottom_field_order_cnt);
        first.other_field = Some(Rc::downgrade(&second));

        second
    }
}
