// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture marking, clause 8.2.5.
//!
//! Both marking modes run right after a reference picture finishes decoding
//! and before it enters the DPB: the sliding window (8.2.5.3) evicts the
//! oldest short-term reference once the window is full, the adaptive mode
//! (8.2.5.4) executes the slice's ordered MMCO command list. The IDR rules
//! of 8.2.5.1/8.2.5.2 are handled by the decode coordinator since they
//! involve flushing the whole DPB.

use std::rc::Rc;

use anyhow::Context;
use log::debug;
use log::warn;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::MaxLongTermFrameIdx;
use crate::codec::h264::syntax::Mmco;
use crate::codec::h264::syntax::Sps;

/// 8.2.5.3: sliding window decoded reference picture marking.
///
/// Errors when the window is full but holds no short-term picture to evict,
/// which only a non-conformant stream can produce.
pub fn sliding_window_marking<T: Clone>(
    dpb: &mut Dpb<T>,
    pic: &mut PictureData,
    sps: &Sps,
) -> anyhow::Result<()> {
    // The second field of a complementary reference field pair whose first
    // field is short-term is itself marked short-term, without eviction.
    if pic.is_second_field()
        && matches!(
            pic.other_field().unwrap().borrow().reference(),
            Reference::ShortTerm
        )
    {
        pic.set_reference(Reference::ShortTerm, false);
        return Ok(());
    }

    let mut num_ref_pics = dpb.num_ref_frames();
    let max_num_ref_frames = std::cmp::max(1, usize::from(sps.max_num_ref_frames));

    if num_ref_pics < max_num_ref_frames {
        return Ok(());
    }

    while num_ref_pics >= max_num_ref_frames {
        let to_unmark = dpb
            .find_short_term_lowest_frame_num_wrap()
            .context("no short-term picture to unmark in the sliding window")?;

        to_unmark
            .pic
            .borrow_mut()
            .set_reference(Reference::None, true);
        num_ref_pics -= 1;
    }

    Ok(())
}

/// 8.2.5.4: adaptive memory control decoded reference picture marking.
///
/// Commands naming pictures that are absent from the reference sets degrade
/// to a logged warning: later pictures can still be decoded against the
/// remaining references. `max_long_term_frame_idx` is updated in place by
/// ops 4 and 5.
pub fn execute_adaptive_marking<T: Clone>(
    dpb: &mut Dpb<T>,
    pic: &mut PictureData,
    max_long_term_frame_idx: &mut MaxLongTermFrameIdx,
) {
    let ops = pic.ref_pic_marking.ops.clone();

    for op in &ops {
        debug!("Executing {:?}", op);

        match *op {
            Mmco::UnmarkShortTerm {
                difference_of_pic_nums_minus1,
            } => unmark_short_term(dpb, pic, difference_of_pic_nums_minus1),
            Mmco::UnmarkLongTerm { long_term_pic_num } => {
                unmark_long_term(dpb, pic, long_term_pic_num)
            }
            Mmco::AssignLongTermFrameIdx {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            } => assign_long_term_frame_idx(
                dpb,
                pic,
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            ),
            Mmco::TruncateLongTerm {
                max_long_term_frame_idx: new_max,
            } => {
                truncate_long_term(dpb, new_max);
                *max_long_term_frame_idx = new_max;
            }
            Mmco::UnmarkAll => {
                unmark_all(dpb, pic);
                *max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }
            Mmco::MarkCurrentAsLongTerm {
                long_term_frame_idx,
            } => mark_current_as_long_term(dpb, pic, long_term_frame_idx),
        }
    }
}

// picNumX, see 8-39/8-40.
fn pic_num_x(pic: &PictureData, difference_of_pic_nums_minus1: u32) -> i32 {
    pic.pic_num - (difference_of_pic_nums_minus1 as i32 + 1)
}

// 8.2.5.4.1
fn unmark_short_term<T: Clone>(
    dpb: &mut Dpb<T>,
    pic: &PictureData,
    difference_of_pic_nums_minus1: u32,
) {
    let pic_num_x = pic_num_x(pic, difference_of_pic_nums_minus1);

    match dpb.find_short_term_with_pic_num(pic_num_x) {
        Some(to_mark) => {
            to_mark
                .pic
                .borrow_mut()
                .set_reference(Reference::None, matches!(pic.field, Field::Frame));
        }
        None => warn!(
            "MMCO 1 names pic_num {} but no such short-term reference exists",
            pic_num_x
        ),
    }
}

// 8.2.5.4.2
fn unmark_long_term<T: Clone>(dpb: &mut Dpb<T>, pic: &PictureData, long_term_pic_num: u32) {
    match dpb.find_long_term_with_long_term_pic_num(long_term_pic_num) {
        Some(to_mark) => {
            to_mark
                .pic
                .borrow_mut()
                .set_reference(Reference::None, matches!(pic.field, Field::Frame));
        }
        None => warn!(
            "MMCO 2 names long_term_pic_num {} but no such long-term reference exists",
            long_term_pic_num
        ),
    }
}

// 8.2.5.4.3: promotion of a short-term picture to long-term. Any picture
// already holding the target index is evicted first.
fn assign_long_term_frame_idx<T: Clone>(
    dpb: &mut Dpb<T>,
    pic: &PictureData,
    difference_of_pic_nums_minus1: u32,
    long_term_frame_idx: u32,
) {
    let pic_num_x = pic_num_x(pic, difference_of_pic_nums_minus1);

    let to_mark_pos = match dpb.find_short_term_with_pic_num_pos(pic_num_x) {
        Some(pos) => pos,
        None => {
            warn!(
                "MMCO 3 names pic_num {} but no such short-term reference exists",
                pic_num_x
            );
            return;
        }
    };

    let to_mark_rc = dpb.entries()[to_mark_pos].pic.clone();

    if to_mark_rc.borrow().nonexisting {
        warn!("MMCO 3 names a non-existing picture, skipping");
        return;
    }

    let to_mark_other_field = to_mark_rc.borrow().other_field();

    evict_long_term_with_idx(dpb, long_term_frame_idx, |candidate| {
        // A reference field already holding the index survives only while
        // it belongs to the complementary pair of picNumX.
        match candidate.other_field() {
            None => true,
            Some(other) => {
                !Rc::ptr_eq(&other, &to_mark_rc)
                    && to_mark_other_field.as_ref().map_or(true, |tof| {
                        !std::ptr::eq(tof.as_ptr() as *const PictureData, candidate)
                    })
            }
        }
    });

    let is_frame = matches!(pic.field, Field::Frame);
    {
        let mut to_mark = to_mark_rc.borrow_mut();
        to_mark.set_reference(Reference::LongTerm, is_frame);
        to_mark.long_term_frame_idx = long_term_frame_idx;
    }

    let to_mark_other_field_rc = to_mark_rc.borrow().other_field();
    if let Some(other_field) = to_mark_other_field_rc {
        let mut other_field = other_field.borrow_mut();
        if matches!(other_field.reference(), Reference::LongTerm) {
            other_field.long_term_frame_idx = long_term_frame_idx;

            debug!(
                "Assigned long_term_frame_idx {} to the other field, POC {}",
                long_term_frame_idx, other_field.pic_order_cnt
            );
        }
    }
}

// Shared eviction step of 8.2.5.4.3 and 8.2.5.4.6: a long-term frame or
// complementary pair holding `long_term_frame_idx` is fully unmarked; a lone
// reference field holding it is unmarked when `field_should_go` says so.
fn evict_long_term_with_idx<T: Clone>(
    dpb: &mut Dpb<T>,
    long_term_frame_idx: u32,
    field_should_go: impl Fn(&PictureData) -> bool,
) {
    for entry in dpb.entries() {
        let mut candidate = entry.pic.borrow_mut();

        let holds_idx = matches!(candidate.reference(), Reference::LongTerm)
            && candidate.long_term_frame_idx == long_term_frame_idx;

        if !holds_idx {
            continue;
        }

        let is_frame = matches!(candidate.field, Field::Frame);

        let is_complementary_pair = candidate
            .other_field()
            .map(|f| {
                let other = f.borrow();
                matches!(other.reference(), Reference::LongTerm)
                    && other.long_term_frame_idx == long_term_frame_idx
            })
            .unwrap_or(false);

        if is_frame || is_complementary_pair {
            candidate.set_reference(Reference::None, true);
            break;
        }

        if field_should_go(&candidate) {
            candidate.set_reference(Reference::None, false);
            break;
        }
    }
}

// 8.2.5.4.4
fn truncate_long_term<T: Clone>(dpb: &mut Dpb<T>, max_long_term_frame_idx: MaxLongTermFrameIdx) {
    for mut dpb_pic in dpb
        .pictures_mut()
        .filter(|pic| matches!(pic.reference(), Reference::LongTerm))
        .filter(|pic| max_long_term_frame_idx < pic.long_term_frame_idx)
    {
        dpb_pic.set_reference(Reference::None, false);
    }
}

// 8.2.5.4.5: everything becomes unusable for reference and the current
// picture restarts the frame_num and POC numbering. The coordinator drains
// the DPB afterwards (C.4.5.3, clause 3).
fn unmark_all<T: Clone>(dpb: &mut Dpb<T>, pic: &mut PictureData) {
    dpb.mark_all_as_unused_for_ref();

    pic.has_mmco_5 = true;

    // 7.4.3: the picture is inferred to have had frame_num 0 for all
    // subsequent use.
    pic.frame_num = 0;
    pic.frame_num_offset = 0;

    // 8.2.1: tempPicOrderCnt = PicOrderCnt(CurrPic); the field order counts
    // present in the picture are rebased by it.
    match pic.field {
        Field::Top => {
            pic.top_field_order_cnt = 0;
            pic.pic_order_cnt = 0;
        }
        Field::Bottom => {
            pic.bottom_field_order_cnt = 0;
            pic.pic_order_cnt = 0;
        }
        Field::Frame => {
            pic.top_field_order_cnt -= pic.pic_order_cnt;
            pic.bottom_field_order_cnt -= pic.pic_order_cnt;
            pic.pic_order_cnt = std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
        }
    }
}

// 8.2.5.4.6
fn mark_current_as_long_term<T: Clone>(
    dpb: &mut Dpb<T>,
    pic: &mut PictureData,
    long_term_frame_idx: u32,
) {
    let current_other_field = pic.other_field();

    evict_long_term_with_idx(dpb, long_term_frame_idx, |candidate| {
        // A lone reference field keeps the index only as part of the
        // current picture's complementary pair.
        current_other_field
            .as_ref()
            .map_or(true, |cof| {
                !std::ptr::eq(cof.as_ptr() as *const PictureData, candidate)
            })
    });

    let is_frame = matches!(pic.field, Field::Frame);

    let is_second_ref_field = pic.is_second_field()
        && matches!(
            pic.other_field().unwrap().borrow().reference(),
            Reference::LongTerm
        );

    pic.set_reference(Reference::LongTerm, is_frame || is_second_ref_field);
    pic.long_term_frame_idx = long_term_frame_idx;

    if is_second_ref_field {
        pic.other_field().unwrap().borrow_mut().long_term_frame_idx = long_term_frame_idx;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::codec::h264::syntax::SpsBuilder;

    fn short_term_pic(frame_num: i32, pic_num: i32) -> Rc<RefCell<PictureData>> {
        let pic = PictureData {
            pic_order_cnt: pic_num * 2,
            frame_num,
            frame_num_wrap: frame_num,
            pic_num,
            output_flag: true,
            ..Default::default()
        };
        let rc = Rc::new(RefCell::new(pic));
        rc.borrow_mut().set_reference(Reference::ShortTerm, false);
        rc
    }

    fn dpb_of(pics: Vec<Rc<RefCell<PictureData>>>) -> Dpb<i32> {
        let mut dpb = Dpb::default();
        dpb.set_limits(16, 0);
        for pic in pics {
            dpb.add_picture(pic, Some(0), &mut None).unwrap();
        }
        dpb
    }

    #[test]
    fn sliding_window_evicts_lowest_frame_num_wrap() {
        let sps = SpsBuilder::new().max_num_ref_frames(3).build();

        let mut dpb = dpb_of(vec![
            short_term_pic(3, 3),
            short_term_pic(1, 1),
            short_term_pic(2, 2),
        ]);

        let mut current = PictureData {
            nal_ref_idc: 1,
            ..Default::default()
        };

        sliding_window_marking(&mut dpb, &mut current, &sps).unwrap();

        // frame_num_wrap 1 was the oldest.
        let still_ref: Vec<_> = dpb
            .short_term_refs_iter()
            .map(|e| e.pic.borrow().frame_num)
            .collect();
        assert_eq!(still_ref, vec![3, 2]);
    }

    #[test]
    fn sliding_window_is_a_noop_below_the_window_size() {
        let sps = SpsBuilder::new().max_num_ref_frames(4).build();

        let mut dpb = dpb_of(vec![short_term_pic(1, 1), short_term_pic(2, 2)]);
        let mut current = PictureData::default();

        sliding_window_marking(&mut dpb, &mut current, &sps).unwrap();
        assert_eq!(dpb.num_ref_frames(), 2);
    }

    #[test]
    fn sliding_window_fails_without_short_term_candidates() {
        let sps = SpsBuilder::new().max_num_ref_frames(1).build();

        let lt = short_term_pic(1, 1);
        lt.borrow_mut().set_reference(Reference::LongTerm, false);
        let mut dpb = dpb_of(vec![lt]);

        let mut current = PictureData::default();
        assert!(sliding_window_marking(&mut dpb, &mut current, &sps).is_err());
    }

    #[test]
    fn mmco_unmark_short_term_by_pic_num() {
        let mut dpb = dpb_of(vec![short_term_pic(1, 1), short_term_pic(2, 2)]);

        let mut current = PictureData {
            pic_num: 3,
            ref_pic_marking: crate::codec::h264::syntax::RefPicMarking {
                adaptive_ref_pic_marking_mode_flag: true,
                // picNumX = 3 - (1 + 1) = 1.
                ops: vec![Mmco::UnmarkShortTerm {
                    difference_of_pic_nums_minus1: 1,
                }],
                ..Default::default()
            },
            ..Default::default()
        };

        let mut max_idx = MaxLongTermFrameIdx::default();
        execute_adaptive_marking(&mut dpb, &mut current, &mut max_idx);

        let still_ref: Vec<_> = dpb
            .short_term_refs_iter()
            .map(|e| e.pic.borrow().pic_num)
            .collect();
        assert_eq!(still_ref, vec![2]);
    }

    #[test]
    fn mmco_promotion_evicts_previous_index_holder() {
        let holder = short_term_pic(1, 1);
        {
            let mut p = holder.borrow_mut();
            p.set_reference(Reference::LongTerm, false);
            p.long_term_frame_idx = 0;
        }

        let mut dpb = dpb_of(vec![holder.clone(), short_term_pic(2, 2)]);

        let mut current = PictureData {
            pic_num: 4,
            ..Default::default()
        };
        current.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        current.ref_pic_marking.ops = vec![Mmco::AssignLongTermFrameIdx {
            // picNumX = 4 - (1 + 1) = 2.
            difference_of_pic_nums_minus1: 1,
            long_term_frame_idx: 0,
        }];

        let mut max_idx = MaxLongTermFrameIdx::Idx(0);
        execute_adaptive_marking(&mut dpb, &mut current, &mut max_idx);

        assert!(!holder.borrow().is_ref());

        let promoted: Vec<_> = dpb
            .long_term_refs_iter()
            .map(|e| {
                let p = e.pic.borrow();
                (p.pic_num, p.long_term_frame_idx)
            })
            .collect();
        assert_eq!(promoted, vec![(2, 0)]);
    }

    #[test]
    fn mmco_truncate_drops_higher_indices() {
        let mk_lt = |pic_num, idx| {
            let pic = short_term_pic(pic_num, pic_num);
            {
                let mut p = pic.borrow_mut();
                p.set_reference(Reference::LongTerm, false);
                p.long_term_frame_idx = idx;
            }
            pic
        };

        let mut dpb = dpb_of(vec![mk_lt(1, 0), mk_lt(2, 1), mk_lt(3, 2)]);

        let mut current = PictureData::default();
        current.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        current.ref_pic_marking.ops = vec![Mmco::TruncateLongTerm {
            max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(0),
        }];

        let mut max_idx = MaxLongTermFrameIdx::Idx(2);
        execute_adaptive_marking(&mut dpb, &mut current, &mut max_idx);

        assert_eq!(max_idx, MaxLongTermFrameIdx::Idx(0));
        let left: Vec<_> = dpb
            .long_term_refs_iter()
            .map(|e| e.pic.borrow().long_term_frame_idx)
            .collect();
        assert_eq!(left, vec![0]);
    }

    // MMCO 5 on a picture with POC 120: the POC rebases to 0 and every
    // stored reference is unmarked.
    #[test]
    fn mmco_5_rebases_poc_and_unmarks_everything() {
        let mut dpb = dpb_of(vec![short_term_pic(1, 1), short_term_pic(2, 2)]);

        let mut current = PictureData {
            frame_num: 7,
            frame_num_offset: 16,
            top_field_order_cnt: 120,
            bottom_field_order_cnt: 121,
            pic_order_cnt: 120,
            ..Default::default()
        };
        current.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        current.ref_pic_marking.ops = vec![Mmco::UnmarkAll];

        let mut max_idx = MaxLongTermFrameIdx::Idx(3);
        execute_adaptive_marking(&mut dpb, &mut current, &mut max_idx);

        assert_eq!(current.pic_order_cnt, 0);
        assert_eq!(current.top_field_order_cnt, 0);
        assert_eq!(current.bottom_field_order_cnt, 1);
        assert_eq!(current.frame_num, 0);
        assert_eq!(current.frame_num_offset, 0);
        assert!(current.has_mmco_5);
        assert_eq!(max_idx, MaxLongTermFrameIdx::NoLongTermFrameIndices);
        assert_eq!(dpb.num_ref_frames(), 0);
    }

    #[test]
    fn mmco_6_marks_current_as_long_term() {
        let mut dpb = dpb_of(vec![short_term_pic(1, 1)]);

        let mut current = PictureData::default();
        current.ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
        current.ref_pic_marking.ops = vec![Mmco::MarkCurrentAsLongTerm {
            long_term_frame_idx: 2,
        }];

        let mut max_idx = MaxLongTermFrameIdx::Idx(2);
        execute_adaptive_marking(&mut dpb, &mut current, &mut max_idx);

        assert!(matches!(*current.reference(), Reference::LongTerm));
        assert_eq!(current.long_term_frame_idx, 2);
    }
}
