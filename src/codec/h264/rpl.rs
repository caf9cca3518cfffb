// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture list construction (8.2.4.2) and modification (8.2.4.3).
//!
//! Initial lists are derived once per picture and shared by its slices; the
//! per-slice final lists apply the slice's modification commands on top and
//! are padded to the exact active size with missing-reference markers
//! (`None`) so the accelerator boundary never sees a short list.

use std::rc::Rc;

use anyhow::anyhow;
use log::debug;
use log::warn;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::MaxLongTermFrameIdx;
use crate::codec::h264::syntax::RefPicListModification;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::REF_LIST_MAX_SIZE;

/// The initial reference picture lists of a picture, derived once per
/// picture over the finalized DPB. Entries point into the DPB.
pub struct ReferencePicLists<T> {
    /// Initial RefPicList0 for P and SP slices.
    pub ref_pic_list_p0: Vec<DpbEntry<T>>,
    /// Initial RefPicList0 for B slices.
    pub ref_pic_list_b0: Vec<DpbEntry<T>>,
    /// Initial RefPicList1 for B slices.
    pub ref_pic_list_b1: Vec<DpbEntry<T>>,
}

impl<T> Default for ReferencePicLists<T> {
    fn default() -> Self {
        Self {
            ref_pic_list_p0: Default::default(),
            ref_pic_list_b0: Default::default(),
            ref_pic_list_b1: Default::default(),
        }
    }
}

/// RefPicList0 and RefPicList1 of one slice, after modification and
/// padding. `None` entries are missing-reference markers.
pub struct SliceRefPicLists<T> {
    pub ref_pic_list0: Vec<Option<DpbEntry<T>>>,
    pub ref_pic_list1: Vec<Option<DpbEntry<T>>>,
}

impl<T> Default for SliceRefPicLists<T> {
    fn default() -> Self {
        Self {
            ref_pic_list0: Default::default(),
            ref_pic_list1: Default::default(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum RefPicList {
    RefPicList0,
    RefPicList1,
}

fn sort_pic_num_descending<T>(pics: &mut [DpbEntry<T>]) {
    pics.sort_by_key(|e| std::cmp::Reverse(e.pic.borrow().pic_num));
}

fn sort_frame_num_wrap_descending<T>(pics: &mut [DpbEntry<T>]) {
    pics.sort_by_key(|e| std::cmp::Reverse(e.pic.borrow().frame_num_wrap));
}

fn sort_long_term_pic_num_ascending<T>(pics: &mut [DpbEntry<T>]) {
    pics.sort_by_key(|e| e.pic.borrow().long_term_pic_num);
}

fn sort_long_term_frame_idx_ascending<T>(pics: &mut [DpbEntry<T>]) {
    pics.sort_by_key(|e| e.pic.borrow().long_term_frame_idx);
}

fn sort_poc_descending<T>(pics: &mut [DpbEntry<T>]) {
    pics.sort_by_key(|e| std::cmp::Reverse(e.pic.borrow().pic_order_cnt));
}

fn sort_poc_ascending<T>(pics: &mut [DpbEntry<T>]) {
    pics.sort_by_key(|e| e.pic.borrow().pic_order_cnt);
}

// When RefPicList1 has more than one entry and is identical to RefPicList0,
// its first two entries are switched.
fn swap_b1_if_needed<T>(b0: &[DpbEntry<T>], b1: &mut [DpbEntry<T>]) {
    if b1.len() > 1 && b0.len() == b1.len() {
        let equals = b0
            .iter()
            .zip(b1.iter())
            .all(|(x0, x1)| Rc::ptr_eq(&x0.pic, &x1.pic));

        if equals {
            b1.swap(0, 1);
        }
    }
}

/// Copies from refFrameList(XShort|Long)Term into RefPicListX as per
/// 8.2.4.2.5: fields of the current parity first, alternating while both
/// parities remain, skipping fields of the wrong reference class.
fn init_ref_field_pic_list<T>(
    mut field: Field,
    reference_type: Reference,
    ref_frame_list: &mut Vec<DpbEntry<T>>,
    ref_pic_list: &mut Vec<DpbEntry<T>>,
) {
    // A missing or differently-marked field is ignored and the next
    // available reference field of the wanted parity is used instead.
    ref_frame_list.retain(|e| {
        let p = e.pic.borrow();
        !(p.nonexisting || *p.reference() != reference_type)
    });

    while let Some(position) = ref_frame_list.iter().position(|e| {
        let found = e.pic.borrow().field == field;

        if found {
            field = field.opposite();
        }

        found
    }) {
        let pic = ref_frame_list.remove(position);
        ref_pic_list.push(pic);
    }

    ref_pic_list.append(ref_frame_list);
}

/// 8.2.4.2.1, initialization process for the reference picture list for P
/// and SP slices in frames.
fn build_ref_pic_list_p<T: Clone>(dpb: &Dpb<T>) -> Vec<DpbEntry<T>> {
    let mut ref_pic_list_p0: Vec<_> = dpb
        .short_term_refs_iter()
        .filter(|e| !e.pic.borrow().is_second_field())
        .cloned()
        .collect();

    sort_pic_num_descending(&mut ref_pic_list_p0);

    let num_short_term_refs = ref_pic_list_p0.len();

    ref_pic_list_p0.extend(
        dpb.long_term_refs_iter()
            .filter(|e| !e.pic.borrow().is_second_field())
            .cloned(),
    );
    sort_long_term_pic_num_ascending(&mut ref_pic_list_p0[num_short_term_refs..]);

    assert!(ref_pic_list_p0.len() <= REF_LIST_MAX_SIZE);

    ref_pic_list_p0
}

/// 8.2.4.2.2, initialization process for the reference picture list for P
/// and SP slices in fields.
fn build_ref_field_pic_list_p<T: Clone>(dpb: &Dpb<T>, cur_pic: &PictureData) -> Vec<DpbEntry<T>> {
    let mut ref_pic_list_p0 = vec![];

    let mut ref_frame_list_0_short_term: Vec<_> = dpb.short_term_refs_iter().cloned().collect();
    sort_frame_num_wrap_descending(&mut ref_frame_list_0_short_term);

    let mut ref_frame_list_long_term: Vec<_> = dpb.long_term_refs_iter().cloned().collect();
    sort_long_term_pic_num_ascending(&mut ref_frame_list_long_term);

    // 8.2.4.2.5
    init_ref_field_pic_list(
        cur_pic.field,
        Reference::ShortTerm,
        &mut ref_frame_list_0_short_term,
        &mut ref_pic_list_p0,
    );
    init_ref_field_pic_list(
        cur_pic.field,
        Reference::LongTerm,
        &mut ref_frame_list_long_term,
        &mut ref_pic_list_p0,
    );

    assert!(ref_pic_list_p0.len() <= REF_LIST_MAX_SIZE);

    ref_pic_list_p0
}

/// 8.2.4.2.3, initialization process for reference picture lists for B
/// slices in frames.
fn build_ref_pic_list_b<T: Clone>(
    dpb: &Dpb<T>,
    cur_pic: &PictureData,
) -> (Vec<DpbEntry<T>>, Vec<DpbEntry<T>>) {
    let mut short_term_refs: Vec<_> = dpb
        .short_term_refs_iter()
        .filter(|e| !e.pic.borrow().is_second_field())
        .cloned()
        .collect();

    // With POC type 0, "non-existing" frames are not included in either
    // list (8.2.5.2).
    if cur_pic.pic_order_cnt_type == 0 {
        short_term_refs.retain(|e| !e.pic.borrow().nonexisting);
    }

    let mut ref_pic_list_b0 = vec![];
    let mut ref_pic_list_b1 = vec![];
    let mut remaining = vec![];

    // b0: short-term pictures with POC < current sorted by descending POC,
    // then those with POC >= current sorted ascending, then long-term
    // pictures by ascending long_term_pic_num.
    for entry in &short_term_refs {
        if entry.pic.borrow().pic_order_cnt < cur_pic.pic_order_cnt {
            ref_pic_list_b0.push(entry.clone());
        } else {
            remaining.push(entry.clone());
        }
    }

    sort_poc_descending(&mut ref_pic_list_b0);
    sort_poc_ascending(&mut remaining);
    ref_pic_list_b0.append(&mut remaining);

    let mut long_term_refs: Vec<_> = dpb
        .long_term_refs_iter()
        .filter(|e| !e.pic.borrow().nonexisting)
        .filter(|e| !e.pic.borrow().is_second_field())
        .cloned()
        .collect();
    sort_long_term_pic_num_ascending(&mut long_term_refs);

    ref_pic_list_b0.extend(long_term_refs.iter().cloned());

    // b1: the mirror image, ascending-then-descending, same long-term tail.
    for entry in &short_term_refs {
        if entry.pic.borrow().pic_order_cnt > cur_pic.pic_order_cnt {
            ref_pic_list_b1.push(entry.clone());
        } else {
            remaining.push(entry.clone());
        }
    }

    sort_poc_ascending(&mut ref_pic_list_b1);
    sort_poc_descending(&mut remaining);

    ref_pic_list_b1.append(&mut remaining);
    ref_pic_list_b1.extend(long_term_refs);

    swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

    assert!(ref_pic_list_b0.len() <= REF_LIST_MAX_SIZE);
    assert!(ref_pic_list_b1.len() <= REF_LIST_MAX_SIZE);

    (ref_pic_list_b0, ref_pic_list_b1)
}

/// 8.2.4.2.4, initialization process for reference picture lists for B
/// slices in fields.
fn build_ref_field_pic_list_b<T: Clone>(
    dpb: &Dpb<T>,
    cur_pic: &PictureData,
) -> (Vec<DpbEntry<T>>, Vec<DpbEntry<T>>) {
    let mut ref_pic_list_b0 = vec![];
    let mut ref_pic_list_b1 = vec![];
    let mut ref_frame_list_0_short_term = vec![];
    let mut ref_frame_list_1_short_term = vec![];
    let mut remaining = vec![];

    let mut short_term_refs: Vec<_> = dpb.short_term_refs_iter().cloned().collect();

    if cur_pic.pic_order_cnt_type == 0 {
        short_term_refs.retain(|e| !e.pic.borrow().nonexisting);
    }

    // refFrameList0ShortTerm: POC <= current descending, then POC > current
    // ascending. A preceding field of the same frame takes part with its
    // own POC (NOTE 3).
    for entry in &short_term_refs {
        if entry.pic.borrow().pic_order_cnt <= cur_pic.pic_order_cnt {
            ref_frame_list_0_short_term.push(entry.clone());
        } else {
            remaining.push(entry.clone());
        }
    }

    sort_poc_descending(&mut ref_frame_list_0_short_term);
    sort_poc_ascending(&mut remaining);
    ref_frame_list_0_short_term.append(&mut remaining);

    // refFrameList1ShortTerm: the mirror ordering (NOTE 4).
    for entry in &short_term_refs {
        if entry.pic.borrow().pic_order_cnt > cur_pic.pic_order_cnt {
            ref_frame_list_1_short_term.push(entry.clone());
        } else {
            remaining.push(entry.clone());
        }
    }

    sort_poc_ascending(&mut ref_frame_list_1_short_term);
    sort_poc_descending(&mut remaining);
    ref_frame_list_1_short_term.append(&mut remaining);

    // refFrameListLongTerm, ascending LongTermFrameIdx (NOTE 5).
    let mut ref_frame_list_long_term: Vec<_> = dpb
        .long_term_refs_iter()
        .filter(|e| !e.pic.borrow().nonexisting)
        .cloned()
        .collect();

    sort_long_term_frame_idx_ascending(&mut ref_frame_list_long_term);

    // 8.2.4.2.5
    let field = cur_pic.field;
    init_ref_field_pic_list(
        field,
        Reference::ShortTerm,
        &mut ref_frame_list_0_short_term,
        &mut ref_pic_list_b0,
    );
    init_ref_field_pic_list(
        field,
        Reference::LongTerm,
        &mut ref_frame_list_long_term.clone(),
        &mut ref_pic_list_b0,
    );

    init_ref_field_pic_list(
        field,
        Reference::ShortTerm,
        &mut ref_frame_list_1_short_term,
        &mut ref_pic_list_b1,
    );
    init_ref_field_pic_list(
        field,
        Reference::LongTerm,
        &mut ref_frame_list_long_term,
        &mut ref_pic_list_b1,
    );

    swap_b1_if_needed(&ref_pic_list_b0, &mut ref_pic_list_b1);

    assert!(ref_pic_list_b0.len() <= REF_LIST_MAX_SIZE);
    assert!(ref_pic_list_b1.len() <= REF_LIST_MAX_SIZE);

    (ref_pic_list_b0, ref_pic_list_b1)
}

/// Derives the initial reference picture lists for `cur_pic` over the
/// current DPB contents, picking the frame or field process as appropriate.
pub fn build_ref_pic_lists<T: Clone>(
    dpb: &Dpb<T>,
    cur_pic: &PictureData,
) -> ReferencePicLists<T> {
    let num_refs = dpb
        .short_term_refs_iter()
        .chain(dpb.long_term_refs_iter())
        .filter(|e| !e.pic.borrow().nonexisting)
        .count();

    // 8.2.4.2.1 ~ 8.2.4.2.4: at least one existing reference frame or
    // complementary reference field pair must be marked as used for
    // reference for this process to run.
    if num_refs == 0 {
        return Default::default();
    }

    let (ref_pic_list_p0, (ref_pic_list_b0, ref_pic_list_b1)) =
        if matches!(cur_pic.field, Field::Frame) {
            (
                build_ref_pic_list_p(dpb),
                build_ref_pic_list_b(dpb, cur_pic),
            )
        } else {
            (
                build_ref_field_pic_list_p(dpb, cur_pic),
                build_ref_field_pic_list_b(dpb, cur_pic),
            )
        };

    ReferencePicLists {
        ref_pic_list_p0,
        ref_pic_list_b0,
        ref_pic_list_b1,
    }
}

// PicNumF, see 8.2.4.3.1: long-term entries can never match a short-term
// target number.
fn pic_num_f(pic: &PictureData, max_pic_num: i32) -> i32 {
    if !matches!(pic.reference(), Reference::LongTerm) {
        pic.pic_num
    } else {
        max_pic_num
    }
}

// LongTermPicNumF, see 8.2.4.3.2.
fn long_term_pic_num_f(pic: &PictureData, max_long_term_frame_idx: MaxLongTermFrameIdx) -> u32 {
    if matches!(pic.reference(), Reference::LongTerm) {
        pic.long_term_pic_num
    } else {
        2 * max_long_term_frame_idx.to_value_plus1()
    }
}

// Shift-and-dedupe step shared by 8.2.4.3.1 and 8.2.4.3.2: after inserting
// the selected picture at `ref_idx_lx`, every later entry whose derived
// number equals the selected one is squeezed out, and the list is cut back
// to the active size.
fn shift_and_dedupe<T: Clone>(
    ref_pic_list_x: &mut Vec<Option<DpbEntry<T>>>,
    num_ref_idx_lx_active_minus1: u8,
    ref_idx_lx: usize,
    matches_selected: impl Fn(&PictureData) -> bool,
) {
    let num_active = usize::from(num_ref_idx_lx_active_minus1) + 1;
    let mut nidx = ref_idx_lx;

    for cidx in ref_idx_lx..=num_active {
        if cidx == ref_pic_list_x.len() {
            break;
        }

        let keep = match &ref_pic_list_x[cidx] {
            Some(entry) => !matches_selected(&entry.pic.borrow()),
            // Missing-reference markers have no derived number.
            None => true,
        };

        if keep {
            ref_pic_list_x[nidx] = ref_pic_list_x[cidx].clone();
            nidx += 1;
        }
    }

    ref_pic_list_x.truncate(num_active);
}

/// 8.2.4.3.1, modification process for short-term reference pictures.
#[allow(clippy::too_many_arguments)]
fn short_term_pic_list_modification<T: Clone>(
    cur_pic: &PictureData,
    dpb: &Dpb<T>,
    ref_pic_list_x: &mut Vec<Option<DpbEntry<T>>>,
    num_ref_idx_lx_active_minus1: u8,
    max_pic_num: i32,
    rplm: &RefPicListModification,
    pic_num_lx_pred: &mut i32,
    ref_idx_lx: &mut usize,
) -> anyhow::Result<()> {
    let abs_diff_pic_num = rplm.abs_diff_pic_num_minus1 as i32 + 1;

    let pic_num_lx_no_wrap = match rplm.modification_of_pic_nums_idc {
        0 => {
            if *pic_num_lx_pred - abs_diff_pic_num < 0 {
                *pic_num_lx_pred - abs_diff_pic_num + max_pic_num
            } else {
                *pic_num_lx_pred - abs_diff_pic_num
            }
        }
        1 => {
            if *pic_num_lx_pred + abs_diff_pic_num >= max_pic_num {
                *pic_num_lx_pred + abs_diff_pic_num - max_pic_num
            } else {
                *pic_num_lx_pred + abs_diff_pic_num
            }
        }
        other => {
            return Err(anyhow!(
                "unexpected modification_of_pic_nums_idc {}",
                other
            ))
        }
    };

    *pic_num_lx_pred = pic_num_lx_no_wrap;

    let pic_num_lx = if pic_num_lx_no_wrap > cur_pic.pic_num {
        pic_num_lx_no_wrap - max_pic_num
    } else {
        pic_num_lx_no_wrap
    };

    let entry = dpb.find_short_term_with_pic_num(pic_num_lx).cloned();
    if entry.is_none() {
        // Degrade rather than abort: a marker takes the slot and the
        // accelerator skips it.
        warn!(
            "No short-term reference with pic_num {}, inserting a missing-reference marker",
            pic_num_lx
        );
    }

    ref_pic_list_x.insert(*ref_idx_lx, entry.clone());
    *ref_idx_lx += 1;

    if entry.is_some() {
        shift_and_dedupe(
            ref_pic_list_x,
            num_ref_idx_lx_active_minus1,
            *ref_idx_lx,
            |p| pic_num_f(p, max_pic_num) == pic_num_lx,
        );
    } else {
        ref_pic_list_x.truncate(usize::from(num_ref_idx_lx_active_minus1) + 1);
    }

    Ok(())
}

/// 8.2.4.3.2, modification process for long-term reference pictures.
fn long_term_pic_list_modification<T: Clone>(
    dpb: &Dpb<T>,
    ref_pic_list_x: &mut Vec<Option<DpbEntry<T>>>,
    num_ref_idx_lx_active_minus1: u8,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    rplm: &RefPicListModification,
    ref_idx_lx: &mut usize,
) {
    let long_term_pic_num = rplm.long_term_pic_num;

    let entry = dpb
        .find_long_term_with_long_term_pic_num(long_term_pic_num)
        .cloned();
    if entry.is_none() {
        warn!(
            "No long-term reference with long_term_pic_num {}, inserting a missing-reference marker",
            long_term_pic_num
        );
    }

    ref_pic_list_x.insert(*ref_idx_lx, entry.clone());
    *ref_idx_lx += 1;

    if entry.is_some() {
        shift_and_dedupe(
            ref_pic_list_x,
            num_ref_idx_lx_active_minus1,
            *ref_idx_lx,
            |p| long_term_pic_num_f(p, max_long_term_frame_idx) == long_term_pic_num,
        );
    } else {
        ref_pic_list_x.truncate(usize::from(num_ref_idx_lx_active_minus1) + 1);
    }
}

fn modify_ref_pic_list<T: Clone>(
    dpb: &Dpb<T>,
    cur_pic: &PictureData,
    hdr: &SliceHeader,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    ref_pic_list: RefPicList,
    initial: &[DpbEntry<T>],
) -> anyhow::Result<Vec<Option<DpbEntry<T>>>> {
    let (ref_pic_list_modification_flag_lx, num_ref_idx_lx_active_minus1, rplm) =
        match ref_pic_list {
            RefPicList::RefPicList0 => (
                hdr.ref_pic_list_modification_flag_l0,
                hdr.num_ref_idx_l0_active_minus1,
                &hdr.ref_pic_list_modification_l0,
            ),
            RefPicList::RefPicList1 => (
                hdr.ref_pic_list_modification_flag_l1,
                hdr.num_ref_idx_l1_active_minus1,
                &hdr.ref_pic_list_modification_l1,
            ),
        };

    let num_active = usize::from(num_ref_idx_lx_active_minus1) + 1;

    let mut ref_pic_list_x: Vec<Option<DpbEntry<T>>> =
        initial.iter().cloned().map(Some).collect();
    ref_pic_list_x.truncate(num_active);

    if ref_pic_list_modification_flag_lx {
        let mut pic_num_lx_pred = cur_pic.pic_num;
        let mut ref_idx_lx = 0;

        for modification in rplm {
            match modification.modification_of_pic_nums_idc {
                0 | 1 => {
                    short_term_pic_list_modification(
                        cur_pic,
                        dpb,
                        &mut ref_pic_list_x,
                        num_ref_idx_lx_active_minus1,
                        hdr.max_pic_num as i32,
                        modification,
                        &mut pic_num_lx_pred,
                        &mut ref_idx_lx,
                    )?;
                }
                2 => long_term_pic_list_modification(
                    dpb,
                    &mut ref_pic_list_x,
                    num_ref_idx_lx_active_minus1,
                    max_long_term_frame_idx,
                    modification,
                    &mut ref_idx_lx,
                ),
                3 => break,
                other => {
                    return Err(anyhow!("unexpected modification_of_pic_nums_idc {}", other))
                }
            }
        }
    }

    // Pad to the exact active size; the markers keep list indices stable
    // for the accelerator.
    while ref_pic_list_x.len() < num_active {
        ref_pic_list_x.push(None);
    }

    debug!(
        "{:?} after modification: {:?}",
        ref_pic_list,
        ref_pic_list_x
            .iter()
            .map(|e| e.as_ref().map(|e| e.pic.borrow().pic_order_cnt))
            .collect::<Vec<_>>()
    );

    Ok(ref_pic_list_x)
}

/// Produces the final RefPicList0/RefPicList1 of one slice from the
/// per-picture initial lists.
pub fn create_slice_ref_pic_lists<T: Clone>(
    dpb: &Dpb<T>,
    cur_pic: &PictureData,
    hdr: &SliceHeader,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    initial: &ReferencePicLists<T>,
) -> anyhow::Result<SliceRefPicLists<T>> {
    let mut slice_lists = SliceRefPicLists::default();

    match hdr.slice_type {
        SliceType::P | SliceType::Sp => {
            slice_lists.ref_pic_list0 = modify_ref_pic_list(
                dpb,
                cur_pic,
                hdr,
                max_long_term_frame_idx,
                RefPicList::RefPicList0,
                &initial.ref_pic_list_p0,
            )?;
        }
        SliceType::B => {
            slice_lists.ref_pic_list0 = modify_ref_pic_list(
                dpb,
                cur_pic,
                hdr,
                max_long_term_frame_idx,
                RefPicList::RefPicList0,
                &initial.ref_pic_list_b0,
            )?;
            slice_lists.ref_pic_list1 = modify_ref_pic_list(
                dpb,
                cur_pic,
                hdr,
                max_long_term_frame_idx,
                RefPicList::RefPicList1,
                &initial.ref_pic_list_b1,
            )?;
        }
        SliceType::I | SliceType::Si => (),
    }

    Ok(slice_lists)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::codec::h264::syntax::PpsBuilder;
    use crate::codec::h264::syntax::SliceHeaderBuilder;
    use crate::codec::h264::syntax::SpsBuilder;

    fn short_term(poc: i32, pic_num: i32) -> DpbEntry<i32> {
        let pic = PictureData {
            pic_order_cnt: poc,
            pic_num,
            frame_num: pic_num,
            frame_num_wrap: pic_num,
            output_flag: true,
            ..Default::default()
        };
        let rc = Rc::new(RefCell::new(pic));
        rc.borrow_mut().set_reference(Reference::ShortTerm, false);
        DpbEntry {
            pic: rc,
            handle: Some(poc),
        }
    }

    fn long_term(poc: i32, long_term_pic_num: u32) -> DpbEntry<i32> {
        let pic = PictureData {
            pic_order_cnt: poc,
            long_term_pic_num,
            long_term_frame_idx: long_term_pic_num,
            output_flag: true,
            ..Default::default()
        };
        let rc = Rc::new(RefCell::new(pic));
        rc.borrow_mut().set_reference(Reference::LongTerm, false);
        DpbEntry {
            pic: rc,
            handle: Some(poc),
        }
    }

    fn dpb_with(entries: Vec<DpbEntry<i32>>) -> Dpb<i32> {
        let mut dpb = Dpb::default();
        dpb.set_limits(16, 0);
        for entry in entries {
            dpb.add_picture(entry.pic, entry.handle, &mut None).unwrap();
        }
        dpb
    }

    fn pocs(list: &[DpbEntry<i32>]) -> Vec<i32> {
        list.iter().map(|e| e.pic.borrow().pic_order_cnt).collect()
    }

    fn modified_pocs(list: &[Option<DpbEntry<i32>>]) -> Vec<Option<i32>> {
        list.iter()
            .map(|e| e.as_ref().map(|e| e.pic.borrow().pic_order_cnt))
            .collect()
    }

    // 4 short-term and 2 long-term references: P init must order them by
    // descending pic_num then ascending long_term_pic_num.
    #[test]
    fn p_list_init_ordering() {
        let dpb = dpb_with(vec![
            short_term(10, 2),
            short_term(20, 4),
            short_term(30, 1),
            short_term(40, 3),
            long_term(50, 1),
            long_term(60, 0),
        ]);

        let cur_pic = PictureData {
            pic_order_cnt: 70,
            pic_num: 5,
            ..Default::default()
        };

        let lists = build_ref_pic_lists(&dpb, &cur_pic);
        assert_eq!(pocs(&lists.ref_pic_list_p0), vec![20, 40, 10, 30, 60, 50]);
    }

    #[test]
    fn b_list_init_ordering_and_swap() {
        let dpb = dpb_with(vec![
            short_term(10, 1),
            short_term(20, 2),
            short_term(40, 3),
            short_term(50, 4),
            long_term(60, 0),
        ]);

        let cur_pic = PictureData {
            pic_order_cnt: 30,
            pic_num: 5,
            ..Default::default()
        };

        let lists = build_ref_pic_lists(&dpb, &cur_pic);

        // b0: POC below current descending, then above ascending, then LT.
        assert_eq!(pocs(&lists.ref_pic_list_b0), vec![20, 10, 40, 50, 60]);
        // b1: mirror ordering with the same long-term tail.
        assert_eq!(pocs(&lists.ref_pic_list_b1), vec![40, 50, 20, 10, 60]);
    }

    #[test]
    fn b1_swaps_first_entries_when_identical_to_b0() {
        // With every short-term POC below the current one, b0 == b1 before
        // the swap rule is applied.
        let dpb = dpb_with(vec![short_term(10, 1), short_term(20, 2)]);

        let cur_pic = PictureData {
            pic_order_cnt: 30,
            pic_num: 3,
            ..Default::default()
        };

        let lists = build_ref_pic_lists(&dpb, &cur_pic);
        assert_eq!(pocs(&lists.ref_pic_list_b0), vec![20, 10]);
        assert_eq!(pocs(&lists.ref_pic_list_b1), vec![10, 20]);
    }

    // [A, B, C] with a command selecting B must give [B, A, C]: insert at
    // front, later duplicate squeezed out. A plain swap would be wrong.
    #[test]
    fn modification_shifts_and_dedupes() {
        let dpb = dpb_with(vec![
            short_term(10, 0),
            short_term(20, 2),
            short_term(30, 4),
        ]);

        let sps = SpsBuilder::new().max_frame_num(16).build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::P)
            .num_ref_idx_l0_active_minus1(2)
            .ref_pic_list_modification_l0(vec![
                RefPicListModification {
                    modification_of_pic_nums_idc: 0,
                    // picNumLX = 5 - (2 + 1) = 2, selecting B.
                    abs_diff_pic_num_minus1: 2,
                    ..Default::default()
                },
                RefPicListModification {
                    modification_of_pic_nums_idc: 3,
                    ..Default::default()
                },
            ])
            .build();

        let cur_pic = PictureData {
            pic_order_cnt: 40,
            pic_num: 5,
            ..Default::default()
        };

        let initial = build_ref_pic_lists(&dpb, &cur_pic);
        // Initial P order by descending pic_num: [C(30), B(20), A(10)].
        assert_eq!(pocs(&initial.ref_pic_list_p0), vec![30, 20, 10]);

        let lists =
            create_slice_ref_pic_lists(&dpb, &cur_pic, &hdr, Default::default(), &initial)
                .unwrap();

        assert_eq!(
            modified_pocs(&lists.ref_pic_list0),
            vec![Some(20), Some(30), Some(10)]
        );
    }

    #[test]
    fn missing_reference_becomes_marker() {
        let dpb = dpb_with(vec![short_term(10, 0)]);

        let sps = SpsBuilder::new().max_frame_num(16).build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::P)
            .num_ref_idx_l0_active_minus1(1)
            .ref_pic_list_modification_l0(vec![RefPicListModification {
                modification_of_pic_nums_idc: 0,
                // picNumLX = 2, which no stored picture carries.
                abs_diff_pic_num_minus1: 2,
                ..Default::default()
            }])
            .build();

        let cur_pic = PictureData {
            pic_order_cnt: 40,
            pic_num: 5,
            ..Default::default()
        };

        let initial = build_ref_pic_lists(&dpb, &cur_pic);
        let lists =
            create_slice_ref_pic_lists(&dpb, &cur_pic, &hdr, Default::default(), &initial)
                .unwrap();

        assert_eq!(modified_pocs(&lists.ref_pic_list0), vec![None, Some(10)]);
    }

    #[test]
    fn short_lists_are_padded_with_markers() {
        let dpb = dpb_with(vec![short_term(10, 0)]);

        let sps = SpsBuilder::new().max_frame_num(16).build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps)
            .slice_type(SliceType::P)
            .num_ref_idx_l0_active_minus1(3)
            .build();

        let cur_pic = PictureData {
            pic_order_cnt: 40,
            pic_num: 5,
            ..Default::default()
        };

        let initial = build_ref_pic_lists(&dpb, &cur_pic);
        let lists =
            create_slice_ref_pic_lists(&dpb, &cur_pic, &hdr, Default::default(), &initial)
                .unwrap();

        assert_eq!(
            modified_pocs(&lists.ref_pic_list0),
            vec![Some(10), None, None, None]
        );
    }

    #[test]
    fn field_lists_interleave_by_parity() {
        // Four coded fields of two frames, current picture a top field:
        // fields of the current parity come first, then alternate.
        let make_field = |poc, frame_num_wrap, field: Field| {
            let pic = PictureData {
                pic_order_cnt: poc,
                frame_num_wrap,
                field,
                output_flag: true,
                ..Default::default()
            };
            let rc = Rc::new(RefCell::new(pic));
            rc.borrow_mut().set_reference(Reference::ShortTerm, false);
            DpbEntry {
                pic: rc,
                handle: Some(poc),
            }
        };

        let mut dpb: Dpb<i32> = Dpb::default();
        dpb.set_limits(16, 0);
        dpb.set_interlaced(true);
        for entry in [
            make_field(0, 0, Field::Top),
            make_field(1, 0, Field::Bottom),
            make_field(4, 1, Field::Top),
            make_field(5, 1, Field::Bottom),
        ] {
            dpb.add_picture(entry.pic, entry.handle, &mut None).unwrap();
        }

        let cur_pic = PictureData {
            pic_order_cnt: 8,
            field: Field::Top,
            ..Default::default()
        };

        let lists = build_ref_pic_lists(&dpb, &cur_pic);

        // frame_num_wrap descending picks frame 1 first; parity interleave
        // starts with the current (top) parity.
        assert_eq!(pocs(&lists.ref_pic_list_p0), vec![4, 5, 0, 1]);
    }
}
