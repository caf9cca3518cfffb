// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer (Annex C.4).
//!
//! The DPB is the single owner of every decoded-but-not-disposed picture.
//! Reference sets and reference picture lists are views over its entries and
//! die with them; the backend handle of an entry is what eventually reaches
//! the output queue when the picture is bumped.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use log::debug;
use thiserror::Error;

use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;

/// One DPB slot: the picture state plus the backend handle of its decoded
/// surface. The handle is `None` only for "non-existing" frames synthesized
/// for frame_num gaps, which are never output.
#[derive(Clone)]
pub struct DpbEntry<T> {
    pub pic: Rc<RefCell<PictureData>>,
    pub handle: Option<T>,
}

#[derive(Debug, Error)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
    #[error("picture is a second field but no first field was stored")]
    NoFirstField,
}

pub struct Dpb<T> {
    entries: Vec<DpbEntry<T>>,

    /// Capacity in frames, from the active SPS level limits. At most 16.
    max_num_pics: usize,

    /// Bound on how many pictures may precede a picture in decoding order
    /// and follow it in output order. Bumping is not required while the DPB
    /// holds fewer pictures than this.
    max_num_reorder_frames: usize,

    /// Whether the stream may code fields. In interlaced mode frames are
    /// split into complementary field pairs before storage, so the entry
    /// count bound doubles while the frame-buffer bound stays at
    /// `max_num_pics`.
    interlaced: bool,
}

impl<T: Clone> Dpb<T> {
    /// Iterator over the pictures stored in the DPB.
    pub(crate) fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|e| e.pic.borrow())
    }

    /// Mutable iterator over the pictures stored in the DPB.
    pub(crate) fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, PictureData>> {
        self.entries.iter().map(|e| e.pic.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &Vec<DpbEntry<T>> {
        &self.entries
    }

    /// Applies new stream limits, typically on SPS (re)activation. Stored
    /// entries are not evicted; only future admissions see the new bounds.
    pub fn set_limits(&mut self, max_num_pics: usize, max_num_reorder_frames: usize) {
        self.max_num_pics = max_num_pics;
        self.max_num_reorder_frames = max_num_reorder_frames;
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn set_interlaced(&mut self, interlaced: bool) {
        self.interlaced = interlaced;
    }

    /// Number of reference frames or field pairs, counting each pair once.
    pub fn num_ref_frames(&self) -> usize {
        self.pictures()
            .filter(|p| p.is_ref() && !p.is_second_field())
            .count()
    }

    /// Returns an iterator over the short-term reference entries.
    pub fn short_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|&e| matches!(e.pic.borrow().reference(), Reference::ShortTerm))
    }

    /// Returns an iterator over the long-term reference entries.
    pub fn long_term_refs_iter(&self) -> impl Iterator<Item = &DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|&e| matches!(e.pic.borrow().reference(), Reference::LongTerm))
    }

    /// The short-term reference picture with the smallest `frame_num_wrap`,
    /// i.e. the sliding window eviction candidate.
    pub fn find_short_term_lowest_frame_num_wrap(&self) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|e| matches!(e.pic.borrow().reference(), Reference::ShortTerm))
            .min_by_key(|e| e.pic.borrow().frame_num_wrap)
    }

    pub(crate) fn find_short_term_with_pic_num_pos(&self, pic_num: i32) -> Option<usize> {
        let position = self
            .pictures()
            .position(|p| matches!(p.reference(), Reference::ShortTerm) && p.pic_num == pic_num);

        debug!(
            "find_short_term_with_pic_num: {}, found position {:?}",
            pic_num, position
        );

        position
    }

    /// Finds the short-term reference picture with the given `PicNum`.
    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<&DpbEntry<T>> {
        let position = self.find_short_term_with_pic_num_pos(pic_num)?;
        Some(&self.entries[position])
    }

    /// Finds the long-term reference picture with the given
    /// `LongTermPicNum`.
    pub fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: u32,
    ) -> Option<&DpbEntry<T>> {
        let position = self.pictures().position(|p| {
            matches!(p.reference(), Reference::LongTerm) && p.long_term_pic_num == long_term_pic_num
        });

        debug!(
            "find_long_term_with_long_term_pic_num: {}, found position {:?}",
            long_term_pic_num, position
        );

        Some(&self.entries[position?])
    }

    /// Marks every stored picture as unused for reference (IDR and MMCO 5).
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for mut picture in self.pictures_mut() {
            picture.set_reference(Reference::None, false);
        }
    }

    /// Drops every picture that is neither a reference nor still awaiting
    /// output.
    pub fn remove_unused(&mut self) {
        self.entries.retain(|e| {
            let pic = e.pic.borrow();
            let discard = !pic.is_ref() && !pic.needed_for_output;

            if discard {
                debug!("Removing unused picture with POC {}", pic.pic_order_cnt);
            }

            !discard
        });
    }

    /// Derives FrameNumWrap, PicNum and LongTermPicNum for every reference
    /// picture relative to the current picture, per 8.2.4.1. Must run once
    /// per picture, after the DPB was finalized for the previous one and
    /// before list construction.
    pub fn update_pic_nums(&mut self, frame_num: i32, max_frame_num: i32, current_pic: &PictureData) {
        for mut pic in self.pictures_mut() {
            if !pic.is_ref() {
                continue;
            }

            if *pic.reference() == Reference::LongTerm {
                pic.long_term_pic_num = if current_pic.field == Field::Frame {
                    pic.long_term_frame_idx
                } else if current_pic.field == pic.field {
                    2 * pic.long_term_frame_idx + 1
                } else {
                    2 * pic.long_term_frame_idx
                };
            } else {
                pic.frame_num_wrap = if pic.frame_num > frame_num {
                    pic.frame_num - max_frame_num
                } else {
                    pic.frame_num
                };

                pic.pic_num = if current_pic.field == Field::Frame {
                    pic.frame_num_wrap
                } else if pic.field == current_pic.field {
                    2 * pic.frame_num_wrap + 1
                } else {
                    2 * pic.frame_num_wrap
                };
            }
        }
    }

    /// Stores a picture. The caller is responsible for having made room
    /// first (see [`Dpb::bump_as_needed`]); failing that this returns
    /// [`StorePictureError::DpbIsFull`] and the DPB is left untouched.
    fn store_picture(
        &mut self,
        picture: Rc<RefCell<PictureData>>,
        handle: Option<T>,
    ) -> Result<(), StorePictureError> {
        let max_entries = if self.interlaced {
            self.max_num_pics * 2
        } else {
            self.max_num_pics
        };

        if self.entries.len() >= max_entries {
            return Err(StorePictureError::DpbIsFull);
        }

        let mut pic_mut = picture.borrow_mut();

        // C.4.2: "non-existing" frames are stored but never output.
        pic_mut.needed_for_output = pic_mut.output_flag && !pic_mut.nonexisting;

        if pic_mut.is_second_field() {
            let first_field_rc = pic_mut
                .other_field()
                .ok_or(StorePictureError::NoFirstField)?;
            drop(pic_mut);
            let mut first_field = first_field_rc.borrow_mut();
            first_field.set_second_field_to(&picture);
        } else {
            drop(pic_mut);
        }

        let pic = picture.borrow();
        debug!(
            "Stored picture POC {}, field {:?}, DPB length {}",
            pic.pic_order_cnt,
            pic.field,
            self.entries.len() + 1
        );
        drop(pic);

        self.entries.push(DpbEntry {
            pic: picture,
            handle,
        });

        Ok(())
    }

    /// Adds `pic` to the DPB, pairing it with a cached first field when the
    /// stream is interlaced.
    pub fn add_picture(
        &mut self,
        pic: Rc<RefCell<PictureData>>,
        handle: Option<T>,
        last_field: &mut Option<(Rc<RefCell<PictureData>>, T)>,
    ) -> Result<(), StorePictureError> {
        if !self.interlaced {
            assert!(last_field.is_none());

            self.store_picture(pic, handle)?;
        } else {
            // A cached first field must enter the DPB together with its
            // just-decoded pair.
            let other_is_cached_field = pic
                .borrow()
                .other_field()
                .zip(last_field.as_ref().map(|f| &f.0))
                .map_or(false, |(other_field, cached)| Rc::ptr_eq(&other_field, cached));

            if other_is_cached_field {
                if let Some((cached_field, cached_handle)) = last_field.take() {
                    self.store_picture(cached_field, Some(cached_handle))?;
                }
            }

            self.store_picture(pic, handle)?;
        }

        Ok(())
    }

    /// Whether a frame buffer is still free, counting complementary field
    /// pairs as one frame in interlaced mode.
    pub fn has_empty_frame_buffer(&self) -> bool {
        if !self.interlaced {
            self.entries.len() < self.max_num_pics
        } else {
            let frames = self
                .pictures()
                .filter(|pic| {
                    !pic.is_second_field()
                        && (matches!(pic.field, Field::Frame) || pic.other_field().is_some())
                })
                .count();

            frames < self.max_num_pics
        }
    }

    /// Whether storing `to_insert` requires output of stored pictures
    /// first. Covers clauses 1, 4, 5 and 6 of the C.4.5.3 bumping process;
    /// clauses 2 (IDR) and 3 (MMCO 5) are the coordinator's responsibility.
    pub fn needs_bumping(&self, to_insert: &PictureData) -> bool {
        if self.has_empty_frame_buffer() {
            return false;
        }

        if to_insert.nonexisting {
            return true;
        }

        if to_insert.is_ref() && matches!(to_insert.is_idr, IsIdr::No) {
            return true;
        }

        let lowest_poc = match self.find_lowest_poc_for_bumping() {
            Some(entry) => entry.pic.borrow().pic_order_cnt,
            None => return false,
        };

        !to_insert.is_second_field_of_complementary_ref_pair()
            && to_insert.pic_order_cnt > lowest_poc
    }

    /// The output candidate: the lowest-POC picture still needing output.
    /// POCs are unique among pending pictures, so there is no tie to break.
    fn find_lowest_poc_for_bumping(&self) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .filter(|e| {
                let pic = e.pic.borrow();

                if !pic.needed_for_output {
                    return false;
                }

                match pic.field {
                    Field::Frame => true,
                    // A split or coded field is output through its first
                    // field once the pair is complete.
                    Field::Top | Field::Bottom => {
                        !pic.is_second_field() && pic.other_field().is_some()
                    }
                }
            })
            .min_by_key(|e| e.pic.borrow().pic_order_cnt)
    }

    /// Outputs the lowest-POC pending picture, per C.4.5.3. Returns `None`
    /// when nothing is left to drain. The bumped entry stays in the DPB
    /// while it is still a reference; `remove_unused` reaps it later.
    fn bump(&mut self) -> Option<Option<T>> {
        let entry = self.find_lowest_poc_for_bumping()?.clone();
        let mut pic = entry.pic.borrow_mut();

        debug!("Bumping picture with POC {} from the DPB", pic.pic_order_cnt);

        pic.needed_for_output = false;
        if let Some(other_field) = pic.other_field() {
            other_field.borrow_mut().needed_for_output = false;
        }

        drop(pic);
        Some(entry.handle)
    }

    /// Repeatedly bumps while admission of `current_pic` requires it,
    /// returning the handles in output order.
    pub fn bump_as_needed(&mut self, current_pic: &PictureData) -> Vec<Option<T>> {
        let mut bumped = vec![];

        while self.needs_bumping(current_pic) && self.len() >= self.max_num_reorder_frames {
            match self.bump() {
                Some(handle) => bumped.push(handle),
                None => break,
            }
            self.remove_unused();
        }

        bumped
    }

    /// Drains the whole DPB in output order, then drops every entry. The
    /// IDR/end-of-stream path.
    pub fn drain(&mut self) -> Vec<Option<T>> {
        debug!("Draining the DPB");

        let mut bumped = vec![];

        while let Some(handle) = self.bump() {
            bumped.push(handle);
        }

        self.clear();

        bumped
    }

    /// Drops all entries, keeping the configured limits.
    pub fn clear(&mut self) {
        debug!("Clearing the DPB");

        self.entries.clear();
    }
}

impl<T> Default for Dpb<T> {
    fn default() -> Self {
        // Not derivable while `T` itself is not `Default`, see
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
            max_num_reorder_frames: Default::default(),
            interlaced: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|e| &e.pic)
            .enumerate()
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .field("interlaced", &self.interlaced)
            .finish()
    }
}
