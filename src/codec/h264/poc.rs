// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count computation, clause 8.2.1.

use anyhow::anyhow;

use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::syntax::Sps;

/// Decoder-global POC recurrence, updated once per decoded picture.
///
/// The `prev_*` values are the explicit recurrence of clause 8.2.1: the
/// three derivations read state saved from the previous (reference) picture
/// and write it back for the next one. The state lives for one decoder
/// session and resets on flush.
#[derive(Clone, Debug)]
pub struct PocState {
    /// frame_num of the previous reference picture, also the anchor for
    /// frame_num gap detection (7.4.3).
    pub prev_ref_frame_num: i32,
    pub prev_ref_has_mmco_5: bool,
    pub prev_ref_top_field_order_cnt: i32,
    pub prev_ref_pic_order_cnt_msb: i32,
    pub prev_ref_pic_order_cnt_lsb: i32,
    pub prev_ref_field: Field,

    pub prev_frame_num: i32,
    pub prev_frame_num_offset: i32,
    pub prev_has_mmco_5: bool,
}

impl Default for PocState {
    fn default() -> Self {
        Self {
            prev_ref_frame_num: 0,
            prev_ref_has_mmco_5: false,
            prev_ref_top_field_order_cnt: 0,
            prev_ref_pic_order_cnt_msb: 0,
            prev_ref_pic_order_cnt_lsb: 0,
            prev_ref_field: Field::Frame,
            prev_frame_num: 0,
            prev_frame_num_offset: 0,
            prev_has_mmco_5: false,
        }
    }
}

impl PocState {
    /// Derives `TopFieldOrderCnt`/`BottomFieldOrderCnt` and `PicOrderCnt`
    /// for `pic`, per 8.2.1. All arithmetic is 32-bit signed with explicit
    /// modulo wraparound.
    pub fn compute_pic_order_count(&mut self, sps: &Sps, pic: &mut PictureData) -> anyhow::Result<()> {
        match pic.pic_order_cnt_type {
            0 => self.compute_type0(sps, pic),
            1 => self.compute_type1(sps, pic),
            2 => self.compute_type2(sps, pic),
            other => return Err(anyhow!("invalid pic_order_cnt_type {}", other)),
        }

        pic.pic_order_cnt = match pic.field {
            Field::Frame => std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt),
            Field::Top => pic.top_field_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt,
        };

        Ok(())
    }

    // 8.2.1.1: MSB/LSB wraparound against MaxPicOrderCntLsb.
    fn compute_type0(&mut self, sps: &Sps, pic: &mut PictureData) {
        let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) =
            if matches!(pic.is_idr, IsIdr::Yes { .. }) {
                (0, 0)
            } else if self.prev_ref_has_mmco_5 {
                // After MMCO 5 the previous picture's POC was rebased to 0;
                // a previous top or frame field keeps its (rebased) top
                // field order count as the LSB anchor.
                if !matches!(self.prev_ref_field, Field::Bottom) {
                    (0, self.prev_ref_top_field_order_cnt)
                } else {
                    (0, 0)
                }
            } else {
                (
                    self.prev_ref_pic_order_cnt_msb,
                    self.prev_ref_pic_order_cnt_lsb,
                )
            };

        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

        pic.pic_order_cnt_msb = if pic.pic_order_cnt_lsb < prev_pic_order_cnt_lsb
            && prev_pic_order_cnt_lsb - pic.pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2
        {
            prev_pic_order_cnt_msb + max_pic_order_cnt_lsb
        } else if pic.pic_order_cnt_lsb > prev_pic_order_cnt_lsb
            && pic.pic_order_cnt_lsb - prev_pic_order_cnt_lsb > max_pic_order_cnt_lsb / 2
        {
            prev_pic_order_cnt_msb - max_pic_order_cnt_lsb
        } else {
            prev_pic_order_cnt_msb
        };

        if !matches!(pic.field, Field::Bottom) {
            pic.top_field_order_cnt = pic.pic_order_cnt_msb + pic.pic_order_cnt_lsb;
        }

        if !matches!(pic.field, Field::Top) {
            if matches!(pic.field, Field::Frame) {
                pic.bottom_field_order_cnt =
                    pic.top_field_order_cnt + pic.delta_pic_order_cnt_bottom;
            } else {
                pic.bottom_field_order_cnt = pic.pic_order_cnt_msb + pic.pic_order_cnt_lsb;
            }
        }
    }

    // 8.2.1.2: frame_num_offset recurrence plus the per-cycle offset table.
    fn compute_type1(&mut self, sps: &Sps, pic: &mut PictureData) {
        if self.prev_has_mmco_5 {
            self.prev_frame_num_offset = 0;
        }

        pic.frame_num_offset = if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if self.prev_frame_num > pic.frame_num {
            self.prev_frame_num_offset + sps.max_frame_num() as i32
        } else {
            self.prev_frame_num_offset
        };

        let num_in_cycle = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);

        let mut abs_frame_num = if num_in_cycle != 0 {
            pic.frame_num_offset + pic.frame_num
        } else {
            0
        };

        if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected_pic_order_cnt = 0;

        if abs_frame_num > 0 {
            let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / num_in_cycle;
            let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % num_in_cycle;

            expected_pic_order_cnt =
                pic_order_cnt_cycle_cnt * sps.expected_delta_per_pic_order_cnt_cycle;

            for i in 0..=frame_num_in_pic_order_cnt_cycle {
                expected_pic_order_cnt += sps.offset_for_ref_frame[i as usize];
            }
        }

        if pic.nal_ref_idc == 0 {
            expected_pic_order_cnt += sps.offset_for_non_ref_pic;
        }

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
                pic.bottom_field_order_cnt = pic.top_field_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt1;
            }
            Field::Top => {
                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = expected_pic_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt0;
            }
        }
    }

    // 8.2.1.3: POC follows decoding order.
    fn compute_type2(&mut self, sps: &Sps, pic: &mut PictureData) {
        if self.prev_has_mmco_5 {
            self.prev_frame_num_offset = 0;
        }

        pic.frame_num_offset = if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if self.prev_frame_num > pic.frame_num {
            self.prev_frame_num_offset + sps.max_frame_num() as i32
        } else {
            self.prev_frame_num_offset
        };

        let temp_pic_order_cnt = if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if pic.nal_ref_idc == 0 {
            2 * (pic.frame_num_offset + pic.frame_num) - 1
        } else {
            2 * (pic.frame_num_offset + pic.frame_num)
        };

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = temp_pic_order_cnt;
                pic.bottom_field_order_cnt = temp_pic_order_cnt;
            }
            Field::Top => pic.top_field_order_cnt = temp_pic_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt = temp_pic_order_cnt,
        }
    }

    /// Saves the recurrence values contributed by a finished reference
    /// picture.
    pub fn save_ref_pic(&mut self, pic: &PictureData) {
        self.prev_ref_has_mmco_5 = pic.has_mmco_5;
        self.prev_ref_top_field_order_cnt = pic.top_field_order_cnt;
        self.prev_ref_pic_order_cnt_msb = pic.pic_order_cnt_msb;
        self.prev_ref_pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        self.prev_ref_field = pic.field;
        self.prev_ref_frame_num = pic.frame_num;
    }

    /// Saves the recurrence values contributed by any finished picture.
    pub fn save_pic(&mut self, pic: &PictureData) {
        self.prev_frame_num = pic.frame_num;
        self.prev_has_mmco_5 = pic.has_mmco_5;
        self.prev_frame_num_offset = pic.frame_num_offset;
    }

    /// Resets the recurrence to stream-start values.
    pub fn reset(&mut self) {
        *self = Default::default();
    }
}
