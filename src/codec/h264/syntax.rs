// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Structured H.264 syntax elements.
//!
//! These types model the output of the bitstream parser, which is an
//! external collaborator: nothing in this crate reads bits. The field names
//! follow the syntax element names of the H.264 specification so that the
//! derivations in the `poc`, `dpb`, `rpl` and `marking` modules can be read
//! against the standard directly.

use std::rc::Rc;

use anyhow::anyhow;
use enumn::N;

use crate::codec::h264::picture::Field;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h).
pub const DPB_MAX_SIZE: usize = 16;

/// Upper bound for the number of entries in a reference picture list, frame
/// or field coding included.
pub const REF_LIST_MAX_SIZE: usize = 32;

#[derive(N, Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    #[default]
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

/// Identification data of a NAL unit, as extracted by the parser from the
/// `nal_unit()` syntax. The offset/size pair locates the unit's payload in
/// the bitstream so the accelerator can fetch the slice data this crate
/// never reads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    /// `nal_ref_idc`: non-zero if the content of the NAL unit is used as a
    /// reference.
    pub ref_idc: u8,
    pub type_: NaluType,
    /// Whether this NAL belongs to an IDR picture.
    pub idr_pic_flag: bool,
    /// Byte offset of the unit's payload in the caller's bitstream buffer.
    pub offset: usize,
    /// Payload size in bytes.
    pub size: usize,
}

impl NaluHeader {
    /// Builds a header from the raw `nal_unit_type` and `nal_ref_idc` values
    /// delivered by the parser, locating `size` payload bytes at `offset`.
    pub fn new(nal_unit_type: u8, ref_idc: u8, offset: usize, size: usize) -> anyhow::Result<Self> {
        let type_ = NaluType::n(nal_unit_type)
            .ok_or_else(|| anyhow!("invalid nal_unit_type {}", nal_unit_type))?;

        Ok(Self {
            ref_idc,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
            offset,
            size,
        })
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 in the specification.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// A single `ref_pic_list_modification()` command, in the literal order the
/// parser found it in the slice header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: u8,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

/// Prediction weight table as parsed with 7.3.3.2. This core never
/// interprets it; it is carried through to the accelerator with the slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,

    pub luma_weight_l0: [i16; 32],
    pub luma_offset_l0: [i8; 32],

    /* if seq->ChromaArrayType != 0 */
    pub chroma_weight_l0: [[i16; 2]; 32],
    pub chroma_offset_l0: [[i8; 2]; 32],

    /* if slice->slice_type % 5 == 1 */
    pub luma_weight_l1: [i16; 32],
    pub luma_offset_l1: [i16; 32],

    /* and if seq->ChromaArrayType != 0 */
    pub chroma_weight_l1: [[i16; 2]; 32],
    pub chroma_offset_l1: [[i8; 2]; 32],
}

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an
/// unsigned integer whose zero value means "no long-term frame indices".
/// Keeping the special value as its own variant forces every user to handle
/// it.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert back to the `max_long_term_frame_idx_plus1` representation.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// A memory management control operation, decoded from the
/// `memory_management_control_operation` opcode and its operands (table 7-9).
///
/// Using one variant per opcode makes the dispatch in the marking process an
/// exhaustive match: an opcode outside 1..=6 cannot be represented and is
/// rejected in [`Mmco::from_parts`] when the command list is assembled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mmco {
    /// Op 1: mark a short-term picture as unused for reference.
    UnmarkShortTerm { difference_of_pic_nums_minus1: u32 },
    /// Op 2: mark a long-term picture as unused for reference.
    UnmarkLongTerm { long_term_pic_num: u32 },
    /// Op 3: promote a short-term picture to long-term with the given index.
    AssignLongTermFrameIdx {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// Op 4: mark long-term pictures above the new maximum index as unused.
    TruncateLongTerm { max_long_term_frame_idx: MaxLongTermFrameIdx },
    /// Op 5: unmark every reference picture and reset frame/POC numbering.
    UnmarkAll,
    /// Op 6: mark the current picture itself as long-term.
    MarkCurrentAsLongTerm { long_term_frame_idx: u32 },
}

impl Mmco {
    /// Assembles a command from the raw syntax elements of a single
    /// `dec_ref_pic_marking()` entry. Operands that the opcode does not use
    /// are ignored, as in the bitstream syntax.
    pub fn from_parts(
        memory_management_control_operation: u8,
        difference_of_pic_nums_minus1: u32,
        long_term_pic_num: u32,
        long_term_frame_idx: u32,
        max_long_term_frame_idx_plus1: u32,
    ) -> anyhow::Result<Self> {
        match memory_management_control_operation {
            1 => Ok(Mmco::UnmarkShortTerm {
                difference_of_pic_nums_minus1,
            }),
            2 => Ok(Mmco::UnmarkLongTerm { long_term_pic_num }),
            3 => Ok(Mmco::AssignLongTermFrameIdx {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            }),
            4 => Ok(Mmco::TruncateLongTerm {
                max_long_term_frame_idx: MaxLongTermFrameIdx::from_value_plus1(
                    max_long_term_frame_idx_plus1,
                ),
            }),
            5 => Ok(Mmco::UnmarkAll),
            6 => Ok(Mmco::MarkCurrentAsLongTerm {
                long_term_frame_idx,
            }),
            other => Err(anyhow!(
                "unknown memory_management_control_operation {}",
                other
            )),
        }
    }
}

/// Decoded reference picture marking, parsed with 7.3.3.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// How the pictures already in the DPB are treated after decoding an IDR
    /// picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// On an IDR picture: if set, the picture is marked "used for long-term
    /// reference" with LongTermFrameIdx 0 and MaxLongTermFrameIdx becomes 0;
    /// if unset, the picture is marked short-term and MaxLongTermFrameIdx
    /// becomes "no long-term frame indices".
    pub long_term_reference_flag: bool,

    /// Selects adaptive (true) or sliding-window (false) marking, as
    /// specified in table 7-8.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// The ordered command list for adaptive marking.
    pub ops: Vec<Mmco>,
}

/// An H.264 slice as delivered by the parser: the decoded header plus the
/// identification of the NAL unit that carried it. Slice data stays behind
/// in the bitstream; the accelerator fetches it by offset on its own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Slice {
    pub header: SliceHeader,
    pub nalu: NaluHeader,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// Coding type of the slice according to table 7-6.
    pub slice_type: SliceType,

    /// The picture parameter set in use.
    pub pic_parameter_set_id: u8,

    /// Used as an identifier for pictures; `log2_max_frame_num_minus4 + 4`
    /// bits in the bitstream.
    pub frame_num: u16,

    /// Set for a slice of a coded field, unset for a slice of a coded frame.
    pub field_pic_flag: bool,

    /// Set for a coded bottom field, unset for a coded top field. Only
    /// meaningful when `field_pic_flag` is set.
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture. Two consecutive IDR access units must
    /// carry different values.
    pub idr_pic_id: u16,

    /// Picture order count modulo `MaxPicOrderCntLsb` for the top field of a
    /// coded frame or for a coded field.
    pub pic_order_cnt_lsb: u16,

    /// POC difference between the bottom and the top field of a coded frame
    /// (POC type 0).
    pub delta_pic_order_cnt_bottom: i32,

    /// POC type 1 offsets: `[0]` for the top field of a frame or for a coded
    /// field, `[1]` for the bottom field of a frame.
    pub delta_pic_order_cnt: [i32; 2],

    /// Shall be 0 for slices of the primary coded picture.
    pub redundant_pic_cnt: u8,

    pub direct_spatial_mv_pred_flag: bool,

    /// Whether the `num_ref_idx_lX_active_minus1` values below were
    /// explicitly coded; when unset the parser has already copied the PPS
    /// defaults into them.
    pub num_ref_idx_active_override_flag: bool,

    /// Maximum reference index for RefPicList0, resolved against the PPS
    /// default by the parser.
    pub num_ref_idx_l0_active_minus1: u8,

    /// Maximum reference index for RefPicList1, resolved against the PPS
    /// default by the parser.
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,

    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    pub pred_weight_table: PredWeightTable,

    pub dec_ref_pic_marking: RefPicMarking,

    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,

    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    /// Same as `MaxPicNum` in the specification: `2 * MaxFrameNum` for field
    /// slices, `MaxFrameNum` otherwise. Derived by the parser.
    pub max_pic_num: u32,
}

impl SliceHeader {
    /// Returns the field that is coded by this header.
    pub fn field(&self) -> Field {
        if self.field_pic_flag {
            if self.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        }
    }
}

/// Video usability information. Only the bitstream restriction data this
/// core reads for DPB sizing is modeled; the rest of the VUI stays with the
/// parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub bitstream_restriction_flag: bool,
    /// Upper bound for the number of frames that precede any frame in
    /// decoding order and follow it in output order.
    pub max_num_reorder_frames: u32,
    /// Required size of the DPB in frame buffers.
    pub max_dec_frame_buffering: u32,
}

/// An H.264 sequence parameter set, restricted to the syntax elements the
/// DPB/POC/reference machinery and the capability checks consume.
#[derive(Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms.
    pub profile_idc: u8,

    /// See 7.4.2.1.1. `constraint_set3_flag` participates in level 1b
    /// detection and in the reorder-depth inference.
    pub constraint_set3_flag: bool,

    /// Level to which the coded video sequence conforms.
    pub level_idc: Level,

    /// Chroma sampling relative to luma as specified in clause 6.2.
    pub chroma_format_idc: u8,

    /// Whether the three colour components of 4:4:4 content are coded
    /// separately.
    pub separate_colour_plane_flag: bool,

    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,

    /// MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4). See 7-10.
    pub log2_max_frame_num_minus4: u8,

    /// Selects one of the three POC derivations of clause 8.2.1.
    pub pic_order_cnt_type: u8,

    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4). See
    /// 7-11.
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// If set, `delta_pic_order_cnt[..]` are absent from the slice headers
    /// and inferred to be 0.
    pub delta_pic_order_always_zero_flag: bool,

    /// POC type 1 offset for non-reference pictures.
    pub offset_for_non_ref_pic: i32,

    /// POC type 1 offset applied to bottom fields.
    pub offset_for_top_to_bottom_field: i32,

    /// Number of entries of `offset_for_ref_frame` in use.
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,

    /// Per-frame POC offsets over one POC cycle (POC type 1).
    pub offset_for_ref_frame: [i32; 255],

    /// Maximum number of short-term plus long-term reference frames,
    /// complementary reference field pairs and non-paired reference fields.
    /// Also sizes the sliding window of clause 8.2.5.3.
    pub max_num_ref_frames: u8,

    /// Whether frame_num is allowed to jump, requiring the gap handling of
    /// clause 8.2.5.2.
    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1, the width of a decoded picture in macroblocks.
    pub pic_width_in_mbs_minus1: u16,
    /// Plus 1, the height of a decoded frame or field in slice group map
    /// units.
    pub pic_height_in_map_units_minus1: u16,

    /// Set when every coded picture of the sequence is a progressive frame;
    /// unset when coded fields or field pairs may appear.
    pub frame_mbs_only_flag: bool,

    pub mb_adaptive_frame_field_flag: bool,

    // Derived by the parser.
    /// ExpectedDeltaPerPicOrderCntCycle, see 7-12.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Coded width of the stream, in pixels. See 7-13.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Coded height of the stream, in pixels. See 7-17.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Returns `ChromaArrayType`, as computed in the specification.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Same as MaxFrameNum. See 7-10 in the specification.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11 in the specification.
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// DPB size in frames for this stream, from the level limits of table
    /// A-1, clamped to [max_num_ref_frames, 16] and overridden by the VUI
    /// bitstream restriction when present.
    pub fn max_dpb_frames(&self) -> usize {
        let profile = self.profile_idc;
        let mut level = self.level_idc;

        // A.3.1 and A.3.2: level 1b for the Baseline, Constrained Baseline
        // and Main profiles is signalled as 1.1 plus constraint_set3_flag.
        if matches!(level, Level::L1_1)
            && (profile == Profile::Baseline as u8 || profile == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        };

        // Table A-1, MaxDpbMbs.
        let max_dpb_mbs = match level {
            Level::L1 => 396,
            Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        };

        let width_mb = self.width() / 16;
        let height_mb = self.height() / 16;

        let max_dpb_frames =
            std::cmp::min(max_dpb_mbs / (width_mb * height_mb), DPB_MAX_SIZE as u32) as usize;

        let mut max_dpb_frames = std::cmp::max(max_dpb_frames, self.max_num_ref_frames as usize);

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            max_dpb_frames = std::cmp::max(1, self.vui_parameters.max_dec_frame_buffering as usize);
        }

        max_dpb_frames
    }

    /// Maximum number of frames that can precede a frame in decoding order
    /// and follow it in output order.
    pub fn max_num_reorder_frames(&self) -> u32 {
        let vui = &self.vui_parameters;

        if self.vui_parameters_present_flag && vui.bitstream_restriction_flag {
            return vui.max_num_reorder_frames;
        }

        let profile = self.profile_idc;
        if (profile == 44
            || profile == 86
            || profile == 100
            || profile == 110
            || profile == 122
            || profile == 244)
            && self.constraint_set3_flag
        {
            0
        } else {
            self.max_dpb_frames() as u32
        }
    }

    /// Whether the sequence may contain coded fields or field pairs.
    pub fn interlaced(&self) -> bool {
        !self.frame_mbs_only_flag
    }
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            offset_for_ref_frame: [0; 255],
            seq_parameter_set_id: Default::default(),
            profile_idc: Default::default(),
            constraint_set3_flag: Default::default(),
            level_idc: Default::default(),
            chroma_format_idc: Default::default(),
            separate_colour_plane_flag: Default::default(),
            bit_depth_luma_minus8: Default::default(),
            bit_depth_chroma_minus8: Default::default(),
            log2_max_frame_num_minus4: Default::default(),
            pic_order_cnt_type: Default::default(),
            log2_max_pic_order_cnt_lsb_minus4: Default::default(),
            delta_pic_order_always_zero_flag: Default::default(),
            offset_for_non_ref_pic: Default::default(),
            offset_for_top_to_bottom_field: Default::default(),
            num_ref_frames_in_pic_order_cnt_cycle: Default::default(),
            max_num_ref_frames: Default::default(),
            gaps_in_frame_num_value_allowed_flag: Default::default(),
            pic_width_in_mbs_minus1: Default::default(),
            pic_height_in_map_units_minus1: Default::default(),
            frame_mbs_only_flag: Default::default(),
            mb_adaptive_frame_field_flag: Default::default(),
            expected_delta_per_pic_order_cnt_cycle: Default::default(),
            vui_parameters_present_flag: Default::default(),
            vui_parameters: Default::default(),
        }
    }
}

/// An H.264 picture parameter set, restricted to what the coordinator and
/// the accelerator hand-off consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    pub entropy_coding_mode_flag: bool,

    /// If set, `delta_pic_order_cnt_bottom` (POC type 0) or
    /// `delta_pic_order_cnt[1]` (POC type 1) are present in frame slice
    /// headers.
    pub bottom_field_pic_order_in_frame_present_flag: bool,

    /// Default for `num_ref_idx_l0_active_minus1` when the slice does not
    /// override it.
    pub num_ref_idx_l0_default_active_minus1: u8,

    /// Default for `num_ref_idx_l1_active_minus1` when the slice does not
    /// override it.
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,

    /// The SPS referenced by this PPS.
    pub sps: Rc<Sps>,
}

/// One pre-parsed unit of the elementary stream, in decoding order. This is
/// the input interface of the decode coordinator: the external parser turns
/// NAL units into these.
#[derive(Debug)]
pub enum StreamUnit {
    Sps(Rc<Sps>),
    Pps(Rc<Pps>),
    Slice(Slice),
    /// End of the coded video sequence.
    SequenceEnd,
    /// End of the stream; finalizes and drains everything.
    StreamEnd,
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        self.0.pic_width_in_mbs_minus1 = ((width + MB_SIZE - 1) / MB_SIZE - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = ((height + MB_SIZE - 1) / MB_SIZE - 1) as u16;
        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn max_frame_num(self, value: u32) -> Self {
        self.log2_max_frame_num_minus4(value.ilog2() as u8 - 4u8)
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value;
        self
    }

    pub fn max_pic_order_cnt_lsb(self, value: u32) -> Self {
        self.log2_max_pic_order_cnt_lsb_minus4(value.ilog2() as u8 - 4u8)
    }

    pub fn delta_pic_order_always_zero_flag(mut self, value: bool) -> Self {
        self.0.delta_pic_order_always_zero_flag = value;
        self
    }

    pub fn offset_for_non_ref_pic(mut self, value: i32) -> Self {
        self.0.offset_for_non_ref_pic = value;
        self
    }

    pub fn offset_for_top_to_bottom_field(mut self, value: i32) -> Self {
        self.0.offset_for_top_to_bottom_field = value;
        self
    }

    /// Sets the POC type 1 cycle offsets and the derived
    /// ExpectedDeltaPerPicOrderCntCycle.
    pub fn offsets_for_ref_frame(mut self, offsets: &[i32]) -> Self {
        self.0.num_ref_frames_in_pic_order_cnt_cycle = offsets.len() as u8;
        self.0.offset_for_ref_frame[..offsets.len()].copy_from_slice(offsets);
        self.0.expected_delta_per_pic_order_cnt_cycle = offsets.iter().sum();
        self
    }

    pub fn max_dec_frame_buffering(mut self, value: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_dec_frame_buffering = value;
        self
    }

    pub fn max_num_reorder_frames(mut self, value: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_num_reorder_frames = value;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Rc<Sps>) -> Self {
        PpsBuilder(Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            chroma_qp_index_offset: 0,
            second_chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            sps,
        })
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn num_ref_idx_l0_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l0_default_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l1_default_active_minus1 = value;
        self
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        SliceHeaderBuilder(SliceHeader {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            num_ref_idx_l0_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            max_pic_num: pps.sps.max_frame_num(),
            ..Default::default()
        })
    }

    pub fn slice_type(mut self, type_: SliceType) -> Self {
        self.0.slice_type = type_;
        self
    }

    pub fn first_mb_in_slice(mut self, value: u32) -> Self {
        self.0.first_mb_in_slice = value;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        match field {
            Field::Frame => self.0.field_pic_flag = false,
            Field::Top => {
                self.0.field_pic_flag = true;
                self.0.bottom_field_flag = false;
            }
            Field::Bottom => {
                self.0.field_pic_flag = true;
                self.0.bottom_field_flag = true;
            }
        }
        self.0.max_pic_num = if self.0.field_pic_flag {
            self.0.max_pic_num * 2
        } else {
            self.0.max_pic_num
        };
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u16) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn delta_pic_order_cnt(mut self, value: [i32; 2]) -> Self {
        self.0.delta_pic_order_cnt = value;
        self
    }

    pub fn idr_pic_id(mut self, value: u16) -> Self {
        self.0.idr_pic_id = value;
        self
    }

    pub fn num_ref_idx_l0_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_active_override_flag = true;
        self.0.num_ref_idx_l0_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_active_override_flag = true;
        self.0.num_ref_idx_l1_active_minus1 = value;
        self
    }

    pub fn ref_pic_list_modification_l0(mut self, rplm: Vec<RefPicListModification>) -> Self {
        self.0.ref_pic_list_modification_flag_l0 = true;
        self.0.ref_pic_list_modification_l0 = rplm;
        self
    }

    pub fn ref_pic_list_modification_l1(mut self, rplm: Vec<RefPicListModification>) -> Self {
        self.0.ref_pic_list_modification_flag_l1 = true;
        self.0.ref_pic_list_modification_l1 = rplm;
        self
    }

    pub fn dec_ref_pic_marking(mut self, marking: RefPicMarking) -> Self {
        self.0.dec_ref_pic_marking = marking;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_long_term_frame_idx_representation() {
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(0),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
        assert_eq!(
            MaxLongTermFrameIdx::NoLongTermFrameIndices.to_value_plus1(),
            0
        );
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(1),
            MaxLongTermFrameIdx::Idx(0)
        );
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(25),
            MaxLongTermFrameIdx::Idx(24)
        );

        assert!(MaxLongTermFrameIdx::NoLongTermFrameIndices < 0);
        assert_ne!(MaxLongTermFrameIdx::NoLongTermFrameIndices, 0);
        assert_eq!(MaxLongTermFrameIdx::Idx(0), 0);
        assert!(MaxLongTermFrameIdx::Idx(24) < 25);
    }

    #[test]
    fn mmco_from_parts_rejects_unknown_opcodes() {
        assert!(Mmco::from_parts(0, 0, 0, 0, 0).is_err());
        assert!(Mmco::from_parts(7, 0, 0, 0, 0).is_err());

        assert_eq!(
            Mmco::from_parts(1, 3, 0, 0, 0).unwrap(),
            Mmco::UnmarkShortTerm {
                difference_of_pic_nums_minus1: 3
            }
        );
        assert_eq!(Mmco::from_parts(5, 0, 0, 0, 0).unwrap(), Mmco::UnmarkAll);
        assert_eq!(
            Mmco::from_parts(4, 0, 0, 0, 3).unwrap(),
            Mmco::TruncateLongTerm {
                max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(2)
            }
        );
    }

    #[test]
    fn sps_derived_values() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::High)
            .level_idc(Level::L4)
            .resolution(1920, 1080)
            .max_num_ref_frames(4)
            .frame_mbs_only_flag(true)
            .max_frame_num(256)
            .max_pic_order_cnt_lsb(512)
            .build();

        assert_eq!(sps.width(), 1920);
        assert_eq!(sps.height(), 1088);
        assert_eq!(sps.max_frame_num(), 256);
        assert_eq!(sps.max_pic_order_cnt_lsb(), 512);
        // 32768 MaxDpbMbs / (120 * 68) macroblocks = 4 frames.
        assert_eq!(sps.max_dpb_frames(), 4);
    }
}
