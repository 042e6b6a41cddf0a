// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of the H.264 syntax elements a byte-stream demuxer needs: NALU
//! headers, SPS/PPS with their id-keyed caches, and the leading part of slice
//! headers up to and including dec_ref_pic_marking().
//!
//! Slice data itself is never touched here; the macroblock-level decoder is an
//! external collaborator.

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;
use thiserror::Error;

use crate::codec::h264::nalu_reader::NaluReader;

const MAX_SPS_COUNT: u8 = 32;
const MAX_PPS_COUNT: u16 = 256;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
const DPB_MAX_SIZE: u32 = 16;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
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
}

impl NaluType {
    /// Whether this NALU carries a coded picture slice.
    pub fn is_slice(&self) -> bool {
        matches!(self, NaluType::Slice | NaluType::SliceIdr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl NaluHeader {
    /// Parses the one-byte NALU header at the start of `data`.
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let byte = *data.first().ok_or(anyhow!("Broken Data"))?;

        if byte & 0x80 != 0 {
            return Err(anyhow!("Broken Data: forbidden_zero_bit set"));
        }

        let type_ = NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown);

        Ok(Self {
            ref_idc: byte >> 5,
            type_,
            idr_pic_flag: matches!(type_, NaluType::SliceIdr),
        })
    }
}

/// One NAL unit: its parsed header and the backing bytes, header byte
/// included. A view into the bitstream buffer, invalidated by compaction.
pub struct Nalu<'a> {
    pub header: NaluHeader,
    pub data: &'a [u8],
}

impl<'a> Nalu<'a> {
    pub fn new(data: &'a [u8]) -> anyhow::Result<Self> {
        Ok(Self {
            header: NaluHeader::parse(data)?,
            data,
        })
    }

    /// The RBSP payload, i.e. everything past the header byte.
    fn rbsp(&self) -> &[u8] {
        &self.data[1..]
    }
}

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
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

impl Default for SliceType {
    fn default() -> Self {
        Self::P
    }
}

/// The subset of VUI we care about: timing information, from which the
/// stream's frame rate is derived.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub timing_info_present_flag: bool,
    /// The number of time units of a clock operating at the frequency
    /// `time_scale` Hz that corresponds to one increment of a clock tick
    /// counter. See E.2.1.
    pub num_units_in_tick: u32,
    /// The number of time units that pass in one second. See E.2.1.
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by the
    /// picture parameter set.
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms.
    pub profile_idc: u8,

    /// Level to which the coded video sequence conforms.
    pub level_idc: u8,

    /// Specifies the chroma sampling relative to the luma sampling as
    /// specified in clause 6.2.
    pub chroma_format_idc: u8,

    /// Specifies whether the three colour components of the 4:4:4 chroma
    /// format are coded separately.
    pub separate_colour_plane_flag: bool,

    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,

    /// Specifies the value of the variable MaxFrameNum used in frame_num
    /// related derivations: MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4).
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count (clause 8.2.1).
    pub pic_order_cnt_type: u8,

    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4).
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// If true, `delta_pic_order_cnt[0]` and `delta_pic_order_cnt[1]` are not
    /// present in the slice headers of the sequence and shall be inferred to
    /// be equal to 0.
    pub delta_pic_order_always_zero_flag: bool,

    /// Used to calculate the picture order count of a non-reference picture
    /// as specified in clause 8.2.1.
    pub offset_for_non_ref_pic: i32,

    /// Used to calculate the picture order count of a bottom field as
    /// specified in clause 8.2.1.
    pub offset_for_top_to_bottom_field: i32,

    /// Used in the decoding process for picture order count (clause 8.2.1).
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,

    /// The per-cycle POC offset table used by POC type 1.
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1 specifies the width of each decoded picture in macroblocks.
    pub pic_width_in_mbs_minus1: u16,
    /// Plus 1 specifies the height in slice group map units of a decoded
    /// frame or field.
    pub pic_height_in_map_units_minus1: u16,

    /// If true, every coded picture of the sequence is a coded frame
    /// containing only frame macroblocks.
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    /// Returns the coded width of the stream.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Same as MaxFrameNum. See 7-10 in the specification.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11 in the specification.
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// Returns `ChromaArrayType`, as computed in the specification.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// The frame rate advertised by the VUI timing information, if any.
    ///
    /// A fixed-frame-rate stream ticks twice per frame (one tick per field),
    /// hence the factor of two.
    pub fn frame_rate(&self) -> Option<f64> {
        let vui = &self.vui_parameters;
        if !self.vui_parameters_present_flag || !vui.timing_info_present_flag {
            return None;
        }

        if vui.fixed_frame_rate_flag {
            Some(f64::from(vui.time_scale) / f64::from(2 * vui.num_units_in_tick))
        } else {
            Some(f64::from(vui.time_scale) / f64::from(vui.num_units_in_tick))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the picture parameter set that is referred to in the slice
    /// header.
    pub pic_parameter_set_id: u8,

    /// Refers to the active SPS.
    pub seq_parameter_set_id: u8,

    /// The SPS referred to by this PPS.
    pub sps: Rc<Sps>,

    pub entropy_coding_mode_flag: bool,

    /// If true, specifies that the syntax elements delta_pic_order_cnt_bottom
    /// (when pic_order_cnt_type is 0) or delta_pic_order_cnt[1] (when
    /// pic_order_cnt_type is 1) are present in slice headers for frames.
    pub bottom_field_pic_order_in_frame_present_flag: bool,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub redundant_pic_cnt_present_flag: bool,
}

/// An entry of the adaptive reference picture marking process, i.e. one
/// memory_management_control_operation with its payload. See Table 7-9.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    pub memory_management_control_operation: u8,
    pub difference_of_pic_nums_minus1: u32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u32,
    pub max_long_term_frame_idx_plus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<RefPicMarkingInner>,
}

impl RefPicMarking {
    /// Whether an MMCO equal to 5 ("clear reference state") is present.
    pub fn has_mmco_5(&self) -> bool {
        self.inner
            .iter()
            .any(|op| op.memory_management_control_operation == 5)
    }
}

/// The leading part of a slice header, parsed far enough to assemble coded
/// pictures: identity of the picture (frame_num, POC fields, IDR id) and the
/// reference picture marking.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// Specifies the coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,

    /// Specifies the picture parameter set in use.
    pub pic_parameter_set_id: u8,

    /// Specifies the colour plane associated with the current slice when
    /// `separate_colour_plane_flag` is set.
    pub colour_plane_id: u8,

    /// Used as an identifier for pictures; represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,

    /// If set, the slice belongs to a coded field rather than a coded frame.
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    /// Identifies an IDR picture. All slices of one IDR picture carry the
    /// same value; two consecutive IDR pictures carry different values.
    pub idr_pic_id: u16,

    /// The picture order count modulo MaxPicOrderCntLsb (POC type 0).
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,

    /// POC deltas for POC type 1.
    pub delta_pic_order_cnt: [i32; 2],

    pub redundant_pic_cnt: u8,

    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub dec_ref_pic_marking: RefPicMarking,
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// The NALU references a parameter set that is not in the cache.
    /// Recoverable: the caller discards the NALU and keeps scanning until the
    /// parameter sets show up again.
    #[error("references a parameter set that has not been successfully parsed")]
    MissingParameterSet,
    #[error(transparent)]
    Invalid(#[from] anyhow::Error),
}

/// Decodability score of a byte range, modeled after typical decoder probe
/// functions: a range containing a picture slice, an SPS and a PPS scores the
/// full 100 and is sufficient to bootstrap a decode context.
pub fn probe(data: &[u8]) -> u32 {
    let mut have_slice = false;
    let mut have_sps = false;
    let mut have_pps = false;

    let mut pos = 0;
    while let Some(offset) = find_start_code(data, pos) {
        let start = offset + 3;
        let end = match find_start_code(data, start) {
            Some(next) => next,
            None => data.len(),
        };

        if let Ok(hdr) = NaluHeader::parse(&data[start..end]) {
            match hdr.type_ {
                NaluType::Slice | NaluType::SliceIdr => have_slice = true,
                NaluType::Sps => have_sps = true,
                NaluType::Pps => have_pps = true,
                _ => (),
            }
        }

        pos = end;
    }

    let mut score = 0;
    if have_slice {
        score += 60;
    }
    if have_sps {
        score += 20;
    }
    if have_pps {
        score += 20;
    }
    score
}

/// Returns the index of the first three-byte start code `00 00 01` at or
/// after `from`, or `None`.
pub(crate) fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(3)
        .position(|window| window == [0x00, 0x00, 0x01])
        .map(|offset| from + offset)
}

/// Parses and caches SPSes and PPSes, and parses slice headers against those
/// caches.
///
/// All cross-call parser state lives here; the caches survive loss-triggered
/// buffer flushes and are only emptied by [`Parser::reset`].
#[derive(Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
}

impl Parser {
    fn skip_scaling_list(r: &mut NaluReader, size: usize) -> anyhow::Result<()> {
        let mut last_scale = 8i32;
        let mut next_scale = 8i32;

        for _ in 0..size {
            if next_scale != 0 {
                let delta_scale: i32 = r.read_se()?;
                next_scale = (last_scale + delta_scale + 256) % 256;
            }
            if next_scale != 0 {
                last_scale = next_scale;
            }
        }

        Ok(())
    }

    fn skip_sps_scaling_lists(r: &mut NaluReader, sps: &Sps) -> anyhow::Result<()> {
        let count = if sps.chroma_format_idc == 3 { 12 } else { 8 };

        for i in 0..count {
            let seq_scaling_list_present_flag = r.read_bit()?;
            if seq_scaling_list_present_flag {
                Parser::skip_scaling_list(r, if i < 6 { 16 } else { 64 })?;
            }
        }

        Ok(())
    }

    fn parse_vui(r: &mut NaluReader, sps: &mut Sps) -> anyhow::Result<()> {
        let vui = &mut sps.vui_parameters;

        let aspect_ratio_info_present_flag = r.read_bit()?;
        if aspect_ratio_info_present_flag {
            let aspect_ratio_idc: u32 = r.read_bits(8)?;
            if aspect_ratio_idc == 255 {
                // sar_width, sar_height
                r.skip_bits(32)?;
            }
        }

        let overscan_info_present_flag = r.read_bit()?;
        if overscan_info_present_flag {
            r.skip_bits(1)?;
        }

        let video_signal_type_present_flag = r.read_bit()?;
        if video_signal_type_present_flag {
            // video_format, video_full_range_flag
            r.skip_bits(4)?;
            let colour_description_present_flag = r.read_bit()?;
            if colour_description_present_flag {
                // colour_primaries, transfer_characteristics, matrix_coefficients
                r.skip_bits(24)?;
            }
        }

        let chroma_loc_info_present_flag = r.read_bit()?;
        if chroma_loc_info_present_flag {
            r.read_ue_max::<u8>(5)?;
            r.read_ue_max::<u8>(5)?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits::<u32>(31)? << 1;
            vui.num_units_in_tick |= r.read_bit()? as u32;
            if vui.num_units_in_tick == 0 {
                return Err(anyhow!(
                    "num_units_in_tick == 0, which is not allowed by E.2.1"
                ));
            }

            vui.time_scale = r.read_bits::<u32>(31)? << 1;
            vui.time_scale |= r.read_bit()? as u32;
            if vui.time_scale == 0 {
                return Err(anyhow!("time_scale == 0, which is not allowed by E.2.1"));
            }

            vui.fixed_frame_rate_flag = r.read_bit()?;
        }

        // Nothing past the timing information is of interest to the demuxer.

        Ok(())
    }

    /// Parse an SPS and add it to the cache, overwriting any previous entry
    /// with the same id.
    ///
    /// Returns a reference to the new SPS.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> anyhow::Result<&Rc<Sps>> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Sps,
                nalu.header.type_
            ));
        }

        let mut r = NaluReader::new(nalu.rbsp());
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            ..Default::default()
        };

        // constraint_setX_flags and reserved_zero_2bits
        r.skip_bits(8)?;

        sps.level_idc = r.read_bits(8)?;
        sps.seq_parameter_set_id = r.read_ue_max(31)?;

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_bit()?;
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;

            // qpprime_y_zero_transform_bypass_flag
            r.skip_bits(1)?;

            let seq_scaling_matrix_present_flag = r.read_bit()?;
            if seq_scaling_matrix_present_flag {
                // The list contents do not matter to a demuxer, but the bits
                // must be walked to reach the fields after them.
                Parser::skip_sps_scaling_lists(&mut r, &sps)?;
            }
        } else {
            sps.chroma_format_idc = 1;
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;

            for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                sps.offset_for_ref_frame.push(r.read_se()?);
            }
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_bit()?;
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps)?;
        }

        let key = sps.seq_parameter_set_id;

        if self.active_spses.len() >= MAX_SPS_COUNT as usize {
            return Err(anyhow!(
                "Broken data: number of active SPSs > MAX_SPS_COUNT"
            ));
        }

        let sps = Rc::new(sps);
        self.active_spses.insert(key, sps);
        Ok(&self.active_spses[&key])
    }

    /// Parse a PPS and add it to the cache, overwriting any previous entry
    /// with the same id. The SPS it references must already be cached.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<&Rc<Pps>, ParseError> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            return Err(anyhow!(
                "Invalid NALU type, expected {:?}, got {:?}",
                NaluType::Pps,
                nalu.header.type_
            )
            .into());
        }

        let mut r = NaluReader::new(nalu.rbsp());

        let pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;
        let seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;

        let sps = self
            .get_sps(seq_parameter_set_id)
            .ok_or(ParseError::MissingParameterSet)?;

        let mut pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            sps: Rc::clone(sps),
            entropy_coding_mode_flag: Default::default(),
            bottom_field_pic_order_in_frame_present_flag: Default::default(),
            num_ref_idx_l0_default_active_minus1: Default::default(),
            num_ref_idx_l1_default_active_minus1: Default::default(),
            weighted_pred_flag: Default::default(),
            weighted_bipred_idc: Default::default(),
            redundant_pic_cnt_present_flag: Default::default(),
        };

        pps.entropy_coding_mode_flag = r.read_bit()?;
        pps.bottom_field_pic_order_in_frame_present_flag = r.read_bit()?;

        let num_slice_groups_minus1: u32 = r.read_ue_max(7)?;
        if num_slice_groups_minus1 > 0 {
            return Err(anyhow!("Stream contains unsupported/unimplemented NALs").into());
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        // pic_init_qp_minus26, pic_init_qs_minus26, chroma_qp_index_offset
        r.read_se::<i32>()?;
        r.read_se::<i32>()?;
        r.read_se::<i32>()?;

        // deblocking_filter_control_present_flag, constrained_intra_pred_flag
        r.skip_bits(2)?;

        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        // The remaining optional fields (transform_8x8_mode_flag, picture
        // scaling lists, second_chroma_qp_index_offset) sit past everything a
        // slice-header parse depends on.

        let key = pps.pic_parameter_set_id;

        if self.active_ppses.len() >= MAX_PPS_COUNT as usize {
            return Err(anyhow!(
                "Broken data: number of active PPSs > MAX_PPS_COUNT"
            )
            .into());
        }

        let pps = Rc::new(pps);
        self.active_ppses.insert(key, pps);
        Ok(&self.active_ppses[&key])
    }

    fn skip_ref_pic_list_modification(r: &mut NaluReader) -> anyhow::Result<()> {
        loop {
            let modification_of_pic_nums_idc: u8 = r.read_ue_max(3)?;

            match modification_of_pic_nums_idc {
                0 | 1 => {
                    // abs_diff_pic_num_minus1
                    r.read_ue::<u32>()?;
                }
                2 => {
                    // long_term_pic_num
                    r.read_ue::<u32>()?;
                }
                3 => break,
                _ => unreachable!(),
            }
        }

        Ok(())
    }

    fn skip_ref_pic_list_modifications(
        r: &mut NaluReader,
        header: &SliceHeader,
    ) -> anyhow::Result<()> {
        if !header.slice_type.is_i() && !header.slice_type.is_si() {
            let ref_pic_list_modification_flag_l0 = r.read_bit()?;
            if ref_pic_list_modification_flag_l0 {
                Parser::skip_ref_pic_list_modification(r)?;
            }
        }

        if header.slice_type.is_b() {
            let ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if ref_pic_list_modification_flag_l1 {
                Parser::skip_ref_pic_list_modification(r)?;
            }
        }

        Ok(())
    }

    fn skip_pred_weight_table(
        r: &mut NaluReader,
        sps: &Sps,
        header: &SliceHeader,
    ) -> anyhow::Result<()> {
        // luma_log2_weight_denom
        r.read_ue_max::<u8>(7)?;
        if sps.chroma_array_type() != 0 {
            // chroma_log2_weight_denom
            r.read_ue_max::<u8>(7)?;
        }

        let mut skip_list = |num_refs: u8| -> anyhow::Result<()> {
            for _ in 0..=num_refs {
                let luma_weight_flag = r.read_bit()?;
                if luma_weight_flag {
                    r.read_se::<i32>()?;
                    r.read_se::<i32>()?;
                }

                if sps.chroma_array_type() != 0 {
                    let chroma_weight_flag = r.read_bit()?;
                    if chroma_weight_flag {
                        for _ in 0..2 {
                            r.read_se::<i32>()?;
                            r.read_se::<i32>()?;
                        }
                    }
                }
            }
            Ok(())
        };

        skip_list(header.num_ref_idx_l0_active_minus1)?;

        if header.slice_type.is_b() {
            skip_list(header.num_ref_idx_l1_active_minus1)?;
        }

        Ok(())
    }

    fn parse_dec_ref_pic_marking(
        r: &mut NaluReader,
        nalu_header: &NaluHeader,
        header: &mut SliceHeader,
    ) -> anyhow::Result<()> {
        let rpm = &mut header.dec_ref_pic_marking;

        if nalu_header.idr_pic_flag {
            rpm.no_output_of_prior_pics_flag = r.read_bit()?;
            rpm.long_term_reference_flag = r.read_bit()?;
        } else {
            rpm.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;

            if rpm.adaptive_ref_pic_marking_mode_flag {
                loop {
                    let mut marking = RefPicMarkingInner::default();

                    let mem_mgmt_ctrl_op = r.read_ue_max::<u8>(6)?;
                    marking.memory_management_control_operation = mem_mgmt_ctrl_op;

                    if mem_mgmt_ctrl_op == 0 {
                        break;
                    }

                    if mem_mgmt_ctrl_op == 1 || mem_mgmt_ctrl_op == 3 {
                        marking.difference_of_pic_nums_minus1 = r.read_ue()?;
                    }

                    if mem_mgmt_ctrl_op == 2 {
                        marking.long_term_pic_num = r.read_ue()?;
                    }

                    if mem_mgmt_ctrl_op == 3 || mem_mgmt_ctrl_op == 6 {
                        marking.long_term_frame_idx = r.read_ue()?;
                    }

                    if mem_mgmt_ctrl_op == 4 {
                        marking.max_long_term_frame_idx_plus1 = r.read_ue()?;
                    }

                    rpm.inner.push(marking);
                }
            }
        }

        Ok(())
    }

    /// Parse the leading part of a slice header, up to and including
    /// dec_ref_pic_marking().
    ///
    /// This is as far as picture assembly needs to look, and conveniently
    /// before anything that would require entropy decoding state.
    pub fn parse_slice_header(&self, nalu: &Nalu) -> Result<SliceHeader, ParseError> {
        if !nalu.header.type_.is_slice() {
            return Err(anyhow!(
                "Invalid NALU type: {:?} is not a slice NALU",
                nalu.header.type_
            )
            .into());
        }

        let mut r = NaluReader::new(nalu.rbsp());

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type = SliceType::n(slice_type)
            .with_context(|| format!("Invalid slice type {}", slice_type))?;

        header.pic_parameter_set_id = r.read_ue()?;

        let pps = self
            .get_pps(header.pic_parameter_set_id)
            .ok_or(ParseError::MissingParameterSet)?;

        let sps = &pps.sps;

        if sps.separate_colour_plane_flag {
            header.colour_plane_id = r.read_bits(2)?;
        }

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type == 0 {
            header.pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }

        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            header.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
                header.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            // direct_spatial_mv_pred_flag
            r.skip_bits(1)?;
        }

        if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue()?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue()?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        if header.num_ref_idx_l0_active_minus1 > 31 || header.num_ref_idx_l1_active_minus1 > 31 {
            return Err(anyhow!("Broken Data").into());
        }

        Parser::skip_ref_pic_list_modifications(&mut r, &header)?;

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            Parser::skip_pred_weight_table(&mut r, sps, &header)?;
        }

        if nalu.header.ref_idc != 0 {
            Parser::parse_dec_ref_pic_marking(&mut r, &nalu.header, &mut header)?;
        }

        Ok(header)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&pps_id)
    }

    /// Whether at least one SPS and one PPS have been cached, i.e. whether
    /// slice headers stand a chance of parsing.
    pub fn have_parameter_sets(&self) -> bool {
        !self.active_spses.is_empty() && !self.active_ppses.is_empty()
    }

    /// Forget all cached parameter sets. Used on full stream restart, not on
    /// loss recovery (parameter sets normally survive loss).
    pub fn reset(&mut self) {
        self.active_spses.clear();
        self.active_ppses.clear();
    }
}

impl From<crate::codec::h264::nalu_reader::ReadBitsError> for ParseError {
    fn from(err: crate::codec::h264::nalu_reader::ReadBitsError) -> Self {
        ParseError::Invalid(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::synth;

    #[test]
    fn parse_sps_with_fixed_frame_rate() {
        let data = synth::sps(&synth::SpsSpec {
            sps_id: 0,
            log2_max_frame_num_minus4: 4,
            poc_type: 0,
            log2_max_poc_lsb_minus4: 4,
            timing: Some((1, 50, true)),
            width_mbs: 40,
            height_mbs: 30,
        });

        let mut parser = Parser::default();
        let nalu = Nalu::new(&data[3..]).unwrap();
        let sps = parser.parse_sps(&nalu).unwrap();

        assert_eq!(sps.seq_parameter_set_id, 0);
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.log2_max_frame_num_minus4, 4);
        assert_eq!(sps.pic_order_cnt_type, 0);
        assert_eq!(sps.log2_max_pic_order_cnt_lsb_minus4, 4);
        assert_eq!(sps.max_frame_num(), 256);
        assert_eq!(sps.width(), 640);
        assert_eq!(sps.height(), 480);
        assert_eq!(sps.frame_rate(), Some(25.0));
    }

    #[test]
    fn parse_sps_without_vui_has_no_frame_rate() {
        let data = synth::sps(&synth::SpsSpec {
            timing: None,
            ..synth::SpsSpec::default()
        });

        let mut parser = Parser::default();
        let nalu = Nalu::new(&data[3..]).unwrap();
        let sps = parser.parse_sps(&nalu).unwrap();

        assert_eq!(sps.frame_rate(), None);
    }

    #[test]
    fn parse_pps_requires_cached_sps() {
        let data = synth::pps(0, 0);

        let mut parser = Parser::default();
        let nalu = Nalu::new(&data[3..]).unwrap();
        assert!(matches!(
            parser.parse_pps(&nalu),
            Err(ParseError::MissingParameterSet)
        ));
    }

    #[test]
    fn parse_idr_slice_header() {
        let mut parser = Parser::default();

        let sps = synth::sps(&synth::SpsSpec::default());
        let nalu = Nalu::new(&sps[3..]).unwrap();
        parser.parse_sps(&nalu).unwrap();

        let pps = synth::pps(0, 0);
        let nalu = Nalu::new(&pps[3..]).unwrap();
        parser.parse_pps(&nalu).unwrap();

        let slice = synth::slice(&synth::SliceSpec {
            idr: true,
            idr_pic_id: 3,
            frame_num: 0,
            poc_lsb: 0,
            ..synth::SliceSpec::default()
        });
        let nalu = Nalu::new(&slice[3..]).unwrap();
        let header = parser.parse_slice_header(&nalu).unwrap();

        assert_eq!(header.slice_type, SliceType::I);
        assert_eq!(header.pic_parameter_set_id, 0);
        assert_eq!(header.frame_num, 0);
        assert_eq!(header.idr_pic_id, 3);
        assert_eq!(header.pic_order_cnt_lsb, 0);
        assert!(!header.dec_ref_pic_marking.has_mmco_5());
    }

    #[test]
    fn slice_header_without_pps_is_missing_parameter_set() {
        let parser = Parser::default();

        let slice = synth::slice(&synth::SliceSpec::default());
        let nalu = Nalu::new(&slice[3..]).unwrap();
        assert!(matches!(
            parser.parse_slice_header(&nalu),
            Err(ParseError::MissingParameterSet)
        ));
    }

    #[test]
    fn probe_scores() {
        let sps = synth::sps(&synth::SpsSpec::default());
        let pps = synth::pps(0, 0);
        let idr = synth::slice(&synth::SliceSpec {
            idr: true,
            ..synth::SliceSpec::default()
        });

        let mut all = Vec::new();
        all.extend_from_slice(&sps);
        all.extend_from_slice(&pps);
        all.extend_from_slice(&idr);

        assert_eq!(probe(&all), 100);
        assert_eq!(probe(&sps), 20);
        assert_eq!(probe(&pps), 20);
        assert_eq!(probe(&idr), 60);

        let mut no_sps = Vec::new();
        no_sps.extend_from_slice(&pps);
        no_sps.extend_from_slice(&idr);
        assert_eq!(probe(&no_sps), 80);
    }

    #[test]
    fn find_start_code_spanning_offsets() {
        let data = [0x00u8, 0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x01, 0x68];
        assert_eq!(find_start_code(&data, 0), Some(1));
        assert_eq!(find_start_code(&data, 2), Some(5));
        assert_eq!(find_start_code(&data, 6), None);
    }
}
