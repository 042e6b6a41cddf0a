// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synthesis of small Annex-B NAL units for tests. Only the syntax the
//! parser consumes is emitted; everything downstream of the parse cutoff is
//! covered by rbsp_trailing_bits().

use crate::codec::h264::nalu_writer::NaluWriter;

pub(crate) struct SpsSpec {
    pub sps_id: u8,
    pub log2_max_frame_num_minus4: u8,
    pub poc_type: u8,
    pub log2_max_poc_lsb_minus4: u8,
    /// (num_units_in_tick, time_scale, fixed_frame_rate_flag)
    pub timing: Option<(u32, u32, bool)>,
    pub width_mbs: u16,
    pub height_mbs: u16,
}

impl Default for SpsSpec {
    fn default() -> Self {
        Self {
            sps_id: 0,
            log2_max_frame_num_minus4: 4,
            poc_type: 0,
            log2_max_poc_lsb_minus4: 4,
            timing: None,
            width_mbs: 40,
            height_mbs: 30,
        }
    }
}

/// Emits a baseline-profile SPS NAL unit.
pub(crate) fn sps(spec: &SpsSpec) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut w = NaluWriter::new(&mut buf);
        w.write_header(3, 7).unwrap();
        w.write_f(8, 66u32).unwrap(); // profile_idc: baseline
        w.write_f(8, 0u32).unwrap(); // constraint flags + reserved_zero_2bits
        w.write_f(8, 30u32).unwrap(); // level_idc
        w.write_ue(u32::from(spec.sps_id)).unwrap();
        w.write_ue(u32::from(spec.log2_max_frame_num_minus4)).unwrap();
        w.write_ue(u32::from(spec.poc_type)).unwrap();
        match spec.poc_type {
            0 => w.write_ue(u32::from(spec.log2_max_poc_lsb_minus4)).unwrap(),
            1 => {
                w.write_f(1, 0u32).unwrap(); // delta_pic_order_always_zero_flag
                w.write_se(0).unwrap(); // offset_for_non_ref_pic
                w.write_se(0).unwrap(); // offset_for_top_to_bottom_field
                w.write_ue(0u32).unwrap(); // num_ref_frames_in_pic_order_cnt_cycle
            }
            _ => (),
        }
        w.write_ue(1u32).unwrap(); // max_num_ref_frames
        w.write_f(1, 0u32).unwrap(); // gaps_in_frame_num_value_allowed_flag
        w.write_ue(u32::from(spec.width_mbs) - 1).unwrap();
        w.write_ue(u32::from(spec.height_mbs) - 1).unwrap();
        w.write_f(1, 1u32).unwrap(); // frame_mbs_only_flag
        w.write_f(1, 1u32).unwrap(); // direct_8x8_inference_flag
        w.write_f(1, 0u32).unwrap(); // frame_cropping_flag
        match spec.timing {
            Some((num_units_in_tick, time_scale, fixed)) => {
                w.write_f(1, 1u32).unwrap(); // vui_parameters_present_flag
                w.write_f(1, 0u32).unwrap(); // aspect_ratio_info_present_flag
                w.write_f(1, 0u32).unwrap(); // overscan_info_present_flag
                w.write_f(1, 0u32).unwrap(); // video_signal_type_present_flag
                w.write_f(1, 0u32).unwrap(); // chroma_loc_info_present_flag
                w.write_f(1, 1u32).unwrap(); // timing_info_present_flag
                w.write_f(32, num_units_in_tick).unwrap();
                w.write_f(32, time_scale).unwrap();
                w.write_f(1, fixed as u32).unwrap();
                // The parser stops here; the remaining VUI flags are absent
                // and folded into the trailing bits.
            }
            None => w.write_f(1, 0u32).unwrap(),
        }
        w.write_trailing_bits().unwrap();
    }
    buf
}

/// Emits a PPS NAL unit referencing `sps_id`, with no optional features.
pub(crate) fn pps(pps_id: u8, sps_id: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut w = NaluWriter::new(&mut buf);
        w.write_header(3, 8).unwrap();
        w.write_ue(u32::from(pps_id)).unwrap();
        w.write_ue(u32::from(sps_id)).unwrap();
        w.write_f(1, 0u32).unwrap(); // entropy_coding_mode_flag
        w.write_f(1, 0u32).unwrap(); // bottom_field_pic_order_in_frame_present_flag
        w.write_ue(0u32).unwrap(); // num_slice_groups_minus1
        w.write_ue(0u32).unwrap(); // num_ref_idx_l0_default_active_minus1
        w.write_ue(0u32).unwrap(); // num_ref_idx_l1_default_active_minus1
        w.write_f(1, 0u32).unwrap(); // weighted_pred_flag
        w.write_f(2, 0u32).unwrap(); // weighted_bipred_idc
        w.write_se(0).unwrap(); // pic_init_qp_minus26
        w.write_se(0).unwrap(); // pic_init_qs_minus26
        w.write_se(0).unwrap(); // chroma_qp_index_offset
        w.write_f(1, 0u32).unwrap(); // deblocking_filter_control_present_flag
        w.write_f(1, 0u32).unwrap(); // constrained_intra_pred_flag
        w.write_f(1, 0u32).unwrap(); // redundant_pic_cnt_present_flag
        w.write_trailing_bits().unwrap();
    }
    buf
}

/// Emits an access-unit delimiter NAL unit.
pub(crate) fn aud() -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut w = NaluWriter::new(&mut buf);
        w.write_header(0, 9).unwrap();
        w.write_f(3, 0u32).unwrap(); // primary_pic_type
        w.write_trailing_bits().unwrap();
    }
    buf
}

pub(crate) struct SliceSpec {
    pub idr: bool,
    pub ref_idc: u8,
    /// 0 = P, 1 = B, 2 = I.
    pub slice_type: u8,
    pub pps_id: u8,
    pub frame_num: u16,
    pub frame_num_bits: usize,
    pub idr_pic_id: u16,
    pub poc_lsb: u16,
    pub poc_bits: usize,
}

impl Default for SliceSpec {
    fn default() -> Self {
        Self {
            idr: false,
            ref_idc: 3,
            slice_type: 2,
            pps_id: 0,
            frame_num: 0,
            frame_num_bits: 8,
            idr_pic_id: 0,
            poc_lsb: 0,
            poc_bits: 8,
        }
    }
}

/// Emits a slice NAL unit whose header matches the synthesized SPS/PPS
/// (POC type 0, no optional PPS features). Only the header is meaningful;
/// there is no slice data behind it.
pub(crate) fn slice(spec: &SliceSpec) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut w = NaluWriter::new(&mut buf);
        w.write_header(spec.ref_idc, if spec.idr { 5 } else { 1 }).unwrap();
        w.write_ue(0u32).unwrap(); // first_mb_in_slice
        w.write_ue(u32::from(spec.slice_type)).unwrap();
        w.write_ue(u32::from(spec.pps_id)).unwrap();
        w.write_f(spec.frame_num_bits, u32::from(spec.frame_num)).unwrap();
        if spec.idr {
            w.write_ue(u32::from(spec.idr_pic_id)).unwrap();
        }
        w.write_f(spec.poc_bits, u32::from(spec.poc_lsb)).unwrap();

        match spec.slice_type {
            // P: num_ref_idx_active_override_flag, ref_pic_list_modification_flag_l0
            0 => {
                w.write_f(1, 0u32).unwrap();
                w.write_f(1, 0u32).unwrap();
            }
            // B: direct_spatial_mv_pred_flag, override flag, both list flags
            1 => {
                w.write_f(1, 0u32).unwrap();
                w.write_f(1, 0u32).unwrap();
                w.write_f(1, 0u32).unwrap();
                w.write_f(1, 0u32).unwrap();
            }
            _ => (),
        }

        if spec.ref_idc != 0 {
            if spec.idr {
                // no_output_of_prior_pics_flag, long_term_reference_flag
                w.write_f(2, 0u32).unwrap();
            } else {
                // adaptive_ref_pic_marking_mode_flag
                w.write_f(1, 0u32).unwrap();
            }
        }

        w.write_trailing_bits().unwrap();
    }
    buf
}
