//! H.264 bitstream parsing and NAL unit re-framing.
//!
//! The demuxer hands over length-prefixed MP4 samples plus the avcC SPS/PPS;
//! this module turns them into what the decode session needs: Annex-B slice
//! data for the bitstream buffer, a parsed picture record per access unit,
//! and `StdVideoH264*` parameter sets for the session parameters object.
//! The heavy lifting (exp-Golomb, emulation prevention) is done by the
//! `h264-reader` crate.

use crate::error::{Result, TranscodeError};
use ash::vk::native as std_video;
use h264_reader::nal::pps::PicParameterSet;
use h264_reader::nal::slice::{FieldPic, SliceHeader};
use h264_reader::nal::sps::{ChromaFormat, PicOrderCntType, SeqParameterSet};
use h264_reader::nal::{Nal, RefNal, UnitType};
use h264_reader::Context;

const START_CODE: [u8; 3] = [0, 0, 1];

/// One picture's worth of slice data, staged for the decoder.
pub struct AccessUnit {
    /// Slice NAL units with Annex-B start codes, ready for the bitstream buffer.
    pub annexb: Vec<u8>,
    /// Byte offset of each slice's start code within `annexb`.
    pub slice_offsets: Vec<u32>,
    /// Parsed picture-level information from the first slice header.
    pub picture: PictureInfo,
    /// True when the access unit replaced the active SPS/PPS; the decode
    /// session parameters must be rebuilt before this picture is recorded.
    pub parameters_changed: bool,
}

/// Picture-level fields the decode command needs.
#[derive(Debug, Clone, Copy)]
pub struct PictureInfo {
    pub is_idr: bool,
    pub is_reference: bool,
    pub frame_num: u16,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u32,
    /// Derived picture order count (top == bottom for progressive frames).
    pub poc: i32,
    pub sps_id: u8,
    pub pps_id: u8,
}

/// Stream geometry derived from the active SPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    /// Macroblock-aligned coded size (the decoder's coded extent).
    pub coded_width: u32,
    pub coded_height: u32,
    /// Cropped display size.
    pub display_width: u32,
    pub display_height: u32,
}

/// Fields of the active SPS the POC derivation and DPB need repeatedly.
#[derive(Debug, Clone, Copy)]
pub struct SpsSummary {
    pub poc_type: u8,
    pub log2_max_frame_num_minus4: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_num_ref_frames: u32,
}

/// Stateful parser for one H.264 video track.
pub struct AccessUnitParser {
    ctx: Context,
    summary: SpsSummary,
    geometry: StreamGeometry,
    std_sps: std_video::StdVideoH264SequenceParameterSet,
    std_pps: std_video::StdVideoH264PictureParameterSet,
    poc: PocState,
}

impl AccessUnitParser {
    /// Parse the container-supplied SPS and PPS NAL units (header byte
    /// included, no start codes or length prefixes).
    pub fn new(sps_nal: &[u8], pps_nal: &[u8]) -> Result<Self> {
        let sps = parse_sps(sps_nal)?;
        let mut ctx = Context::new();
        let pps = {
            ctx.put_seq_param_set(sps.clone());
            parse_pps(&ctx, pps_nal)?
        };

        let summary = summarize_sps(&sps)?;
        let geometry = geometry_from_sps(&sps)?;
        let std_sps = build_std_sps(&sps)?;
        let std_pps = build_std_pps(&sps, &pps);
        ctx.put_pic_param_set(pps);

        Ok(Self {
            ctx,
            summary,
            geometry,
            std_sps,
            std_pps,
            poc: PocState::default(),
        })
    }

    pub fn geometry(&self) -> StreamGeometry {
        self.geometry
    }

    pub fn sps_summary(&self) -> SpsSummary {
        self.summary
    }

    /// The active SPS as the Vulkan Std record. Pointer members are null:
    /// scaling matrices and VUI are not forwarded, and POC type 1 streams
    /// are rejected before this is ever consumed.
    pub fn std_sps(&self) -> std_video::StdVideoH264SequenceParameterSet {
        self.std_sps
    }

    pub fn std_pps(&self) -> std_video::StdVideoH264PictureParameterSet {
        self.std_pps
    }

    /// Parse one MP4 sample (length-prefixed NAL units) into an access unit.
    ///
    /// Slice NALs are re-framed with Annex-B start codes; in-band SPS/PPS
    /// replace the active parameter sets; SEI and delimiters are dropped.
    pub fn parse_sample(&mut self, sample: &[u8]) -> Result<AccessUnit> {
        let nals = split_length_prefixed(sample)?;

        let mut annexb = Vec::with_capacity(sample.len() + 8);
        let mut slice_offsets = Vec::new();
        let mut picture: Option<PictureInfo> = None;
        let mut parameters_changed = false;

        for nal in nals {
            let unit_type = nal_unit_type(nal)?;
            match unit_type {
                UnitType::SeqParameterSet => {
                    let sps = parse_sps(nal)?;
                    self.summary = summarize_sps(&sps)?;
                    let geometry = geometry_from_sps(&sps)?;
                    if geometry != self.geometry {
                        return Err(TranscodeError::BadInput(
                            "resolution change mid-stream is not supported".to_string(),
                        ));
                    }
                    self.std_sps = build_std_sps(&sps)?;
                    self.ctx.put_seq_param_set(sps);
                    parameters_changed = true;
                }
                UnitType::PicParameterSet => {
                    let pps = parse_pps(&self.ctx, nal)?;
                    let sps = sps_for_pps(&self.ctx, &pps)?;
                    self.std_pps = build_std_pps(&sps, &pps);
                    self.ctx.put_pic_param_set(pps);
                    parameters_changed = true;
                }
                UnitType::SliceLayerWithoutPartitioningIdr
                | UnitType::SliceLayerWithoutPartitioningNonIdr => {
                    if picture.is_none() {
                        let is_idr = unit_type == UnitType::SliceLayerWithoutPartitioningIdr;
                        picture = Some(self.parse_slice(nal, is_idr)?);
                    }
                    slice_offsets.push(annexb.len() as u32);
                    annexb.extend_from_slice(&START_CODE);
                    annexb.extend_from_slice(nal);
                }
                _ => {}
            }
        }

        let picture = picture.ok_or_else(|| {
            TranscodeError::BitstreamParse("access unit contains no slice data".to_string())
        })?;

        Ok(AccessUnit {
            annexb,
            slice_offsets,
            picture,
            parameters_changed,
        })
    }

    fn parse_slice(&mut self, nal: &[u8], is_idr: bool) -> Result<PictureInfo> {
        let ref_nal = RefNal::new(nal, &[], true);
        let header = ref_nal
            .header()
            .map_err(|e| TranscodeError::BitstreamParse(format!("slice NAL header: {e:?}")))?;
        let is_reference = header.nal_ref_idc() != 0;

        let (slice, _sps, pps) =
            SliceHeader::from_bits(&self.ctx, &mut ref_nal.rbsp_bits(), header)
                .map_err(|e| TranscodeError::BitstreamParse(format!("slice header: {e:?}")))?;

        if matches!(slice.field_pic, FieldPic::Field(..)) {
            return Err(TranscodeError::BadInput(
                "interlaced (field-coded) content is not supported".to_string(),
            ));
        }

        let pps_id = pps.pic_parameter_set_id.id();
        let sps_id = pps.seq_parameter_set_id.id();
        let frame_num = slice.frame_num;
        let pic_order_cnt_lsb = match slice.pic_order_cnt_lsb {
            Some(h264_reader::nal::slice::PicOrderCountLsb::Frame(v)) => v,
            Some(h264_reader::nal::slice::PicOrderCountLsb::FieldsAbsolute {
                pic_order_cnt_lsb,
                ..
            }) => pic_order_cnt_lsb,
            _ => 0,
        };
        let idr_pic_id = slice.idr_pic_id.unwrap_or(0) as u16;

        let poc = self.poc.next(
            &self.summary,
            is_idr,
            is_reference,
            u32::from(frame_num),
            pic_order_cnt_lsb,
        )?;

        Ok(PictureInfo {
            is_idr,
            is_reference,
            frame_num,
            idr_pic_id,
            pic_order_cnt_lsb,
            poc,
            sps_id,
            pps_id,
        })
    }
}

fn parse_sps(nal: &[u8]) -> Result<SeqParameterSet> {
    let ref_nal = RefNal::new(nal, &[], true);
    SeqParameterSet::from_bits(ref_nal.rbsp_bits())
        .map_err(|e| TranscodeError::BitstreamParse(format!("SPS: {e:?}")))
}

fn parse_pps(ctx: &Context, nal: &[u8]) -> Result<PicParameterSet> {
    let ref_nal = RefNal::new(nal, &[], true);
    PicParameterSet::from_bits(ctx, ref_nal.rbsp_bits())
        .map_err(|e| TranscodeError::BitstreamParse(format!("PPS: {e:?}")))
}

fn sps_for_pps(ctx: &Context, pps: &PicParameterSet) -> Result<SeqParameterSet> {
    ctx.sps_by_id(pps.seq_parameter_set_id)
        .cloned()
        .ok_or_else(|| {
            TranscodeError::BitstreamParse("PPS references an unknown SPS".to_string())
        })
}

fn nal_unit_type(nal: &[u8]) -> Result<UnitType> {
    let ref_nal = RefNal::new(nal, &[], true);
    Ok(ref_nal
        .header()
        .map_err(|e| TranscodeError::BitstreamParse(format!("NAL header: {e:?}")))?
        .nal_unit_type())
}

fn summarize_sps(sps: &SeqParameterSet) -> Result<SpsSummary> {
    let (poc_type, log2_max_pic_order_cnt_lsb_minus4) = match &sps.pic_order_cnt {
        PicOrderCntType::TypeZero {
            log2_max_pic_order_cnt_lsb_minus4,
        } => (0, *log2_max_pic_order_cnt_lsb_minus4),
        PicOrderCntType::TypeOne { .. } => {
            return Err(TranscodeError::BitstreamParse(
                "pic_order_cnt_type 1 is not supported".to_string(),
            ));
        }
        PicOrderCntType::TypeTwo => (2, 0),
    };

    Ok(SpsSummary {
        poc_type,
        log2_max_frame_num_minus4: sps.log2_max_frame_num_minus4,
        log2_max_pic_order_cnt_lsb_minus4,
        max_num_ref_frames: sps.max_num_ref_frames,
    })
}

fn geometry_from_sps(sps: &SeqParameterSet) -> Result<StreamGeometry> {
    let (display_width, display_height) = sps
        .pixel_dimensions()
        .map_err(|e| TranscodeError::BitstreamParse(format!("SPS dimensions: {e:?}")))?;

    if !matches!(
        sps.frame_mbs_flags,
        h264_reader::nal::sps::FrameMbsFlags::Frames
    ) {
        return Err(TranscodeError::BadInput(
            "interlaced (MBAFF/field) content is not supported".to_string(),
        ));
    }

    Ok(StreamGeometry {
        coded_width: (sps.pic_width_in_mbs_minus1 + 1) * 16,
        coded_height: (sps.pic_height_in_map_units_minus1 + 1) * 16,
        display_width,
        display_height,
    })
}

fn std_profile_idc(profile_idc: u8) -> Result<std_video::StdVideoH264ProfileIdc> {
    match profile_idc {
        66 => Ok(std_video::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_BASELINE),
        77 => Ok(std_video::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_MAIN),
        100 => Ok(std_video::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH),
        other => Err(TranscodeError::BadInput(format!(
            "unsupported H.264 profile_idc {other}"
        ))),
    }
}

fn std_level_idc(level_idc: u8) -> std_video::StdVideoH264LevelIdc {
    use std_video::*;
    match level_idc {
        0..=10 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_0,
        11 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_1,
        12 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_2,
        13 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_1_3,
        14..=20 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_2_0,
        21 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_2_1,
        22 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_2_2,
        23..=30 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_3_0,
        31 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_3_1,
        32 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_3_2,
        33..=40 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_0,
        41 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_1,
        42 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_4_2,
        43..=50 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_0,
        51 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_1,
        52 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_5_2,
        53..=60 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_6_0,
        61 => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_6_1,
        _ => StdVideoH264LevelIdc_STD_VIDEO_H264_LEVEL_IDC_6_2,
    }
}

fn std_chroma_format_idc(format: &ChromaFormat) -> Result<std_video::StdVideoH264ChromaFormatIdc> {
    use std_video::*;
    match format {
        ChromaFormat::YUV420 => {
            Ok(StdVideoH264ChromaFormatIdc_STD_VIDEO_H264_CHROMA_FORMAT_IDC_420)
        }
        other => Err(TranscodeError::BadInput(format!(
            "unsupported chroma format {other:?}; only 4:2:0 is handled"
        ))),
    }
}

/// Convert the parsed SPS into the decoder's Std record.
pub(crate) fn build_std_sps(
    sps: &SeqParameterSet,
) -> Result<std_video::StdVideoH264SequenceParameterSet> {
    let mut flags: std_video::StdVideoH264SpsFlags = unsafe { std::mem::zeroed() };
    if sps.direct_8x8_inference_flag {
        flags.set_direct_8x8_inference_flag(1);
    }
    // Progressive-only input: frame_mbs_only is enforced by geometry_from_sps.
    flags.set_frame_mbs_only_flag(1);
    if sps.gaps_in_frame_num_value_allowed_flag {
        flags.set_gaps_in_frame_num_value_allowed_flag(1);
    }
    if sps.chroma_info.qpprime_y_zero_transform_bypass_flag {
        flags.set_qpprime_y_zero_transform_bypass_flag(1);
    }
    if sps.frame_cropping.is_some() {
        flags.set_frame_cropping_flag(1);
    }

    let (pic_order_cnt_type, log2_max_pic_order_cnt_lsb_minus4) = match &sps.pic_order_cnt {
        PicOrderCntType::TypeZero {
            log2_max_pic_order_cnt_lsb_minus4,
        } => (
            std_video::StdVideoH264PocType_STD_VIDEO_H264_POC_TYPE_0,
            *log2_max_pic_order_cnt_lsb_minus4,
        ),
        PicOrderCntType::TypeOne { .. } => {
            return Err(TranscodeError::BitstreamParse(
                "pic_order_cnt_type 1 is not supported".to_string(),
            ));
        }
        PicOrderCntType::TypeTwo => (std_video::StdVideoH264PocType_STD_VIDEO_H264_POC_TYPE_2, 0),
    };

    let (crop_left, crop_right, crop_top, crop_bottom) = match &sps.frame_cropping {
        Some(crop) => (
            crop.left_offset,
            crop.right_offset,
            crop.top_offset,
            crop.bottom_offset,
        ),
        None => (0, 0, 0, 0),
    };

    Ok(std_video::StdVideoH264SequenceParameterSet {
        flags,
        profile_idc: std_profile_idc(u8::from(sps.profile_idc))?,
        level_idc: std_level_idc(sps.level_idc),
        chroma_format_idc: std_chroma_format_idc(&sps.chroma_info.chroma_format)?,
        seq_parameter_set_id: sps.seq_parameter_set_id.id(),
        bit_depth_luma_minus8: sps.chroma_info.bit_depth_luma_minus8,
        bit_depth_chroma_minus8: sps.chroma_info.bit_depth_chroma_minus8,
        log2_max_frame_num_minus4: sps.log2_max_frame_num_minus4,
        pic_order_cnt_type,
        offset_for_non_ref_pic: 0,
        offset_for_top_to_bottom_field: 0,
        log2_max_pic_order_cnt_lsb_minus4,
        num_ref_frames_in_pic_order_cnt_cycle: 0,
        max_num_ref_frames: sps.max_num_ref_frames as u8,
        reserved1: 0,
        pic_width_in_mbs_minus1: sps.pic_width_in_mbs_minus1,
        pic_height_in_map_units_minus1: sps.pic_height_in_map_units_minus1,
        frame_crop_left_offset: crop_left,
        frame_crop_right_offset: crop_right,
        frame_crop_top_offset: crop_top,
        frame_crop_bottom_offset: crop_bottom,
        reserved2: 0,
        pOffsetForRefFrame: std::ptr::null(),
        pScalingLists: std::ptr::null(),
        pSequenceParameterSetVui: std::ptr::null(),
    })
}

/// Convert the parsed PPS into the decoder's Std record.
pub(crate) fn build_std_pps(
    sps: &SeqParameterSet,
    pps: &PicParameterSet,
) -> std_video::StdVideoH264PictureParameterSet {
    let mut flags: std_video::StdVideoH264PpsFlags = unsafe { std::mem::zeroed() };
    if pps.entropy_coding_mode_flag {
        flags.set_entropy_coding_mode_flag(1);
    }
    if pps.bottom_field_pic_order_in_frame_present_flag {
        flags.set_bottom_field_pic_order_in_frame_present_flag(1);
    }
    if pps.weighted_pred_flag {
        flags.set_weighted_pred_flag(1);
    }
    if pps.deblocking_filter_control_present_flag {
        flags.set_deblocking_filter_control_present_flag(1);
    }
    if pps.constrained_intra_pred_flag {
        flags.set_constrained_intra_pred_flag(1);
    }
    if pps.redundant_pic_cnt_present_flag {
        flags.set_redundant_pic_cnt_present_flag(1);
    }

    let (transform_8x8, second_chroma_qp_index_offset) = match &pps.extension {
        Some(ext) => (
            ext.transform_8x8_mode_flag,
            ext.second_chroma_qp_index_offset as i8,
        ),
        None => (false, pps.chroma_qp_index_offset as i8),
    };
    if transform_8x8 {
        flags.set_transform_8x8_mode_flag(1);
    }

    let weighted_bipred_idc = match pps.weighted_bipred_idc {
        1 => std_video::StdVideoH264WeightedBipredIdc_STD_VIDEO_H264_WEIGHTED_BIPRED_IDC_EXPLICIT,
        2 => std_video::StdVideoH264WeightedBipredIdc_STD_VIDEO_H264_WEIGHTED_BIPRED_IDC_IMPLICIT,
        _ => std_video::StdVideoH264WeightedBipredIdc_STD_VIDEO_H264_WEIGHTED_BIPRED_IDC_DEFAULT,
    };

    std_video::StdVideoH264PictureParameterSet {
        flags,
        seq_parameter_set_id: sps.seq_parameter_set_id.id(),
        pic_parameter_set_id: pps.pic_parameter_set_id.id(),
        num_ref_idx_l0_default_active_minus1: pps.num_ref_idx_l0_default_active_minus1 as u8,
        num_ref_idx_l1_default_active_minus1: pps.num_ref_idx_l1_default_active_minus1 as u8,
        weighted_bipred_idc,
        pic_init_qp_minus26: pps.pic_init_qp_minus26 as i8,
        pic_init_qs_minus26: pps.pic_init_qs_minus26 as i8,
        chroma_qp_index_offset: pps.chroma_qp_index_offset as i8,
        second_chroma_qp_index_offset,
        pScalingLists: std::ptr::null(),
    }
}

/// Picture order count derivation state (ITU-T H.264 §8.2.1, types 0 and 2).
#[derive(Debug, Default)]
struct PocState {
    prev_msb: i32,
    prev_lsb: i32,
    prev_frame_num: u32,
    frame_num_offset: u32,
}

impl PocState {
    fn next(
        &mut self,
        sps: &SpsSummary,
        is_idr: bool,
        is_reference: bool,
        frame_num: u32,
        pic_order_cnt_lsb: u32,
    ) -> Result<i32> {
        match sps.poc_type {
            0 => {
                if is_idr {
                    self.prev_msb = 0;
                    self.prev_lsb = 0;
                }
                let max_lsb = 1i32 << (sps.log2_max_pic_order_cnt_lsb_minus4 + 4);
                let lsb = pic_order_cnt_lsb as i32;
                let msb = if lsb < self.prev_lsb && (self.prev_lsb - lsb) >= max_lsb / 2 {
                    self.prev_msb + max_lsb
                } else if lsb > self.prev_lsb && (lsb - self.prev_lsb) > max_lsb / 2 {
                    self.prev_msb - max_lsb
                } else {
                    self.prev_msb
                };
                if is_reference {
                    self.prev_msb = msb;
                    self.prev_lsb = lsb;
                }
                Ok(msb + lsb)
            }
            2 => {
                let max_frame_num = 1u32 << (sps.log2_max_frame_num_minus4 + 4);
                if is_idr {
                    self.frame_num_offset = 0;
                } else if frame_num < self.prev_frame_num {
                    self.frame_num_offset += max_frame_num;
                }
                self.prev_frame_num = frame_num;
                let tmp = (self.frame_num_offset + frame_num) as i32;
                Ok(if is_reference { 2 * tmp } else { 2 * tmp - 1 })
            }
            other => Err(TranscodeError::BitstreamParse(format!(
                "pic_order_cnt_type {other} is not supported"
            ))),
        }
    }
}

/// Split a length-prefixed MP4 sample into NAL units.
///
/// The avcC length size is nearly always 4; the reader does not expose it,
/// so the prefix width is inferred: the first width in {4, 2, 1} whose
/// length chain exactly consumes the sample wins.
pub(crate) fn split_length_prefixed(sample: &[u8]) -> Result<Vec<&[u8]>> {
    for prefix_len in [4usize, 2, 1] {
        if let Some(nals) = try_split(sample, prefix_len) {
            return Ok(nals);
        }
    }
    Err(TranscodeError::BitstreamParse(
        "sample is not valid length-prefixed NAL data".to_string(),
    ))
}

fn try_split(sample: &[u8], prefix_len: usize) -> Option<Vec<&[u8]>> {
    let mut nals = Vec::new();
    let mut offset = 0usize;
    while offset < sample.len() {
        if offset + prefix_len > sample.len() {
            return None;
        }
        let mut len = 0usize;
        for &byte in &sample[offset..offset + prefix_len] {
            len = (len << 8) | byte as usize;
        }
        offset += prefix_len;
        if len == 0 || offset + len > sample.len() {
            return None;
        }
        nals.push(&sample[offset..offset + len]);
        offset += len;
    }
    if nals.is_empty() {
        None
    } else {
        Some(nals)
    }
}

/// Find NAL unit payload ranges in an Annex-B stream (3- or 4-byte start codes).
pub(crate) fn find_nal_units(data: &[u8]) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut i = 0;
    let len = data.len();

    while i + 3 <= len {
        if data[i] == 0 && data[i + 1] == 0 {
            let nal_start = if data[i + 2] == 1 {
                i + 3
            } else if i + 4 <= len && data[i + 2] == 0 && data[i + 3] == 1 {
                i + 4
            } else {
                i += 1;
                continue;
            };

            let mut nal_end = len;
            let mut j = nal_start;
            while j + 3 <= len {
                if data[j] == 0
                    && data[j + 1] == 0
                    && (data[j + 2] == 1 || (j + 4 <= len && data[j + 2] == 0 && data[j + 3] == 1))
                {
                    nal_end = j;
                    break;
                }
                j += 1;
            }

            if nal_start < nal_end {
                units.push((nal_start, nal_end));
            }
            i = nal_end;
        } else {
            i += 1;
        }
    }

    units
}

/// Convert an Annex-B access unit to length-prefixed NAL units (4-byte,
/// big-endian), the framing MP4 samples use.
pub(crate) fn annexb_to_length_prefixed(data: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len() + 16);
    for (start, end) in find_nal_units(data) {
        let nal = &data[start..end];
        output.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        output.extend_from_slice(nal);
    }
    output
}

/// Whether an Annex-B HEVC access unit starts a random-access point.
///
/// True when the first VCL NAL unit is an IRAP picture (BLA/IDR/CRA,
/// nal_unit_type 16..=21).
pub(crate) fn hevc_is_keyframe(annexb: &[u8]) -> bool {
    for (start, _end) in find_nal_units(annexb) {
        let nal_type = (annexb[start] >> 1) & 0x3F;
        if nal_type < 32 {
            return (16..=21).contains(&nal_type);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal big-endian bit writer with exp-Golomb support, enough to
    /// synthesize parameter sets and slice headers for parser tests.
    struct BitWriter {
        bytes: Vec<u8>,
        bit: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        fn put_bit(&mut self, value: u32) {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            if value != 0 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 1 << (7 - self.bit);
            }
            self.bit = (self.bit + 1) % 8;
        }

        fn put_bits(&mut self, count: u32, value: u32) {
            for i in (0..count).rev() {
                self.put_bit((value >> i) & 1);
            }
        }

        fn put_ue(&mut self, value: u32) {
            let code = value + 1;
            let bits = 32 - code.leading_zeros();
            self.put_bits(bits - 1, 0);
            self.put_bits(bits, code);
        }

        fn put_se(&mut self, value: i32) {
            let code = if value <= 0 {
                (-2 * value) as u32
            } else {
                (2 * value - 1) as u32
            };
            self.put_ue(code);
        }

        fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit + alignment
            self.put_bit(1);
            while self.bit != 0 {
                self.put_bit(0);
            }
            self.bytes
        }
    }

    /// Baseline-profile 320x240 SPS: poc type 0, lsb bits 8, 4 reference
    /// frames, frame_num bits 4, no cropping.
    fn test_sps_nal() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(8, 66); // profile_idc: baseline
        w.put_bits(8, 0); // constraint flags + reserved
        w.put_bits(8, 30); // level_idc 3.0
        w.put_ue(0); // seq_parameter_set_id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(0); // pic_order_cnt_type
        w.put_ue(4); // log2_max_pic_order_cnt_lsb_minus4
        w.put_ue(4); // max_num_ref_frames
        w.put_bit(0); // gaps_in_frame_num_value_allowed_flag
        w.put_ue(19); // pic_width_in_mbs_minus1 (320)
        w.put_ue(14); // pic_height_in_map_units_minus1 (240)
        w.put_bit(1); // frame_mbs_only_flag
        w.put_bit(1); // direct_8x8_inference_flag
        w.put_bit(0); // frame_cropping_flag
        w.put_bit(0); // vui_parameters_present_flag
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    fn test_pps_nal() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // pic_parameter_set_id
        w.put_ue(0); // seq_parameter_set_id
        w.put_bit(1); // entropy_coding_mode_flag
        w.put_bit(0); // bottom_field_pic_order_in_frame_present_flag
        w.put_ue(0); // num_slice_groups_minus1
        w.put_ue(0); // num_ref_idx_l0_default_active_minus1
        w.put_ue(0); // num_ref_idx_l1_default_active_minus1
        w.put_bit(0); // weighted_pred_flag
        w.put_bits(2, 0); // weighted_bipred_idc
        w.put_se(2); // pic_init_qp_minus26
        w.put_se(0); // pic_init_qs_minus26
        w.put_se(0); // chroma_qp_index_offset
        w.put_bit(1); // deblocking_filter_control_present_flag
        w.put_bit(0); // constrained_intra_pred_flag
        w.put_bit(0); // redundant_pic_cnt_present_flag
        let mut nal = vec![0x68];
        nal.extend(w.finish());
        nal
    }

    /// IDR slice header matching the test SPS/PPS.
    fn test_idr_slice_nal(frame_num: u32, poc_lsb: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // first_mb_in_slice
        w.put_ue(7); // slice_type: I (exclusive)
        w.put_ue(0); // pic_parameter_set_id
        w.put_bits(4, frame_num); // frame_num (log2_max_frame_num = 4)
        w.put_ue(1); // idr_pic_id
        w.put_bits(8, poc_lsb); // pic_order_cnt_lsb (8 bits)
        w.put_bit(0); // no_output_of_prior_pics_flag
        w.put_bit(0); // long_term_reference_flag
        w.put_se(0); // slice_qp_delta
        w.put_ue(0); // disable_deblocking_filter_idc
        w.put_se(0); // slice_alpha_c0_offset_div2
        w.put_se(0); // slice_beta_offset_div2
        let mut nal = vec![0x65]; // nal_ref_idc=3, type=5 (IDR)
        nal.extend(w.finish());
        nal.extend_from_slice(&[0xAA; 8]); // trailing slice data
        nal
    }

    fn length_prefixed(nals: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_sps_geometry_and_std_conversion() {
        let parser = AccessUnitParser::new(&test_sps_nal(), &test_pps_nal()).unwrap();
        let geometry = parser.geometry();
        assert_eq!(geometry.coded_width, 320);
        assert_eq!(geometry.coded_height, 240);
        assert_eq!(geometry.display_width, 320);
        assert_eq!(geometry.display_height, 240);

        let std_sps = parser.std_sps();
        assert_eq!(
            std_sps.profile_idc,
            ash::vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_BASELINE
        );
        assert_eq!(std_sps.pic_width_in_mbs_minus1, 19);
        assert_eq!(std_sps.pic_height_in_map_units_minus1, 14);
        assert_eq!(std_sps.max_num_ref_frames, 4);
        assert_eq!(std_sps.log2_max_pic_order_cnt_lsb_minus4, 4);
        assert!(std_sps.pScalingLists.is_null());

        let std_pps = parser.std_pps();
        assert_eq!(std_pps.pic_init_qp_minus26, 2);

        let summary = parser.sps_summary();
        assert_eq!(summary.poc_type, 0);
        assert_eq!(summary.max_num_ref_frames, 4);
    }

    #[test]
    fn test_parse_idr_sample() {
        let mut parser = AccessUnitParser::new(&test_sps_nal(), &test_pps_nal()).unwrap();
        let sample = length_prefixed(&[test_idr_slice_nal(0, 0)]);
        let au = parser.parse_sample(&sample).unwrap();

        assert!(au.picture.is_idr);
        assert!(au.picture.is_reference);
        assert_eq!(au.picture.frame_num, 0);
        assert_eq!(au.picture.idr_pic_id, 1);
        assert_eq!(au.picture.poc, 0);
        assert!(!au.parameters_changed);

        // One slice, re-framed with a start code at offset 0.
        assert_eq!(au.slice_offsets, vec![0]);
        assert_eq!(&au.annexb[..3], &START_CODE[..]);
        assert_eq!(au.annexb[3], 0x65);
    }

    #[test]
    fn test_in_band_parameter_sets_flag_a_rebuild() {
        let mut parser = AccessUnitParser::new(&test_sps_nal(), &test_pps_nal()).unwrap();
        let sample = length_prefixed(&[
            test_sps_nal(),
            test_pps_nal(),
            test_idr_slice_nal(0, 0),
        ]);
        let au = parser.parse_sample(&sample).unwrap();
        assert!(au.parameters_changed);
        // Parameter sets are not staged for the decoder, only slices are.
        assert_eq!(au.slice_offsets.len(), 1);
    }

    #[test]
    fn test_sample_without_slices_is_rejected() {
        let mut parser = AccessUnitParser::new(&test_sps_nal(), &test_pps_nal()).unwrap();
        let sample = length_prefixed(&[test_sps_nal()]);
        assert!(matches!(
            parser.parse_sample(&sample),
            Err(TranscodeError::BitstreamParse(_))
        ));
    }

    #[test]
    fn test_poc_type0_wraparound() {
        let sps = SpsSummary {
            poc_type: 0,
            log2_max_frame_num_minus4: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0, // max_lsb = 16
            max_num_ref_frames: 1,
        };
        let mut poc = PocState::default();
        assert_eq!(poc.next(&sps, true, true, 0, 0).unwrap(), 0);
        assert_eq!(poc.next(&sps, false, true, 1, 2).unwrap(), 2);
        assert_eq!(poc.next(&sps, false, true, 2, 14).unwrap(), 14);
        // lsb wraps 14 -> 2; msb must advance by 16.
        assert_eq!(poc.next(&sps, false, true, 3, 2).unwrap(), 18);
    }

    #[test]
    fn test_poc_type2_monotonic() {
        let sps = SpsSummary {
            poc_type: 2,
            log2_max_frame_num_minus4: 0, // max_frame_num = 16
            log2_max_pic_order_cnt_lsb_minus4: 0,
            max_num_ref_frames: 1,
        };
        let mut poc = PocState::default();
        assert_eq!(poc.next(&sps, true, true, 0, 0).unwrap(), 0);
        for n in 1..16 {
            assert_eq!(poc.next(&sps, false, true, n, 0).unwrap(), 2 * n as i32);
        }
        // frame_num wraps to 0; POC keeps increasing.
        assert_eq!(poc.next(&sps, false, true, 0, 0).unwrap(), 32);
    }

    #[test]
    fn test_split_length_prefixed_four_byte() {
        let sample = length_prefixed(&[vec![0x65, 1, 2, 3], vec![0x41, 9]]);
        let nals = split_length_prefixed(&sample).unwrap();
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x65, 1, 2, 3][..]);
        assert_eq!(nals[1], &[0x41, 9][..]);
    }

    #[test]
    fn test_split_length_prefixed_two_byte() {
        // 2-byte prefixes that cannot be parsed as a 4-byte chain.
        let sample = vec![0x00, 0x03, 0x65, 1, 2, 0x00, 0x02, 0x41, 9];
        let nals = split_length_prefixed(&sample).unwrap();
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x65, 1, 2][..]);
    }

    #[test]
    fn test_split_rejects_garbage() {
        assert!(split_length_prefixed(&[0xFF, 0xFF, 0xFF, 0xFF, 0x00]).is_err());
        assert!(split_length_prefixed(&[]).is_err());
    }

    #[test]
    fn test_find_nal_units_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xAA, // 4-byte start code
            0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, // 3-byte start code
        ];
        let units = find_nal_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], (4, 7));
        assert_eq!(units[1], (10, 13));
    }

    #[test]
    fn test_annexb_to_length_prefixed() {
        let data = [0x00, 0x00, 0x01, 0x26, 0x01, 0xAA, 0xBB];
        let avcc = annexb_to_length_prefixed(&data);
        assert_eq!(avcc, vec![0, 0, 0, 4, 0x26, 0x01, 0xAA, 0xBB]);
    }

    #[test]
    fn test_hevc_keyframe_detection() {
        // IDR_W_RADL (type 19 -> first byte 19 << 1 = 0x26)
        let idr = [0x00, 0x00, 0x01, 0x26, 0x01, 0xAA];
        assert!(hevc_is_keyframe(&idr));

        // TRAIL_R (type 1 -> first byte 0x02)
        let trail = [0x00, 0x00, 0x01, 0x02, 0x01, 0xAA];
        assert!(!hevc_is_keyframe(&trail));

        // VPS (32) then IDR: parameter sets are skipped when classifying.
        let vps_then_idr = [
            0x00, 0x00, 0x01, 0x40, 0x01, 0x0C, // VPS
            0x00, 0x00, 0x01, 0x26, 0x01, 0xAA, // IDR
        ];
        assert!(hevc_is_keyframe(&vps_then_idr));
    }
}
