//! H.265/HEVC encode session using Vulkan Video.
#![allow(clippy::field_reassign_with_default)]

use crate::error::{Result, TranscodeError};
use crate::gop::{GopMode, GopStructure};
use crate::parser::find_nal_units;
use crate::profiles::{VideoProfiles, NV12_FORMAT};
use crate::resources::{
    allocate_session_memory, cmd_image_barriers, create_image, create_image_view, layer_range,
    video_barrier,
};
use crate::vulkan::VideoContext;
use ash::vk;
use ash::vk::native as std_video;
use std::ptr;
use tracing::{debug, info};

/// DPB slots allocated for the encode session.
pub const ENCODE_DPB_SLOTS: u32 = 8;

/// H.265 Coding Tree Block (CTB) size in pixels.
pub const CTB_SIZE: u32 = 32;

/// POC LSB width exponent used in the generated SPS (2^(4+4) = 256 values).
const LOG2_MAX_POC_LSB_MINUS4: u8 = 4;

/// Encoder configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Display width of the source video.
    pub width: u32,
    /// Display height of the source video.
    pub height: u32,
    /// Constant QP applied to every slice.
    pub quality_level: u32,
    pub gop_mode: GopMode,
    /// Output frame rate (constant, frames per second).
    pub frame_rate: u32,
}

impl EncoderConfig {
    pub fn new(width: u32, height: u32) -> Self {
        assert!(width > 0, "width must be non-zero");
        assert!(height > 0, "height must be non-zero");
        Self {
            width,
            height,
            quality_level: 28,
            gop_mode: GopMode::IntraOnly,
            frame_rate: 30,
        }
    }

    pub fn with_quality_level(mut self, qp: u32) -> Self {
        self.quality_level = qp;
        self
    }

    pub fn with_gop_mode(mut self, mode: GopMode) -> Self {
        self.gop_mode = mode;
        self
    }
}

/// The generated parameter sets, one raw NAL unit each (no start codes).
#[derive(Debug, Clone, Default)]
pub struct HevcParameterSets {
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// Split the Annex-B header blob returned by the driver into VPS/SPS/PPS.
pub(crate) fn split_parameter_sets(header: &[u8]) -> Result<HevcParameterSets> {
    let mut sets = HevcParameterSets::default();
    for (start, end) in find_nal_units(header) {
        let nal = &header[start..end];
        match (nal[0] >> 1) & 0x3F {
            32 => sets.vps = nal.to_vec(),
            33 => sets.sps = nal.to_vec(),
            34 => sets.pps = nal.to_vec(),
            _ => {}
        }
    }
    if sets.vps.is_empty() || sets.sps.is_empty() || sets.pps.is_empty() {
        return Err(TranscodeError::VideoApiFailed {
            op: "vkGetEncodedVideoSessionParametersKHR",
            result: vk::Result::INCOMPLETE,
        });
    }
    Ok(sets)
}

#[derive(Debug, Clone, Copy)]
struct ReferenceInfo {
    dpb_slot: u8,
    poc: i32,
}

/// Parameters for recording one encode operation.
pub(crate) struct EncodeRecordParams {
    pub command_buffer: vk::CommandBuffer,
    /// View of the frame slot's shared picture (the decode output).
    pub source_view: vk::ImageView,
    pub dst_buffer: vk::Buffer,
    pub dst_capacity: u64,
    /// Feedback query slot owned by the frame slot.
    pub query_slot: u32,
}

/// What was scheduled for one recorded picture.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EncodedPictureMeta {
    pub is_idr: bool,
}

/// H.265 encode session bound to the encode queue family.
pub struct EncodeSession {
    context: VideoContext,
    config: EncoderConfig,
    aligned_width: u32,
    aligned_height: u32,
    session: vk::VideoSessionKHR,
    session_params: vk::VideoSessionParametersKHR,
    session_memory: Vec<vk::DeviceMemory>,
    dpb_image: vk::Image,
    dpb_memory: vk::DeviceMemory,
    dpb_views: Vec<vk::ImageView>,
    dpb_layer_activated: Vec<bool>,
    query_pool: vk::QueryPool,
    gop: GopStructure,
    last_reference: Option<ReferenceInfo>,
    frames_recorded: u64,
    header_data: Vec<u8>,
    parameter_sets: HevcParameterSets,
}

impl EncodeSession {
    pub fn new(
        context: VideoContext,
        profiles: &VideoProfiles,
        config: EncoderConfig,
        query_slots: u32,
    ) -> Result<Self> {
        let aligned_width = (config.width + CTB_SIZE - 1) & !(CTB_SIZE - 1);
        let aligned_height = (config.height + CTB_SIZE - 1) & !(CTB_SIZE - 1);

        info!(
            "Creating H.265 encode session: {}x{} (aligned {}x{}), qp={}, gop={:?}",
            config.width, config.height, aligned_width, aligned_height, config.quality_level,
            config.gop_mode
        );

        let caps = query_encode_capabilities(&context, profiles)?;
        if aligned_width > caps.max_coded_extent.width
            || aligned_height > caps.max_coded_extent.height
        {
            return Err(TranscodeError::BadInput(format!(
                "output resolution {}x{} exceeds the adapter's encode limit {}x{}",
                aligned_width,
                aligned_height,
                caps.max_coded_extent.width,
                caps.max_coded_extent.height
            )));
        }

        let session_create_info = vk::VideoSessionCreateInfoKHR::default()
            .queue_family_index(context.encode_queue_family())
            .video_profile(profiles.encode())
            .picture_format(NV12_FORMAT)
            .max_coded_extent(vk::Extent2D {
                width: aligned_width,
                height: aligned_height,
            })
            .reference_picture_format(NV12_FORMAT)
            .max_dpb_slots(ENCODE_DPB_SLOTS)
            .max_active_reference_pictures(ENCODE_DPB_SLOTS)
            .std_header_version(&caps.std_header_version);

        let mut session = vk::VideoSessionKHR::null();
        let result = unsafe {
            (context.video_queue_fn().fp().create_video_session_khr)(
                context.device().handle(),
                &session_create_info,
                ptr::null(),
                &mut session,
            )
        };
        if result != vk::Result::SUCCESS {
            return Err(TranscodeError::from_vk("vkCreateVideoSessionKHR", result));
        }

        let session_memory = allocate_session_memory(&context, session)?;
        let session_params =
            create_encode_parameters(&context, session, &config, aligned_width, aligned_height)?;

        let (dpb_image, dpb_memory) = create_image(
            &context,
            aligned_width,
            aligned_height,
            NV12_FORMAT,
            vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR,
            ENCODE_DPB_SLOTS,
            &profiles.encode_list(),
        )?;
        let mut dpb_views = Vec::with_capacity(ENCODE_DPB_SLOTS as usize);
        for layer in 0..ENCODE_DPB_SLOTS {
            dpb_views.push(create_image_view(&context, dpb_image, NV12_FORMAT, layer)?);
        }

        let query_pool = create_feedback_query_pool(&context, profiles, query_slots)?;

        let header_data = fetch_encoded_parameters(&context, session_params)?;
        let parameter_sets = split_parameter_sets(&header_data)?;
        debug!(
            "Generated HEVC parameter sets: vps={} sps={} pps={} bytes",
            parameter_sets.vps.len(),
            parameter_sets.sps.len(),
            parameter_sets.pps.len()
        );

        let gop = GopStructure::new(config.gop_mode, LOG2_MAX_POC_LSB_MINUS4);

        Ok(Self {
            context,
            config,
            aligned_width,
            aligned_height,
            session,
            session_params,
            session_memory,
            dpb_image,
            dpb_memory,
            dpb_views,
            dpb_layer_activated: vec![false; ENCODE_DPB_SLOTS as usize],
            query_pool,
            gop,
            last_reference: None,
            frames_recorded: 0,
            header_data,
            parameter_sets,
        })
    }

    /// The generated VPS/SPS/PPS, for the container's codec-specific data.
    pub fn parameter_sets(&self) -> &HevcParameterSets {
        &self.parameter_sets
    }

    /// Record one encode operation into the given command buffer. The buffer
    /// must be recording; the source picture must already be in
    /// `VIDEO_ENCODE_SRC` layout.
    pub(crate) fn record(&mut self, params: EncodeRecordParams) -> EncodedPictureMeta {
        let device = self.context.device();
        let cb = params.command_buffer;

        let position = self.gop.next_frame();
        let is_idr = position.frame_type.is_idr();
        let poc = position.pic_order_cnt;
        if is_idr {
            self.last_reference = None;
        }

        let setup_slot: u8 = match self.last_reference {
            Some(reference) => (reference.dpb_slot + 1) % 2,
            None => 0,
        };

        unsafe {
            device.cmd_reset_query_pool(cb, self.query_pool, params.query_slot, 1);
        }

        // DPB layer transitions: first touch for the setup layer, write-read
        // ordering for the reference layer.
        let mut barriers = Vec::new();
        let setup_old = if self.dpb_layer_activated[setup_slot as usize] {
            vk::ImageLayout::VIDEO_ENCODE_DPB_KHR
        } else {
            vk::ImageLayout::UNDEFINED
        };
        barriers.push(video_barrier(
            self.dpb_image,
            layer_range(u32::from(setup_slot), 1),
            setup_old,
            vk::ImageLayout::VIDEO_ENCODE_DPB_KHR,
        ));
        self.dpb_layer_activated[setup_slot as usize] = true;
        if let Some(reference) = self.last_reference {
            barriers.push(video_barrier(
                self.dpb_image,
                layer_range(u32::from(reference.dpb_slot), 1),
                vk::ImageLayout::VIDEO_ENCODE_DPB_KHR,
                vk::ImageLayout::VIDEO_ENCODE_DPB_KHR,
            ));
        }
        unsafe { cmd_image_barriers(device, cb, &barriers) };

        // Slice segment header.
        let mut slice_flags: std_video::StdVideoEncodeH265SliceSegmentHeaderFlags = unsafe { std::mem::zeroed() };
        slice_flags.set_first_slice_segment_in_pic_flag(1);
        slice_flags.set_slice_sao_luma_flag(1);
        slice_flags.set_slice_sao_chroma_flag(1);
        slice_flags.set_num_ref_idx_active_override_flag(1);

        let slice_type = if is_idr {
            std_video::StdVideoH265SliceType_STD_VIDEO_H265_SLICE_TYPE_I
        } else {
            std_video::StdVideoH265SliceType_STD_VIDEO_H265_SLICE_TYPE_P
        };
        let picture_type = if is_idr {
            std_video::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_IDR
        } else {
            std_video::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_P
        };

        let slice_header = std_video::StdVideoEncodeH265SliceSegmentHeader {
            flags: slice_flags,
            slice_type,
            slice_segment_address: 0,
            collocated_ref_idx: 0,
            MaxNumMergeCand: 5,
            slice_cb_qp_offset: 0,
            slice_cr_qp_offset: 0,
            slice_beta_offset_div2: 0,
            slice_tc_offset_div2: 0,
            slice_act_y_qp_offset: 0,
            slice_act_cb_qp_offset: 0,
            slice_act_cr_qp_offset: 0,
            slice_qp_delta: 0,
            reserved1: 0,
            pWeightTable: ptr::null(),
        };

        // Short-term reference picture set for this picture: one negative
        // reference for P pictures, empty for IDR.
        let max_poc_lsb = 1i32 << (LOG2_MAX_POC_LSB_MINUS4 + 4);
        let mut delta_poc_s0_minus1 = [0u16; 16];
        let mut num_negative_pics = 0u8;
        let mut used_by_curr_pic_s0_flag = 0u16;
        if let Some(reference) = self.last_reference.filter(|_| !is_idr) {
            delta_poc_s0_minus1[0] =
                (poc - reference.poc - 1).rem_euclid(max_poc_lsb) as u16;
            num_negative_pics = 1;
            used_by_curr_pic_s0_flag = 1;
        }

        let rps = std_video::StdVideoH265ShortTermRefPicSet {
            flags: unsafe { std::mem::zeroed::<std_video::StdVideoH265ShortTermRefPicSetFlags>() },
            delta_idx_minus1: 0,
            use_delta_flag: 0,
            abs_delta_rps_minus1: 0,
            used_by_curr_pic_flag: 0,
            used_by_curr_pic_s0_flag,
            used_by_curr_pic_s1_flag: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            num_negative_pics,
            num_positive_pics: 0,
            delta_poc_s0_minus1,
            delta_poc_s1_minus1: [0u16; 16],
        };

        // Reference lists.
        const NO_REFERENCE_PICTURE: u8 = 0xFF;
        let mut ref_list0 = [NO_REFERENCE_PICTURE; 15];
        let has_reference = !is_idr && self.last_reference.is_some();
        if let Some(reference) = self.last_reference.filter(|_| !is_idr) {
            ref_list0[0] = reference.dpb_slot;
        }

        let ref_lists_info = std_video::StdVideoEncodeH265ReferenceListsInfo {
            flags: unsafe { std::mem::zeroed::<std_video::StdVideoEncodeH265ReferenceListsInfoFlags>() },
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            RefPicList0: ref_list0,
            RefPicList1: [NO_REFERENCE_PICTURE; 15],
            list_entry_l0: [0; 15],
            list_entry_l1: [0; 15],
        };

        let mut picture_flags: std_video::StdVideoEncodeH265PictureInfoFlags = unsafe { std::mem::zeroed() };
        picture_flags.set_is_reference(1);
        picture_flags.set_pic_output_flag(1);
        if is_idr {
            picture_flags.set_IrapPicFlag(1);
            picture_flags.set_no_output_of_prior_pics_flag(1);
        }

        let picture_info = std_video::StdVideoEncodeH265PictureInfo {
            flags: picture_flags,
            pic_type: picture_type,
            sps_video_parameter_set_id: 0,
            pps_seq_parameter_set_id: 0,
            pps_pic_parameter_set_id: 0,
            short_term_ref_pic_set_idx: 0,
            PicOrderCntVal: poc,
            TemporalId: 0,
            reserved1: [0; 7],
            pRefLists: if has_reference {
                &ref_lists_info
            } else {
                ptr::null()
            },
            pShortTermRefPicSet: &rps,
            pLongTermRefPics: ptr::null(),
        };

        let nalu_slice_entries = [vk::VideoEncodeH265NaluSliceSegmentInfoKHR::default()
            .constant_qp(self.config.quality_level as i32)
            .std_slice_segment_header(&slice_header)];

        let mut h265_picture_info = vk::VideoEncodeH265PictureInfoKHR::default()
            .nalu_slice_segment_entries(&nalu_slice_entries)
            .std_picture_info(&picture_info);

        let src_picture_resource = self.picture_resource(params.source_view);
        let setup_picture_resource = self.picture_resource(self.dpb_views[setup_slot as usize]);

        // Setup slot: the reconstructed picture.
        let setup_std_info = std_video::StdVideoEncodeH265ReferenceInfo {
            flags: unsafe { std::mem::zeroed::<std_video::StdVideoEncodeH265ReferenceInfoFlags>() },
            pic_type: picture_type,
            PicOrderCntVal: poc,
            TemporalId: 0,
        };
        let mut setup_dpb_info = vk::VideoEncodeH265DpbSlotInfoKHR::default()
            .std_reference_info(&setup_std_info);
        let mut setup_slot_info = vk::VideoReferenceSlotInfoKHR::default()
            .slot_index(i32::from(setup_slot))
            .picture_resource(&setup_picture_resource);
        setup_slot_info.p_next =
            (&mut setup_dpb_info as *mut vk::VideoEncodeH265DpbSlotInfoKHR).cast();

        // Active reference slot (single previous reconstruction for P).
        let reference_resource = self
            .last_reference
            .filter(|_| has_reference)
            .map(|reference| self.picture_resource(self.dpb_views[reference.dpb_slot as usize]));
        let reference_std_info = self.last_reference.map(|reference| {
            std_video::StdVideoEncodeH265ReferenceInfo {
                flags: unsafe { std::mem::zeroed::<std_video::StdVideoEncodeH265ReferenceInfoFlags>() },
                pic_type: std_video::StdVideoH265PictureType_STD_VIDEO_H265_PICTURE_TYPE_P,
                PicOrderCntVal: reference.poc,
                TemporalId: 0,
            }
        });
        let mut reference_dpb_info = reference_std_info
            .as_ref()
            .map(|info| vk::VideoEncodeH265DpbSlotInfoKHR::default().std_reference_info(info));

        let mut reference_slots = Vec::with_capacity(1);
        if has_reference {
            let reference = self.last_reference.expect("has_reference checked");
            let mut slot_info = vk::VideoReferenceSlotInfoKHR::default()
                .slot_index(i32::from(reference.dpb_slot))
                .picture_resource(reference_resource.as_ref().expect("resource built"));
            slot_info.p_next = (reference_dpb_info
                .as_mut()
                .expect("dpb info built")
                as *mut vk::VideoEncodeH265DpbSlotInfoKHR)
                .cast();
            reference_slots.push(slot_info);
        }

        // Slots bound for the coding scope: active references plus the setup
        // slot marked inactive until the encode activates it.
        let mut bound_slots = reference_slots.clone();
        bound_slots.push(setup_slot_info.slot_index(-1));

        let mut rc_info = vk::VideoEncodeRateControlInfoKHR::default()
            .rate_control_mode(vk::VideoEncodeRateControlModeFlagsKHR::DISABLED);

        let is_first_frame = self.frames_recorded == 0;
        let begin_info = {
            let mut info = vk::VideoBeginCodingInfoKHR::default()
                .video_session(self.session)
                .video_session_parameters(self.session_params)
                .reference_slots(&bound_slots);
            if !is_first_frame {
                info.p_next = (&mut rc_info as *mut vk::VideoEncodeRateControlInfoKHR).cast();
            }
            info
        };
        unsafe {
            (self.context.video_queue_fn().fp().cmd_begin_video_coding_khr)(cb, &begin_info);
        }

        // First frame: reset the session state and program rate control and
        // quality level in a single control command.
        if is_first_frame {
            let mut quality_level_info =
                vk::VideoEncodeQualityLevelInfoKHR::default().quality_level(0);
            quality_level_info.p_next =
                (&mut rc_info as *mut vk::VideoEncodeRateControlInfoKHR).cast();

            let mut control_info = vk::VideoCodingControlInfoKHR::default().flags(
                vk::VideoCodingControlFlagsKHR::RESET
                    | vk::VideoCodingControlFlagsKHR::ENCODE_RATE_CONTROL
                    | vk::VideoCodingControlFlagsKHR::ENCODE_QUALITY_LEVEL,
            );
            control_info.p_next =
                (&mut quality_level_info as *mut vk::VideoEncodeQualityLevelInfoKHR).cast();

            unsafe {
                (self
                    .context
                    .video_queue_fn()
                    .fp()
                    .cmd_control_video_coding_khr)(cb, &control_info);
            }
        }

        let mut encode_info = vk::VideoEncodeInfoKHR::default()
            .src_picture_resource(src_picture_resource)
            .setup_reference_slot(&setup_slot_info)
            .reference_slots(&reference_slots)
            .dst_buffer(params.dst_buffer)
            .dst_buffer_offset(0)
            .dst_buffer_range(params.dst_capacity);
        encode_info.p_next =
            (&mut h265_picture_info as *mut vk::VideoEncodeH265PictureInfoKHR).cast();

        unsafe {
            device.cmd_begin_query(
                cb,
                self.query_pool,
                params.query_slot,
                vk::QueryControlFlags::empty(),
            );
            (self.context.video_encode_fn().fp().cmd_encode_video_khr)(cb, &encode_info);
            device.cmd_end_query(cb, self.query_pool, params.query_slot);
            (self.context.video_queue_fn().fp().cmd_end_video_coding_khr)(
                cb,
                &vk::VideoEndCodingInfoKHR::default(),
            );
        }

        self.last_reference = Some(ReferenceInfo {
            dpb_slot: setup_slot,
            poc,
        });
        self.frames_recorded += 1;

        debug!(
            frame = position.frame_index,
            idr = is_idr,
            poc,
            setup_slot,
            "Recorded encode"
        );

        EncodedPictureMeta { is_idr }
    }

    /// Fetch the written byte count from the feedback query and copy exactly
    /// that many bytes out of the mapped output buffer. IDR access units get
    /// the VPS/SPS/PPS header prepended so every random-access point is
    /// self-contained.
    ///
    /// # Safety contract
    ///
    /// `mapped` must point at the slot's mapped output buffer of at least
    /// `capacity` bytes, and the slot's encode fence must have signalled.
    pub(crate) fn read_encoded(
        &self,
        query_slot: u32,
        mapped: *const u8,
        capacity: u64,
        meta: EncodedPictureMeta,
    ) -> Result<Vec<u8>> {
        #[repr(C)]
        #[derive(Clone, Copy, Default)]
        struct EncodeFeedback {
            offset: u32,
            bytes_written: u32,
        }

        let mut results = [EncodeFeedback::default()];
        unsafe {
            self.context.device().get_query_pool_results(
                self.query_pool,
                query_slot,
                &mut results,
                vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(|e| TranscodeError::from_vk("vkGetQueryPoolResults", e))?;

        let offset = results[0].offset as u64;
        let size = results[0].bytes_written as u64;
        if size == 0 || offset + size > capacity {
            return Err(TranscodeError::VideoApiFailed {
                op: "vkCmdEncodeVideoKHR",
                result: vk::Result::ERROR_UNKNOWN,
            });
        }

        let mut encoded = if meta.is_idr {
            let mut data = Vec::with_capacity(self.header_data.len() + size as usize);
            data.extend_from_slice(&self.header_data);
            data
        } else {
            Vec::with_capacity(size as usize)
        };
        unsafe {
            let slice =
                std::slice::from_raw_parts(mapped.add(offset as usize), size as usize);
            encoded.extend_from_slice(slice);
        }
        Ok(encoded)
    }

    fn picture_resource(&self, view: vk::ImageView) -> vk::VideoPictureResourceInfoKHR<'static> {
        vk::VideoPictureResourceInfoKHR::default()
            .coded_offset(vk::Offset2D { x: 0, y: 0 })
            .coded_extent(vk::Extent2D {
                width: self.aligned_width,
                height: self.aligned_height,
            })
            .base_array_layer(0)
            .image_view_binding(view)
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        unsafe {
            let _ = self.context.device().device_wait_idle();

            self.context.device().destroy_query_pool(self.query_pool, None);
            for view in &self.dpb_views {
                self.context.device().destroy_image_view(*view, None);
            }
            self.context.device().destroy_image(self.dpb_image, None);
            self.context.device().free_memory(self.dpb_memory, None);

            (self
                .context
                .video_queue_fn()
                .fp()
                .destroy_video_session_parameters_khr)(
                self.context.device().handle(),
                self.session_params,
                ptr::null(),
            );
            (self.context.video_queue_fn().fp().destroy_video_session_khr)(
                self.context.device().handle(),
                self.session,
                ptr::null(),
            );
            for memory in &self.session_memory {
                self.context.device().free_memory(*memory, None);
            }
        }
    }
}

struct EncodeCapabilities {
    max_coded_extent: vk::Extent2D,
    std_header_version: vk::ExtensionProperties,
}

fn query_encode_capabilities(
    context: &VideoContext,
    profiles: &VideoProfiles,
) -> Result<EncodeCapabilities> {
    let video_queue_instance =
        ash::khr::video_queue::Instance::new(context.entry(), context.instance());

    let mut h265_caps = vk::VideoEncodeH265CapabilitiesKHR::default();
    let mut encode_caps = vk::VideoEncodeCapabilitiesKHR::default();
    encode_caps.p_next = (&mut h265_caps as *mut vk::VideoEncodeH265CapabilitiesKHR).cast();
    let mut caps = vk::VideoCapabilitiesKHR::default();
    caps.p_next = (&mut encode_caps as *mut vk::VideoEncodeCapabilitiesKHR).cast();

    let result = unsafe {
        (video_queue_instance
            .fp()
            .get_physical_device_video_capabilities_khr)(
            context.physical_device(),
            profiles.encode(),
            &mut caps,
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(TranscodeError::from_vk(
            "vkGetPhysicalDeviceVideoCapabilitiesKHR",
            result,
        ));
    }

    Ok(EncodeCapabilities {
        max_coded_extent: caps.max_coded_extent,
        std_header_version: caps.std_header_version,
    })
}

fn create_feedback_query_pool(
    context: &VideoContext,
    profiles: &VideoProfiles,
    query_slots: u32,
) -> Result<vk::QueryPool> {
    let mut profile_info = *profiles.encode();

    let mut feedback_create = vk::QueryPoolVideoEncodeFeedbackCreateInfoKHR::default()
        .encode_feedback_flags(
            vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BUFFER_OFFSET
                | vk::VideoEncodeFeedbackFlagsKHR::BITSTREAM_BYTES_WRITTEN,
        );
    feedback_create.p_next = (&mut profile_info as *mut vk::VideoProfileInfoKHR).cast();

    let mut create_info = vk::QueryPoolCreateInfo::default()
        .query_type(vk::QueryType::VIDEO_ENCODE_FEEDBACK_KHR)
        .query_count(query_slots);
    create_info.p_next =
        (&mut feedback_create as *mut vk::QueryPoolVideoEncodeFeedbackCreateInfoKHR).cast();

    unsafe { context.device().create_query_pool(&create_info, None) }
        .map_err(|e| TranscodeError::from_vk("vkCreateQueryPool", e))
}

/// Build the Std VPS/SPS/PPS and create the session parameters object.
fn create_encode_parameters(
    context: &VideoContext,
    session: vk::VideoSessionKHR,
    config: &EncoderConfig,
    aligned_width: u32,
    aligned_height: u32,
) -> Result<vk::VideoSessionParametersKHR> {
    // H.265 coding block sizes: 32x32 CTB, 16x16 min CB, 4x4..32x32 TU.
    let ctb_log2_size_y: u8 = 5;
    let min_cb_log2_size_y: u8 = 4;
    let log2_min_transform_block_size: u8 = 2;
    let log2_max_transform_block_size: u8 = 5;

    // Conformance window crops the CTB padding (4:2:0: offsets in chroma units).
    let conf_win_right_offset = (aligned_width - config.width) / 2;
    let conf_win_bottom_offset = (aligned_height - config.height) / 2;
    let conformance_window = conf_win_right_offset > 0 || conf_win_bottom_offset > 0;

    let mut ptl_flags: std_video::StdVideoH265ProfileTierLevelFlags = unsafe { std::mem::zeroed() };
    ptl_flags.set_general_progressive_source_flag(1);
    ptl_flags.set_general_frame_only_constraint_flag(1);

    let profile_tier_level = Box::new(std_video::StdVideoH265ProfileTierLevel {
        flags: ptl_flags,
        general_profile_idc:
            std_video::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN,
        general_level_idc: std_video::StdVideoH265LevelIdc_STD_VIDEO_H265_LEVEL_IDC_5_1,
    });

    let dec_pic_buf_mgr = Box::new(std_video::StdVideoH265DecPicBufMgr {
        max_latency_increase_plus1: [0; 7],
        max_dec_pic_buffering_minus1: [(ENCODE_DPB_SLOTS - 1) as u8, 0, 0, 0, 0, 0, 0],
        max_num_reorder_pics: [0; 7],
    });

    // One short-term RPS in the SPS: a single backward reference.
    let mut short_term_ref_pic_set = Box::new(std_video::StdVideoH265ShortTermRefPicSet {
        flags: unsafe { std::mem::zeroed::<std_video::StdVideoH265ShortTermRefPicSetFlags>() },
        delta_idx_minus1: 0,
        use_delta_flag: 0,
        abs_delta_rps_minus1: 0,
        used_by_curr_pic_flag: 0,
        used_by_curr_pic_s0_flag: 1,
        used_by_curr_pic_s1_flag: 0,
        reserved1: 0,
        reserved2: 0,
        reserved3: 0,
        num_negative_pics: 1,
        num_positive_pics: 0,
        delta_poc_s0_minus1: [0; 16],
        delta_poc_s1_minus1: [0; 16],
    });
    short_term_ref_pic_set.delta_poc_s0_minus1[0] = 0;

    let long_term_ref_pics = Box::new(std_video::StdVideoH265LongTermRefPicsSps {
        used_by_curr_pic_lt_sps_flag: 0,
        lt_ref_pic_poc_lsb_sps: [0; 32],
    });

    let mut sps_flags: std_video::StdVideoH265SpsFlags = unsafe { std::mem::zeroed() };
    sps_flags.set_sps_temporal_id_nesting_flag(1);
    sps_flags.set_sps_sub_layer_ordering_info_present_flag(1);
    sps_flags.set_amp_enabled_flag(1);
    sps_flags.set_sample_adaptive_offset_enabled_flag(1);
    if conformance_window {
        sps_flags.set_conformance_window_flag(1);
    }

    let mut sps = std_video::StdVideoH265SequenceParameterSet {
        flags: sps_flags,
        chroma_format_idc:
            std_video::StdVideoH265ChromaFormatIdc_STD_VIDEO_H265_CHROMA_FORMAT_IDC_420,
        pic_width_in_luma_samples: aligned_width,
        pic_height_in_luma_samples: aligned_height,
        sps_video_parameter_set_id: 0,
        sps_max_sub_layers_minus1: 0,
        sps_seq_parameter_set_id: 0,
        bit_depth_luma_minus8: 0,
        bit_depth_chroma_minus8: 0,
        log2_max_pic_order_cnt_lsb_minus4: LOG2_MAX_POC_LSB_MINUS4,
        log2_min_luma_coding_block_size_minus3: min_cb_log2_size_y - 3,
        log2_diff_max_min_luma_coding_block_size: ctb_log2_size_y - min_cb_log2_size_y,
        log2_min_luma_transform_block_size_minus2: log2_min_transform_block_size - 2,
        log2_diff_max_min_luma_transform_block_size: log2_max_transform_block_size
            - log2_min_transform_block_size,
        max_transform_hierarchy_depth_inter: (ctb_log2_size_y - log2_min_transform_block_size)
            .max(1),
        max_transform_hierarchy_depth_intra: 3,
        num_short_term_ref_pic_sets: 1,
        num_long_term_ref_pics_sps: 0,
        pcm_sample_bit_depth_luma_minus1: 7,
        pcm_sample_bit_depth_chroma_minus1: 7,
        log2_min_pcm_luma_coding_block_size_minus3: min_cb_log2_size_y - 3,
        log2_diff_max_min_pcm_luma_coding_block_size: ctb_log2_size_y - min_cb_log2_size_y,
        reserved1: 0,
        reserved2: 0,
        palette_max_size: 0,
        delta_palette_max_predictor_size: 0,
        motion_vector_resolution_control_idc: 0,
        sps_num_palette_predictor_initializers_minus1: 0,
        conf_win_left_offset: 0,
        conf_win_right_offset,
        conf_win_top_offset: 0,
        conf_win_bottom_offset,
        pProfileTierLevel: ptr::null(),
        pDecPicBufMgr: ptr::null(),
        pScalingLists: ptr::null(),
        pShortTermRefPicSet: ptr::null(),
        pLongTermRefPicsSps: ptr::null(),
        pSequenceParameterSetVui: ptr::null(),
        pPredictorPaletteEntries: ptr::null(),
    };
    sps.pProfileTierLevel = profile_tier_level.as_ref();
    sps.pDecPicBufMgr = dec_pic_buf_mgr.as_ref();
    sps.pShortTermRefPicSet = short_term_ref_pic_set.as_ref();
    sps.pLongTermRefPicsSps = long_term_ref_pics.as_ref();

    let mut vps_flags: std_video::StdVideoH265VpsFlags = unsafe { std::mem::zeroed() };
    vps_flags.set_vps_temporal_id_nesting_flag(1);
    vps_flags.set_vps_sub_layer_ordering_info_present_flag(1);
    vps_flags.set_vps_timing_info_present_flag(1);

    let mut vps = std_video::StdVideoH265VideoParameterSet {
        flags: vps_flags,
        vps_video_parameter_set_id: 0,
        vps_max_sub_layers_minus1: 0,
        reserved1: 0,
        reserved2: 0,
        vps_num_units_in_tick: 1,
        vps_time_scale: config.frame_rate,
        vps_num_ticks_poc_diff_one_minus1: 0,
        reserved3: 0,
        pDecPicBufMgr: ptr::null(),
        pHrdParameters: ptr::null(),
        pProfileTierLevel: ptr::null(),
    };
    vps.pDecPicBufMgr = dec_pic_buf_mgr.as_ref();
    vps.pProfileTierLevel = profile_tier_level.as_ref();

    let mut pps_flags: std_video::StdVideoH265PpsFlags = unsafe { std::mem::zeroed() };
    pps_flags.set_cabac_init_present_flag(1);
    pps_flags.set_transform_skip_enabled_flag(1);
    pps_flags.set_cu_qp_delta_enabled_flag(1);
    pps_flags.set_pps_loop_filter_across_slices_enabled_flag(1);
    pps_flags.set_deblocking_filter_control_present_flag(1);

    let pps = std_video::StdVideoH265PictureParameterSet {
        flags: pps_flags,
        pps_pic_parameter_set_id: 0,
        pps_seq_parameter_set_id: 0,
        sps_video_parameter_set_id: 0,
        num_extra_slice_header_bits: 0,
        num_ref_idx_l0_default_active_minus1: 0,
        num_ref_idx_l1_default_active_minus1: 0,
        init_qp_minus26: 0,
        diff_cu_qp_delta_depth: 0,
        pps_cb_qp_offset: 0,
        pps_cr_qp_offset: 0,
        pps_beta_offset_div2: 0,
        pps_tc_offset_div2: 0,
        log2_parallel_merge_level_minus2: 0,
        log2_max_transform_skip_block_size_minus2: 0,
        diff_cu_chroma_qp_offset_depth: 0,
        chroma_qp_offset_list_len_minus1: 0,
        cb_qp_offset_list: [0; 6],
        cr_qp_offset_list: [0; 6],
        log2_sao_offset_scale_luma: 0,
        log2_sao_offset_scale_chroma: 0,
        pps_act_y_qp_offset_plus5: 0,
        pps_act_cb_qp_offset_plus5: 0,
        pps_act_cr_qp_offset_plus3: 0,
        pps_num_palette_predictor_initializers: 0,
        luma_bit_depth_entry_minus8: 0,
        chroma_bit_depth_entry_minus8: 0,
        num_tile_columns_minus1: 0,
        num_tile_rows_minus1: 0,
        reserved1: 0,
        reserved2: 0,
        column_width_minus1: [0; 19],
        row_height_minus1: [0; 21],
        reserved3: 0,
        pScalingLists: ptr::null(),
        pPredictorPaletteEntries: ptr::null(),
    };

    let vps_array = [vps];
    let sps_array = [sps];
    let pps_array = [pps];

    let add_info = vk::VideoEncodeH265SessionParametersAddInfoKHR::default()
        .std_vp_ss(&vps_array)
        .std_sp_ss(&sps_array)
        .std_pp_ss(&pps_array);

    let mut h265_create_info = vk::VideoEncodeH265SessionParametersCreateInfoKHR::default()
        .max_std_vps_count(1)
        .max_std_sps_count(1)
        .max_std_pps_count(1)
        .parameters_add_info(&add_info);

    let mut create_info =
        vk::VideoSessionParametersCreateInfoKHR::default().video_session(session);
    create_info.p_next = (&mut h265_create_info
        as *mut vk::VideoEncodeH265SessionParametersCreateInfoKHR)
        .cast();

    let mut params = vk::VideoSessionParametersKHR::null();
    let result = unsafe {
        (context
            .video_queue_fn()
            .fp()
            .create_video_session_parameters_khr)(
            context.device().handle(),
            &create_info,
            ptr::null(),
            &mut params,
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(TranscodeError::from_vk(
            "vkCreateVideoSessionParametersKHR",
            result,
        ));
    }
    Ok(params)
}

/// Retrieve the encoded VPS/SPS/PPS NAL units from the session parameters.
///
/// Some implementations misbehave for a size-only query (pData = NULL), so a
/// preallocated buffer is used and grown on INCOMPLETE.
fn fetch_encoded_parameters(
    context: &VideoContext,
    session_params: vk::VideoSessionParametersKHR,
) -> Result<Vec<u8>> {
    let mut h265_get_info = vk::VideoEncodeH265SessionParametersGetInfoKHR::default()
        .write_std_vps(true)
        .write_std_sps(true)
        .write_std_pps(true)
        .std_vps_id(0)
        .std_sps_id(0)
        .std_pps_id(0);

    let get_info = vk::VideoEncodeSessionParametersGetInfoKHR {
        video_session_parameters: session_params,
        p_next: (&mut h265_get_info as *mut vk::VideoEncodeH265SessionParametersGetInfoKHR)
            .cast(),
        ..Default::default()
    };

    let mut data = vec![0u8; 4096];
    let mut data_size: usize = data.len();
    let mut h265_feedback = vk::VideoEncodeH265SessionParametersFeedbackInfoKHR::default();
    let mut feedback = vk::VideoEncodeSessionParametersFeedbackInfoKHR {
        p_next: (&mut h265_feedback
            as *mut vk::VideoEncodeH265SessionParametersFeedbackInfoKHR)
            .cast(),
        ..Default::default()
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = unsafe {
            (context
                .video_encode_fn()
                .fp()
                .get_encoded_video_session_parameters_khr)(
                context.device().handle(),
                &get_info,
                &mut feedback,
                &mut data_size,
                data.as_mut_ptr() as *mut std::ffi::c_void,
            )
        };

        match result {
            vk::Result::SUCCESS => {
                if data_size == 0 {
                    return Err(TranscodeError::VideoApiFailed {
                        op: "vkGetEncodedVideoSessionParametersKHR",
                        result: vk::Result::INCOMPLETE,
                    });
                }
                data.truncate(data_size);
                return Ok(data);
            }
            vk::Result::INCOMPLETE if attempts < 3 => {
                let new_size = data_size.max(data.len() * 2).max(1);
                data.resize(new_size, 0);
                data_size = data.len();
            }
            err => {
                return Err(TranscodeError::from_vk(
                    "vkGetEncodedVideoSessionParametersKHR",
                    err,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EncoderConfig::new(1920, 1080)
            .with_quality_level(24)
            .with_gop_mode(GopMode::LowDelayP { gop_size: 60 });
        assert_eq!(config.quality_level, 24);
        assert_eq!(config.gop_mode, GopMode::LowDelayP { gop_size: 60 });
        assert_eq!(config.frame_rate, 30);
    }

    #[test]
    fn test_ctb_alignment() {
        let width = 1920u32;
        let height = 1080u32;
        let aligned_width = (width + CTB_SIZE - 1) & !(CTB_SIZE - 1);
        let aligned_height = (height + CTB_SIZE - 1) & !(CTB_SIZE - 1);
        assert_eq!(aligned_width, 1920);
        assert_eq!(aligned_height, 1088);
        // 4:2:0 conformance window offsets are in chroma units.
        assert_eq!((aligned_height - height) / 2, 4);
    }

    #[test]
    fn test_split_parameter_sets() {
        // VPS (32), SPS (33), PPS (34) with 4- and 3-byte start codes.
        let header = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xAA, // VPS
            0x00, 0x00, 0x01, 0x42, 0x01, 0xBB, // SPS
            0x00, 0x00, 0x01, 0x44, 0x01, 0xCC, // PPS
        ];
        let sets = split_parameter_sets(&header).unwrap();
        assert_eq!(sets.vps, vec![0x40, 0x01, 0xAA]);
        assert_eq!(sets.sps, vec![0x42, 0x01, 0xBB]);
        assert_eq!(sets.pps, vec![0x44, 0x01, 0xCC]);
    }

    #[test]
    fn test_split_parameter_sets_missing_pps() {
        let header = [
            0x00, 0x00, 0x01, 0x40, 0x01, // VPS
            0x00, 0x00, 0x01, 0x42, 0x01, // SPS
        ];
        assert!(split_parameter_sets(&header).is_err());
    }
}
