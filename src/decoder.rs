//! H.264 decode session and decoded-picture-buffer management.
#![allow(clippy::field_reassign_with_default)]

use crate::error::{Result, TranscodeError};
use crate::parser::{PictureInfo, SpsSummary, StreamGeometry};
use crate::profiles::{VideoProfiles, NV12_FORMAT};
use crate::resources::{
    allocate_session_memory, align_up, cmd_image_barriers, create_image, create_image_view,
    layer_range, video_barrier,
};
use crate::vulkan::VideoContext;
use ash::vk;
use ash::vk::native as std_video;
use std::ptr;
use tracing::{debug, info};

/// DPB slots allocated for the decode session.
pub const DECODE_DPB_SLOTS: u32 = 8;

/// Contents of one occupied DPB slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DpbEntry {
    pub frame_num: u16,
    pub poc: i32,
}

/// Slot assignment for one picture, handed to the decode command.
#[derive(Debug)]
pub(crate) struct DpbAssignment {
    /// Slot the reconstructed picture will occupy; None for non-reference pictures.
    pub setup_slot: Option<u8>,
    /// Active reference slots the codec may read, with their picture data.
    pub references: Vec<(u8, DpbEntry)>,
}

/// Tracks which DPB slot holds which decoded reference picture.
///
/// Slot assignment follows the bitstream's DPB management: IDR pictures drop
/// every reference, and the sliding window evicts the oldest reference once
/// `max_num_ref_frames` is reached.
pub(crate) struct DpbTracker {
    slots: Vec<Option<DpbEntry>>,
    /// Occupied reference slots, oldest first.
    window: Vec<u8>,
    max_refs: usize,
}

impl DpbTracker {
    pub fn new(slot_count: usize, max_num_ref_frames: u32) -> Self {
        // One slot stays free of the window so the setup slot can never
        // collide with an active reference.
        let max_refs = (max_num_ref_frames.max(1) as usize).min(slot_count - 1);
        Self {
            slots: vec![None; slot_count],
            window: Vec::new(),
            max_refs,
        }
    }

    /// Assign slots for the next picture. The returned reference list is the
    /// DPB state before the picture is stored, so the setup slot can never
    /// appear in it; sliding-window eviction happens after the picture is
    /// stored, matching the bitstream's marking order.
    pub fn assign(&mut self, picture: &PictureInfo) -> DpbAssignment {
        if picture.is_idr {
            self.slots.iter_mut().for_each(|slot| *slot = None);
            self.window.clear();
        }

        let references: Vec<(u8, DpbEntry)> = self
            .window
            .iter()
            .map(|&slot| (slot, self.slots[slot as usize].expect("window slot occupied")))
            .collect();

        let setup_slot = if picture.is_reference {
            let slot = self
                .slots
                .iter()
                .position(|slot| slot.is_none())
                .expect("window cap keeps a slot free") as u8;
            self.slots[slot as usize] = Some(DpbEntry {
                frame_num: picture.frame_num,
                poc: picture.poc,
            });
            self.window.push(slot);
            if self.window.len() > self.max_refs {
                let evicted = self.window.remove(0);
                self.slots[evicted as usize] = None;
            }
            Some(slot)
        } else {
            None
        };

        DpbAssignment {
            setup_slot,
            references,
        }
    }
}

/// Parameters for recording one decode operation.
pub(crate) struct DecodeRecordParams<'a> {
    pub command_buffer: vk::CommandBuffer,
    /// View of the frame slot's shared picture, layer 0.
    pub target_view: vk::ImageView,
    pub bitstream_buffer: vk::Buffer,
    /// Unpadded byte length of the staged slice data.
    pub bitstream_size: u64,
    pub picture: &'a PictureInfo,
    pub slice_offsets: &'a [u32],
}

/// H.264 decode session bound to the decode queue family.
pub struct DecodeSession {
    context: VideoContext,
    session: vk::VideoSessionKHR,
    session_params: vk::VideoSessionParametersKHR,
    session_memory: Vec<vk::DeviceMemory>,
    dpb_image: vk::Image,
    dpb_memory: vk::DeviceMemory,
    dpb_views: Vec<vk::ImageView>,
    dpb_layer_activated: Vec<bool>,
    tracker: DpbTracker,
    coded_extent: vk::Extent2D,
    needs_reset: bool,
    min_bitstream_size_alignment: u64,
}

impl DecodeSession {
    pub fn new(
        context: VideoContext,
        profiles: &VideoProfiles,
        geometry: StreamGeometry,
        sps_summary: SpsSummary,
        std_sps: std_video::StdVideoH264SequenceParameterSet,
        std_pps: std_video::StdVideoH264PictureParameterSet,
    ) -> Result<Self> {
        let caps = query_decode_capabilities(&context, profiles)?;

        let coded_extent = vk::Extent2D {
            width: geometry.coded_width,
            height: geometry.coded_height,
        };

        if coded_extent.width > caps.max_coded_extent.width
            || coded_extent.height > caps.max_coded_extent.height
        {
            return Err(TranscodeError::BadInput(format!(
                "stream resolution {}x{} exceeds the adapter's decode limit {}x{}",
                coded_extent.width,
                coded_extent.height,
                caps.max_coded_extent.width,
                caps.max_coded_extent.height
            )));
        }

        let session_create_info = vk::VideoSessionCreateInfoKHR::default()
            .queue_family_index(context.decode_queue_family())
            .video_profile(profiles.decode())
            .picture_format(NV12_FORMAT)
            .max_coded_extent(coded_extent)
            .reference_picture_format(NV12_FORMAT)
            .max_dpb_slots(DECODE_DPB_SLOTS)
            .max_active_reference_pictures(DECODE_DPB_SLOTS)
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
        info!(
            width = coded_extent.width,
            height = coded_extent.height,
            "Created H.264 decode session"
        );

        let session_memory = allocate_session_memory(&context, session)?;
        let session_params = create_decode_parameters(&context, session, &std_sps, &std_pps)?;

        let (dpb_image, dpb_memory) = create_image(
            &context,
            coded_extent.width,
            coded_extent.height,
            NV12_FORMAT,
            vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR,
            DECODE_DPB_SLOTS,
            &profiles.decode_list(),
        )?;

        let mut dpb_views = Vec::with_capacity(DECODE_DPB_SLOTS as usize);
        for layer in 0..DECODE_DPB_SLOTS {
            dpb_views.push(create_image_view(&context, dpb_image, NV12_FORMAT, layer)?);
        }

        Ok(Self {
            context,
            session,
            session_params,
            session_memory,
            dpb_image,
            dpb_memory,
            dpb_views,
            dpb_layer_activated: vec![false; DECODE_DPB_SLOTS as usize],
            tracker: DpbTracker::new(DECODE_DPB_SLOTS as usize, sps_summary.max_num_ref_frames),
            coded_extent,
            needs_reset: true,
            min_bitstream_size_alignment: caps.min_bitstream_buffer_size_alignment.max(1),
        })
    }

    pub fn coded_extent(&self) -> vk::Extent2D {
        self.coded_extent
    }

    /// Staged bitstream ranges must respect the driver's size alignment.
    pub fn align_bitstream_size(&self, size: u64) -> u64 {
        align_up(size, self.min_bitstream_size_alignment)
    }

    /// Replace the session parameters after a mid-stream SPS/PPS change.
    ///
    /// The decode queue must not have work in flight referencing the old
    /// object, so this drains the queue first.
    pub fn rebuild_parameters(
        &mut self,
        std_sps: std_video::StdVideoH264SequenceParameterSet,
        std_pps: std_video::StdVideoH264PictureParameterSet,
    ) -> Result<()> {
        unsafe {
            self.context
                .device()
                .queue_wait_idle(self.context.decode_queue())
        }
        .map_err(|e| TranscodeError::from_vk("vkQueueWaitIdle", e))?;

        let new_params =
            create_decode_parameters(&self.context, self.session, &std_sps, &std_pps)?;
        unsafe {
            (self
                .context
                .video_queue_fn()
                .fp()
                .destroy_video_session_parameters_khr)(
                self.context.device().handle(),
                self.session_params,
                ptr::null(),
            );
        }
        self.session_params = new_params;
        debug!("Rebuilt decode session parameters");
        Ok(())
    }

    /// Record one decode operation into the given command buffer. The buffer
    /// must be recording; the shared picture must already be in
    /// `VIDEO_DECODE_DST` layout.
    pub(crate) fn record(&mut self, params: DecodeRecordParams<'_>) -> Result<()> {
        let device = self.context.device();
        let cb = params.command_buffer;
        let assignment = self.tracker.assign(params.picture);

        // First-touch transitions for the DPB layers this picture uses, and
        // write-read ordering for the reference layers.
        let mut barriers = Vec::new();
        if let Some(slot) = assignment.setup_slot {
            let old = if self.dpb_layer_activated[slot as usize] {
                vk::ImageLayout::VIDEO_DECODE_DPB_KHR
            } else {
                vk::ImageLayout::UNDEFINED
            };
            barriers.push(video_barrier(
                self.dpb_image,
                layer_range(u32::from(slot), 1),
                old,
                vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            ));
            self.dpb_layer_activated[slot as usize] = true;
        }
        for (slot, _) in &assignment.references {
            barriers.push(video_barrier(
                self.dpb_image,
                layer_range(u32::from(*slot), 1),
                vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
                vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
            ));
        }
        if !barriers.is_empty() {
            unsafe { cmd_image_barriers(device, cb, &barriers) };
        }

        // Reference pictures: keep the Std structs, the codec slot infos and
        // the slot infos in parallel vectors so every chained pointer stays
        // valid until the decode command is recorded.
        let mut ref_resources = Vec::with_capacity(assignment.references.len());
        let mut ref_std_infos = Vec::with_capacity(assignment.references.len());
        for (slot, entry) in &assignment.references {
            ref_resources.push(self.picture_resource(self.dpb_views[*slot as usize]));
            ref_std_infos.push(std_reference_info(entry));
        }
        let mut ref_dpb_infos: Vec<vk::VideoDecodeH264DpbSlotInfoKHR> = ref_std_infos
            .iter()
            .map(|info| vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(info))
            .collect();

        let mut reference_slots = Vec::with_capacity(assignment.references.len());
        for (index, (slot, _)) in assignment.references.iter().enumerate() {
            let mut slot_info = vk::VideoReferenceSlotInfoKHR::default()
                .slot_index(i32::from(*slot))
                .picture_resource(&ref_resources[index]);
            slot_info.p_next = (&mut ref_dpb_infos[index]
                as *mut vk::VideoDecodeH264DpbSlotInfoKHR)
                .cast();
            reference_slots.push(slot_info);
        }

        // Setup slot: where the reconstructed picture lands in the DPB.
        let setup_std_info = std_reference_info(&DpbEntry {
            frame_num: params.picture.frame_num,
            poc: params.picture.poc,
        });
        let mut setup_dpb_info =
            vk::VideoDecodeH264DpbSlotInfoKHR::default().std_reference_info(&setup_std_info);
        let setup_resource = assignment
            .setup_slot
            .map(|slot| self.picture_resource(self.dpb_views[slot as usize]));
        let setup_slot_info = assignment.setup_slot.map(|slot| {
            let mut info = vk::VideoReferenceSlotInfoKHR::default()
                .slot_index(i32::from(slot))
                .picture_resource(setup_resource.as_ref().expect("resource set with slot"));
            info.p_next = (&mut setup_dpb_info as *mut vk::VideoDecodeH264DpbSlotInfoKHR).cast();
            info
        });

        // Slots bound for the coding scope: the active references plus the
        // setup slot marked inactive (index -1) until the decode activates it.
        let mut bound_slots = reference_slots.clone();
        if let Some(slot_info) = setup_slot_info {
            bound_slots.push(slot_info.slot_index(-1));
        }

        let begin_info = vk::VideoBeginCodingInfoKHR::default()
            .video_session(self.session)
            .video_session_parameters(self.session_params)
            .reference_slots(&bound_slots);
        unsafe {
            (self.context.video_queue_fn().fp().cmd_begin_video_coding_khr)(cb, &begin_info);
        }

        if self.needs_reset {
            let control_info = vk::VideoCodingControlInfoKHR::default()
                .flags(vk::VideoCodingControlFlagsKHR::RESET);
            unsafe {
                (self
                    .context
                    .video_queue_fn()
                    .fp()
                    .cmd_control_video_coding_khr)(cb, &control_info);
            }
            self.needs_reset = false;
        }

        let std_picture_info = build_std_picture_info(params.picture);
        let mut h264_picture_info = vk::VideoDecodeH264PictureInfoKHR::default()
            .std_picture_info(&std_picture_info)
            .slice_offsets(params.slice_offsets);

        let dst_resource = self.picture_resource(params.target_view);
        let mut decode_info = vk::VideoDecodeInfoKHR::default()
            .src_buffer(params.bitstream_buffer)
            .src_buffer_offset(0)
            .src_buffer_range(self.align_bitstream_size(params.bitstream_size))
            .dst_picture_resource(dst_resource)
            .reference_slots(&reference_slots);
        if let Some(setup) = setup_slot_info.as_ref() {
            decode_info = decode_info.setup_reference_slot(setup);
        }
        decode_info.p_next =
            (&mut h264_picture_info as *mut vk::VideoDecodeH264PictureInfoKHR).cast();

        unsafe {
            (self.context.video_decode_fn().fp().cmd_decode_video_khr)(cb, &decode_info);
            (self.context.video_queue_fn().fp().cmd_end_video_coding_khr)(
                cb,
                &vk::VideoEndCodingInfoKHR::default(),
            );
        }

        debug!(
            poc = params.picture.poc,
            idr = params.picture.is_idr,
            setup_slot = ?assignment.setup_slot,
            refs = assignment.references.len(),
            "Recorded decode"
        );
        Ok(())
    }

    fn picture_resource(&self, view: vk::ImageView) -> vk::VideoPictureResourceInfoKHR<'static> {
        vk::VideoPictureResourceInfoKHR::default()
            .coded_offset(vk::Offset2D { x: 0, y: 0 })
            .coded_extent(self.coded_extent)
            .base_array_layer(0)
            .image_view_binding(view)
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        unsafe {
            let _ = self.context.device().device_wait_idle();

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

struct DecodeCapabilities {
    max_coded_extent: vk::Extent2D,
    min_bitstream_buffer_size_alignment: u64,
    std_header_version: vk::ExtensionProperties,
}

fn query_decode_capabilities(
    context: &VideoContext,
    profiles: &VideoProfiles,
) -> Result<DecodeCapabilities> {
    let video_queue_instance =
        ash::khr::video_queue::Instance::new(context.entry(), context.instance());

    let mut h264_caps = vk::VideoDecodeH264CapabilitiesKHR::default();
    let mut decode_caps = vk::VideoDecodeCapabilitiesKHR::default();
    decode_caps.p_next = (&mut h264_caps as *mut vk::VideoDecodeH264CapabilitiesKHR).cast();
    let mut caps = vk::VideoCapabilitiesKHR::default();
    caps.p_next = (&mut decode_caps as *mut vk::VideoDecodeCapabilitiesKHR).cast();

    let result = unsafe {
        (video_queue_instance
            .fp()
            .get_physical_device_video_capabilities_khr)(
            context.physical_device(),
            profiles.decode(),
            &mut caps,
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(TranscodeError::from_vk(
            "vkGetPhysicalDeviceVideoCapabilitiesKHR",
            result,
        ));
    }

    // The pipeline reconstructs references into a DPB image distinct from the
    // shared output picture; a driver that only supports coincident DPB and
    // output cannot run it.
    if !decode_caps
        .flags
        .contains(vk::VideoDecodeCapabilityFlagsKHR::DPB_AND_OUTPUT_DISTINCT)
    {
        return Err(TranscodeError::NoDevice(
            "adapter does not support distinct decode DPB and output pictures".to_string(),
        ));
    }

    Ok(DecodeCapabilities {
        max_coded_extent: caps.max_coded_extent,
        min_bitstream_buffer_size_alignment: caps.min_bitstream_buffer_size_alignment,
        std_header_version: caps.std_header_version,
    })
}

fn create_decode_parameters(
    context: &VideoContext,
    session: vk::VideoSessionKHR,
    std_sps: &std_video::StdVideoH264SequenceParameterSet,
    std_pps: &std_video::StdVideoH264PictureParameterSet,
) -> Result<vk::VideoSessionParametersKHR> {
    let sps_array = [*std_sps];
    let pps_array = [*std_pps];
    let add_info = vk::VideoDecodeH264SessionParametersAddInfoKHR::default()
        .std_sp_ss(&sps_array)
        .std_pp_ss(&pps_array);

    let mut h264_create_info = vk::VideoDecodeH264SessionParametersCreateInfoKHR::default()
        .max_std_sps_count(1)
        .max_std_pps_count(1)
        .parameters_add_info(&add_info);

    let mut create_info =
        vk::VideoSessionParametersCreateInfoKHR::default().video_session(session);
    create_info.p_next = (&mut h264_create_info
        as *mut vk::VideoDecodeH264SessionParametersCreateInfoKHR)
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

fn std_reference_info(entry: &DpbEntry) -> std_video::StdVideoDecodeH264ReferenceInfo {
    std_video::StdVideoDecodeH264ReferenceInfo {
        flags: unsafe { std::mem::zeroed::<std_video::StdVideoDecodeH264ReferenceInfoFlags>() },
        FrameNum: entry.frame_num,
        reserved: 0,
        PicOrderCnt: [entry.poc, entry.poc],
    }
}

fn build_std_picture_info(picture: &PictureInfo) -> std_video::StdVideoDecodeH264PictureInfo {
    let mut flags: std_video::StdVideoDecodeH264PictureInfoFlags = unsafe { std::mem::zeroed() };
    if picture.is_idr {
        flags.set_is_intra(1);
        flags.set_IdrPicFlag(1);
    }
    if picture.is_reference {
        flags.set_is_reference(1);
    }

    std_video::StdVideoDecodeH264PictureInfo {
        flags,
        seq_parameter_set_id: picture.sps_id,
        pic_parameter_set_id: picture.pps_id,
        reserved1: 0,
        reserved2: 0,
        frame_num: picture.frame_num,
        idr_pic_id: picture.idr_pic_id,
        PicOrderCnt: [picture.poc, picture.poc],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picture(is_idr: bool, is_reference: bool, frame_num: u16, poc: i32) -> PictureInfo {
        PictureInfo {
            is_idr,
            is_reference,
            frame_num,
            idr_pic_id: 0,
            pic_order_cnt_lsb: 0,
            poc,
            sps_id: 0,
            pps_id: 0,
        }
    }

    #[test]
    fn test_idr_takes_first_slot_with_no_references() {
        let mut tracker = DpbTracker::new(8, 4);
        let assignment = tracker.assign(&picture(true, true, 0, 0));
        assert_eq!(assignment.setup_slot, Some(0));
        assert!(assignment.references.is_empty());
    }

    #[test]
    fn test_references_accumulate_up_to_window() {
        let mut tracker = DpbTracker::new(8, 4);
        tracker.assign(&picture(true, true, 0, 0));
        for n in 1..4u16 {
            let assignment = tracker.assign(&picture(false, true, n, 2 * n as i32));
            assert_eq!(assignment.references.len(), n as usize);
            assert_eq!(assignment.setup_slot, Some(n as u8));
        }
    }

    #[test]
    fn test_sliding_window_evicts_oldest() {
        let mut tracker = DpbTracker::new(8, 2);
        tracker.assign(&picture(true, true, 0, 0)); // slot 0
        tracker.assign(&picture(false, true, 1, 2)); // slot 1
        let assignment = tracker.assign(&picture(false, true, 2, 4));
        // The current picture may still reference both stored frames; frame 0
        // leaves the window only after this picture is stored.
        assert_eq!(assignment.references.len(), 2);
        assert_eq!(assignment.setup_slot, Some(2));
        let frame_nums: Vec<u16> = assignment
            .references
            .iter()
            .map(|(_, entry)| entry.frame_num)
            .collect();
        assert_eq!(frame_nums, vec![0, 1]);

        // Frame 0's slot was freed and is reused next.
        let next = tracker.assign(&picture(false, true, 3, 6));
        assert_eq!(next.setup_slot, Some(0));
        let frame_nums: Vec<u16> = next
            .references
            .iter()
            .map(|(_, entry)| entry.frame_num)
            .collect();
        assert_eq!(frame_nums, vec![1, 2]);
    }

    #[test]
    fn test_setup_slot_never_among_references() {
        let mut tracker = DpbTracker::new(8, 8);
        for n in 0..100u32 {
            let is_idr = n % 30 == 0;
            let assignment = tracker.assign(&picture(is_idr, true, (n % 16) as u16, n as i32));
            if let Some(setup) = assignment.setup_slot {
                assert!(
                    assignment.references.iter().all(|(slot, _)| *slot != setup),
                    "frame {n}: setup slot {setup} also listed as reference"
                );
            }
        }
    }

    #[test]
    fn test_idr_clears_previous_references() {
        let mut tracker = DpbTracker::new(8, 4);
        tracker.assign(&picture(true, true, 0, 0));
        tracker.assign(&picture(false, true, 1, 2));
        tracker.assign(&picture(false, true, 2, 4));
        let assignment = tracker.assign(&picture(true, true, 0, 0));
        assert!(assignment.references.is_empty());
        assert_eq!(assignment.setup_slot, Some(0));
    }

    #[test]
    fn test_non_reference_picture_gets_no_slot() {
        let mut tracker = DpbTracker::new(8, 4);
        tracker.assign(&picture(true, true, 0, 0));
        let assignment = tracker.assign(&picture(false, false, 1, 1));
        assert_eq!(assignment.setup_slot, None);
        assert_eq!(assignment.references.len(), 1);
        // The non-reference picture must not occupy the window.
        let next = tracker.assign(&picture(false, true, 1, 2));
        assert_eq!(next.references.len(), 1);
    }

    #[test]
    fn test_std_picture_info_flags() {
        let info = build_std_picture_info(&picture(true, true, 3, 6));
        assert_eq!(info.frame_num, 3);
        assert_eq!(info.PicOrderCnt, [6, 6]);
        assert_eq!(info.flags.IdrPicFlag(), 1);
        assert_eq!(info.flags.is_reference(), 1);
        assert_eq!(info.flags.field_pic_flag(), 0);

        let non_ref = build_std_picture_info(&picture(false, false, 4, 7));
        assert_eq!(non_ref.flags.IdrPicFlag(), 0);
        assert_eq!(non_ref.flags.is_reference(), 0);
    }
}
