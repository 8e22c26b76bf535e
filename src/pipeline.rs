//! The per-frame transcode driver.
//!
//! Owns the frame ring and the frame counter. Each iteration pulls one
//! compressed access unit, stages it, records decode and encode into the
//! slot's two command buffers, and submits them to their queues with a
//! semaphore hand-off; the slot's fence gates reuse. Across slots the GPU
//! decodes frame N+1 while it encodes frame N.

use crate::container::{HevcMuxer, Mp4Demuxer};
use crate::decoder::{DecodeRecordParams, DecodeSession};
use crate::encoder::{EncodeRecordParams, EncodeSession, EncoderConfig, CTB_SIZE};
use crate::error::{Result, TranscodeError};
use crate::gop::GopMode;
use crate::parser::{hevc_is_keyframe, AccessUnit, AccessUnitParser};
use crate::profiles::VideoProfiles;
use crate::resources::{cmd_image_barriers, layer_range, video_barrier, with_queue_transfer};
use crate::ring::{FrameRing, PendingFrame, DEFAULT_RING_SIZE, MIN_RING_SIZE};
use crate::vulkan::VideoContext;
use ash::vk;
use std::path::Path;
use tracing::{debug, info, warn};

/// Output frame rate: PTS is the frame index in 1/30 s units.
const OUTPUT_FPS: u32 = 30;

/// Tunables for a transcode run.
#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    /// Constant QP for the HEVC encoder.
    pub quality_level: u32,
    pub gop_mode: GopMode,
    /// Frame slots in flight; clamped to at least [`MIN_RING_SIZE`].
    pub ring_size: usize,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            quality_level: 28,
            gop_mode: GopMode::IntraOnly,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

/// GPU H.264 → H.265 transcoder for one input file.
pub struct Transcoder {
    context: VideoContext,
    demuxer: Mp4Demuxer,
    muxer: HevcMuxer,
    parser: AccessUnitParser,
    decoder: DecodeSession,
    encoder: EncodeSession,
    ring: FrameRing,
    frame_count: u64,
}

impl Transcoder {
    pub fn new(
        context: VideoContext,
        input: &Path,
        output: &Path,
        options: &TranscodeOptions,
    ) -> Result<Self> {
        let demuxer = Mp4Demuxer::open(input)?;
        let (sps, pps) = demuxer.parameter_sets();
        let parser = AccessUnitParser::new(sps, pps)?;
        let geometry = parser.geometry();

        if geometry.display_width != demuxer.width() || geometry.display_height != demuxer.height()
        {
            warn!(
                "container reports {}x{} but the SPS decodes to {}x{}; using the SPS",
                demuxer.width(),
                demuxer.height(),
                geometry.display_width,
                geometry.display_height
            );
        }

        let profiles = VideoProfiles::h264_to_h265();
        let ring_size = options.ring_size.max(MIN_RING_SIZE);

        let decoder = DecodeSession::new(
            context.clone(),
            &profiles,
            geometry,
            parser.sps_summary(),
            parser.std_sps(),
            parser.std_pps(),
        )?;

        let encoder_config =
            EncoderConfig::new(geometry.display_width, geometry.display_height)
                .with_quality_level(options.quality_level)
                .with_gop_mode(options.gop_mode);
        let encoder = EncodeSession::new(
            context.clone(),
            &profiles,
            encoder_config,
            ring_size as u32,
        )?;

        let mut muxer = HevcMuxer::create(
            output,
            geometry.display_width,
            geometry.display_height,
            OUTPUT_FPS,
        )?;
        muxer.set_codec_parameters(encoder.parameter_sets());

        // The shared pictures must satisfy both sessions; the encoder's CTB
        // alignment is at least as coarse as the decoder's macroblock grid.
        let ctb_mask = CTB_SIZE - 1;
        let picture_width =
            ((geometry.display_width + ctb_mask) & !ctb_mask).max(geometry.coded_width);
        let picture_height =
            ((geometry.display_height + ctb_mask) & !ctb_mask).max(geometry.coded_height);

        let ring = FrameRing::new(context.clone(), picture_width, picture_height, ring_size)?;

        Ok(Self {
            context,
            demuxer,
            muxer,
            parser,
            decoder,
            encoder,
            ring,
            frame_count: 0,
        })
    }

    /// Run the transcode to completion.
    ///
    /// On success the output trailer has been written. On error the loop is
    /// aborted, the device drained (unless it is lost), and the trailer is
    /// withheld so the output is recognizably incomplete.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_inner();
        if let Err(err) = &result {
            warn!("transcode aborted: {err}");
            if !err.device_unusable() {
                self.context.wait_idle();
            }
        }
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        info!("Starting transcode");
        while let Some(packet) = self.demuxer.next_video_packet()? {
            let au = self.parser.parse_sample(&packet.data)?;
            if au.parameters_changed {
                // New parameter sets replace the session object atomically
                // between frames; the decode queue is drained inside.
                self.decoder
                    .rebuild_parameters(self.parser.std_sps(), self.parser.std_pps())?;
            }
            self.submit_frame(&au)?;
        }
        self.drain()?;
        self.muxer.finish()?;
        info!(frames = self.frame_count, "Transcode finished");
        Ok(())
    }

    /// Stage, record, and submit one access unit through a ring slot.
    fn submit_frame(&mut self, au: &AccessUnit) -> Result<()> {
        let index = self.ring.slot_index(self.frame_count);
        self.ring.wait_slot(index)?;
        self.flush_slot(index)?;
        self.ring.begin_slot(index)?;

        let staged_size = au.annexb.len() as u64;
        let padded_size = self.decoder.align_bitstream_size(staged_size);
        self.ring.stage_input(index, &au.annexb, padded_size)?;

        let device = self.context.device();
        let cross_family = self.context.cross_family();
        let decode_family = self.context.decode_queue_family();
        let encode_family = self.context.encode_queue_family();

        let (decode_cb, encode_cb, picture, picture_view, input_buffer) = {
            let slot = self.ring.slot(index);
            (
                slot.decode_cb,
                slot.encode_cb,
                slot.picture,
                slot.picture_view,
                slot.input_buffer,
            )
        };
        let (output_buffer, output_capacity, decode_done, encode_done) = {
            let slot = self.ring.slot(index);
            (
                slot.output_buffer,
                slot.output_capacity,
                slot.decode_done,
                slot.encode_done,
            )
        };

        // Decode command buffer: make the shared picture writable (previous
        // contents are dead), decode into it, then hand it to the encoder.
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(decode_cb, &begin_info) }
            .map_err(|e| TranscodeError::from_vk("vkBeginCommandBuffer", e))?;

        let to_decode_dst = video_barrier(
            picture,
            layer_range(0, 1),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::VIDEO_DECODE_DST_KHR,
        );
        unsafe { cmd_image_barriers(device, decode_cb, &[to_decode_dst]) };

        self.decoder.record(DecodeRecordParams {
            command_buffer: decode_cb,
            target_view: picture_view,
            bitstream_buffer: input_buffer,
            bitstream_size: staged_size,
            picture: &au.picture,
            slice_offsets: &au.slice_offsets,
        })?;

        let handoff = video_barrier(
            picture,
            layer_range(0, 1),
            vk::ImageLayout::VIDEO_DECODE_DST_KHR,
            vk::ImageLayout::VIDEO_ENCODE_SRC_KHR,
        );
        if cross_family {
            // Release half of the queue ownership transfer.
            let release = with_queue_transfer(handoff, decode_family, encode_family);
            unsafe { cmd_image_barriers(device, decode_cb, &[release]) };
        } else {
            unsafe { cmd_image_barriers(device, decode_cb, &[handoff]) };
        }
        unsafe { device.end_command_buffer(decode_cb) }
            .map_err(|e| TranscodeError::from_vk("vkEndCommandBuffer", e))?;

        // Encode command buffer: acquire the picture when crossing families,
        // then encode from it.
        unsafe { device.begin_command_buffer(encode_cb, &begin_info) }
            .map_err(|e| TranscodeError::from_vk("vkBeginCommandBuffer", e))?;
        if cross_family {
            let acquire = with_queue_transfer(
                video_barrier(
                    picture,
                    layer_range(0, 1),
                    vk::ImageLayout::VIDEO_DECODE_DST_KHR,
                    vk::ImageLayout::VIDEO_ENCODE_SRC_KHR,
                ),
                decode_family,
                encode_family,
            );
            unsafe { cmd_image_barriers(device, encode_cb, &[acquire]) };
        }

        let meta = self.encoder.record(EncodeRecordParams {
            command_buffer: encode_cb,
            source_view: picture_view,
            dst_buffer: output_buffer,
            dst_capacity: output_capacity,
            query_slot: index as u32,
        });
        unsafe { device.end_command_buffer(encode_cb) }
            .map_err(|e| TranscodeError::from_vk("vkEndCommandBuffer", e))?;

        // Submit decode, signalling the hand-off semaphore.
        let decode_cb_infos =
            [vk::CommandBufferSubmitInfo::default().command_buffer(decode_cb)];
        let decode_signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(decode_done)
            .stage_mask(vk::PipelineStageFlags2::VIDEO_DECODE_KHR)];
        let decode_submits = [vk::SubmitInfo2::default()
            .command_buffer_infos(&decode_cb_infos)
            .signal_semaphore_infos(&decode_signals)];
        unsafe {
            device.queue_submit2(self.context.decode_queue(), &decode_submits, vk::Fence::null())
        }
        .map_err(|e| TranscodeError::from_vk("vkQueueSubmit2", e))?;

        // Submit encode, waiting for decode at the video-encode stage and
        // signalling the slot's fence.
        let encode_cb_infos =
            [vk::CommandBufferSubmitInfo::default().command_buffer(encode_cb)];
        let encode_waits = [vk::SemaphoreSubmitInfo::default()
            .semaphore(decode_done)
            .stage_mask(vk::PipelineStageFlags2::VIDEO_ENCODE_KHR)];
        let encode_submits = [vk::SubmitInfo2::default()
            .wait_semaphore_infos(&encode_waits)
            .command_buffer_infos(&encode_cb_infos)];
        unsafe { device.queue_submit2(self.context.encode_queue(), &encode_submits, encode_done) }
            .map_err(|e| TranscodeError::from_vk("vkQueueSubmit2", e))?;

        self.ring.slot_mut(index).pending = Some(PendingFrame {
            frame_index: self.frame_count,
            meta,
        });
        self.frame_count += 1;
        debug!(frame = self.frame_count, "Submitted frame");
        Ok(())
    }

    /// Read back and mux the frame previously submitted through this slot.
    /// The slot's fence must have signalled.
    fn flush_slot(&mut self, index: usize) -> Result<()> {
        let Some(pending) = self.ring.slot_mut(index).pending.take() else {
            return Ok(());
        };
        let (output_ptr, output_capacity) = {
            let slot = self.ring.slot(index);
            (slot.output_ptr(), slot.output_capacity)
        };
        let data =
            self.encoder
                .read_encoded(index as u32, output_ptr, output_capacity, pending.meta)?;
        let keyframe = hevc_is_keyframe(&data);
        self.muxer
            .write_packet(&data, pending.frame_index, keyframe)?;
        debug!(
            frame = pending.frame_index,
            bytes = data.len(),
            keyframe,
            "Muxed frame"
        );
        Ok(())
    }

    /// Retire all in-flight slots in submission order.
    fn drain(&mut self) -> Result<()> {
        for offset in 0..self.ring.len() as u64 {
            let index = self.ring.slot_index(self.frame_count + offset);
            if self.ring.slot(index).pending.is_some() {
                self.ring.wait_slot(index)?;
                self.flush_slot(index)?;
            }
        }
        Ok(())
    }

    /// Frames transcoded so far.
    pub fn frames_transcoded(&self) -> u64 {
        self.frame_count
    }
}
