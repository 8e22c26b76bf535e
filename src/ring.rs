//! Ring of per-frame GPU resources.
//!
//! Each slot owns everything one frame in flight needs: the staged compressed
//! input, the shared decoded picture, the encoded output buffer, one command
//! buffer per video queue family, and the synchronization objects that order
//! decode before encode and gate slot reuse. With at least two slots the host
//! muxes frame N while the GPU works on frame N+1.

use crate::encoder::EncodedPictureMeta;
use crate::error::{Result, TranscodeError};
use crate::profiles::{VideoProfiles, NV12_FORMAT};
use crate::resources::{create_buffer, create_image, create_image_view, map_memory};
use crate::vulkan::VideoContext;
use ash::vk;
use tracing::debug;

/// Minimum ring size; one slot would serialize decode and encode.
pub const MIN_RING_SIZE: usize = 2;

/// Default ring size.
pub const DEFAULT_RING_SIZE: usize = 3;

/// Initial capacity of the per-slot bitstream staging buffers.
pub(crate) const INITIAL_STAGING_SIZE: u64 = 2 * 1024 * 1024;

/// Fence waits longer than this mean the device stopped making progress.
const FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// A frame submitted to the GPU and not yet muxed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingFrame {
    pub frame_index: u64,
    pub meta: EncodedPictureMeta,
}

/// Per-frame resources for one ring position.
pub(crate) struct FrameSlot {
    pub input_buffer: vk::Buffer,
    input_memory: vk::DeviceMemory,
    input_ptr: *mut u8,
    pub input_capacity: u64,

    pub picture: vk::Image,
    picture_memory: vk::DeviceMemory,
    pub picture_view: vk::ImageView,

    pub output_buffer: vk::Buffer,
    output_memory: vk::DeviceMemory,
    output_ptr: *mut u8,
    pub output_capacity: u64,

    pub decode_cb: vk::CommandBuffer,
    pub encode_cb: vk::CommandBuffer,
    /// Signalled by the decode submission, waited by the encode submission.
    pub decode_done: vk::Semaphore,
    /// Signalled by the encode submission; the host waits before slot reuse.
    pub encode_done: vk::Fence,

    pub pending: Option<PendingFrame>,
}

impl FrameSlot {
    pub fn output_ptr(&self) -> *const u8 {
        self.output_ptr
    }
}

/// Ring of frame slots plus the command pools their buffers come from.
pub(crate) struct FrameRing {
    context: VideoContext,
    profiles: VideoProfiles,
    slots: Vec<FrameSlot>,
    decode_pool: vk::CommandPool,
    encode_pool: vk::CommandPool,
}

impl FrameRing {
    pub fn new(
        context: VideoContext,
        picture_width: u32,
        picture_height: u32,
        ring_size: usize,
    ) -> Result<Self> {
        let ring_size = ring_size.max(MIN_RING_SIZE);
        let profiles = VideoProfiles::h264_to_h265();
        let device = context.device();

        let decode_pool = create_pool(&context, context.decode_queue_family())?;
        let encode_pool = create_pool(&context, context.encode_queue_family())?;

        let decode_cbs = allocate_command_buffers(&context, decode_pool, ring_size as u32)?;
        let encode_cbs = allocate_command_buffers(&context, encode_pool, ring_size as u32)?;

        let mut slots = Vec::with_capacity(ring_size);
        for index in 0..ring_size {
            let (input_buffer, input_memory) = create_buffer(
                &context,
                INITIAL_STAGING_SIZE,
                vk::BufferUsageFlags::VIDEO_DECODE_SRC_KHR,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                &profiles.decode_list(),
            )?;
            let input_ptr = map_memory(&context, input_memory, INITIAL_STAGING_SIZE)?;

            let (picture, picture_memory) = create_image(
                &context,
                picture_width,
                picture_height,
                NV12_FORMAT,
                vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR
                    | vk::ImageUsageFlags::VIDEO_ENCODE_SRC_KHR,
                1,
                &profiles.shared_list(),
            )?;
            let picture_view = create_image_view(&context, picture, NV12_FORMAT, 0)?;

            let (output_buffer, output_memory) = create_buffer(
                &context,
                INITIAL_STAGING_SIZE,
                vk::BufferUsageFlags::VIDEO_ENCODE_DST_KHR,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                &profiles.encode_list(),
            )?;
            let output_ptr = map_memory(&context, output_memory, INITIAL_STAGING_SIZE)?;

            let decode_done = unsafe {
                device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            }
            .map_err(|e| TranscodeError::from_vk("vkCreateSemaphore", e))?;

            // Created signalled so the first wait on every slot passes.
            let fence_info =
                vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let encode_done = unsafe { device.create_fence(&fence_info, None) }
                .map_err(|e| TranscodeError::from_vk("vkCreateFence", e))?;

            slots.push(FrameSlot {
                input_buffer,
                input_memory,
                input_ptr,
                input_capacity: INITIAL_STAGING_SIZE,
                picture,
                picture_memory,
                picture_view,
                output_buffer,
                output_memory,
                output_ptr,
                output_capacity: INITIAL_STAGING_SIZE,
                decode_cb: decode_cbs[index],
                encode_cb: encode_cbs[index],
                decode_done,
                encode_done,
                pending: None,
            });
        }

        debug!(ring_size, "Created frame ring");
        Ok(Self {
            context,
            profiles,
            slots,
            decode_pool,
            encode_pool,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_index(&self, frame_index: u64) -> usize {
        (frame_index % self.slots.len() as u64) as usize
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }

    /// Block until the slot's previous encode finished.
    pub fn wait_slot(&self, index: usize) -> Result<()> {
        let fence = self.slots[index].encode_done;
        unsafe {
            self.context
                .device()
                .wait_for_fences(&[fence], true, FENCE_TIMEOUT_NS)
        }
        .map_err(|result| match result {
            vk::Result::TIMEOUT => TranscodeError::DeviceLost,
            other => TranscodeError::from_vk("vkWaitForFences", other),
        })
    }

    /// Reset the slot's fence and command buffers for re-recording. The slot
    /// must have been waited on first.
    pub fn begin_slot(&mut self, index: usize) -> Result<()> {
        let device = self.context.device();
        let slot = &mut self.slots[index];
        unsafe { device.reset_fences(&[slot.encode_done]) }
            .map_err(|e| TranscodeError::from_vk("vkResetFences", e))?;
        unsafe {
            device.reset_command_buffer(slot.decode_cb, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| TranscodeError::from_vk("vkResetCommandBuffer", e))?;
        unsafe {
            device.reset_command_buffer(slot.encode_cb, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| TranscodeError::from_vk("vkResetCommandBuffer", e))?;
        Ok(())
    }

    /// Copy an access unit into the slot's input staging buffer, zero-padding
    /// up to `padded_size`. Grows the buffer to the next power of two when the
    /// packet does not fit; the slot must be idle.
    pub fn stage_input(&mut self, index: usize, data: &[u8], padded_size: u64) -> Result<()> {
        if padded_size > self.slots[index].input_capacity {
            self.grow_input(index, padded_size)?;
        }
        let slot = &self.slots[index];
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), slot.input_ptr, data.len());
            std::ptr::write_bytes(
                slot.input_ptr.add(data.len()),
                0,
                (padded_size as usize).saturating_sub(data.len()),
            );
        }
        Ok(())
    }

    fn grow_input(&mut self, index: usize, needed: u64) -> Result<()> {
        let new_capacity = needed.next_power_of_two();
        debug!(
            slot = index,
            needed, new_capacity, "Growing input staging buffer"
        );

        let (buffer, memory) = create_buffer(
            &self.context,
            new_capacity,
            vk::BufferUsageFlags::VIDEO_DECODE_SRC_KHR,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            &self.profiles.decode_list(),
        )?;
        let ptr = match map_memory(&self.context, memory, new_capacity) {
            Ok(ptr) => ptr,
            Err(e) => {
                unsafe {
                    self.context.device().destroy_buffer(buffer, None);
                    self.context.device().free_memory(memory, None);
                }
                return Err(e);
            }
        };

        let slot = &mut self.slots[index];
        unsafe {
            self.context.device().unmap_memory(slot.input_memory);
            self.context.device().destroy_buffer(slot.input_buffer, None);
            self.context.device().free_memory(slot.input_memory, None);
        }
        slot.input_buffer = buffer;
        slot.input_memory = memory;
        slot.input_ptr = ptr;
        slot.input_capacity = new_capacity;
        Ok(())
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            let _ = device.device_wait_idle();
            for slot in &self.slots {
                device.destroy_fence(slot.encode_done, None);
                device.destroy_semaphore(slot.decode_done, None);

                device.unmap_memory(slot.input_memory);
                device.destroy_buffer(slot.input_buffer, None);
                device.free_memory(slot.input_memory, None);

                device.unmap_memory(slot.output_memory);
                device.destroy_buffer(slot.output_buffer, None);
                device.free_memory(slot.output_memory, None);

                device.destroy_image_view(slot.picture_view, None);
                device.destroy_image(slot.picture, None);
                device.free_memory(slot.picture_memory, None);
            }
            device.destroy_command_pool(self.decode_pool, None);
            device.destroy_command_pool(self.encode_pool, None);
        }
    }
}

fn create_pool(context: &VideoContext, queue_family: u32) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
    unsafe { context.device().create_command_pool(&pool_info, None) }
        .map_err(|e| TranscodeError::from_vk("vkCreateCommandPool", e))
}

fn allocate_command_buffers(
    context: &VideoContext,
    pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);
    unsafe { context.device().allocate_command_buffers(&alloc_info) }
        .map_err(|e| TranscodeError::from_vk("vkAllocateCommandBuffers", e))
}

#[cfg(test)]
mod tests {
    /// Slot scheduling arithmetic, kept free of any Vulkan objects.
    fn slot_index(frame_index: u64, ring_size: usize) -> usize {
        (frame_index % ring_size as u64) as usize
    }

    #[test]
    fn test_slot_rotation() {
        let indices: Vec<usize> = (0..7).map(|frame| slot_index(frame, 3)).collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_each_fence_waited_equally() {
        // 300 frames over a 3-slot ring: every fence is waited exactly 100
        // times, and no more than ring_size frames are ever in flight.
        let ring_size = 3;
        let mut waits = [0u32; 3];
        let mut in_flight: Vec<u64> = Vec::new();
        for frame in 0..300u64 {
            let slot = slot_index(frame, ring_size);
            waits[slot] += 1;
            // Waiting on the slot retires the frame that used it previously.
            in_flight.retain(|f| slot_index(*f, ring_size) != slot);
            in_flight.push(frame);
            assert!(in_flight.len() <= ring_size);
        }
        assert_eq!(waits, [100, 100, 100]);
    }

    #[test]
    fn test_growth_is_next_power_of_two() {
        assert_eq!(3_000_000u64.next_power_of_two(), 4 * 1024 * 1024);
        assert_eq!((2u64 * 1024 * 1024).next_power_of_two(), 2 * 1024 * 1024);
    }
}
