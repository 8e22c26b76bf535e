//! Memory and resource helpers for video buffers, images, and sessions.
#![allow(clippy::field_reassign_with_default)]

use crate::error::{Result, TranscodeError};
use crate::vulkan::VideoContext;
use ash::vk;
use std::ptr;

/// Align a value up to the next multiple of the given alignment.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Create a buffer with a chained video profile list and bind fresh memory.
///
/// Every buffer touched by a video operation must carry the profile list of
/// the sessions that will read or write it.
pub(crate) fn create_buffer(
    context: &VideoContext,
    size: u64,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    profile_list: &[vk::VideoProfileInfoKHR<'static>],
) -> Result<(vk::Buffer, vk::DeviceMemory)> {
    let mut profile_list_info = vk::VideoProfileListInfoKHR::default().profiles(profile_list);

    let mut create_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    create_info.p_next = (&mut profile_list_info as *mut vk::VideoProfileListInfoKHR).cast();

    let device = context.device();
    let buffer = unsafe { device.create_buffer(&create_info, None) }
        .map_err(|e| TranscodeError::from_vk("vkCreateBuffer", e))?;

    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let memory = match allocate(context, &requirements, memory_flags) {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            device.destroy_buffer(buffer, None);
            device.free_memory(memory, None);
        }
        return Err(TranscodeError::from_vk("vkBindBufferMemory", e));
    }

    Ok((buffer, memory))
}

/// Create an optimal-tiling image with `layers` array layers and a chained
/// video profile list, backed by device-local memory.
pub(crate) fn create_image(
    context: &VideoContext,
    width: u32,
    height: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    layers: u32,
    profile_list: &[vk::VideoProfileInfoKHR<'static>],
) -> Result<(vk::Image, vk::DeviceMemory)> {
    let mut profile_list_info = vk::VideoProfileListInfoKHR::default().profiles(profile_list);

    let mut create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(layers)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    create_info.p_next = (&mut profile_list_info as *mut vk::VideoProfileListInfoKHR).cast();

    let device = context.device();
    let image = unsafe { device.create_image(&create_info, None) }
        .map_err(|e| TranscodeError::from_vk("vkCreateImage", e))?;

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let memory = match allocate(context, &requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };

    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.destroy_image(image, None);
            device.free_memory(memory, None);
        }
        return Err(TranscodeError::from_vk("vkBindImageMemory", e));
    }

    Ok((image, memory))
}

/// Create a 2D view over a single array layer. NV12 views use the COLOR aspect.
pub(crate) fn create_image_view(
    context: &VideoContext,
    image: vk::Image,
    format: vk::Format,
    base_array_layer: u32,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(layer_range(base_array_layer, 1));

    unsafe { context.device().create_image_view(&create_info, None) }
        .map_err(|e| TranscodeError::from_vk("vkCreateImageView", e))
}

fn allocate(
    context: &VideoContext,
    requirements: &vk::MemoryRequirements,
    memory_flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = context
        .find_memory_type(requirements.memory_type_bits, memory_flags)
        .ok_or_else(|| {
            TranscodeError::OutOfMemory(format!(
                "no compatible memory type (bits 0x{:x}, flags {:?})",
                requirements.memory_type_bits, memory_flags
            ))
        })?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { context.device().allocate_memory(&alloc_info, None) }
        .map_err(|e| TranscodeError::from_vk("vkAllocateMemory", e))
}

/// Map a host-visible allocation for persistent access.
pub(crate) fn map_memory(
    context: &VideoContext,
    memory: vk::DeviceMemory,
    size: u64,
) -> Result<*mut u8> {
    let ptr = unsafe {
        context
            .device()
            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
    }
    .map_err(|e| TranscodeError::from_vk("vkMapMemory", e))?;
    Ok(ptr as *mut u8)
}

/// Allocate and bind memory for a video session.
///
/// The session reports a variable number of bindings; all of them are bound
/// in a single `vkBindVideoSessionMemoryKHR` call, never partially.
pub(crate) fn allocate_session_memory(
    context: &VideoContext,
    session: vk::VideoSessionKHR,
) -> Result<Vec<vk::DeviceMemory>> {
    let video_queue_fn = context.video_queue_fn();
    let device = context.device();

    let mut count = 0u32;
    let result = unsafe {
        (video_queue_fn
            .fp()
            .get_video_session_memory_requirements_khr)(
            device.handle(),
            session,
            &mut count,
            ptr::null_mut(),
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(TranscodeError::from_vk(
            "vkGetVideoSessionMemoryRequirementsKHR",
            result,
        ));
    }

    let mut requirements = vec![vk::VideoSessionMemoryRequirementsKHR::default(); count as usize];
    let result = unsafe {
        (video_queue_fn
            .fp()
            .get_video_session_memory_requirements_khr)(
            device.handle(),
            session,
            &mut count,
            requirements.as_mut_ptr(),
        )
    };
    if result != vk::Result::SUCCESS {
        return Err(TranscodeError::from_vk(
            "vkGetVideoSessionMemoryRequirementsKHR",
            result,
        ));
    }

    let mut session_memory = Vec::with_capacity(count as usize);
    let mut bind_infos = Vec::with_capacity(count as usize);

    for req in &requirements {
        let memory_type_index = context
            .find_memory_type(
                req.memory_requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| {
                context.find_memory_type(
                    req.memory_requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::empty(),
                )
            })
            .ok_or_else(|| {
                TranscodeError::OutOfMemory(format!(
                    "no compatible memory type for session binding (bits 0x{:x})",
                    req.memory_requirements.memory_type_bits
                ))
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(req.memory_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                for allocated in &session_memory {
                    unsafe { device.free_memory(*allocated, None) };
                }
                return Err(TranscodeError::from_vk("vkAllocateMemory", e));
            }
        };

        bind_infos.push(
            vk::BindVideoSessionMemoryInfoKHR::default()
                .memory_bind_index(req.memory_bind_index)
                .memory(memory)
                .memory_offset(0)
                .memory_size(req.memory_requirements.size),
        );
        session_memory.push(memory);
    }

    let result = unsafe {
        (video_queue_fn.fp().bind_video_session_memory_khr)(
            device.handle(),
            session,
            bind_infos.len() as u32,
            bind_infos.as_ptr(),
        )
    };
    if result != vk::Result::SUCCESS {
        for allocated in &session_memory {
            unsafe { device.free_memory(*allocated, None) };
        }
        return Err(TranscodeError::from_vk(
            "vkBindVideoSessionMemoryKHR",
            result,
        ));
    }

    Ok(session_memory)
}

/// Subresource range over NV12 array layers.
pub(crate) fn layer_range(base_array_layer: u32, layer_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer,
        layer_count,
    }
}

fn stage_access_for(
    layout: vk::ImageLayout,
) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
        }
        vk::ImageLayout::VIDEO_DECODE_DST_KHR => (
            vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
            vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
        ),
        vk::ImageLayout::VIDEO_DECODE_DPB_KHR => (
            vk::PipelineStageFlags2::VIDEO_DECODE_KHR,
            vk::AccessFlags2::VIDEO_DECODE_READ_KHR | vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR,
        ),
        vk::ImageLayout::VIDEO_ENCODE_SRC_KHR => (
            vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
            vk::AccessFlags2::VIDEO_ENCODE_READ_KHR,
        ),
        vk::ImageLayout::VIDEO_ENCODE_DPB_KHR => (
            vk::PipelineStageFlags2::VIDEO_ENCODE_KHR,
            vk::AccessFlags2::VIDEO_ENCODE_READ_KHR | vk::AccessFlags2::VIDEO_ENCODE_WRITE_KHR,
        ),
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

/// Build an image barrier between video layouts, deriving the video stage and
/// access masks from the layouts.
pub(crate) fn video_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access) = stage_access_for(old_layout);
    let (dst_stage, dst_access) = stage_access_for(new_layout);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

/// Turn a barrier into one half of a queue-family ownership transfer.
pub(crate) fn with_queue_transfer(
    barrier: vk::ImageMemoryBarrier2<'static>,
    src_family: u32,
    dst_family: u32,
) -> vk::ImageMemoryBarrier2<'static> {
    barrier
        .src_queue_family_index(src_family)
        .dst_queue_family_index(dst_family)
}

/// Record a batch of image barriers with synchronization2.
///
/// # Safety
///
/// The command buffer must be in the recording state.
pub(crate) unsafe fn cmd_image_barriers(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    barriers: &[vk::ImageMemoryBarrier2],
) {
    let dependency = vk::DependencyInfo::default().image_memory_barriers(barriers);
    device.cmd_pipeline_barrier2(command_buffer, &dependency);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(130, 64), 192);
        assert_eq!(align_up(128, 64), 128);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(100, 1), 100);
        assert_eq!(align_up(100, 0), 100);
    }

    #[test]
    fn test_barrier_masks_decode_to_encode() {
        let barrier = video_barrier(
            vk::Image::null(),
            layer_range(0, 1),
            vk::ImageLayout::VIDEO_DECODE_DST_KHR,
            vk::ImageLayout::VIDEO_ENCODE_SRC_KHR,
        );
        assert_eq!(
            barrier.src_stage_mask,
            vk::PipelineStageFlags2::VIDEO_DECODE_KHR
        );
        assert_eq!(
            barrier.src_access_mask,
            vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR
        );
        assert_eq!(
            barrier.dst_stage_mask,
            vk::PipelineStageFlags2::VIDEO_ENCODE_KHR
        );
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags2::VIDEO_ENCODE_READ_KHR
        );
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn test_barrier_first_touch_dpb() {
        let barrier = video_barrier(
            vk::Image::null(),
            layer_range(3, 1),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
        );
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::NONE);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(barrier.subresource_range.base_array_layer, 3);
        assert!(barrier
            .dst_access_mask
            .contains(vk::AccessFlags2::VIDEO_DECODE_WRITE_KHR));
    }

    #[test]
    fn test_queue_transfer_families() {
        let barrier = with_queue_transfer(
            video_barrier(
                vk::Image::null(),
                layer_range(0, 1),
                vk::ImageLayout::VIDEO_DECODE_DST_KHR,
                vk::ImageLayout::VIDEO_ENCODE_SRC_KHR,
            ),
            1,
            2,
        );
        assert_eq!(barrier.src_queue_family_index, 1);
        assert_eq!(barrier.dst_queue_family_index, 2);
    }
}
