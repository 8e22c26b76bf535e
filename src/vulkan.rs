//! Vulkan context and device selection for GPU transcoding.
//!
//! Note: Vulkan p_next chaining requires creating default structs and then assigning p_next,
//! which triggers clippy::field_reassign_with_default. This is the correct pattern for Vulkan.
#![allow(clippy::field_reassign_with_default)]

use crate::error::{QueueRole, Result, TranscodeError};
use ash::vk;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Environment variable selecting a preferred adapter by device-name substring.
pub const DEVICE_ENV_VAR: &str = "VKSHIFT_DEVICE";

/// Device extensions required for H.264 decode + H.265 encode.
const REQUIRED_EXTENSIONS: [&CStr; 7] = [
    ash::khr::video_queue::NAME,
    ash::khr::video_decode_queue::NAME,
    ash::khr::video_decode_h264::NAME,
    ash::khr::video_encode_queue::NAME,
    ash::khr::video_encode_h265::NAME,
    ash::khr::synchronization2::NAME,
    ash::khr::sampler_ycbcr_conversion::NAME,
];

/// Adapter selection policy.
///
/// Replaces the hard-coded vendor constants of typical samples: discrete
/// adapters are preferred in a first tier, and an optional name substring
/// (seeded from `VKSHIFT_DEVICE`) restricts the candidates.
#[derive(Debug, Clone)]
pub struct AdapterPolicy {
    pub prefer_discrete: bool,
    pub name_substring: Option<String>,
}

impl Default for AdapterPolicy {
    fn default() -> Self {
        Self {
            prefer_discrete: true,
            name_substring: std::env::var(DEVICE_ENV_VAR).ok(),
        }
    }
}

impl AdapterPolicy {
    fn matches_name(&self, device_name: &str) -> bool {
        match &self.name_substring {
            Some(needle) => device_name
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            None => true,
        }
    }
}

/// Per-family capabilities relevant to video queue selection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FamilyCaps {
    pub flags: vk::QueueFlags,
    pub video_ops: vk::VideoCodecOperationFlagsKHR,
}

/// Pick the lowest-index family advertising H.264 decode and the lowest
/// advertising H.265 encode. The two may be equal.
pub(crate) fn select_video_families(families: &[FamilyCaps]) -> (Option<u32>, Option<u32>) {
    let mut decode = None;
    let mut encode = None;
    for (idx, caps) in families.iter().enumerate() {
        if decode.is_none()
            && caps.flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR)
            && caps
                .video_ops
                .contains(vk::VideoCodecOperationFlagsKHR::DECODE_H264)
        {
            decode = Some(idx as u32);
        }
        if encode.is_none()
            && caps.flags.contains(vk::QueueFlags::VIDEO_ENCODE_KHR)
            && caps
                .video_ops
                .contains(vk::VideoCodecOperationFlagsKHR::ENCODE_H265)
        {
            encode = Some(idx as u32);
        }
    }
    (decode, encode)
}

/// Builder for creating a [`VideoContext`].
#[must_use]
pub struct VideoContextBuilder {
    app_name: String,
    enable_validation: bool,
    policy: AdapterPolicy,
}

impl Default for VideoContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoContextBuilder {
    pub fn new() -> Self {
        Self {
            app_name: "vkshift".to_string(),
            enable_validation: false,
            policy: AdapterPolicy::default(),
        }
    }

    /// Set the application name.
    pub fn app_name(mut self, name: &str) -> Self {
        self.app_name = name.to_string();
        self
    }

    /// Enable or disable validation layers.
    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Override the adapter selection policy.
    pub fn adapter_policy(mut self, policy: AdapterPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the VideoContext.
    pub fn build(self) -> Result<VideoContext> {
        VideoContext::new(self)
    }
}

/// Inner struct holding the actual Vulkan resources.
struct VideoContextInner {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    decode_queue_family: u32,
    encode_queue_family: u32,
    decode_queue: vk::Queue,
    encode_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device_properties: vk::PhysicalDeviceProperties,
    video_queue_fn: ash::khr::video_queue::Device,
    video_decode_fn: ash::khr::video_decode_queue::Device,
    video_encode_fn: ash::khr::video_encode_queue::Device,
}

impl Drop for VideoContextInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Holds the Vulkan context for video operations.
///
/// This type is cheaply cloneable - clones share the same underlying Vulkan resources.
#[derive(Clone)]
pub struct VideoContext {
    inner: Arc<VideoContextInner>,
}

impl VideoContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.inner.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.inner.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.inner.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.inner.physical_device
    }

    pub fn decode_queue_family(&self) -> u32 {
        self.inner.decode_queue_family
    }

    pub fn encode_queue_family(&self) -> u32 {
        self.inner.encode_queue_family
    }

    pub fn decode_queue(&self) -> vk::Queue {
        self.inner.decode_queue
    }

    pub fn encode_queue(&self) -> vk::Queue {
        self.inner.encode_queue
    }

    /// Whether decode and encode live on different queue families, in which
    /// case the shared picture needs a queue ownership transfer per frame.
    pub fn cross_family(&self) -> bool {
        self.inner.decode_queue_family != self.inner.encode_queue_family
    }

    pub(crate) fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.inner.memory_properties
    }

    pub fn device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.inner.device_properties
    }

    pub(crate) fn video_queue_fn(&self) -> &ash::khr::video_queue::Device {
        &self.inner.video_queue_fn
    }

    pub(crate) fn video_decode_fn(&self) -> &ash::khr::video_decode_queue::Device {
        &self.inner.video_decode_fn
    }

    pub(crate) fn video_encode_fn(&self) -> &ash::khr::video_encode_queue::Device {
        &self.inner.video_encode_fn
    }

    /// Find the smallest memory type index matching the filter and properties.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let props = &self.inner.memory_properties;
        (0..props.memory_type_count).find(|&i| {
            (type_filter & (1 << i)) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }

    /// Block until both video queues are idle. Best effort during teardown.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.inner.device.device_wait_idle();
        }
    }
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    decode_family: u32,
    encode_family: u32,
}

impl VideoContext {
    fn new(builder: VideoContextBuilder) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| TranscodeError::NoDevice(format!("failed to load Vulkan: {e}")))?;

        let app_name = CString::new(builder.app_name.clone())
            .map_err(|_| TranscodeError::NoDevice("invalid application name".to_string()))?;
        let engine_name = CString::new("vkshift").expect("static engine name");

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let validation_layer =
            CString::new("VK_LAYER_KHRONOS_validation").expect("static layer name");
        let mut layer_names: Vec<*const c_char> = Vec::new();
        if builder.enable_validation {
            layer_names.push(validation_layer.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| TranscodeError::NoDevice(format!("instance creation failed: {e}")))?;

        info!("Created Vulkan instance");

        let candidate = match Self::pick_physical_device(&instance, &builder.policy) {
            Ok(c) => c,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let device_properties =
            unsafe { instance.get_physical_device_properties(candidate.physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(candidate.physical_device) };

        // One queue per required family, deduplicated when decode == encode.
        let queue_priorities = [1.0f32];
        let mut unique_families = vec![candidate.decode_family];
        if !unique_families.contains(&candidate.encode_family) {
            unique_families.push(candidate.encode_family);
        }
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extension_names: Vec<*const c_char> =
            REQUIRED_EXTENSIONS.iter().map(|n| n.as_ptr()).collect();

        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let mut ycbcr_features = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default()
            .sampler_ycbcr_conversion(true);

        // Chain: sync2_features -> ycbcr_features
        sync2_features.p_next =
            (&mut ycbcr_features as *mut vk::PhysicalDeviceSamplerYcbcrConversionFeatures).cast();

        let mut device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names);
        device_create_info.p_next =
            (&mut sync2_features as *mut vk::PhysicalDeviceSynchronization2Features).cast();

        let device = match unsafe {
            instance.create_device(candidate.physical_device, &device_create_info, None)
        } {
            Ok(d) => d,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(TranscodeError::DeviceCreationFailed(e.to_string()));
            }
        };

        let decode_queue = unsafe { device.get_device_queue(candidate.decode_family, 0) };
        let encode_queue = unsafe { device.get_device_queue(candidate.encode_family, 0) };

        let video_queue_fn = ash::khr::video_queue::Device::new(&instance, &device);
        let video_decode_fn = ash::khr::video_decode_queue::Device::new(&instance, &device);
        let video_encode_fn = ash::khr::video_encode_queue::Device::new(&instance, &device);

        info!(
            decode_family = candidate.decode_family,
            encode_family = candidate.encode_family,
            "Created Vulkan device with video queues"
        );

        Ok(Self {
            inner: Arc::new(VideoContextInner {
                entry,
                instance,
                physical_device: candidate.physical_device,
                device,
                decode_queue_family: candidate.decode_family,
                encode_queue_family: candidate.encode_family,
                decode_queue,
                encode_queue,
                memory_properties,
                device_properties,
                video_queue_fn,
                video_decode_fn,
                video_encode_fn,
            }),
        })
    }

    /// Rank adapters in two tiers (discrete first when preferred) and return
    /// the first suitable one. The last rejection reason is surfaced when no
    /// adapter qualifies so the user sees why their hardware was skipped.
    fn pick_physical_device(
        instance: &ash::Instance,
        policy: &AdapterPolicy,
    ) -> Result<Candidate> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| TranscodeError::NoDevice(format!("device enumeration failed: {e}")))?;

        if physical_devices.is_empty() {
            return Err(TranscodeError::NoDevice(
                "no Vulkan adapters present".to_string(),
            ));
        }

        let mut tiers: Vec<Vec<vk::PhysicalDevice>> = vec![Vec::new(), Vec::new()];
        for &physical_device in &physical_devices {
            let props = unsafe { instance.get_physical_device_properties(physical_device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();
            if !policy.matches_name(&name) {
                debug!("Skipping adapter {name}: name filter");
                continue;
            }
            let discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            if policy.prefer_discrete && discrete {
                tiers[0].push(physical_device);
            } else {
                tiers[1].push(physical_device);
            }
        }

        let mut last_rejection: Option<TranscodeError> = None;
        for physical_device in tiers.into_iter().flatten() {
            match Self::probe_device(instance, physical_device) {
                Ok(candidate) => return Ok(candidate),
                Err(e) => {
                    debug!("Adapter rejected: {e}");
                    last_rejection = Some(e);
                }
            }
        }

        Err(last_rejection.unwrap_or_else(|| {
            TranscodeError::NoDevice("no adapter matched the selection policy".to_string())
        }))
    }

    /// Check one adapter: both video families and every required extension.
    fn probe_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Candidate> {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .to_string();
        debug!("Checking adapter: {name}");

        let family_count = unsafe {
            instance.get_physical_device_queue_family_properties2_len(physical_device)
        };
        let mut video_props =
            vec![vk::QueueFamilyVideoPropertiesKHR::default(); family_count];
        let mut family_props = vec![vk::QueueFamilyProperties2::default(); family_count];
        for (family, video) in family_props.iter_mut().zip(video_props.iter_mut()) {
            family.p_next = (video as *mut vk::QueueFamilyVideoPropertiesKHR).cast();
        }
        unsafe {
            instance
                .get_physical_device_queue_family_properties2(physical_device, &mut family_props);
        }

        let caps: Vec<FamilyCaps> = family_props
            .iter()
            .zip(video_props.iter())
            .map(|(family, video)| FamilyCaps {
                flags: family.queue_family_properties.queue_flags,
                video_ops: video.video_codec_operations,
            })
            .collect();

        let (decode_family, encode_family) = select_video_families(&caps);
        let decode_family = decode_family.ok_or(TranscodeError::NoVideoQueue {
            role: QueueRole::Decode,
        })?;
        let encode_family = encode_family.ok_or(TranscodeError::NoVideoQueue {
            role: QueueRole::Encode,
        })?;

        let available = unsafe {
            instance
                .enumerate_device_extension_properties(physical_device)
                .unwrap_or_default()
        };
        let has_extension = |wanted: &CStr| {
            available.iter().any(|ext| {
                let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                ext_name == wanted
            })
        };

        for required in REQUIRED_EXTENSIONS {
            if has_extension(required) {
                debug!("  [found] {}", required.to_string_lossy());
            } else {
                warn!(
                    "Adapter {name} is missing {}",
                    required.to_string_lossy()
                );
                return Err(TranscodeError::MissingExtension {
                    name: required.to_string_lossy().into_owned(),
                });
            }
        }

        info!(
            "Selected adapter {name} (decode family {decode_family}, encode family {encode_family})"
        );
        Ok(Candidate {
            physical_device,
            decode_family,
            encode_family,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, video_ops: vk::VideoCodecOperationFlagsKHR) -> FamilyCaps {
        FamilyCaps { flags, video_ops }
    }

    #[test]
    fn test_separate_decode_encode_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, vk::VideoCodecOperationFlagsKHR::NONE),
            family(
                vk::QueueFlags::VIDEO_DECODE_KHR,
                vk::VideoCodecOperationFlagsKHR::DECODE_H264,
            ),
            family(
                vk::QueueFlags::VIDEO_ENCODE_KHR,
                vk::VideoCodecOperationFlagsKHR::ENCODE_H265,
            ),
        ];
        assert_eq!(select_video_families(&families), (Some(1), Some(2)));
    }

    #[test]
    fn test_combined_family_selected_for_both() {
        let families = [family(
            vk::QueueFlags::VIDEO_DECODE_KHR | vk::QueueFlags::VIDEO_ENCODE_KHR,
            vk::VideoCodecOperationFlagsKHR::DECODE_H264
                | vk::VideoCodecOperationFlagsKHR::ENCODE_H265,
        )];
        assert_eq!(select_video_families(&families), (Some(0), Some(0)));
    }

    #[test]
    fn test_lowest_index_wins() {
        let decode = family(
            vk::QueueFlags::VIDEO_DECODE_KHR,
            vk::VideoCodecOperationFlagsKHR::DECODE_H264,
        );
        let families = [
            family(vk::QueueFlags::COMPUTE, vk::VideoCodecOperationFlagsKHR::NONE),
            decode,
            decode,
        ];
        assert_eq!(select_video_families(&families).0, Some(1));
    }

    #[test]
    fn test_flag_without_codec_op_is_not_enough() {
        // A family advertising the decode queue flag but only H.265 decode
        // must not be selected for H.264 work.
        let families = [family(
            vk::QueueFlags::VIDEO_DECODE_KHR,
            vk::VideoCodecOperationFlagsKHR::DECODE_H265,
        )];
        assert_eq!(select_video_families(&families), (None, None));
    }

    #[test]
    fn test_no_encode_family() {
        let families = [family(
            vk::QueueFlags::VIDEO_DECODE_KHR,
            vk::VideoCodecOperationFlagsKHR::DECODE_H264,
        )];
        let (decode, encode) = select_video_families(&families);
        assert_eq!(decode, Some(0));
        assert_eq!(encode, None);
    }

    #[test]
    fn test_adapter_policy_name_filter() {
        let policy = AdapterPolicy {
            prefer_discrete: true,
            name_substring: Some("RaDeOn".to_string()),
        };
        assert!(policy.matches_name("AMD Radeon RX 7900"));
        assert!(!policy.matches_name("NVIDIA GeForce RTX 4070"));

        let open = AdapterPolicy {
            prefer_discrete: true,
            name_substring: None,
        };
        assert!(open.matches_name("anything"));
    }
}
