//! Error types for vkshift.

use ash::vk;
use thiserror::Error;

/// Which video queue role a device was missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Decode,
    Encode,
}

impl std::fmt::Display for QueueRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueRole::Decode => write!(f, "decode"),
            QueueRole::Encode => write!(f, "encode"),
        }
    }
}

/// Main error type for vkshift operations.
#[derive(Error, Debug)]
pub enum TranscodeError {
    /// The input container or its video track cannot be transcoded.
    #[error("{0}")]
    BadInput(String),

    /// No Vulkan adapter suitable for H.264 decode + H.265 encode was found.
    #[error("{0}")]
    NoDevice(String),

    /// An adapter was missing a video queue family for the given role.
    #[error("missing {role} queue family")]
    NoVideoQueue { role: QueueRole },

    /// An adapter was missing a required device extension.
    #[error("{name}")]
    MissingExtension { name: String },

    /// Logical device creation failed.
    #[error("{0}")]
    DeviceCreationFailed(String),

    /// Host or device memory allocation failed.
    #[error("{0}")]
    OutOfMemory(String),

    /// A Vulkan video call returned a non-success status.
    #[error("{op} returned {result:?}")]
    VideoApiFailed {
        op: &'static str,
        result: vk::Result,
    },

    /// The H.264 bitstream could not be parsed.
    #[error("{0}")]
    BitstreamParse(String),

    /// The device was lost (fence timeout or VK_ERROR_DEVICE_LOST).
    #[error("the device stopped responding")]
    DeviceLost,

    /// Filesystem I/O failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// Classify a raw Vulkan status from the named driver call.
    pub fn from_vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                TranscodeError::OutOfMemory(format!("{op}: {result:?}"))
            }
            vk::Result::ERROR_DEVICE_LOST => TranscodeError::DeviceLost,
            _ => TranscodeError::VideoApiFailed { op, result },
        }
    }

    /// The short kind label used for the CLI's single error line.
    pub fn kind(&self) -> &'static str {
        match self {
            TranscodeError::BadInput(_) => "BadInput",
            TranscodeError::NoDevice(_) => "NoDevice",
            TranscodeError::NoVideoQueue { .. } => "NoVideoQueue",
            TranscodeError::MissingExtension { .. } => "MissingExtension",
            TranscodeError::DeviceCreationFailed(_) => "DeviceCreationFailed",
            TranscodeError::OutOfMemory(_) => "OutOfMemory",
            TranscodeError::VideoApiFailed { .. } => "VideoApiFailed",
            TranscodeError::BitstreamParse(_) => "BitstreamParse",
            TranscodeError::DeviceLost => "DeviceLost",
            TranscodeError::Io(_) => "IoError",
        }
    }

    /// Whether the driver must skip the device-idle wait during teardown.
    pub fn device_unusable(&self) -> bool {
        matches!(self, TranscodeError::DeviceLost)
    }
}

/// Result type for vkshift operations.
pub type Result<T> = std::result::Result<T, TranscodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_role_display() {
        assert_eq!(
            TranscodeError::NoVideoQueue {
                role: QueueRole::Encode
            }
            .to_string(),
            "missing encode queue family"
        );
    }

    #[test]
    fn test_vk_classification() {
        assert!(matches!(
            TranscodeError::from_vk("vkCreateBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            TranscodeError::OutOfMemory(_)
        ));
        assert!(matches!(
            TranscodeError::from_vk("vkWaitForFences", vk::Result::ERROR_DEVICE_LOST),
            TranscodeError::DeviceLost
        ));
        let err = TranscodeError::from_vk("vkCmdDecodeVideoKHR", vk::Result::ERROR_UNKNOWN);
        assert!(matches!(
            err,
            TranscodeError::VideoApiFailed {
                op: "vkCmdDecodeVideoKHR",
                ..
            }
        ));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(TranscodeError::DeviceLost.kind(), "DeviceLost");
        assert_eq!(
            TranscodeError::BadInput("unsupported codec".into()).kind(),
            "BadInput"
        );
        assert!(TranscodeError::DeviceLost.device_unusable());
        assert!(!TranscodeError::BadInput("x".into()).device_unusable());
    }
}
