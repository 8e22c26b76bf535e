//! vkshift: GPU H.264 → H.265 transcoding with Vulkan Video.
//!
//! The compressed H.264 bitstream of a single-video-track MP4 file is fed to
//! the GPU's hardware decode queue; the decoded NV12 pictures are forwarded
//! to the hardware encode queue without leaving device memory; the produced
//! HEVC bitstream is read back and muxed into an MP4 output.
//!
//! ```no_run
//! use vkshift::{Transcoder, TranscodeOptions, VideoContextBuilder};
//!
//! # fn main() -> vkshift::Result<()> {
//! let context = VideoContextBuilder::new().build()?;
//! let options = TranscodeOptions::default();
//! let mut transcoder = Transcoder::new(
//!     context,
//!     "input.mp4".as_ref(),
//!     "output.mp4".as_ref(),
//!     &options,
//! )?;
//! transcoder.run()?;
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod gop;
pub mod parser;
pub mod pipeline;
mod profiles;
mod resources;
mod ring;
pub mod vulkan;

pub use container::{HevcMuxer, Mp4Demuxer, VideoPacket};
pub use decoder::DecodeSession;
pub use encoder::{EncodeSession, EncoderConfig, HevcParameterSets};
pub use error::{QueueRole, Result, TranscodeError};
pub use gop::GopMode;
pub use pipeline::{TranscodeOptions, Transcoder};
pub use profiles::VideoProfiles;
pub use ring::{DEFAULT_RING_SIZE, MIN_RING_SIZE};
pub use vulkan::{AdapterPolicy, VideoContext, VideoContextBuilder, DEVICE_ENV_VAR};
