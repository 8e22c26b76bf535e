//! Video profile definitions shared by the sessions and every video resource.
//!
//! The driver lays out video memory per profile, so every buffer and image a
//! video queue touches must carry a profile list at creation. Resources read
//! by both queues (the shared decoded picture) carry both profiles.

use ash::vk;

/// NV12: two-plane YUV 4:2:0, 8-bit.
pub const NV12_FORMAT: vk::Format = vk::Format::G8_B8R8_2PLANE_420_UNORM;

/// Owned pair of video profiles: H.264 High decode and H.265 Main encode,
/// both progressive 4:2:0 8-bit.
///
/// The codec-specific profile structs live in boxes so the `p_next` chains
/// stay valid however the owning struct moves.
pub struct VideoProfiles {
    _decode_codec: Box<vk::VideoDecodeH264ProfileInfoKHR<'static>>,
    _encode_codec: Box<vk::VideoEncodeH265ProfileInfoKHR<'static>>,
    decode: vk::VideoProfileInfoKHR<'static>,
    encode: vk::VideoProfileInfoKHR<'static>,
}

impl VideoProfiles {
    pub fn h264_to_h265() -> Self {
        let mut decode_codec = Box::new(
            vk::VideoDecodeH264ProfileInfoKHR::default()
                .std_profile_idc(
                    ash::vk::native::StdVideoH264ProfileIdc_STD_VIDEO_H264_PROFILE_IDC_HIGH,
                )
                .picture_layout(vk::VideoDecodeH264PictureLayoutFlagsKHR::PROGRESSIVE),
        );
        let mut encode_codec = Box::new(vk::VideoEncodeH265ProfileInfoKHR::default()
            .std_profile_idc(
                ash::vk::native::StdVideoH265ProfileIdc_STD_VIDEO_H265_PROFILE_IDC_MAIN,
            ));

        let mut decode = vk::VideoProfileInfoKHR::default()
            .video_codec_operation(vk::VideoCodecOperationFlagsKHR::DECODE_H264)
            .chroma_subsampling(vk::VideoChromaSubsamplingFlagsKHR::TYPE_420)
            .luma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
            .chroma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8);
        decode.p_next =
            (decode_codec.as_mut() as *mut vk::VideoDecodeH264ProfileInfoKHR).cast();

        let mut encode = vk::VideoProfileInfoKHR::default()
            .video_codec_operation(vk::VideoCodecOperationFlagsKHR::ENCODE_H265)
            .chroma_subsampling(vk::VideoChromaSubsamplingFlagsKHR::TYPE_420)
            .luma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8)
            .chroma_bit_depth(vk::VideoComponentBitDepthFlagsKHR::TYPE_8);
        encode.p_next =
            (encode_codec.as_mut() as *mut vk::VideoEncodeH265ProfileInfoKHR).cast();

        Self {
            _decode_codec: decode_codec,
            _encode_codec: encode_codec,
            decode,
            encode,
        }
    }

    pub fn decode(&self) -> &vk::VideoProfileInfoKHR<'static> {
        &self.decode
    }

    pub fn encode(&self) -> &vk::VideoProfileInfoKHR<'static> {
        &self.encode
    }

    /// Profile list for decode-only resources.
    pub fn decode_list(&self) -> [vk::VideoProfileInfoKHR<'static>; 1] {
        [self.decode]
    }

    /// Profile list for encode-only resources.
    pub fn encode_list(&self) -> [vk::VideoProfileInfoKHR<'static>; 1] {
        [self.encode]
    }

    /// Profile list for the shared decoded picture, legal on both queues.
    pub fn shared_list(&self) -> [vk::VideoProfileInfoKHR<'static>; 2] {
        [self.decode, self.encode]
    }
}

impl Default for VideoProfiles {
    fn default() -> Self {
        Self::h264_to_h265()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_operations() {
        let profiles = VideoProfiles::h264_to_h265();
        assert_eq!(
            profiles.decode().video_codec_operation,
            vk::VideoCodecOperationFlagsKHR::DECODE_H264
        );
        assert_eq!(
            profiles.encode().video_codec_operation,
            vk::VideoCodecOperationFlagsKHR::ENCODE_H265
        );
    }

    #[test]
    fn test_codec_chains_present() {
        // Every profile must chain its codec-specific struct; the driver
        // rejects profiles without one.
        let profiles = VideoProfiles::h264_to_h265();
        assert!(!profiles.decode().p_next.is_null());
        assert!(!profiles.encode().p_next.is_null());
    }

    #[test]
    fn test_shared_list_carries_both() {
        let profiles = VideoProfiles::h264_to_h265();
        let shared = profiles.shared_list();
        assert_eq!(shared.len(), 2);
        assert_eq!(
            shared[0].video_codec_operation,
            vk::VideoCodecOperationFlagsKHR::DECODE_H264
        );
        assert_eq!(
            shared[1].video_codec_operation,
            vk::VideoCodecOperationFlagsKHR::ENCODE_H265
        );
    }

    #[test]
    fn test_chains_survive_moves() {
        let profiles = VideoProfiles::h264_to_h265();
        let before = profiles.decode().p_next;
        let moved = Box::new(profiles);
        assert_eq!(moved.decode().p_next, before);
    }
}
