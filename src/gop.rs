//! GOP (Group of Pictures) cadence for the HEVC encoder.
//!
//! The baseline configuration encodes every picture as an IDR; the low-delay
//! mode emits an IDR at each GOP boundary and trailing P pictures in between,
//! each predicting from the previous reconstruction.

/// Output picture cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopMode {
    /// Every picture is an IDR.
    IntraOnly,
    /// IDR at GOP boundaries, trailing P pictures otherwise.
    LowDelayP { gop_size: u32 },
}

/// Frame type in GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopFrameType {
    Idr,
    P,
}

impl GopFrameType {
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::Idr)
    }
}

/// Position in the GOP.
#[derive(Debug, Clone, Copy)]
pub struct GopPosition {
    /// Overall frame index in the sequence.
    pub frame_index: u64,
    pub frame_type: GopFrameType,
    /// POC (Picture Order Count), reset at each IDR.
    pub pic_order_cnt: i32,
}

/// GOP structure manager.
pub struct GopStructure {
    mode: GopMode,
    frame_index: u64,
    poc: i32,
    /// Max POC LSB value (2^(log2_max_pic_order_cnt_lsb_minus4 + 4)).
    max_poc_lsb: i32,
    force_idr: bool,
}

impl GopStructure {
    pub fn new(mode: GopMode, log2_max_pic_order_cnt_lsb_minus4: u8) -> Self {
        Self {
            mode,
            frame_index: 0,
            poc: 0,
            max_poc_lsb: 1 << (log2_max_pic_order_cnt_lsb_minus4 + 4),
            force_idr: false,
        }
    }

    /// Get the next frame position in the GOP.
    pub fn next_frame(&mut self) -> GopPosition {
        let is_idr = match self.mode {
            GopMode::IntraOnly => true,
            GopMode::LowDelayP { gop_size } => {
                self.frame_index % u64::from(gop_size.max(1)) == 0 || self.force_idr
            }
        };
        self.force_idr = false;

        if is_idr {
            self.poc = 0;
        }

        let position = GopPosition {
            frame_index: self.frame_index,
            frame_type: if is_idr {
                GopFrameType::Idr
            } else {
                GopFrameType::P
            },
            pic_order_cnt: self.poc,
        };

        self.poc = (self.poc + 1) % self.max_poc_lsb;
        self.frame_index += 1;

        position
    }

    /// Request that the next frame be an IDR frame.
    pub fn request_idr(&mut self) {
        self.force_idr = true;
    }

    pub fn total_frames(&self) -> u64 {
        self.frame_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intra_only_everything_is_idr() {
        let mut gop = GopStructure::new(GopMode::IntraOnly, 4);
        for i in 0..10 {
            let pos = gop.next_frame();
            assert_eq!(pos.frame_type, GopFrameType::Idr, "frame {i}");
            assert_eq!(pos.pic_order_cnt, 0);
            assert_eq!(pos.frame_index, i);
        }
    }

    #[test]
    fn test_low_delay_p_cadence() {
        let mut gop = GopStructure::new(GopMode::LowDelayP { gop_size: 30 }, 4);

        let pos = gop.next_frame();
        assert_eq!(pos.frame_type, GopFrameType::Idr);
        assert_eq!(pos.pic_order_cnt, 0);

        for i in 1..30 {
            let pos = gop.next_frame();
            assert_eq!(pos.frame_type, GopFrameType::P, "frame {i} should be P");
            assert_eq!(pos.pic_order_cnt, i);
        }

        // Frame 30 starts a new GOP.
        let pos = gop.next_frame();
        assert_eq!(pos.frame_type, GopFrameType::Idr);
        assert_eq!(pos.pic_order_cnt, 0);
    }

    #[test]
    fn test_forced_idr() {
        let mut gop = GopStructure::new(GopMode::LowDelayP { gop_size: 300 }, 4);
        gop.next_frame();
        gop.next_frame();
        gop.request_idr();
        let pos = gop.next_frame();
        assert_eq!(pos.frame_type, GopFrameType::Idr);
        assert_eq!(pos.pic_order_cnt, 0);
        // The force flag is one-shot.
        assert_eq!(gop.next_frame().frame_type, GopFrameType::P);
    }

    #[test]
    fn test_poc_wraps_at_lsb_range() {
        let mut gop = GopStructure::new(GopMode::LowDelayP { gop_size: u32::MAX }, 0); // max 16
        for _ in 0..16 {
            gop.next_frame();
        }
        let pos = gop.next_frame();
        assert_eq!(pos.pic_order_cnt, 0);
        assert_eq!(pos.frame_type, GopFrameType::P);
    }
}
