//! MP4 container I/O: H.264 demuxing and HEVC muxing via the `mp4` crate.

use crate::encoder::HevcParameterSets;
use crate::error::{Result, TranscodeError};
use crate::parser::annexb_to_length_prefixed;
use bytes::Bytes;
use mp4::{
    HevcConfig, MediaConfig, Mp4Config, Mp4Reader, Mp4Sample, Mp4Writer, TrackConfig, TrackType,
};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info};

/// One compressed video sample pulled from the input.
pub struct VideoPacket {
    /// Length-prefixed NAL units, as stored in the container.
    pub data: Vec<u8>,
    /// Presentation time in the track's timescale.
    pub pts: u64,
}

fn io_err(e: mp4::Error) -> TranscodeError {
    TranscodeError::Io(std::io::Error::other(e.to_string()))
}

/// Reads the single H.264 video track of an MP4/MOV file.
pub struct Mp4Demuxer {
    reader: Mp4Reader<BufReader<File>>,
    track_id: u32,
    sample_count: u32,
    /// MP4 sample ids are 1-based.
    next_sample: u32,
    width: u32,
    height: u32,
    sps: Vec<u8>,
    pps: Vec<u8>,
}

impl Mp4Demuxer {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let reader = Mp4Reader::read_header(BufReader::new(file), size)
            .map_err(|e| TranscodeError::BadInput(format!("unreadable MP4 container: {e}")))?;

        let mut video_track: Option<u32> = None;
        for (&track_id, track) in reader.tracks() {
            if track.track_type().ok() == Some(TrackType::Video) {
                if video_track.is_some() {
                    return Err(TranscodeError::BadInput(
                        "more than one video track".to_string(),
                    ));
                }
                video_track = Some(track_id);
            }
        }
        let track_id = video_track
            .ok_or_else(|| TranscodeError::BadInput("no video track".to_string()))?;

        let track = &reader.tracks()[&track_id];
        match track.media_type() {
            Ok(mp4::MediaType::H264) => {}
            Ok(other) => {
                return Err(TranscodeError::BadInput(format!(
                    "unsupported codec: {other}"
                )));
            }
            Err(e) => {
                return Err(TranscodeError::BadInput(format!(
                    "unsupported codec: {e}"
                )));
            }
        }

        // SPS and PPS must come from the avcC record; in-band-only parameter
        // sets are not supported.
        let sps = track
            .sequence_parameter_set()
            .map_err(|_| TranscodeError::BadInput("missing parameter sets".to_string()))?
            .to_vec();
        let pps = track
            .picture_parameter_set()
            .map_err(|_| TranscodeError::BadInput("missing parameter sets".to_string()))?
            .to_vec();
        if sps.is_empty() || pps.is_empty() {
            return Err(TranscodeError::BadInput(
                "missing parameter sets".to_string(),
            ));
        }

        let width = u32::from(track.width());
        let height = u32::from(track.height());
        let sample_count = track.sample_count();
        info!(
            track_id,
            width, height, sample_count, "Opened H.264 video track"
        );

        Ok(Self {
            reader,
            track_id,
            sample_count,
            next_sample: 1,
            width,
            height,
            sps,
            pps,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The avcC SPS and PPS NAL units (header byte included, unframed).
    pub fn parameter_sets(&self) -> (&[u8], &[u8]) {
        (&self.sps, &self.pps)
    }

    /// Pull the next sample of the video track; None at end of stream.
    pub fn next_video_packet(&mut self) -> Result<Option<VideoPacket>> {
        while self.next_sample <= self.sample_count {
            let sample_id = self.next_sample;
            self.next_sample += 1;
            match self.reader.read_sample(self.track_id, sample_id) {
                Ok(Some(sample)) => {
                    return Ok(Some(VideoPacket {
                        data: sample.bytes.to_vec(),
                        pts: sample.start_time,
                    }));
                }
                Ok(None) => continue,
                Err(e) => return Err(io_err(e)),
            }
        }
        Ok(None)
    }
}

/// Writes the HEVC output track. The trailer is only written by [`finish`],
/// so an aborted transcode leaves a recognizably incomplete file.
///
/// [`finish`]: HevcMuxer::finish
pub struct HevcMuxer {
    writer: Mp4Writer<BufWriter<File>>,
    track_id: u32,
    parameter_sets: HevcParameterSets,
    finished: bool,
}

impl HevcMuxer {
    pub fn create(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self> {
        let file = File::create(path)?;

        let config = Mp4Config {
            major_brand: str::parse("isom").unwrap(),
            minor_version: 512,
            compatible_brands: vec![
                str::parse("isom").unwrap(),
                str::parse("iso2").unwrap(),
                str::parse("mp41").unwrap(),
            ],
            timescale: 1000,
        };

        let mut writer =
            Mp4Writer::write_start(BufWriter::new(file), &config).map_err(io_err)?;

        // Track timescale equals the frame rate, so sample timestamps are
        // plain frame indices.
        writer
            .add_track(&TrackConfig {
                track_type: TrackType::Video,
                timescale: fps,
                language: "und".to_string(),
                media_conf: MediaConfig::HevcConfig(HevcConfig {
                    width: width as u16,
                    height: height as u16,
                    ..Default::default()
                }),
            })
            .map_err(io_err)?;

        info!(width, height, fps, "Created HEVC output track");
        Ok(Self {
            writer,
            track_id: 1,
            parameter_sets: HevcParameterSets::default(),
            finished: false,
        })
    }

    /// Install the codec-specific data for the track.
    ///
    /// The track writer does not yet accept hvcC parameter-set arrays, so the
    /// sets are retained here while the stream stays self-contained through
    /// the in-band copies prepended to every IDR access unit.
    pub fn set_codec_parameters(&mut self, sets: &HevcParameterSets) {
        debug!(
            vps = sets.vps.len(),
            sps = sets.sps.len(),
            pps = sets.pps.len(),
            "Muxer received HEVC parameter sets"
        );
        self.parameter_sets = sets.clone();
    }

    /// Append one access unit. `data` is Annex-B; the sample is stored with
    /// length-prefixed NAL units per the container convention.
    pub fn write_packet(&mut self, data: &[u8], pts: u64, keyframe: bool) -> Result<()> {
        let sample = Mp4Sample {
            start_time: pts,
            duration: 1,
            rendering_offset: 0,
            is_sync: keyframe,
            bytes: Bytes::from(annexb_to_length_prefixed(data)),
        };
        self.writer
            .write_sample(self.track_id, &sample)
            .map_err(io_err)
    }

    /// Finalize the container (writes the trailer). Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.writer.write_end().map_err(io_err)?;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("vkshift-test-{}-{name}", std::process::id()));
        path
    }

    /// A fake HEVC access unit: one IDR_W_RADL NAL behind a start code.
    fn fake_idr() -> Vec<u8> {
        vec![0x00, 0x00, 0x01, 0x26, 0x01, 0xAA, 0xBB, 0xCC]
    }

    #[test]
    fn test_mux_then_read_back() {
        let path = temp_path("mux-roundtrip.mp4");
        let mut muxer = HevcMuxer::create(&path, 320, 240, 30).unwrap();
        muxer.set_codec_parameters(&HevcParameterSets {
            vps: vec![0x40, 0x01],
            sps: vec![0x42, 0x01],
            pps: vec![0x44, 0x01],
        });
        muxer.write_packet(&fake_idr(), 0, true).unwrap();
        muxer.write_packet(&fake_idr(), 1, true).unwrap();
        muxer.finish().unwrap();

        let file = File::open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        let reader = Mp4Reader::read_header(BufReader::new(file), size).unwrap();
        let video: Vec<_> = reader
            .tracks()
            .values()
            .filter(|t| t.track_type().ok() == Some(TrackType::Video))
            .collect();
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].width(), 320);
        assert_eq!(video[0].height(), 240);
        assert_eq!(video[0].sample_count(), 2);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unfinished_mux_has_no_trailer() {
        let path = temp_path("mux-incomplete.mp4");
        {
            let mut muxer = HevcMuxer::create(&path, 320, 240, 30).unwrap();
            muxer.write_packet(&fake_idr(), 0, true).unwrap();
            // Dropped without finish(): no trailer.
        }
        let file = File::open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        // Without the moov trailer the file must not parse as a usable MP4
        // with a complete video track.
        let readable = Mp4Reader::read_header(BufReader::new(file), size)
            .map(|r| r.tracks().len())
            .unwrap_or(0);
        assert_eq!(readable, 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_input_is_classified() {
        let err = Mp4Demuxer::open(Path::new("/nonexistent/vkshift-input.mp4")).unwrap_err();
        assert_eq!(err.kind(), "IoError");
    }

    #[test]
    fn test_non_mp4_input_is_bad_input() {
        let path = temp_path("not-an-mp4.mp4");
        std::fs::write(&path, b"certainly not an mp4 file").unwrap();
        let err = Mp4Demuxer::open(&path).unwrap_err();
        assert_eq!(err.kind(), "BadInput");
        std::fs::remove_file(&path).ok();
    }
}
