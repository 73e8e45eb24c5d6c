//! Diagnostics side paths: frame dumps and preview frame rate

use crate::buffer::FrameGeometry;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Any frame type enabled
const DUMP_ENABLE_MASK: u32 = 0xff;
const DEFAULT_DUMP_FRAMES: u32 = 10;
const MAX_DUMP_FRAMES: u32 = 256;

/// FPS is reported once per interval
const FPS_INTERVAL: Duration = Duration::from_millis(250);

/// Frame class selected by a dump mask bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFrame {
    Preview,
    Video,
    Main,
    Thumbnail,
}

impl DumpFrame {
    pub fn bit(self) -> u32 {
        match self {
            DumpFrame::Preview => 0x1,
            DumpFrame::Video => 0x2,
            DumpFrame::Main => 0x4,
            DumpFrame::Thumbnail => 0x8,
        }
    }

    fn suffix(self) -> char {
        match self {
            DumpFrame::Preview => 'p',
            DumpFrame::Video => 'v',
            DumpFrame::Main => 'm',
            DumpFrame::Thumbnail => 't',
        }
    }
}

/// Writes selected frames to disk as raw semi-planar YUV.
///
/// Mask layout: bits 0-7 select frame classes, bits 8-15 the skip interval,
/// bits 16-31 the number of frames to write.
#[derive(Debug)]
pub struct FrameDumper {
    mask: u32,
    dir: PathBuf,
    written: u32,
    seen: u32,
}

impl FrameDumper {
    pub fn new(mask: u32, dir: impl Into<PathBuf>) -> Self {
        Self {
            mask,
            dir: dir.into(),
            written: 0,
            seen: 0,
        }
    }

    pub fn is_enabled(&self, frame: DumpFrame) -> bool {
        self.mask & DUMP_ENABLE_MASK != 0 && self.mask & frame.bit() != 0
    }

    /// Frames to write before stopping (256 wraps around)
    fn frame_limit(&self) -> u32 {
        match (self.mask >> 16) & 0xffff {
            0 => DEFAULT_DUMP_FRAMES,
            n => n.min(MAX_DUMP_FRAMES),
        }
    }

    fn skip_interval(&self) -> u32 {
        match (self.mask >> 8) & 0xff {
            0 => 1,
            n => n,
        }
    }

    /// Offer one frame; returns the planes to write when it is selected
    pub fn offer(&mut self, frame: DumpFrame, geometry: &FrameGeometry, data: &[u8]) -> Option<DumpJob> {
        if self.mask & DUMP_ENABLE_MASK == 0 {
            self.written = 0;
            return None;
        }
        if self.mask & frame.bit() == 0 {
            return None;
        }

        let limit = self.frame_limit();
        let mut job = None;
        if self.seen % self.skip_interval() == 0 {
            if self.written < limit {
                job = self.copy_planes(frame, geometry, data);
                self.written += 1;
            } else if limit == MAX_DUMP_FRAMES {
                self.written = 0;
            }
        }
        self.seen = self.seen.wrapping_add(1);
        job
    }

    fn copy_planes(&self, frame: DumpFrame, geometry: &FrameGeometry, data: &[u8]) -> Option<DumpJob> {
        let luma = geometry.luma_len();
        let chroma = geometry.chroma_len();
        let (Some(y_plane), Some(c_plane)) = (
            data.get(geometry.y_offset..geometry.y_offset + luma),
            data.get(geometry.cbcr_offset..geometry.cbcr_offset + chroma),
        ) else {
            warn!("Frame too short to dump ({} bytes)", data.len());
            return None;
        };

        let path = self.dir.join(format!(
            "{}{}_{}x{}.yuv",
            self.written,
            frame.suffix(),
            geometry.size.width,
            geometry.size.height
        ));
        Some(DumpJob {
            frame,
            path,
            luma: y_plane.to_vec(),
            chroma: c_plane.to_vec(),
        })
    }
}

/// Frame planes copied out of a mapped buffer, written later off the lock
#[derive(Debug)]
pub struct DumpJob {
    frame: DumpFrame,
    path: PathBuf,
    luma: Vec<u8>,
    chroma: Vec<u8>,
}

impl DumpJob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the planes; returns the path on success
    pub fn write(self) -> Option<PathBuf> {
        match write_planes(&self.path, &self.luma, &self.chroma) {
            Ok(()) => {
                debug!("Dumped {:?} frame to {}", self.frame, self.path.display());
                Some(self.path)
            }
            Err(e) => {
                warn!("Failed to dump frame to {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

fn write_planes(path: &Path, luma: &[u8], chroma: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(luma)?;
    file.write_all(chroma)?;
    file.flush()
}

/// Preview frame rate meter
#[derive(Debug)]
pub struct FpsMeter {
    frames: u64,
    last_frames: u64,
    last_time: Option<Instant>,
    fps: f32,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            frames: 0,
            last_frames: 0,
            last_time: None,
            fps: 0.0,
        }
    }

    /// Count a frame at `now`; returns the new rate when an interval elapsed
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let Some(last) = self.last_time else {
            self.last_time = Some(now);
            self.last_frames = self.frames;
            return None;
        };

        let elapsed = now.saturating_duration_since(last);
        if elapsed <= FPS_INTERVAL {
            return None;
        }

        self.fps = (self.frames - self.last_frames) as f32 / elapsed.as_secs_f32();
        self.last_time = Some(now);
        self.last_frames = self.frames;
        info!("Preview frames in {:?}: {:.2} fps", elapsed, self.fps);
        Some(self.fps)
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}
