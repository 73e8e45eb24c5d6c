//! Camera parameters and driver-negotiated geometry

use crate::error::{HalError, HalResult};
use crate::state::StreamKind;
use serde::{Deserialize, Serialize};

/// Frame size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Preview sizes the HAL accepts, largest first
pub const SUPPORTED_PREVIEW_SIZES: [Size; 13] = [
    Size::new(1920, 1080),
    Size::new(1280, 720),
    Size::new(800, 480),
    Size::new(768, 432),
    Size::new(720, 480),
    Size::new(640, 480),
    Size::new(576, 432),
    Size::new(480, 320),
    Size::new(384, 288),
    Size::new(352, 288),
    Size::new(320, 240),
    Size::new(240, 160),
    Size::new(176, 144),
];

/// Picture sizes the HAL accepts, largest first
pub const SUPPORTED_PICTURE_SIZES: [Size; 15] = [
    Size::new(4000, 3000),
    Size::new(3200, 2400),
    Size::new(2592, 1944),
    Size::new(2048, 1536),
    Size::new(1920, 1080),
    Size::new(1600, 1200),
    Size::new(1280, 768),
    Size::new(1280, 720),
    Size::new(1024, 768),
    Size::new(800, 600),
    Size::new(800, 480),
    Size::new(640, 480),
    Size::new(352, 288),
    Size::new(320, 240),
    Size::new(176, 144),
];

/// Default stream size used before the caller configures anything
pub const DEFAULT_STREAM_SIZE: Size = Size::new(640, 480);

/// Semi-planar YUV layouts the pipeline produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Y plane followed by interleaved CrCb
    #[default]
    Nv21,
    /// Y plane followed by interleaved CbCr
    Nv12,
}

/// Requested support mode bits, as passed to `open`
pub mod support_mode {
    pub const MODE_2D: u32 = 0x01;
    pub const MODE_3D: u32 = 0x02;
    pub const MODE_NONZSL: u32 = 0x04;
    pub const MODE_ZSL: u32 = 0x08;
}

/// Driver operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraMode {
    #[default]
    TwoD,
    ThreeD,
    NonZsl,
    Zsl,
}

impl CameraMode {
    /// Map a requested support mode onto the driver mode (unknown → 2D)
    pub fn from_support_mode(mode: u32) -> Self {
        match mode {
            support_mode::MODE_2D => CameraMode::TwoD,
            support_mode::MODE_3D => CameraMode::ThreeD,
            support_mode::MODE_NONZSL => CameraMode::NonZsl,
            support_mode::MODE_ZSL => CameraMode::Zsl,
            _ => CameraMode::TwoD,
        }
    }
}

/// Focus mode requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FocusMode {
    #[default]
    Auto,
    Macro,
    Normal,
    Infinity,
    Fixed,
}

impl FocusMode {
    /// Whether an autofocus sweep can run in this mode
    pub fn supports_sweep(self) -> bool {
        matches!(self, FocusMode::Auto | FocusMode::Macro | FocusMode::Normal)
    }
}

/// Rectangle in sensor or display coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self { left, top, width, height }
    }

    /// Full-frame rectangle for a size
    pub fn full(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Crop geometry reported by the driver for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CropInfo {
    /// Display channels (preview, record)
    Stream(Rect),
    /// Snapshot channel: main image and thumbnail
    Snapshot { main: Rect, thumbnail: Rect },
}

/// Stream geometry negotiated with the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dimension {
    pub display: Size,
    pub video: Size,
    pub orig_video: Size,
    pub picture: Size,
    pub thumbnail: Size,
    pub preview_format: PixelFormat,
    pub enc_format: PixelFormat,
}

impl Dimension {
    /// Merge caller parameters into the driver's current dimension.
    ///
    /// Returns `true` when the preview geometry already matched, i.e. an
    /// existing preview stream can be reused as-is.
    pub fn apply_preview(&mut self, params: &CameraParameters) -> bool {
        let requested = params.preview_size;
        let mut matching = if requested.is_empty() {
            false
        } else {
            let same = requested == self.display;
            if !same {
                self.display = requested;
            }
            same
        };

        let format = params.preview_format.unwrap_or_default();
        if format != self.preview_format {
            matching = false;
            self.preview_format = format;
        }

        self.enc_format = PixelFormat::Nv12;
        self.video = params.video_size;
        self.orig_video = params.video_size;
        matching
    }

    /// Size of the frames produced on a channel
    pub fn stream_size(&self, kind: StreamKind) -> Size {
        match kind {
            StreamKind::Preview => self.display,
            StreamKind::Record => self.video,
            StreamKind::Snapshot => self.picture,
        }
    }

    /// Pixel layout produced on a channel
    pub fn stream_format(&self, kind: StreamKind) -> PixelFormat {
        match kind {
            StreamKind::Preview => self.preview_format,
            StreamKind::Record | StreamKind::Snapshot => self.enc_format,
        }
    }
}

/// Caller-visible camera parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraParameters {
    pub preview_size: Size,
    /// `None` selects the driver default (NV21)
    pub preview_format: Option<PixelFormat>,
    pub picture_size: Size,
    pub video_size: Size,
    pub thumbnail_size: Size,
    pub focus_mode: FocusMode,
    pub zoom: u32,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self {
            preview_size: DEFAULT_STREAM_SIZE,
            preview_format: None,
            picture_size: Size::new(2048, 1536),
            video_size: DEFAULT_STREAM_SIZE,
            thumbnail_size: Size::new(512, 384),
            focus_mode: FocusMode::Auto,
            zoom: 0,
        }
    }
}

impl CameraParameters {
    /// Reject sizes outside the supported tables
    pub fn validate(&self) -> HalResult<()> {
        if !SUPPORTED_PREVIEW_SIZES.contains(&self.preview_size) {
            return Err(HalError::Config(format!(
                "unsupported preview size {}x{}",
                self.preview_size.width, self.preview_size.height
            )));
        }
        if !SUPPORTED_PICTURE_SIZES.contains(&self.picture_size) {
            return Err(HalError::Config(format!(
                "unsupported picture size {}x{}",
                self.picture_size.width, self.picture_size.height
            )));
        }
        if self.video_size.is_empty() {
            return Err(HalError::Config("video size must be non-zero".to_string()));
        }
        Ok(())
    }
}
