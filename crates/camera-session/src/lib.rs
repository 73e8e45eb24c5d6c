//! Scripted Camera Session
//!
//! Drives a [`CameraHardware`] bound to the simulated driver through a
//! preview, autofocus, zoom, recording and still-capture sequence, playing
//! the driver's side of each exchange, and reports what the caller saw.

use camera_hal::sim::{Callback, HeapMapper, RecordingSink, RecordingSurface, SimDriver};
use camera_hal::{
    support_mode, CameraHardware, CameraState, ChannelEvent, ControlEvent, ControlStatus, DriverEvent,
    FrameReady, HalError, HalSettings, HalStatus, MsgType, StreamKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How long a queued event may take to reach the coordinator
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE_POLL: Duration = Duration::from_millis(5);

/// Nanoseconds between simulated frames (30 fps)
const FRAME_INTERVAL_NS: u64 = 33_333_333;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("HAL error: {0}")]
    Hal(#[from] HalError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("No driver callback for {0:?}")]
    Unregistered(DriverEvent),

    #[error("Camera stuck in {actual:?} waiting for {expected:?}")]
    Stalled { expected: CameraState, actual: CameraState },
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Steps of a scripted session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPlan {
    pub preview_frames: usize,
    pub autofocus: bool,
    pub zoom: Option<u32>,
    pub record_frames: usize,
    pub picture: bool,
}

impl Default for SessionPlan {
    fn default() -> Self {
        Self {
            preview_frames: 30,
            autofocus: true,
            zoom: Some(4),
            record_frames: 15,
            picture: true,
        }
    }
}

/// What the caller observed during a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub preview_frames: usize,
    pub video_frames: usize,
    pub raw_images: usize,
    pub postview_frames: usize,
    /// `ext1` of every focus notification, in order
    pub focus_results: Vec<i32>,
    pub zoom_notifications: usize,
    pub displayed_buffers: usize,
    /// Coordinator status taken before release
    pub status: HalStatus,
}

/// Initialize logging; `RUST_LOG` overrides `default_level`
pub fn init_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| SessionError::Logging(e.to_string()))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| SessionError::Logging(e.to_string()))
}

/// The simulated side of a session: driver, display and caller
struct Rig {
    driver: SimDriver,
    surface: Arc<RecordingSurface>,
    sink: Arc<RecordingSink>,
    hal: CameraHardware,
    timestamp_ns: u64,
}

impl Rig {
    fn new(settings: HalSettings) -> Self {
        let driver = SimDriver::new();
        let hal = CameraHardware::new(Arc::new(driver.clone()), Arc::new(HeapMapper::new()), settings);
        let surface = Arc::new(RecordingSurface::new());
        let sink = Arc::new(RecordingSink::new());
        hal.set_surface(Some(surface.clone()));
        hal.set_callbacks(Some(sink.clone()));
        hal.enable_msg_type(MsgType::all());

        Self {
            driver,
            surface,
            sink,
            hal,
            timestamp_ns: 0,
        }
    }

    fn emit(&self, event: DriverEvent) -> Result<()> {
        if self.driver.emit(event) {
            Ok(())
        } else {
            Err(SessionError::Unregistered(event))
        }
    }

    fn frame(&mut self, channel: StreamKind, buffer_index: usize, thumbnail: bool) -> Result<()> {
        self.timestamp_ns += FRAME_INTERVAL_NS;
        self.emit(DriverEvent::Frame(FrameReady {
            channel,
            buffer_index,
            timestamp_ns: self.timestamp_ns,
            thumbnail,
        }))
    }

    /// Report a channel transition and wait for the coordinator to apply it
    fn confirm(&self, channel: StreamKind, event: ChannelEvent, expected: CameraState) -> Result<()> {
        self.emit(DriverEvent::channel(channel, event))?;
        self.settle(expected)
    }

    fn settle(&self, expected: CameraState) -> Result<()> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            let actual = self.hal.state();
            if actual == expected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Stalled { expected, actual });
            }
            thread::sleep(SETTLE_POLL);
        }
    }

    fn report(&self) -> SessionReport {
        let focus_results = self
            .sink
            .callbacks()
            .into_iter()
            .filter_map(|callback| match callback {
                Callback::Notify(msg, ext1, _) if msg == MsgType::FOCUS => Some(ext1),
                _ => None,
            })
            .collect();

        SessionReport {
            preview_frames: self.sink.count(MsgType::PREVIEW_FRAME),
            video_frames: self.sink.count(MsgType::VIDEO_FRAME),
            raw_images: self.sink.count(MsgType::RAW_IMAGE),
            postview_frames: self.sink.count(MsgType::POSTVIEW_FRAME),
            focus_results,
            zoom_notifications: self.sink.count(MsgType::ZOOM),
            displayed_buffers: self.surface.queued().len(),
            status: self.hal.status(),
        }
    }
}

/// Run one scripted session against the simulated driver
pub fn run_session(settings: HalSettings, plan: &SessionPlan) -> Result<SessionReport> {
    settings.validate()?;
    let preview_buffers = settings.preview_buffers;
    let record_buffers = settings.record_buffers;
    let snapshot_buffers = settings.snapshot_buffers;

    let mut rig = Rig::new(settings);
    rig.hal.open(support_mode::MODE_2D)?;

    info!("Starting preview");
    rig.hal.start_preview()?;
    rig.confirm(StreamKind::Preview, ChannelEvent::StreamingOn, CameraState::Preview)?;
    for n in 0..plan.preview_frames {
        rig.frame(StreamKind::Preview, n % preview_buffers, false)?;
    }

    if plan.autofocus {
        rig.hal.auto_focus()?;
        rig.emit(DriverEvent::control(ControlEvent::AutoFocusDone, ControlStatus::Success))?;
    }

    if let Some(level) = plan.zoom {
        rig.hal.set_zoom(level)?;
        rig.emit(DriverEvent::control(ControlEvent::ZoomDone, ControlStatus::Success))?;
    }

    if plan.record_frames > 0 {
        info!("Recording {} frames", plan.record_frames);
        rig.hal.start_recording()?;
        rig.confirm(StreamKind::Record, ChannelEvent::StreamingOn, CameraState::Record)?;
        for n in 0..plan.record_frames {
            rig.frame(StreamKind::Record, n % record_buffers, false)?;
        }
        for frame in rig.sink.frames(MsgType::VIDEO_FRAME) {
            rig.hal.release_recording_frame(frame.index)?;
        }
        rig.hal.stop_recording()?;
    }

    if plan.picture {
        info!("Taking picture");
        rig.hal.take_picture()?;
        rig.confirm(StreamKind::Snapshot, ChannelEvent::StreamingOn, CameraState::SnapshotAcked)?;
        rig.frame(StreamKind::Snapshot, 0, false)?;
        rig.frame(StreamKind::Snapshot, snapshot_buffers.saturating_sub(1), true)?;
        rig.confirm(StreamKind::Snapshot, ChannelEvent::StreamingOff, CameraState::Ready)?;
    }

    let report = rig.report();
    debug!("Session status {:?}", report.status);
    if report.status.state == CameraState::Error {
        warn!("Session ended in error state");
    }

    rig.hal.release();
    Ok(report)
}
