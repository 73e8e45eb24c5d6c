//! Camera hardware command facade
//!
//! Every command takes the coordination lock for its whole duration, reads
//! the current state, and either performs the transition or returns early.
//! Redundant teardown (stop while stopped, cancel while idle) succeeds
//! without side effects.
//!
//! Lock order: coordination lock, then the display, focus or callback
//! locks. Driver `perform_action` calls are never made under the
//! coordination lock, so a driver may signal their completion from inside
//! the call.

use crate::buffer::MemoryMapper;
use crate::dispatch::{self, EventPump};
use crate::driver::{Action, CameraDriver, EventCallback, EventKind, ParamKey, ParamValue};
use crate::error::{HalError, HalResult};
use crate::machine::{FocusSession, Machine};
use crate::notify::{CallbackSink, Callbacks, MsgType, Notification};
use crate::params::{CameraMode, CameraParameters, Dimension, PixelFormat};
use crate::pending::PendingOp;
use crate::settings::HalSettings;
use crate::state::{CameraState, StreamKind};
use crate::stream::StreamPhase;
use crate::surface::{DisplaySurface, SurfaceSlot};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State shared between the facade and driver callbacks
pub(crate) struct Shared {
    pub(crate) driver: Arc<dyn CameraDriver>,
    /// Primary coordination lock
    pub(crate) core: Mutex<Machine>,
    pub(crate) surface: SurfaceSlot,
    pub(crate) focus: Mutex<FocusSession>,
    pub(crate) prepare: PendingOp,
    pub(crate) callbacks: Callbacks,
    pub(crate) settings: HalSettings,
}

/// Live stream summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub kind: StreamKind,
    pub mode: CameraMode,
    pub phase: StreamPhase,
    pub width: u32,
    pub height: u32,
    pub buffers: usize,
    pub loaned: usize,
}

/// Serializable snapshot of the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HalStatus {
    pub state: CameraState,
    pub mode: CameraMode,
    pub streams: Vec<StreamStatus>,
    pub focus: FocusSession,
    pub postview: bool,
    pub surface_attached: bool,
    pub enabled_messages: u32,
    pub preview_fps: Option<f32>,
}

/// Camera HAL instance bound to one driver
pub struct CameraHardware {
    shared: Arc<Shared>,
    pump: Option<EventPump>,
}

impl CameraHardware {
    /// Bind a driver; the device stays closed until [`open`](Self::open)
    pub fn new(driver: Arc<dyn CameraDriver>, mapper: Arc<dyn MemoryMapper>, settings: HalSettings) -> Self {
        let shared = Arc::new(Shared {
            driver,
            core: Mutex::new(Machine::new(mapper, &settings)),
            surface: SurfaceSlot::default(),
            focus: Mutex::new(FocusSession::default()),
            prepare: PendingOp::default(),
            callbacks: Callbacks::default(),
            settings,
        });

        let pump = if shared.settings.queued_dispatch {
            EventPump::start(Arc::downgrade(&shared))
        } else {
            None
        };

        Self { shared, pump }
    }

    /// Open the device and register event callbacks.
    ///
    /// `support_mode` is one of the [`support_mode`](crate::params::support_mode)
    /// bits; unknown values open in 2D mode. Failure moves to the terminal
    /// Error state.
    pub fn open(&self, support_mode: u32) -> HalResult<()> {
        let driver = self.shared.driver.as_ref();
        let mut core = self.shared.core.lock();
        match core.state() {
            CameraState::Uninitialized => {}
            CameraState::Error => return Err(HalError::InvalidDevice),
            state => {
                debug!("Camera already open in state {:?}", state);
                return Ok(());
            }
        }

        let mode = CameraMode::from_support_mode(support_mode);
        info!("Opening camera in {:?} mode", mode);
        if let Err(e) = driver.open(mode) {
            error!("Camera open failed: {}", e);
            core.set_state(CameraState::Error);
            return Err(e.into());
        }
        core.opened = true;
        core.mode = mode;

        for kind in EventKind::ALL {
            if !driver.is_event_supported(kind) {
                debug!("Driver does not deliver {:?} events", kind);
                continue;
            }
            if let Err(e) = driver.register_event_callback(kind, self.event_callback()) {
                error!("Registering {:?} callback failed: {}", kind, e);
                driver.close();
                core.opened = false;
                core.set_state(CameraState::Error);
                return Err(e.into());
            }
        }

        core.dimension = match driver.get_param(ParamKey::Dimension) {
            Ok(ParamValue::Dimension(dimension)) => dimension,
            other => {
                warn!("No dimension from driver ({:?}), using parameters", other);
                dimension_from(&core.params)
            }
        };

        let fps = self.shared.settings.preview_fps;
        if fps > 0 {
            if let Err(e) = driver.set_param(ParamValue::Fps(fps)) {
                warn!("Driver rejected preview rate {}: {}", fps, e);
            }
        }

        core.set_state(CameraState::Ready);
        Ok(())
    }

    fn event_callback(&self) -> EventCallback {
        match &self.pump {
            Some(pump) => pump.callback(),
            None => dispatch::direct_callback(Arc::downgrade(&self.shared)),
        }
    }

    /// Start preview; a no-op when preview is already active
    pub fn start_preview(&self) -> HalResult<()> {
        info!("start_preview");
        let mut core = self.shared.core.lock();
        core.ensure_operational()?;
        if core.state().is_preview_active() {
            debug!("Preview already started in state {:?}", core.state());
            return Ok(());
        }
        if core.state().is_snapshot_active() {
            self.cancel_picture_locked(&mut core);
        }
        self.start_preview_locked(&mut core)
    }

    fn start_preview_locked(&self, core: &mut Machine) -> HalResult<()> {
        let driver = self.shared.driver.as_ref();
        let mut dimension = match driver.get_param(ParamKey::Dimension) {
            Ok(ParamValue::Dimension(dimension)) => dimension,
            Ok(other) => return Err(HalError::Config(format!("unexpected dimension reply {:?}", other))),
            Err(e) => return Err(HalError::Config(format!("can't get preview dimension: {}", e))),
        };

        let unchanged = dimension.apply_preview(&core.params);
        driver
            .set_param(ParamValue::Dimension(dimension))
            .map_err(|e| HalError::Config(format!("can't configure preview: {}", e)))?;
        core.dimension = dimension;

        if unchanged && core.has_stream(StreamKind::Preview) {
            debug!("Reusing preview stream");
        } else {
            core.create_stream(driver, StreamKind::Preview, self.shared.settings.preview_buffers)?;
        }
        core.launch_stream(StreamKind::Preview)?;

        let registered = self.shared.surface.register(&core.store.handles(StreamKind::Preview));
        if registered || !self.shared.surface.is_attached() {
            core.store.clear_postview();
        } else {
            debug!("Surface kept its heap, holding postview copy");
        }
        core.set_state(CameraState::PreviewStartPending);
        Ok(())
    }

    /// Stop preview (and recording with it); a no-op when not active
    pub fn stop_preview(&self) -> HalResult<()> {
        info!("stop_preview");
        let mut core = self.shared.core.lock();
        core.ensure_operational()?;
        if !core.state().is_preview_active() {
            debug!("Preview already stopped");
            return Ok(());
        }
        self.stop_preview_locked(&mut core);
        Ok(())
    }

    fn stop_preview_locked(&self, core: &mut Machine) {
        if core.state().is_record_active() {
            self.stop_recording_locked(core);
        }
        if !core.destroy_stream(StreamKind::Preview) {
            debug!("No preview stream to release");
        }
        core.set_state(CameraState::PreviewStopPending);
        core.set_state(CameraState::Ready);
    }

    /// Start recording.
    ///
    /// Does not require a running preview.
    pub fn start_recording(&self) -> HalResult<()> {
        info!("start_recording");
        let mut core = self.shared.core.lock();
        core.ensure_operational()?;
        if core.state().is_record_active() {
            debug!("Recording already running");
            return Ok(());
        }
        if core.state().is_snapshot_active() {
            self.cancel_picture_locked(&mut core);
        }

        let driver = self.shared.driver.as_ref();
        core.create_stream(driver, StreamKind::Record, self.shared.settings.record_buffers)?;
        core.launch_stream(StreamKind::Record)?;
        core.set_state(CameraState::RecordStartPending);
        Ok(())
    }

    /// Stop recording and fall back to Preview; a no-op when not recording
    pub fn stop_recording(&self) -> HalResult<()> {
        info!("stop_recording");
        let mut core = self.shared.core.lock();
        core.ensure_operational()?;
        if !core.state().is_record_active() {
            debug!("Recording already stopped");
            return Ok(());
        }
        self.stop_recording_locked(&mut core);
        Ok(())
    }

    fn stop_recording_locked(&self, core: &mut Machine) {
        if !core.destroy_stream(StreamKind::Record) {
            debug!("No record stream to release");
        }
        core.set_state(CameraState::Preview);
    }

    /// Return a video frame delivered through `VIDEO_FRAME`
    pub fn release_recording_frame(&self, index: usize) -> HalResult<()> {
        let mut core = self.shared.core.lock();
        match core.stream_mut(StreamKind::Record) {
            Some(handle) => handle.release_frame(index),
            None => {
                debug!("Record stream not initialized, ignoring frame {}", index);
                Ok(())
            }
        }
    }

    /// Capture a still picture.
    ///
    /// Blocks until the driver completes "prepare snapshot" (bounded by
    /// `prepare_snapshot_timeout_ms`), then swaps preview for the snapshot
    /// stream. The last displayed preview frame is copied and shown on the
    /// surface before preview is torn down. A second call while the first
    /// is still waiting fails with `InvalidState`.
    pub fn take_picture(&self) -> HalResult<()> {
        info!("take_picture");
        self.shared.core.lock().ensure_operational()?;
        self.prepare_snapshot_and_wait()?;

        let mut core = self.shared.core.lock();
        core.ensure_operational()?;
        self.take_picture_locked(&mut core)
    }

    fn prepare_snapshot_and_wait(&self) -> HalResult<()> {
        let driver = self.shared.driver.as_ref();
        if !driver.is_event_supported(EventKind::Control) {
            debug!("No control events, skipping prepare snapshot");
            return Ok(());
        }

        let prepare = &self.shared.prepare;
        if !prepare.try_arm() {
            warn!("Prepare snapshot already pending, rejecting take_picture");
            return Err(HalError::InvalidState("picture already in progress".to_string()));
        }
        if let Err(e) = driver.perform_action(true, Action::PrepareSnapshot) {
            prepare.disarm();
            return Err(e.into());
        }

        let timeout = self.shared.settings.prepare_timeout();
        if prepare.wait(timeout) {
            debug!("Prepare snapshot done");
            Ok(())
        } else {
            error!("Prepare snapshot timed out after {:?}", timeout);
            Err(HalError::PrepareTimeout(self.shared.settings.prepare_snapshot_timeout_ms))
        }
    }

    fn take_picture_locked(&self, core: &mut Machine) -> HalResult<()> {
        let driver = self.shared.driver.as_ref();

        if core.state().is_snapshot_active() {
            self.cancel_picture_locked(core);
        } else {
            core.destroy_stream(StreamKind::Snapshot);
        }
        core.dimension.picture = core.params.picture_size;
        core.dimension.thumbnail = core.params.thumbnail_size;
        driver
            .set_param(ParamValue::Dimension(core.dimension))
            .map_err(|e| HalError::Config(format!("can't configure snapshot: {}", e)))?;
        core.create_stream(driver, StreamKind::Snapshot, self.shared.settings.snapshot_buffers)?;

        self.store_preview_for_postview(core);

        if core.state().is_record_active() {
            self.stop_recording_locked(core);
        }
        if core.destroy_stream(StreamKind::Preview) {
            debug!("Preview stopped for snapshot");
        }

        if let Err(e) = core.launch_stream(StreamKind::Snapshot) {
            core.set_state(CameraState::Ready);
            return Err(e);
        }
        core.set_state(CameraState::SnapshotStartPending);
        Ok(())
    }

    /// Keep the last displayed preview frame on screen across the handover
    fn store_preview_for_postview(&self, core: &mut Machine) {
        let Some(index) = core
            .stream(StreamKind::Preview)
            .and_then(|handle| handle.last_queued_frame())
        else {
            debug!("No displayed preview frame to keep");
            return;
        };

        match core.store.capture_postview(index) {
            Ok(handle) => {
                if !self.shared.surface.show(handle) {
                    debug!("Postview copy not displayed");
                }
            }
            Err(e) => warn!("Storing preview frame for postview failed: {}", e),
        }
    }

    /// Abort an in-flight picture; a no-op when none is active
    pub fn cancel_picture(&self) -> HalResult<()> {
        info!("cancel_picture");
        let mut core = self.shared.core.lock();
        core.ensure_operational()?;
        if !core.state().is_snapshot_active() {
            debug!("No picture in progress");
            return Ok(());
        }
        self.cancel_picture_locked(&mut core);
        Ok(())
    }

    fn cancel_picture_locked(&self, core: &mut Machine) {
        core.destroy_stream(StreamKind::Snapshot);
        core.set_state(CameraState::SnapshotStopPending);
        core.set_state(CameraState::Ready);
    }

    /// Start an autofocus sweep; the result arrives as a `FOCUS` notification
    pub fn auto_focus(&self) -> HalResult<()> {
        info!("auto_focus");
        let mode = {
            let core = self.shared.core.lock();
            core.ensure_operational()?;
            core.params.focus_mode
        };

        {
            let mut focus = self.shared.focus.lock();
            if focus.auto_focus_running {
                return Err(HalError::InvalidState("autofocus already running".to_string()));
            }
            if !mode.supports_sweep() {
                drop(focus);
                warn!("Focus mode {:?} cannot autofocus", mode);
                self.shared.callbacks.deliver(vec![Notification::Notify {
                    msg: MsgType::FOCUS,
                    ext1: 0,
                    ext2: 0,
                }]);
                return Err(HalError::Config(format!("focus mode {:?} has no autofocus", mode)));
            }
            focus.auto_focus_running = true;
        }

        if let Err(e) = self.shared.driver.perform_action(true, Action::Focus(mode)) {
            error!("Autofocus command failed: {}", e);
            self.shared.focus.lock().auto_focus_running = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Cancel autofocus without waiting for the hardware
    pub fn cancel_auto_focus(&self) -> HalResult<()> {
        info!("cancel_auto_focus");
        let mode = {
            let core = self.shared.core.lock();
            core.ensure_operational()?;
            core.params.focus_mode
        };

        {
            let mut focus = self.shared.focus.lock();
            if !focus.auto_focus_running {
                debug!("Autofocus not running");
                return Ok(());
            }
            focus.auto_focus_running = false;
        }

        if let Err(e) = self.shared.driver.perform_action(false, Action::Focus(mode)) {
            warn!("Autofocus cancel failed: {}", e);
        }
        Ok(())
    }

    /// Request a zoom level; the crop follows on the zoom-done event
    pub fn set_zoom(&self, level: u32) -> HalResult<()> {
        info!("set_zoom {}", level);
        let driver = self.shared.driver.as_ref();
        let mut core = self.shared.core.lock();
        core.ensure_operational()?;

        let max = match driver.get_param(ParamKey::MaxZoom)? {
            ParamValue::MaxZoom(max) => max,
            other => return Err(HalError::Config(format!("unexpected max zoom reply {:?}", other))),
        };
        if level > max {
            return Err(HalError::Config(format!("zoom {} above maximum {}", level, max)));
        }

        driver.set_param(ParamValue::Zoom(level))?;
        self.shared.focus.lock().target_zoom = level;
        core.params.zoom = level;
        Ok(())
    }

    /// Attach or detach the display surface
    pub fn set_surface(&self, surface: Option<Arc<dyn DisplaySurface>>) {
        let attached = surface.is_some();
        self.shared.surface.set(surface);
        info!("Display surface {}", if attached { "attached" } else { "detached" });

        if attached {
            let core = self.shared.core.lock();
            if core.state().is_preview_active() {
                self.shared.surface.register(&core.store.handles(StreamKind::Preview));
            }
        }
    }

    /// Install the caller's callback sink (or remove it with `None`)
    pub fn set_callbacks(&self, sink: Option<Arc<dyn CallbackSink>>) {
        self.shared.callbacks.set_sink(sink);
    }

    pub fn enable_msg_type(&self, msg: MsgType) {
        self.shared.callbacks.enable(msg);
    }

    pub fn disable_msg_type(&self, msg: MsgType) {
        self.shared.callbacks.disable(msg);
    }

    pub fn msg_type_enabled(&self, msg: MsgType) -> bool {
        self.shared.callbacks.mask().intersects(msg)
    }

    pub fn parameters(&self) -> CameraParameters {
        self.shared.core.lock().params.clone()
    }

    /// Validate and store parameters; they apply on the next stream setup
    pub fn set_parameters(&self, params: CameraParameters) -> HalResult<()> {
        params.validate()?;
        let mut core = self.shared.core.lock();
        debug!("Parameters updated: {:?}", params);
        core.params = params;
        Ok(())
    }

    pub fn state(&self) -> CameraState {
        self.shared.core.lock().state()
    }

    pub fn preview_enabled(&self) -> bool {
        self.shared.core.lock().state().is_preview_active()
    }

    pub fn recording_enabled(&self) -> bool {
        self.shared.core.lock().state().is_record_active()
    }

    /// Stop everything and free every stream; the device stays open
    pub fn release(&self) {
        info!("release");
        let mut core = self.shared.core.lock();
        if core.state().is_record_active() {
            self.stop_recording_locked(&mut core);
        }
        if core.state().is_preview_active() {
            self.stop_preview_locked(&mut core);
        }
        if core.state().is_snapshot_active() {
            self.cancel_picture_locked(&mut core);
        }
        core.destroy_all();
    }

    pub fn status(&self) -> HalStatus {
        let core = self.shared.core.lock();
        let streams = core
            .live_streams()
            .map(|handle| StreamStatus {
                kind: handle.kind(),
                mode: handle.mode(),
                phase: handle.phase(),
                width: handle.geometry().size.width,
                height: handle.geometry().size.height,
                buffers: handle.buffer_count(),
                loaned: handle.loaned_frames(),
            })
            .collect();

        HalStatus {
            state: core.state(),
            mode: core.mode,
            streams,
            focus: *self.shared.focus.lock(),
            postview: core.store.postview().is_some(),
            surface_attached: self.shared.surface.is_attached(),
            enabled_messages: self.shared.callbacks.mask().bits(),
            preview_fps: core.fps.as_ref().map(|meter| meter.fps()),
        }
    }
}

impl Drop for CameraHardware {
    fn drop(&mut self) {
        {
            let mut core = self.shared.core.lock();
            core.destroy_all();
            if core.opened {
                info!("Closing camera");
                self.shared.driver.close();
                core.opened = false;
            }
        }
        if let Some(pump) = self.pump.take() {
            pump.shutdown();
        }
    }
}

fn dimension_from(params: &CameraParameters) -> Dimension {
    Dimension {
        display: params.preview_size,
        video: params.video_size,
        orig_video: params.video_size,
        picture: params.picture_size,
        thumbnail: params.thumbnail_size,
        preview_format: params.preview_format.unwrap_or_default(),
        enc_format: PixelFormat::Nv12,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::event::{ControlEvent, ControlStatus, DriverEvent, FrameReady};
    use crate::params::{support_mode, CropInfo, FocusMode, Rect, Size};
    use crate::sim::{Callback, HeapMapper, RecordingSink, RecordingSurface, SimDriver, StreamOp, SurfaceCall};
    use crate::state::ChannelEvent;
    use proptest::prelude::*;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Rig {
        driver: SimDriver,
        mapper: Arc<HeapMapper>,
        surface: Arc<RecordingSurface>,
        sink: Arc<RecordingSink>,
        hal: CameraHardware,
    }

    impl Rig {
        fn emit(&self, event: DriverEvent) {
            assert!(self.driver.emit(event));
        }

        fn channel(&self, kind: StreamKind, event: ChannelEvent) {
            self.emit(DriverEvent::channel(kind, event));
        }

        fn frame(&self, kind: StreamKind, index: usize) {
            self.emit(DriverEvent::frame(kind, index, 1_000 * index as u64));
        }

        fn descriptor(&self, kind: StreamKind, index: usize) -> i32 {
            self.driver.registered_buffers(kind)[index].descriptor
        }
    }

    fn rig_with(settings: HalSettings) -> Rig {
        let driver = SimDriver::new();
        let mapper = Arc::new(HeapMapper::new());
        let hal = CameraHardware::new(Arc::new(driver.clone()), mapper.clone(), settings);
        let surface = Arc::new(RecordingSurface::new());
        let sink = Arc::new(RecordingSink::new());
        hal.set_surface(Some(surface.clone()));
        hal.set_callbacks(Some(sink.clone()));
        hal.enable_msg_type(MsgType::all());
        Rig {
            driver,
            mapper,
            surface,
            sink,
            hal,
        }
    }

    fn opened() -> Rig {
        let rig = rig_with(HalSettings::default());
        rig.hal.open(support_mode::MODE_2D).unwrap();
        rig
    }

    fn previewing() -> Rig {
        let rig = opened();
        rig.hal.start_preview().unwrap();
        rig.channel(StreamKind::Preview, ChannelEvent::StreamingOn);
        assert_eq!(rig.hal.state(), CameraState::Preview);
        rig
    }

    fn wait_for(hal: &CameraHardware, state: CameraState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if hal.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_open_registers_callbacks() {
        let rig = opened();
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert_eq!(rig.driver.open_mode(), Some(CameraMode::TwoD));
        for kind in EventKind::ALL {
            assert!(rig.driver.has_callback(kind));
        }

        // second open is a no-op
        rig.hal.open(support_mode::MODE_ZSL).unwrap();
        assert_eq!(rig.driver.open_mode(), Some(CameraMode::TwoD));
    }

    #[test]
    fn test_open_maps_support_mode() {
        let rig = rig_with(HalSettings::default());
        rig.hal.open(support_mode::MODE_ZSL).unwrap();
        assert_eq!(rig.driver.open_mode(), Some(CameraMode::Zsl));
        assert_eq!(rig.hal.status().mode, CameraMode::Zsl);

        rig.hal.start_preview().unwrap();
        assert_eq!(rig.hal.status().streams[0].mode, CameraMode::Zsl);
    }

    #[test]
    fn test_unsupported_event_kinds_are_skipped() {
        let rig = rig_with(HalSettings::default());
        rig.driver.set_event_supported(EventKind::Stats, false);
        rig.hal.open(support_mode::MODE_2D).unwrap();
        assert!(!rig.driver.has_callback(EventKind::Stats));
        assert!(rig.driver.has_callback(EventKind::Channel));
    }

    #[test]
    fn test_open_failure_is_terminal() {
        let rig = rig_with(HalSettings::default());
        rig.driver.fail_open();
        assert!(matches!(
            rig.hal.open(support_mode::MODE_2D),
            Err(HalError::Device(DriverError::Failed(_)))
        ));
        assert_eq!(rig.hal.state(), CameraState::Error);
        assert!(matches!(rig.hal.start_preview(), Err(HalError::InvalidDevice)));
        assert!(matches!(rig.hal.open(support_mode::MODE_2D), Err(HalError::InvalidDevice)));
    }

    #[test]
    fn test_registration_failure_closes_driver() {
        let rig = rig_with(HalSettings::default());
        rig.driver.fail_register(EventKind::Control);
        assert!(rig.hal.open(support_mode::MODE_2D).is_err());
        assert_eq!(rig.hal.state(), CameraState::Error);
        assert!(!rig.driver.is_open());
        assert_eq!(rig.driver.close_count(), 1);

        drop(rig.hal);
        assert_eq!(rig.driver.close_count(), 1);
    }

    #[test]
    fn test_commands_before_open_fail_fast() {
        let rig = rig_with(HalSettings::default());
        assert!(matches!(rig.hal.start_preview(), Err(HalError::InvalidDevice)));
        assert!(matches!(rig.hal.take_picture(), Err(HalError::InvalidDevice)));
        assert!(matches!(rig.hal.auto_focus(), Err(HalError::InvalidDevice)));
        assert_eq!(rig.hal.state(), CameraState::Uninitialized);
    }

    #[test]
    fn test_stop_preview_when_inactive_is_noop() {
        let rig = opened();
        rig.hal.stop_preview().unwrap();
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert!(rig.driver.stream_ops(StreamKind::Preview).is_empty());
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 0);
    }

    #[test]
    fn test_start_preview_registers_heap_and_waits_for_streaming() {
        let rig = opened();
        rig.hal.start_preview().unwrap();
        assert_eq!(rig.hal.state(), CameraState::PreviewStartPending);
        assert!(rig.hal.preview_enabled());

        let descriptors: Vec<i32> = rig
            .driver
            .registered_buffers(StreamKind::Preview)
            .iter()
            .map(|buffer| buffer.descriptor)
            .collect();
        assert_eq!(descriptors.len(), 4);
        assert_eq!(rig.surface.calls(), vec![SurfaceCall::Register(descriptors)]);

        rig.channel(StreamKind::Preview, ChannelEvent::StreamingOn);
        assert_eq!(rig.hal.state(), CameraState::Preview);
    }

    #[test]
    fn test_second_start_preview_does_not_recreate() {
        let rig = opened();
        rig.hal.start_preview().unwrap();
        rig.hal.start_preview().unwrap();

        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 1);
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Preview),
            vec![StreamOp::Init(4), StreamOp::Start]
        );
    }

    #[test]
    fn test_preview_reused_after_streaming_off() {
        let rig = previewing();
        rig.channel(StreamKind::Preview, ChannelEvent::StreamingOff);
        assert_eq!(rig.hal.state(), CameraState::Ready);

        rig.hal.start_preview().unwrap();
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 1);
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Preview),
            vec![StreamOp::Init(4), StreamOp::Start, StreamOp::Stop, StreamOp::Start]
        );
    }

    #[test]
    fn test_preview_recreated_when_size_changes() {
        let rig = previewing();
        rig.channel(StreamKind::Preview, ChannelEvent::StreamingOff);
        rig.hal
            .set_parameters(CameraParameters {
                preview_size: Size::new(320, 240),
                ..Default::default()
            })
            .unwrap();

        rig.hal.start_preview().unwrap();
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 1);
        assert_eq!(rig.driver.dimension().display, Size::new(320, 240));
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Preview),
            vec![
                StreamOp::Init(4),
                StreamOp::Start,
                StreamOp::Stop,
                StreamOp::Release,
                StreamOp::Init(4),
                StreamOp::Start
            ]
        );
        let status = rig.hal.status();
        assert_eq!((status.streams[0].width, status.streams[0].height), (320, 240));
    }

    #[test]
    fn test_preview_init_failure_leaves_no_handle() {
        let rig = opened();
        rig.driver.fail_init(StreamKind::Preview);
        assert!(matches!(rig.hal.start_preview(), Err(HalError::Config(_))));
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 0);
        assert_eq!(rig.mapper.live_mappings(), 0);
    }

    #[test]
    fn test_dimension_failure_is_config_error() {
        let rig = opened();
        rig.driver.fail_dimension();
        assert!(matches!(rig.hal.start_preview(), Err(HalError::Config(_))));
        assert_eq!(rig.hal.state(), CameraState::Ready);
    }

    #[test]
    fn test_stop_preview_releases_buffers() {
        let rig = previewing();
        rig.hal.stop_preview().unwrap();
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 0);
        assert_eq!(rig.mapper.live_mappings(), 0);
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Preview).last(),
            Some(&StreamOp::Release)
        );

        // late confirmation from the driver is ignored
        rig.channel(StreamKind::Preview, ChannelEvent::StreamingOn);
        assert_eq!(rig.hal.state(), CameraState::Ready);
    }

    #[test]
    fn test_recording_without_preview_is_accepted() {
        let rig = opened();
        rig.hal.start_recording().unwrap();
        assert_eq!(rig.hal.state(), CameraState::RecordStartPending);
        assert!(rig.hal.recording_enabled());

        rig.channel(StreamKind::Record, ChannelEvent::StreamingOn);
        assert_eq!(rig.hal.state(), CameraState::Record);

        rig.hal.stop_recording().unwrap();
        assert_eq!(rig.hal.state(), CameraState::Preview);
        assert_eq!(rig.driver.live_streams(StreamKind::Record), 0);

        // already stopped
        rig.hal.stop_recording().unwrap();
        assert_eq!(rig.hal.state(), CameraState::Preview);
    }

    #[test]
    fn test_stop_preview_stops_recording_first() {
        let rig = previewing();
        rig.hal.start_recording().unwrap();
        rig.hal.stop_preview().unwrap();
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert_eq!(rig.driver.live_streams(StreamKind::Record), 0);
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 0);
    }

    #[test]
    fn test_record_start_failure_keeps_state() {
        let rig = previewing();
        rig.driver.fail_create(StreamKind::Record);
        assert!(matches!(rig.hal.start_recording(), Err(HalError::Allocation(_))));
        assert_eq!(rig.hal.state(), CameraState::Preview);
    }

    #[test]
    fn test_video_frames_loaned_until_released() {
        let rig = previewing();
        rig.hal.start_recording().unwrap();
        rig.channel(StreamKind::Record, ChannelEvent::StreamingOn);

        rig.frame(StreamKind::Record, 2);
        let frames = rig.sink.frames(MsgType::VIDEO_FRAME);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].index, 2);
        assert_eq!(frames[0].size, Size::new(640, 480));
        assert_eq!(rig.hal.status().streams.iter().map(|s| s.loaned).sum::<usize>(), 1);

        rig.hal.release_recording_frame(2).unwrap();
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Record).last(),
            Some(&StreamOp::ReleaseFrame(2))
        );
        assert_eq!(rig.hal.status().streams.iter().map(|s| s.loaned).sum::<usize>(), 0);
    }

    #[test]
    fn test_video_frame_returned_when_disabled() {
        let rig = previewing();
        rig.hal.disable_msg_type(MsgType::VIDEO_FRAME);
        rig.hal.start_recording().unwrap();
        rig.frame(StreamKind::Record, 1);

        assert_eq!(rig.sink.count(MsgType::VIDEO_FRAME), 0);
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Record).last(),
            Some(&StreamOp::ReleaseFrame(1))
        );
    }

    #[test]
    fn test_preview_frames_rotate_through_display() {
        let rig = previewing();
        rig.frame(StreamKind::Preview, 0);
        rig.frame(StreamKind::Preview, 1);

        let d0 = rig.descriptor(StreamKind::Preview, 0);
        let d1 = rig.descriptor(StreamKind::Preview, 1);
        assert_eq!(rig.surface.queued(), vec![d0, d1]);
        // frame 0 returns once frame 1 replaces it on screen
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Preview),
            vec![StreamOp::Init(4), StreamOp::Start, StreamOp::ReleaseFrame(0)]
        );
        assert_eq!(rig.sink.count(MsgType::PREVIEW_FRAME), 2);
    }

    #[test]
    fn test_preview_frame_without_surface_returns_immediately() {
        let rig = previewing();
        rig.hal.set_surface(None);
        rig.frame(StreamKind::Preview, 3);
        assert_eq!(
            rig.driver.stream_ops(StreamKind::Preview).last(),
            Some(&StreamOp::ReleaseFrame(3))
        );
    }

    #[test]
    fn test_frames_on_idle_channel_are_dropped() {
        let rig = opened();
        rig.frame(StreamKind::Record, 0);
        assert!(rig.sink.callbacks().is_empty());
    }

    #[test]
    fn test_take_picture_shows_postview_before_teardown() {
        let rig = previewing();
        let preview_descriptors: Vec<i32> = rig
            .driver
            .registered_buffers(StreamKind::Preview)
            .iter()
            .map(|buffer| buffer.descriptor)
            .collect();
        assert!(rig.mapper.fill(preview_descriptors[1], 0x42));
        rig.frame(StreamKind::Preview, 1);

        rig.hal.take_picture().unwrap();
        assert_eq!(rig.hal.state(), CameraState::SnapshotStartPending);
        assert!(rig.driver.actions().contains(&(true, Action::PrepareSnapshot)));
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 0);
        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 1);

        let calls = rig.surface.calls();
        let postview = match &calls[calls.len() - 2..] {
            [SurfaceCall::Register(heap), SurfaceCall::Queue(queued)] => {
                assert_eq!(heap, &vec![*queued]);
                *queued
            }
            other => panic!("postview not shown: {:?}", other),
        };
        assert!(!preview_descriptors.contains(&postview));
        assert!(rig.hal.status().postview);

        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOn);
        assert_eq!(rig.hal.state(), CameraState::SnapshotAcked);
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOff);
        assert_eq!(rig.hal.state(), CameraState::Ready);
    }

    #[test]
    fn test_take_picture_twice_keeps_one_snapshot_handle() {
        let rig = previewing();
        rig.hal.take_picture().unwrap();
        rig.hal.take_picture().unwrap();

        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 1);
        assert_eq!(
            rig.driver
                .stream_ops(StreamKind::Snapshot)
                .iter()
                .filter(|op| **op == StreamOp::Release)
                .count(),
            1
        );
    }

    #[test]
    fn test_take_picture_times_out_without_prepare_completion() {
        let rig = rig_with(HalSettings {
            prepare_snapshot_timeout_ms: 50,
            ..Default::default()
        });
        rig.hal.open(support_mode::MODE_2D).unwrap();
        rig.hal.start_preview().unwrap();
        rig.driver.hold_prepare();

        assert!(matches!(rig.hal.take_picture(), Err(HalError::PrepareTimeout(50))));
        assert_eq!(rig.hal.state(), CameraState::PreviewStartPending);
        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 0);
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 1);
    }

    #[test]
    fn test_concurrent_take_picture_rejected_while_prepare_pending() {
        let rig = rig_with(HalSettings {
            prepare_snapshot_timeout_ms: 5_000,
            ..Default::default()
        });
        rig.hal.open(support_mode::MODE_2D).unwrap();
        rig.hal.start_preview().unwrap();
        rig.channel(StreamKind::Preview, ChannelEvent::StreamingOn);
        rig.driver.hold_prepare();

        let prepare_requests = || {
            rig.driver
                .actions()
                .iter()
                .filter(|action| **action == (true, Action::PrepareSnapshot))
                .count()
        };

        thread::scope(|scope| {
            let first = scope.spawn(|| rig.hal.take_picture());

            let deadline = Instant::now() + Duration::from_secs(2);
            while prepare_requests() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(prepare_requests(), 1);

            let started = Instant::now();
            assert!(matches!(rig.hal.take_picture(), Err(HalError::InvalidState(_))));
            assert!(started.elapsed() < Duration::from_secs(1));

            rig.emit(DriverEvent::control(ControlEvent::PrepareSnapshotDone, ControlStatus::Success));
            first.join().unwrap().unwrap();
        });

        assert_eq!(prepare_requests(), 1);
        assert_eq!(rig.hal.state(), CameraState::SnapshotStartPending);
        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 1);
        assert!(!rig.hal.shared.prepare.is_armed());
    }

    #[test]
    fn test_failed_preview_restart_keeps_displayed_postview() {
        let rig = previewing();
        rig.frame(StreamKind::Preview, 1);
        rig.hal.take_picture().unwrap();
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOn);
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOff);
        assert_eq!(rig.hal.state(), CameraState::Ready);

        let displayed = rig.surface.queued().last().copied();
        let mappings = rig.mapper.live_mappings();
        assert!(rig.hal.status().postview);

        rig.driver.fail_create(StreamKind::Preview);
        assert!(matches!(rig.hal.start_preview(), Err(HalError::Allocation(_))));
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert!(rig.hal.status().postview);
        assert_eq!(rig.mapper.live_mappings(), mappings);
        assert_eq!(rig.surface.queued().last().copied(), displayed);
    }

    #[test]
    fn test_postview_released_after_preview_heap_registered() {
        let rig = previewing();
        rig.frame(StreamKind::Preview, 1);
        rig.hal.take_picture().unwrap();
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOn);
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOff);
        assert!(rig.hal.status().postview);

        rig.hal.start_preview().unwrap();
        assert!(!rig.hal.status().postview);
        match rig.surface.calls().last() {
            Some(SurfaceCall::Register(heap)) => assert_eq!(heap.len(), 4),
            other => panic!("preview heap not registered: {:?}", other),
        }
    }

    #[test]
    fn test_start_preview_cancels_active_picture() {
        let rig = previewing();
        rig.hal.take_picture().unwrap();
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOn);
        assert_eq!(rig.hal.state(), CameraState::SnapshotAcked);

        rig.hal.start_preview().unwrap();
        assert_eq!(rig.hal.state(), CameraState::PreviewStartPending);
        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 0);
        assert_eq!(rig.driver.live_streams(StreamKind::Preview), 1);

        // late stop from the cancelled snapshot is stale
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOff);
        assert_eq!(rig.hal.state(), CameraState::PreviewStartPending);
    }

    #[test]
    fn test_start_recording_cancels_active_picture() {
        let rig = previewing();
        rig.hal.take_picture().unwrap();
        assert_eq!(rig.hal.state(), CameraState::SnapshotStartPending);

        rig.hal.start_recording().unwrap();
        assert_eq!(rig.hal.state(), CameraState::RecordStartPending);
        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 0);
        assert_eq!(rig.driver.live_streams(StreamKind::Record), 1);
    }

    #[test]
    fn test_take_picture_stops_recording() {
        let rig = previewing();
        rig.hal.start_recording().unwrap();
        rig.hal.take_picture().unwrap();
        assert_eq!(rig.hal.state(), CameraState::SnapshotStartPending);
        assert_eq!(rig.driver.live_streams(StreamKind::Record), 0);
    }

    #[test]
    fn test_snapshot_start_failure_returns_to_ready() {
        let rig = previewing();
        rig.driver.fail_start(StreamKind::Snapshot);
        assert!(rig.hal.take_picture().is_err());
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 0);
    }

    #[test]
    fn test_cancel_picture() {
        let rig = previewing();
        rig.hal.take_picture().unwrap();
        rig.hal.cancel_picture().unwrap();
        assert_eq!(rig.hal.state(), CameraState::Ready);
        assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 0);

        rig.hal.cancel_picture().unwrap();
        assert_eq!(rig.hal.state(), CameraState::Ready);
    }

    #[test]
    fn test_snapshot_frames_reach_caller() {
        let rig = previewing();
        rig.hal.take_picture().unwrap();
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOn);

        rig.frame(StreamKind::Snapshot, 0);
        rig.emit(DriverEvent::Frame(FrameReady {
            channel: StreamKind::Snapshot,
            buffer_index: 1,
            timestamp_ns: 5,
            thumbnail: true,
        }));

        assert_eq!(rig.sink.count(MsgType::RAW_IMAGE), 1);
        assert_eq!(rig.sink.count(MsgType::POSTVIEW_FRAME), 1);
        assert_eq!(rig.sink.frames(MsgType::RAW_IMAGE)[0].size, Size::new(2048, 1536));
        let ops = rig.driver.stream_ops(StreamKind::Snapshot);
        assert!(ops.contains(&StreamOp::ReleaseFrame(0)));
        assert!(ops.contains(&StreamOp::ReleaseFrame(1)));
    }

    #[test]
    fn test_autofocus_round_trip() {
        let rig = previewing();
        rig.hal.auto_focus().unwrap();
        assert_eq!(rig.driver.actions(), vec![(true, Action::Focus(FocusMode::Auto))]);
        assert!(matches!(rig.hal.auto_focus(), Err(HalError::InvalidState(_))));

        rig.emit(DriverEvent::control(ControlEvent::AutoFocusDone, ControlStatus::Success));
        assert_eq!(rig.sink.callbacks(), vec![Callback::Notify(MsgType::FOCUS, 1, 0)]);
        assert!(!rig.hal.status().focus.auto_focus_running);
    }

    #[test]
    fn test_autofocus_failure_status_reported() {
        let rig = previewing();
        rig.hal.auto_focus().unwrap();
        rig.emit(DriverEvent::control(ControlEvent::AutoFocusDone, ControlStatus::Failed));
        assert_eq!(rig.sink.callbacks(), vec![Callback::Notify(MsgType::FOCUS, 0, 0)]);
    }

    #[test]
    fn test_stale_autofocus_event_is_discarded() {
        let rig = previewing();
        let before = rig.hal.status();
        rig.emit(DriverEvent::control(ControlEvent::AutoFocusDone, ControlStatus::Success));
        assert!(rig.sink.callbacks().is_empty());
        assert_eq!(rig.hal.status(), before);
    }

    #[test]
    fn test_cancel_autofocus_when_idle_issues_nothing() {
        let rig = previewing();
        rig.hal.cancel_auto_focus().unwrap();
        assert!(rig.driver.actions().is_empty());
    }

    #[test]
    fn test_cancelled_autofocus_completion_is_discarded() {
        let rig = previewing();
        rig.hal.auto_focus().unwrap();
        rig.hal.cancel_auto_focus().unwrap();
        assert_eq!(
            rig.driver.actions(),
            vec![
                (true, Action::Focus(FocusMode::Auto)),
                (false, Action::Focus(FocusMode::Auto))
            ]
        );

        rig.emit(DriverEvent::control(ControlEvent::AutoFocusDone, ControlStatus::Success));
        assert_eq!(rig.sink.count(MsgType::FOCUS), 0);
    }

    #[test]
    fn test_autofocus_in_fixed_mode_reports_failure() {
        let rig = previewing();
        rig.hal
            .set_parameters(CameraParameters {
                focus_mode: FocusMode::Infinity,
                ..Default::default()
            })
            .unwrap();

        assert!(matches!(rig.hal.auto_focus(), Err(HalError::Config(_))));
        assert_eq!(rig.sink.callbacks(), vec![Callback::Notify(MsgType::FOCUS, 0, 0)]);
        assert!(rig.driver.actions().is_empty());
    }

    #[test]
    fn test_autofocus_driver_failure_clears_flag() {
        let rig = previewing();
        rig.driver.fail_actions();
        assert!(matches!(rig.hal.auto_focus(), Err(HalError::Device(_))));
        assert!(matches!(rig.hal.auto_focus(), Err(HalError::Device(_))));
        assert!(!rig.hal.status().focus.auto_focus_running);
    }

    #[test]
    fn test_zoom_applies_driver_crop() {
        let rig = previewing();
        assert!(matches!(rig.hal.set_zoom(40), Err(HalError::Config(_))));
        rig.hal.set_zoom(10).unwrap();
        assert!(rig.driver.params().contains(&ParamValue::Zoom(10)));
        assert_eq!(rig.hal.parameters().zoom, 10);

        let crop = Rect::new(10, 10, 320, 240);
        rig.driver.set_crop(StreamKind::Preview, CropInfo::Stream(crop));
        rig.emit(DriverEvent::control(ControlEvent::ZoomDone, ControlStatus::Success));

        assert_eq!(rig.surface.calls().last(), Some(&SurfaceCall::SetCrop(crop)));
        assert_eq!(rig.sink.callbacks(), vec![Callback::Notify(MsgType::ZOOM, 10, 1)]);
        assert_eq!(rig.hal.status().focus.current_zoom, 10);
    }

    #[test]
    fn test_zero_crop_resets_to_full_preview() {
        let rig = previewing();
        rig.emit(DriverEvent::control(ControlEvent::ZoomDone, ControlStatus::Success));
        assert_eq!(
            rig.surface.calls().last(),
            Some(&SurfaceCall::SetCrop(Rect::new(0, 0, 640, 480)))
        );
    }

    #[test]
    fn test_snapshot_zoom_updates_stream_crop_only() {
        let rig = previewing();
        rig.hal.take_picture().unwrap();
        rig.channel(StreamKind::Snapshot, ChannelEvent::StreamingOn);
        rig.driver.set_crop(
            StreamKind::Snapshot,
            CropInfo::Snapshot {
                main: Rect::new(0, 0, 1024, 768),
                thumbnail: Rect::new(0, 0, 256, 192),
            },
        );
        let before = rig.surface.calls().len();

        rig.emit(DriverEvent::control(ControlEvent::ZoomDone, ControlStatus::Success));
        assert_eq!(rig.surface.calls().len(), before);
        assert_eq!(rig.sink.count(MsgType::ZOOM), 0);

        let crop = rig
            .hal
            .shared
            .core
            .lock()
            .stream(StreamKind::Snapshot)
            .and_then(|handle| handle.crop());
        assert_eq!(
            crop,
            Some(CropInfo::Snapshot {
                main: Rect::new(0, 0, 1024, 768),
                thumbnail: Rect::new(0, 0, 256, 192),
            })
        );
    }

    #[test]
    fn test_device_error_is_terminal() {
        let rig = previewing();
        rig.emit(DriverEvent::control(ControlEvent::DeviceError, ControlStatus::Failed));
        assert_eq!(rig.hal.state(), CameraState::Error);
        assert_eq!(rig.sink.callbacks(), vec![Callback::Notify(MsgType::ERROR, 1, 0)]);
        assert!(matches!(rig.hal.start_recording(), Err(HalError::InvalidDevice)));
    }

    #[test]
    fn test_disabled_messages_are_not_delivered() {
        let rig = previewing();
        rig.hal.disable_msg_type(MsgType::FOCUS);
        assert!(!rig.hal.msg_type_enabled(MsgType::FOCUS));
        assert!(rig.hal.msg_type_enabled(MsgType::FOCUS | MsgType::ZOOM));

        rig.hal.auto_focus().unwrap();
        rig.emit(DriverEvent::control(ControlEvent::AutoFocusDone, ControlStatus::Success));
        assert_eq!(rig.sink.count(MsgType::FOCUS), 0);
    }

    #[test]
    fn test_surface_attached_mid_preview_gets_heap() {
        let rig = previewing();
        let late = Arc::new(RecordingSurface::new());
        rig.hal.set_surface(Some(late.clone()));
        assert!(matches!(late.calls().as_slice(), [SurfaceCall::Register(heap)] if heap.len() == 4));
        assert!(rig.hal.status().surface_attached);
    }

    #[test]
    fn test_set_parameters_rejects_unsupported_size() {
        let rig = opened();
        let result = rig.hal.set_parameters(CameraParameters {
            picture_size: Size::new(123, 45),
            ..Default::default()
        });
        assert!(matches!(result, Err(HalError::Config(_))));
        assert_eq!(rig.hal.parameters(), CameraParameters::default());
    }

    #[test]
    fn test_release_then_drop_closes_driver() {
        let rig = previewing();
        rig.hal.start_recording().unwrap();
        rig.hal.release();

        assert_eq!(rig.hal.state(), CameraState::Ready);
        for kind in StreamKind::ALL {
            assert_eq!(rig.driver.live_streams(kind), 0);
        }
        assert_eq!(rig.mapper.live_mappings(), 0);
        assert!(rig.driver.is_open());

        let Rig { driver, hal, .. } = rig;
        drop(hal);
        assert!(!driver.is_open());
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_preview_frames_dumped_when_enabled() {
        let dir = std::env::temp_dir().join(format!("camera-hal-dump-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let rig = rig_with(HalSettings {
            dump_mask: 0x1,
            dump_dir: dir.clone(),
            ..Default::default()
        });
        rig.hal.open(support_mode::MODE_2D).unwrap();
        rig.hal.start_preview().unwrap();
        rig.frame(StreamKind::Preview, 0);

        assert!(dir.join("0p_640x480.yuv").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_queued_dispatch_drains_on_worker_thread() {
        let rig = rig_with(HalSettings {
            queued_dispatch: true,
            ..Default::default()
        });
        rig.hal.open(support_mode::MODE_2D).unwrap();
        rig.hal.start_preview().unwrap();
        rig.channel(StreamKind::Preview, ChannelEvent::StreamingOn);
        assert!(wait_for(&rig.hal, CameraState::Preview));

        // prepare-snapshot completion travels through the queue
        rig.hal.take_picture().unwrap();
        assert_eq!(rig.hal.state(), CameraState::SnapshotStartPending);
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        StartPreview,
        StopPreview,
        StartRecording,
        StopRecording,
        TakePicture,
        CancelPicture,
        AutoFocus,
        CancelAutoFocus,
        FocusDone,
        Channel(StreamKind, ChannelEvent),
        Frame(StreamKind, usize),
    }

    fn kind() -> impl Strategy<Value = StreamKind> {
        prop_oneof![
            Just(StreamKind::Preview),
            Just(StreamKind::Record),
            Just(StreamKind::Snapshot)
        ]
    }

    fn step() -> impl Strategy<Value = Step> {
        let event = prop_oneof![
            Just(ChannelEvent::StreamingOn),
            Just(ChannelEvent::StreamingOff),
            Just(ChannelEvent::DeliveryDone)
        ];
        prop_oneof![
            Just(Step::StartPreview),
            Just(Step::StopPreview),
            Just(Step::StartRecording),
            Just(Step::StopRecording),
            Just(Step::TakePicture),
            Just(Step::CancelPicture),
            Just(Step::AutoFocus),
            Just(Step::CancelAutoFocus),
            Just(Step::FocusDone),
            (kind(), event).prop_map(|(kind, event)| Step::Channel(kind, event)),
            (kind(), 0usize..4).prop_map(|(kind, index)| Step::Frame(kind, index)),
        ]
    }

    /// Whether a step may move the machine from `before` to `after`
    fn allowed_edge(before: CameraState, step: Step, after: CameraState) -> bool {
        if before == after {
            return true;
        }
        match step {
            Step::StartPreview => !before.is_preview_active() && after == CameraState::PreviewStartPending,
            Step::StopPreview => before.is_preview_active() && after == CameraState::Ready,
            Step::StartRecording => !before.is_record_active() && after == CameraState::RecordStartPending,
            Step::StopRecording => before.is_record_active() && after == CameraState::Preview,
            Step::TakePicture => matches!(after, CameraState::SnapshotStartPending | CameraState::Ready),
            Step::CancelPicture => before.is_snapshot_active() && after == CameraState::Ready,
            Step::Channel(kind, event) => before.on_channel_event(kind, event) == Some(after),
            Step::AutoFocus | Step::CancelAutoFocus | Step::FocusDone | Step::Frame(..) => false,
        }
    }

    fn small_rig() -> Rig {
        let rig = opened();
        rig.hal
            .set_parameters(CameraParameters {
                preview_size: Size::new(176, 144),
                picture_size: Size::new(320, 240),
                video_size: Size::new(176, 144),
                ..Default::default()
            })
            .unwrap();
        rig
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_random_sequences_keep_invariants(steps in prop::collection::vec(step(), 1..24)) {
            let rig = small_rig();

            for step in steps {
                let before = rig.hal.state();
                let preview_ops = rig.driver.stream_ops(StreamKind::Preview).len();

                match step {
                    Step::StartPreview => { let _ = rig.hal.start_preview(); }
                    Step::StopPreview => rig.hal.stop_preview().unwrap(),
                    Step::StartRecording => { let _ = rig.hal.start_recording(); }
                    Step::StopRecording => rig.hal.stop_recording().unwrap(),
                    Step::TakePicture => { let _ = rig.hal.take_picture(); }
                    Step::CancelPicture => rig.hal.cancel_picture().unwrap(),
                    Step::AutoFocus => { let _ = rig.hal.auto_focus(); }
                    Step::CancelAutoFocus => rig.hal.cancel_auto_focus().unwrap(),
                    Step::FocusDone => rig.emit(DriverEvent::control(
                        ControlEvent::AutoFocusDone,
                        ControlStatus::Success,
                    )),
                    Step::Channel(kind, event) => rig.channel(kind, event),
                    Step::Frame(kind, index) => rig.frame(kind, index),
                }

                let state = rig.hal.state();
                prop_assert!(state.is_operational());
                prop_assert!(
                    allowed_edge(before, step, state),
                    "{:?} moved {:?} to {:?}",
                    step,
                    before,
                    state
                );
                // a command leaving a snapshot state releases the snapshot stream
                let command = !matches!(step, Step::Channel(..) | Step::Frame(..) | Step::FocusDone);
                if command && before.is_snapshot_active() && !state.is_snapshot_active() {
                    prop_assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 0);
                }
                for kind in StreamKind::ALL {
                    prop_assert!(rig.driver.live_streams(kind) <= 1);
                }

                if matches!(step, Step::StopPreview) && !before.is_preview_active() {
                    prop_assert_eq!(state, before);
                    prop_assert_eq!(rig.driver.stream_ops(StreamKind::Preview).len(), preview_ops);
                }
                if state.is_snapshot_active() {
                    prop_assert_eq!(rig.driver.live_streams(StreamKind::Snapshot), 1);
                }
                if state.is_record_active() {
                    prop_assert_eq!(rig.driver.live_streams(StreamKind::Record), 1);
                }
                if state == CameraState::PreviewStartPending {
                    prop_assert_eq!(rig.driver.live_streams(StreamKind::Preview), 1);
                }
            }
        }
    }
}
