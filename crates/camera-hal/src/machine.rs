//! Camera state machine core
//!
//! Everything in [`Machine`] lives behind the primary coordination lock:
//! the camera state, the negotiated geometry, the per-kind stream slots and
//! the buffer store. [`FocusSession`] sits behind its own lock.

use crate::buffer::{BufferStore, FrameGeometry, MemoryMapper};
use crate::diag::{FpsMeter, FrameDumper};
use crate::driver::CameraDriver;
use crate::error::{HalError, HalResult};
use crate::params::{CameraMode, CameraParameters, Dimension};
use crate::settings::HalSettings;
use crate::state::{CameraState, ChannelEvent, StreamKind};
use crate::stream::{StreamHandle, StreamPhase};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Autofocus and zoom session flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FocusSession {
    pub auto_focus_running: bool,
    pub current_zoom: u32,
    pub target_zoom: u32,
}

pub(crate) struct Machine {
    state: CameraState,
    /// Driver opened and not yet closed
    pub(crate) opened: bool,
    pub(crate) mode: CameraMode,
    pub(crate) params: CameraParameters,
    pub(crate) dimension: Dimension,
    streams: [Option<StreamHandle>; 3],
    pub(crate) store: BufferStore,
    pub(crate) dumper: FrameDumper,
    pub(crate) fps: Option<FpsMeter>,
}

impl Machine {
    pub(crate) fn new(mapper: Arc<dyn MemoryMapper>, settings: &HalSettings) -> Self {
        Self {
            state: CameraState::Uninitialized,
            opened: false,
            mode: CameraMode::default(),
            params: CameraParameters::default(),
            dimension: Dimension::default(),
            streams: [None, None, None],
            store: BufferStore::new(mapper),
            dumper: FrameDumper::new(settings.dump_mask, settings.dump_dir.clone()),
            fps: settings.debug_fps.then(FpsMeter::new),
        }
    }

    pub(crate) fn state(&self) -> CameraState {
        self.state
    }

    pub(crate) fn set_state(&mut self, next: CameraState) {
        if self.state != next {
            info!("Camera state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Fail fast unless the device is opened and healthy
    pub(crate) fn ensure_operational(&self) -> HalResult<()> {
        if self.state.is_operational() {
            Ok(())
        } else {
            debug!("Rejecting command in state {:?}", self.state);
            Err(HalError::InvalidDevice)
        }
    }

    /// Apply a channel event; stale events leave the state untouched
    pub(crate) fn apply_channel_event(&mut self, channel: StreamKind, event: ChannelEvent) -> Option<CameraState> {
        match self.state.on_channel_event(channel, event) {
            Some(next) => {
                self.set_state(next);
                Some(next)
            }
            None => {
                debug!(
                    "Ignoring {:?} on {} channel in state {:?}",
                    event, channel, self.state
                );
                None
            }
        }
    }

    pub(crate) fn stream(&self, kind: StreamKind) -> Option<&StreamHandle> {
        self.streams[kind.index()].as_ref()
    }

    pub(crate) fn stream_mut(&mut self, kind: StreamKind) -> Option<&mut StreamHandle> {
        self.streams[kind.index()].as_mut()
    }

    pub(crate) fn has_stream(&self, kind: StreamKind) -> bool {
        self.streams[kind.index()].is_some()
    }

    /// Replace the handle of `kind` with a fresh, uninitialized one
    pub(crate) fn create_stream(
        &mut self,
        driver: &dyn CameraDriver,
        kind: StreamKind,
        buffer_count: usize,
    ) -> HalResult<()> {
        self.destroy_stream(kind);

        let size = self.dimension.stream_size(kind);
        if size.is_empty() {
            return Err(HalError::Config(format!("{} stream has no frame size", kind)));
        }
        let geometry = FrameGeometry::semi_planar(size, self.dimension.stream_format(kind));
        let handle = StreamHandle::create(driver, kind, self.mode, geometry, buffer_count)?;
        self.streams[kind.index()] = Some(handle);
        Ok(())
    }

    /// Bring the handle of `kind` to Started.
    ///
    /// A failed init or start destroys the handle.
    pub(crate) fn launch_stream(&mut self, kind: StreamKind) -> HalResult<()> {
        let Some(handle) = self.streams[kind.index()].as_mut() else {
            return Err(HalError::InvalidState(format!("no {} stream to start", kind)));
        };

        let result = match handle.phase() {
            StreamPhase::Uninit => handle.init(&mut self.store).and_then(|_| handle.start()),
            StreamPhase::Started => {
                handle.stop();
                handle.start()
            }
            _ => handle.start(),
        };

        if let Err(e) = &result {
            warn!("Starting {} stream failed: {}", kind, e);
            self.destroy_stream(kind);
        }
        result
    }

    /// Stop, release and drop the handle of `kind`; `false` if none was live
    pub(crate) fn destroy_stream(&mut self, kind: StreamKind) -> bool {
        match self.streams[kind.index()].take() {
            Some(handle) => {
                handle.release(&mut self.store);
                true
            }
            None => false,
        }
    }

    pub(crate) fn destroy_all(&mut self) {
        for kind in StreamKind::ALL {
            self.destroy_stream(kind);
        }
        self.store.clear_postview();
    }

    pub(crate) fn live_streams(&self) -> impl Iterator<Item = &StreamHandle> {
        self.streams.iter().flatten()
    }
}
