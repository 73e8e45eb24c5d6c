//! Per-channel stream handle lifecycle
//!
//! create → init → start → stop → release, one handle per [`StreamKind`].
//! `release` consumes the handle, so a second release needs a new create.

use crate::buffer::{BufferStore, FrameGeometry};
use crate::driver::{CameraDriver, DriverStream};
use crate::error::{HalError, HalResult};
use crate::params::{CameraMode, CropInfo};
use crate::state::StreamKind;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Lifecycle phase of a stream handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamPhase {
    Uninit,
    Initialized,
    Started,
    Stopped,
    Released,
}

/// One driver channel plus its buffer set
pub struct StreamHandle {
    kind: StreamKind,
    mode: CameraMode,
    channel: Box<dyn DriverStream>,
    phase: StreamPhase,
    geometry: FrameGeometry,
    buffer_count: usize,
    /// Last buffer queued to the display
    last_queued: Option<usize>,
    /// Buffers handed to the caller and not yet returned
    loaned: BTreeSet<usize>,
    crop: Option<CropInfo>,
}

impl StreamHandle {
    /// Acquire channel resources from the driver
    pub fn create(
        driver: &dyn CameraDriver,
        kind: StreamKind,
        mode: CameraMode,
        geometry: FrameGeometry,
        buffer_count: usize,
    ) -> HalResult<Self> {
        let channel = driver.create_stream(kind, mode).map_err(|e| {
            HalError::Allocation(format!("can't create {} stream: {}", kind, e))
        })?;

        info!(
            "Created {} stream {}x{} ({:?}, {} buffers)",
            kind, geometry.size.width, geometry.size.height, mode, buffer_count
        );

        Ok(Self {
            kind,
            mode,
            channel,
            phase: StreamPhase::Uninit,
            geometry,
            buffer_count,
            last_queued: None,
            loaned: BTreeSet::new(),
            crop: None,
        })
    }

    /// Map buffers and register them with the channel
    pub fn init(&mut self, store: &mut BufferStore) -> HalResult<()> {
        if self.phase != StreamPhase::Uninit {
            return Err(HalError::InvalidState(format!(
                "{} stream init in phase {:?}",
                self.kind, self.phase
            )));
        }

        let handles = store.allocate(self.kind, self.buffer_count, self.geometry)?;
        if let Err(e) = self.channel.init(&handles) {
            store.release_kind(self.kind);
            return Err(HalError::Config(format!("can't init {} stream: {}", self.kind, e)));
        }

        self.phase = StreamPhase::Initialized;
        debug!("{} stream initialized", self.kind);
        Ok(())
    }

    /// Ask the driver to stream; StreamingOn confirms it later
    pub fn start(&mut self) -> HalResult<()> {
        match self.phase {
            StreamPhase::Initialized | StreamPhase::Stopped => {}
            phase => {
                return Err(HalError::InvalidState(format!(
                    "{} stream start in phase {:?}",
                    self.kind, phase
                )))
            }
        }

        self.channel.start()?;
        self.phase = StreamPhase::Started;
        debug!("{} stream start accepted", self.kind);
        Ok(())
    }

    /// Stop streaming; safe when start never ran
    pub fn stop(&mut self) {
        match self.phase {
            StreamPhase::Started | StreamPhase::Initialized => {
                self.channel.stop();
                self.phase = StreamPhase::Stopped;
            }
            StreamPhase::Uninit => self.phase = StreamPhase::Stopped,
            StreamPhase::Stopped | StreamPhase::Released => {
                debug!("{} stream already stopped", self.kind);
            }
        }
    }

    /// Tear the channel down and unmap its buffers
    pub fn release(mut self, store: &mut BufferStore) {
        self.teardown();
        store.release_kind(self.kind);
        info!("Released {} stream", self.kind);
    }

    fn teardown(&mut self) {
        let initialized = matches!(
            self.phase,
            StreamPhase::Initialized | StreamPhase::Started | StreamPhase::Stopped
        );
        self.stop();
        if initialized {
            self.channel.release();
        }
        self.loaned.clear();
        self.last_queued = None;
        self.phase = StreamPhase::Released;
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn mode(&self) -> CameraMode {
        self.mode
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Record that a buffer was queued to the display
    pub fn mark_queued(&mut self, index: usize) {
        self.last_queued = Some(index);
    }

    pub fn last_queued_frame(&self) -> Option<usize> {
        self.last_queued
    }

    /// Hand a buffer to the caller; it stays out of the driver queue
    pub fn loan_frame(&mut self, index: usize) {
        self.loaned.insert(index);
    }

    pub fn loaned_frames(&self) -> usize {
        self.loaned.len()
    }

    /// Return a buffer to the driver's free queue
    pub fn release_frame(&mut self, index: usize) -> HalResult<()> {
        self.loaned.remove(&index);
        if self.phase != StreamPhase::Started {
            debug!("{} frame {} returned while not streaming", self.kind, index);
            return Ok(());
        }
        self.channel.release_frame(index)?;
        Ok(())
    }

    pub fn set_crop(&mut self, crop: CropInfo) {
        self.crop = Some(crop);
    }

    pub fn crop(&self) -> Option<CropInfo> {
        self.crop
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.phase != StreamPhase::Released {
            warn!("{} stream dropped without release", self.kind);
            self.teardown();
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("buffer_count", &self.buffer_count)
            .field("loaned", &self.loaned.len())
            .finish()
    }
}
