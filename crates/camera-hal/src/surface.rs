//! Display surface seam
//!
//! The overlay can be attached or detached by the windowing system at any
//! time, so the handle lives behind its own lock, independent of camera
//! state.

use crate::buffer::BufferHandle;
use crate::driver::DriverError;
use crate::params::Rect;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Display/overlay sink accepting buffer handles
pub trait DisplaySurface: Send + Sync {
    /// Register the heap that later `queue_buffer` calls refer to
    fn register_buffers(&self, heap: &[BufferHandle]) -> Result<(), DriverError>;

    fn set_crop(&self, crop: Rect) -> Result<(), DriverError>;

    /// Display one buffer
    fn queue_buffer(&self, buffer: BufferHandle) -> Result<(), DriverError>;
}

/// Surface handle guarded by the display lock
#[derive(Default)]
pub(crate) struct SurfaceSlot {
    surface: Mutex<Option<Arc<dyn DisplaySurface>>>,
}

impl SurfaceSlot {
    pub(crate) fn set(&self, surface: Option<Arc<dyn DisplaySurface>>) {
        *self.surface.lock() = surface;
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.surface.lock().is_some()
    }

    /// Run `f` against the attached surface while holding the display lock.
    ///
    /// Returns `None` when no surface is attached.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&dyn DisplaySurface) -> R) -> Option<R> {
        let guard = self.surface.lock();
        match guard.as_ref() {
            Some(surface) => Some(f(surface.as_ref())),
            None => {
                debug!("No display surface attached");
                None
            }
        }
    }

    /// Register a stream's buffer heap with the display
    pub(crate) fn register(&self, heap: &[BufferHandle]) -> bool {
        self.with(|surface| match surface.register_buffers(heap) {
            Ok(()) => true,
            Err(e) => {
                warn!("Surface rejected buffer registration: {}", e);
                false
            }
        })
        .unwrap_or(false)
    }

    /// Queue a buffer from an already registered heap
    pub(crate) fn queue(&self, buffer: BufferHandle) -> bool {
        self.with(|surface| match surface.queue_buffer(buffer) {
            Ok(()) => true,
            Err(e) => {
                warn!("Surface rejected buffer {}: {}", buffer.index, e);
                false
            }
        })
        .unwrap_or(false)
    }

    /// Register a single-buffer heap and queue it
    pub(crate) fn show(&self, buffer: BufferHandle) -> bool {
        self.with(|surface| {
            if let Err(e) = surface.register_buffers(std::slice::from_ref(&buffer)) {
                warn!("Surface rejected postview registration: {}", e);
                return false;
            }
            match surface.queue_buffer(buffer) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Surface rejected postview buffer: {}", e);
                    false
                }
            }
        })
        .unwrap_or(false)
    }

    /// Apply a crop, falling back to `full` when the crop is empty
    pub(crate) fn apply_crop(&self, crop: Rect, full: Rect) {
        self.with(|surface| {
            let region = if crop.is_empty() {
                debug!("Resetting crop to full frame");
                full
            } else {
                crop
            };
            if let Err(e) = surface.set_crop(region) {
                warn!("Surface rejected crop {:?}: {}", region, e);
            }
        });
    }
}
