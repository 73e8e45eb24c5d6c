//! Driver-facing interfaces
//!
//! The vendor camera stack is an opaque collaborator. The HAL calls into it
//! through [`CameraDriver`] and [`DriverStream`], and receives asynchronous
//! notifications through the callbacks it registers per [`EventKind`].

use crate::buffer::BufferHandle;
use crate::event::DriverEvent;
use crate::params::{CameraMode, CropInfo, Dimension, FocusMode};
use crate::state::StreamKind;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Driver call failed with status {0}")]
    Failed(i32),

    #[error("Driver out of channel resources")]
    NoResources,

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Driver not opened")]
    NotOpened,
}

/// Event classes a driver can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Channel,
    Control,
    Stats,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Channel, EventKind::Control, EventKind::Stats];
}

/// Callback invoked by the driver, from its own execution context
pub type EventCallback = Arc<dyn Fn(DriverEvent) + Send + Sync>;

/// Keys readable through [`CameraDriver::get_param`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKey {
    Dimension,
    Crop(StreamKind),
    MaxZoom,
}

/// Values exchanged through get/set param
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Dimension(Dimension),
    Crop(CropInfo),
    MaxZoom(u32),
    Zoom(u32),
    Fps(u32),
}

/// Hardware actions toggled through [`CameraDriver::perform_action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Focus(FocusMode),
    PrepareSnapshot,
}

/// Camera device driver
pub trait CameraDriver: Send + Sync {
    /// Open the device in the given mode
    fn open(&self, mode: CameraMode) -> Result<(), DriverError>;

    /// Close the device; callbacks must not fire afterwards
    fn close(&self);

    fn is_event_supported(&self, kind: EventKind) -> bool;

    /// Register the handler for one event class
    fn register_event_callback(&self, kind: EventKind, callback: EventCallback) -> Result<(), DriverError>;

    fn get_param(&self, key: ParamKey) -> Result<ParamValue, DriverError>;

    fn set_param(&self, value: ParamValue) -> Result<(), DriverError>;

    /// Start (`enable`) or stop an asynchronous hardware action
    fn perform_action(&self, enable: bool, action: Action) -> Result<(), DriverError>;

    /// Acquire channel resources for one stream
    fn create_stream(&self, kind: StreamKind, mode: CameraMode) -> Result<Box<dyn DriverStream>, DriverError>;
}

/// Driver side of one channel
pub trait DriverStream: Send {
    /// Register buffers and acquire the channel
    fn init(&mut self, buffers: &[BufferHandle]) -> Result<(), DriverError>;

    /// Request streaming; StreamingOn confirms it later
    fn start(&mut self) -> Result<(), DriverError>;

    fn stop(&mut self);

    /// Give the channel and its buffer registrations back
    fn release(&mut self);

    /// Return a delivered frame to the driver's free queue
    fn release_frame(&mut self, index: usize) -> Result<(), DriverError>;
}
