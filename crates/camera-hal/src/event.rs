//! Typed driver notifications

use crate::driver::EventKind;
use crate::state::{ChannelEvent, StreamKind};

/// Completion status carried by control events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Success,
    Accepted,
    Failed,
    Unknown(i32),
}

/// Control-plane notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    ZoomDone,
    AutoFocusDone,
    PrepareSnapshotDone,
    /// Unrecoverable device failure
    DeviceError,
}

/// A filled buffer on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReady {
    pub channel: StreamKind,
    pub buffer_index: usize,
    pub timestamp_ns: u64,
    /// Snapshot channel only: the buffer holds the thumbnail
    pub thumbnail: bool,
}

/// Notification delivered by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    Channel { channel: StreamKind, event: ChannelEvent },
    Frame(FrameReady),
    Control { event: ControlEvent, status: ControlStatus },
    /// Statistics (histogram, AWB, ...) are accepted and ignored
    Stats { id: u32 },
}

impl DriverEvent {
    /// Event class the driver registers this event under
    pub fn kind(&self) -> EventKind {
        match self {
            DriverEvent::Channel { .. } | DriverEvent::Frame(_) => EventKind::Channel,
            DriverEvent::Control { .. } => EventKind::Control,
            DriverEvent::Stats { .. } => EventKind::Stats,
        }
    }

    pub fn channel(channel: StreamKind, event: ChannelEvent) -> Self {
        DriverEvent::Channel { channel, event }
    }

    pub fn control(event: ControlEvent, status: ControlStatus) -> Self {
        DriverEvent::Control { event, status }
    }

    pub fn frame(channel: StreamKind, buffer_index: usize, timestamp_ns: u64) -> Self {
        DriverEvent::Frame(FrameReady {
            channel,
            buffer_index,
            timestamp_ns,
            thumbnail: false,
        })
    }
}
