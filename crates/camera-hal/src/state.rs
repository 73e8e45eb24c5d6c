//! Camera operational state and channel-event transitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Driver-managed data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Preview,
    Record,
    Snapshot,
}

impl StreamKind {
    /// All stream kinds, in slot order
    pub const ALL: [StreamKind; 3] = [StreamKind::Preview, StreamKind::Record, StreamKind::Snapshot];

    /// Slot index used by per-kind tables
    pub fn index(self) -> usize {
        match self {
            StreamKind::Preview => 0,
            StreamKind::Record => 1,
            StreamKind::Snapshot => 2,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Preview => "preview",
            StreamKind::Record => "record",
            StreamKind::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// Streaming notification for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    StreamingOn,
    StreamingOff,
    DeliveryDone,
}

/// Camera state (exactly one live at a time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraState {
    #[default]
    Uninitialized,
    Ready,
    PreviewStartPending,
    Preview,
    PreviewStopPending,
    RecordStartPending,
    Record,
    RecordStopPending,
    SnapshotStartPending,
    SnapshotAcked,
    SnapshotStopPending,
    Error,
}

impl CameraState {
    /// Preview pipeline is requested or running (recording implies preview)
    pub fn is_preview_active(self) -> bool {
        matches!(
            self,
            CameraState::Preview
                | CameraState::PreviewStartPending
                | CameraState::Record
                | CameraState::RecordStartPending
        )
    }

    /// Record pipeline is requested or running
    pub fn is_record_active(self) -> bool {
        matches!(self, CameraState::Record | CameraState::RecordStartPending)
    }

    /// Snapshot is requested or acknowledged by the driver
    pub fn is_snapshot_active(self) -> bool {
        matches!(self, CameraState::SnapshotAcked | CameraState::SnapshotStartPending)
    }

    /// Device is opened and not in the terminal error state
    pub fn is_operational(self) -> bool {
        !matches!(self, CameraState::Uninitialized | CameraState::Error)
    }

    /// Next state for a channel event, or `None` when the event does not
    /// match any edge out of the current state (stale or duplicate).
    pub fn on_channel_event(self, channel: StreamKind, event: ChannelEvent) -> Option<CameraState> {
        use CameraState::*;

        match (channel, event) {
            (_, ChannelEvent::DeliveryDone) => None,
            (StreamKind::Preview, ChannelEvent::StreamingOn) => match self {
                PreviewStartPending => Some(Preview),
                _ => None,
            },
            (StreamKind::Preview, ChannelEvent::StreamingOff) => match self {
                PreviewStartPending | Preview | PreviewStopPending => Some(Ready),
                _ => None,
            },
            (StreamKind::Record, ChannelEvent::StreamingOn) => match self {
                RecordStartPending => Some(Record),
                _ => None,
            },
            (StreamKind::Record, ChannelEvent::StreamingOff) => match self {
                RecordStartPending | Record | RecordStopPending => Some(Preview),
                _ => None,
            },
            (StreamKind::Snapshot, ChannelEvent::StreamingOn) => match self {
                SnapshotStartPending => Some(SnapshotAcked),
                _ => None,
            },
            (StreamKind::Snapshot, ChannelEvent::StreamingOff) => match self {
                SnapshotStartPending | SnapshotAcked | SnapshotStopPending => Some(Ready),
                _ => None,
            },
        }
    }
}
