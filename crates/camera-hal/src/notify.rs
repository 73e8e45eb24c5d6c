//! Notifications toward the caller, gated by an enabled-message mask

use crate::params::{PixelFormat, Size};
use crate::state::StreamKind;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

bitflags! {
    /// Message classes the caller can enable
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MsgType: u32 {
        const ERROR = 0x0001;
        const SHUTTER = 0x0002;
        const FOCUS = 0x0004;
        const ZOOM = 0x0008;
        const PREVIEW_FRAME = 0x0010;
        const VIDEO_FRAME = 0x0020;
        const POSTVIEW_FRAME = 0x0040;
        const RAW_IMAGE = 0x0080;
        const COMPRESSED_IMAGE = 0x0100;
    }
}

/// A frame handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameData {
    pub kind: StreamKind,
    /// Buffer index; video frames must be returned with this index
    pub index: usize,
    pub timestamp_ns: u64,
    pub size: Size,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// Receiver of caller-facing callbacks
pub trait CallbackSink: Send + Sync {
    /// Discrete event (focus result, zoom progress, error)
    fn notify(&self, msg: MsgType, ext1: i32, ext2: i32);

    /// Frame delivery
    fn data(&self, msg: MsgType, frame: FrameData);
}

/// Callback queued while the coordination lock is held, delivered after
#[derive(Debug)]
pub(crate) enum Notification {
    Notify { msg: MsgType, ext1: i32, ext2: i32 },
    Data { msg: MsgType, frame: FrameData },
}

impl Notification {
    fn msg(&self) -> MsgType {
        match self {
            Notification::Notify { msg, .. } | Notification::Data { msg, .. } => *msg,
        }
    }
}

#[derive(Default)]
struct CallbackState {
    sink: Option<Arc<dyn CallbackSink>>,
    enabled: MsgType,
}

/// Sink plus enabled mask
#[derive(Default)]
pub(crate) struct Callbacks {
    state: Mutex<CallbackState>,
}

impl Callbacks {
    pub(crate) fn set_sink(&self, sink: Option<Arc<dyn CallbackSink>>) {
        self.state.lock().sink = sink;
    }

    pub(crate) fn enable(&self, msg: MsgType) {
        self.state.lock().enabled.insert(msg);
    }

    pub(crate) fn disable(&self, msg: MsgType) {
        self.state.lock().enabled.remove(msg);
    }

    /// Any of `msg` enabled and a sink registered
    pub(crate) fn is_enabled(&self, msg: MsgType) -> bool {
        let state = self.state.lock();
        state.sink.is_some() && state.enabled.intersects(msg)
    }

    pub(crate) fn mask(&self) -> MsgType {
        self.state.lock().enabled
    }

    /// Deliver queued callbacks, re-checking the mask before each one
    pub(crate) fn deliver(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            let sink = {
                let state = self.state.lock();
                if !state.enabled.intersects(notification.msg()) {
                    trace!("Dropping disabled callback {:?}", notification.msg());
                    continue;
                }
                match state.sink.clone() {
                    Some(sink) => sink,
                    None => continue,
                }
            };

            match notification {
                Notification::Notify { msg, ext1, ext2 } => sink.notify(msg, ext1, ext2),
                Notification::Data { msg, frame } => sink.data(msg, frame),
            }
        }
    }
}
