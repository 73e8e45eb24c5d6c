//! Driver event dispatch
//!
//! Events are routed by tag: channel events drive the state machine, frame
//! events feed the display and the caller, control events complete focus,
//! zoom and prepare-snapshot requests, stats events are ignored. Caller
//! notifications and frame dumps are collected under the coordination lock
//! and finished after it is released.

use crate::diag::{DumpFrame, DumpJob};
use crate::driver::{EventCallback, ParamKey, ParamValue};
use crate::event::{ControlEvent, ControlStatus, DriverEvent, FrameReady};
use crate::hardware::Shared;
use crate::machine::Machine;
use crate::notify::{FrameData, MsgType, Notification};
use crate::params::{CropInfo, Rect};
use crate::state::{CameraState, ChannelEvent, StreamKind};
use crate::stream::StreamPhase;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Error code reported with `MsgType::ERROR`
const CAMERA_ERROR_UNKNOWN: i32 = 1;

/// Route one driver event to its handler
pub(crate) fn process_event(shared: &Shared, event: DriverEvent) {
    trace!("Driver event {:?}", event);
    let notifications = match event {
        DriverEvent::Channel { channel, event } => {
            channel_event(shared, channel, event);
            Vec::new()
        }
        DriverEvent::Frame(frame) => {
            let (notifications, dump) = frame_event(shared, frame);
            if let Some(job) = dump {
                job.write();
            }
            notifications
        }
        DriverEvent::Control { event, status } => control_event(shared, event, status),
        DriverEvent::Stats { id } => {
            trace!("Ignoring stats event {}", id);
            Vec::new()
        }
    };
    shared.callbacks.deliver(notifications);
}

/// Callback that dispatches on the driver's own execution context
pub(crate) fn direct_callback(shared: Weak<Shared>) -> EventCallback {
    Arc::new(move |event: DriverEvent| match shared.upgrade() {
        Some(shared) => process_event(&shared, event),
        None => debug!("Camera released, dropping {:?}", event),
    })
}

fn channel_event(shared: &Shared, channel: StreamKind, event: ChannelEvent) {
    let mut core = shared.core.lock();
    if event == ChannelEvent::DeliveryDone {
        trace!("{} channel delivery done", channel);
        return;
    }
    core.apply_channel_event(channel, event);
}

fn frame_event(shared: &Shared, frame: FrameReady) -> (Vec<Notification>, Option<DumpJob>) {
    let mut core = shared.core.lock();
    let streaming = core
        .stream(frame.channel)
        .map(|handle| handle.phase() == StreamPhase::Started)
        .unwrap_or(false);
    if !streaming {
        debug!(
            "Dropping {} frame {}: channel not streaming",
            frame.channel, frame.buffer_index
        );
        return (Vec::new(), None);
    }
    if core.store.buffer(frame.channel, frame.buffer_index).is_none() {
        warn!("{} frame {} has no mapped buffer", frame.channel, frame.buffer_index);
        return (Vec::new(), None);
    }

    let dump = dump(&mut core, &frame);
    let notifications = match frame.channel {
        StreamKind::Preview => preview_frame(shared, &mut core, frame),
        StreamKind::Record => video_frame(shared, &mut core, frame),
        StreamKind::Snapshot => snapshot_frame(shared, &mut core, frame),
    };
    (notifications, dump)
}

fn frame_data(core: &Machine, frame: &FrameReady) -> Option<FrameData> {
    let buffer = core.store.buffer(frame.channel, frame.buffer_index)?;
    let geometry = buffer.geometry();
    Some(FrameData {
        kind: frame.channel,
        index: frame.buffer_index,
        timestamp_ns: frame.timestamp_ns,
        size: geometry.size,
        format: geometry.format,
        data: buffer.data().to_vec(),
    })
}

fn dump(core: &mut Machine, frame: &FrameReady) -> Option<DumpJob> {
    let kind = match frame.channel {
        StreamKind::Preview => DumpFrame::Preview,
        StreamKind::Record => DumpFrame::Video,
        StreamKind::Snapshot if frame.thumbnail => DumpFrame::Thumbnail,
        StreamKind::Snapshot => DumpFrame::Main,
    };
    if !core.dumper.is_enabled(kind) {
        return None;
    }
    let buffer = core.store.buffer(frame.channel, frame.buffer_index)?;
    let geometry = *buffer.geometry();
    core.dumper.offer(kind, &geometry, buffer.data())
}

fn return_frame(core: &mut Machine, channel: StreamKind, index: usize) {
    if let Some(handle) = core.stream_mut(channel) {
        if let Err(e) = handle.release_frame(index) {
            warn!("Returning {} frame {} failed: {}", channel, index, e);
        }
    }
}

fn preview_frame(shared: &Shared, core: &mut Machine, frame: FrameReady) -> Vec<Notification> {
    let index = frame.buffer_index;
    let mut notifications = Vec::new();

    if shared.callbacks.is_enabled(MsgType::PREVIEW_FRAME) {
        if let Some(data) = frame_data(core, &frame) {
            notifications.push(Notification::Data {
                msg: MsgType::PREVIEW_FRAME,
                frame: data,
            });
        }
    }

    if let Some(meter) = core.fps.as_mut() {
        meter.tick(Instant::now());
    }

    let queued = core
        .store
        .buffer(StreamKind::Preview, index)
        .map(|buffer| shared.surface.queue(buffer.handle()))
        .unwrap_or(false);

    // The display keeps the last queued buffer until the next one replaces it
    let displaced = match core.stream_mut(StreamKind::Preview) {
        Some(handle) if queued => {
            let previous = handle.last_queued_frame();
            handle.mark_queued(index);
            previous.filter(|&previous| previous != index)
        }
        _ => Some(index),
    };
    if let Some(displaced) = displaced {
        return_frame(core, StreamKind::Preview, displaced);
    }

    notifications
}

fn video_frame(shared: &Shared, core: &mut Machine, frame: FrameReady) -> Vec<Notification> {
    if !shared.callbacks.is_enabled(MsgType::VIDEO_FRAME) {
        return_frame(core, StreamKind::Record, frame.buffer_index);
        return Vec::new();
    }

    let Some(data) = frame_data(core, &frame) else {
        return Vec::new();
    };
    if let Some(handle) = core.stream_mut(StreamKind::Record) {
        handle.loan_frame(frame.buffer_index);
    }
    vec![Notification::Data {
        msg: MsgType::VIDEO_FRAME,
        frame: data,
    }]
}

fn snapshot_frame(shared: &Shared, core: &mut Machine, frame: FrameReady) -> Vec<Notification> {
    let msg = if frame.thumbnail {
        MsgType::POSTVIEW_FRAME
    } else {
        MsgType::RAW_IMAGE
    };

    let mut notifications = Vec::new();
    if shared.callbacks.is_enabled(msg) {
        if let Some(data) = frame_data(core, &frame) {
            notifications.push(Notification::Data { msg, frame: data });
        }
    }
    return_frame(core, StreamKind::Snapshot, frame.buffer_index);
    notifications
}

fn control_event(shared: &Shared, event: ControlEvent, status: ControlStatus) -> Vec<Notification> {
    match event {
        ControlEvent::ZoomDone => zoom_event(shared, status),
        ControlEvent::AutoFocusDone => autofocus_event(shared, status),
        ControlEvent::PrepareSnapshotDone => {
            if !shared.prepare.complete() {
                debug!("Prepare snapshot completion with no waiter");
            }
            Vec::new()
        }
        ControlEvent::DeviceError => device_error(shared, status),
    }
}

fn autofocus_event(shared: &Shared, status: ControlStatus) -> Vec<Notification> {
    {
        let mut focus = shared.focus.lock();
        if !focus.auto_focus_running {
            debug!("Autofocus not running, discarding stale event");
            return Vec::new();
        }
        focus.auto_focus_running = false;
    }

    let focused = match status {
        ControlStatus::Success | ControlStatus::Accepted => 1,
        ControlStatus::Failed => 0,
        ControlStatus::Unknown(code) => {
            warn!("Unknown autofocus status {}", code);
            return Vec::new();
        }
    };
    vec![Notification::Notify {
        msg: MsgType::FOCUS,
        ext1: focused,
        ext2: 0,
    }]
}

fn zoom_event(shared: &Shared, status: ControlStatus) -> Vec<Notification> {
    let mut core = shared.core.lock();
    if !core.state().is_operational() {
        return Vec::new();
    }
    if status == ControlStatus::Failed {
        warn!("Zoom failed in state {:?}", core.state());
        return Vec::new();
    }

    if core.state() == CameraState::SnapshotAcked {
        match shared.driver.get_param(ParamKey::Crop(StreamKind::Snapshot)) {
            Ok(ParamValue::Crop(crop)) => {
                debug!("Snapshot crop {:?}", crop);
                if let Some(handle) = core.stream_mut(StreamKind::Snapshot) {
                    handle.set_crop(crop);
                }
            }
            Ok(other) => warn!("Unexpected crop reply {:?}", other),
            Err(e) => warn!("Fetching snapshot crop failed: {}", e),
        }
        return Vec::new();
    }

    let crop = match shared.driver.get_param(ParamKey::Crop(StreamKind::Preview)) {
        Ok(ParamValue::Crop(CropInfo::Stream(rect))) => rect,
        Ok(ParamValue::Crop(CropInfo::Snapshot { main, .. })) => main,
        Ok(other) => {
            warn!("Unexpected crop reply {:?}", other);
            return Vec::new();
        }
        Err(e) => {
            warn!("Fetching preview crop failed: {}", e);
            return Vec::new();
        }
    };

    shared.surface.apply_crop(crop, Rect::full(core.dimension.display));
    if let Some(handle) = core.stream_mut(StreamKind::Preview) {
        handle.set_crop(CropInfo::Stream(crop));
    }

    let zoom = {
        let mut focus = shared.focus.lock();
        focus.current_zoom = focus.target_zoom;
        focus.current_zoom
    };
    debug!("Current zoom {}", zoom);
    vec![Notification::Notify {
        msg: MsgType::ZOOM,
        ext1: zoom as i32,
        ext2: 1,
    }]
}

fn device_error(shared: &Shared, status: ControlStatus) -> Vec<Notification> {
    error!("Driver reported unrecoverable failure ({:?})", status);
    shared.core.lock().set_state(CameraState::Error);
    // wake a take_picture waiter; it re-checks the state
    shared.prepare.complete();
    vec![Notification::Notify {
        msg: MsgType::ERROR,
        ext1: CAMERA_ERROR_UNKNOWN,
        ext2: 0,
    }]
}

/// Queued dispatch: driver callbacks enqueue, a dedicated thread drains
pub(crate) struct EventPump {
    sender: Option<mpsc::UnboundedSender<DriverEvent>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl EventPump {
    /// Spawn the drain thread; `None` if the thread cannot be created
    pub(crate) fn start(shared: Weak<Shared>) -> Option<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<DriverEvent>();
        let spawned = thread::Builder::new()
            .name("camera-events".to_string())
            .spawn(move || {
                debug!("Event pump started");
                while let Some(event) = receiver.blocking_recv() {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    process_event(&shared, event);
                }
                debug!("Event pump stopped");
            });

        match spawned {
            Ok(worker) => Some(Self {
                sender: Some(sender),
                worker: Some(worker),
            }),
            Err(e) => {
                warn!("Can't spawn event pump, dispatching directly: {}", e);
                None
            }
        }
    }

    /// Driver callback feeding this pump
    pub(crate) fn callback(&self) -> EventCallback {
        let sender = self.sender.as_ref().map(|sender| sender.downgrade());
        Arc::new(move |event: DriverEvent| match sender.as_ref().and_then(|weak| weak.upgrade()) {
            Some(sender) => {
                if sender.send(event).is_err() {
                    debug!("Event pump gone, dropping {:?}", event);
                }
            }
            None => debug!("Event pump closed, dropping {:?}", event),
        })
    }

    /// Close the queue and wait for queued events to drain
    pub(crate) fn shutdown(mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Event pump thread panicked");
            }
        }
    }
}
