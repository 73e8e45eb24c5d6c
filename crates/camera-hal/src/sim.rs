//! Simulated collaborators
//!
//! In-process stand-ins for the vendor driver, the display surface, the
//! caller's callback sink and the shared-memory heap. They record every call
//! so tests (and the session binary) can observe what the coordinator did.

use crate::buffer::{BufferHandle, MapError, MappedRegion, MemoryMapper};
use crate::driver::{Action, CameraDriver, DriverError, DriverStream, EventCallback, EventKind, ParamKey, ParamValue};
use crate::event::{ControlEvent, ControlStatus, DriverEvent};
use crate::notify::{CallbackSink, FrameData, MsgType};
use crate::params::{CameraMode, CropInfo, Dimension, PixelFormat, Rect, Size};
use crate::state::StreamKind;
use crate::surface::DisplaySurface;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info};

/// First descriptor handed out by [`HeapMapper`]
const FIRST_DESCRIPTOR: i32 = 100;

#[derive(Default)]
struct HeapState {
    next_descriptor: i32,
    /// descriptor → (base address, length)
    live: HashMap<i32, (usize, usize)>,
    /// Remaining successful maps before failing
    budget: Option<usize>,
}

/// Heap-backed [`MemoryMapper`] with fake descriptors
pub struct HeapMapper {
    state: Mutex<HeapState>,
}

impl Default for HeapMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapMapper {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_descriptor: FIRST_DESCRIPTOR,
                ..Default::default()
            }),
        }
    }

    /// Fail every map after the next `count` succeed
    pub fn fail_after(&self, count: usize) {
        self.state.lock().budget = Some(count);
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Overwrite a mapping, as the sensor would when filling a buffer
    pub fn fill(&self, descriptor: i32, value: u8) -> bool {
        let state = self.state.lock();
        match state.live.get(&descriptor) {
            Some(&(base, len)) => {
                // SAFETY: the region stays allocated while it is in `live`,
                // and the state lock is held for the duration of the write
                unsafe { std::ptr::write_bytes(base as *mut u8, value, len) };
                true
            }
            None => false,
        }
    }

    fn free(base: usize, len: usize) {
        let slice = std::ptr::slice_from_raw_parts_mut(base as *mut u8, len);
        // SAFETY: `base`/`len` came from Box::into_raw in `map`
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl MemoryMapper for HeapMapper {
    fn map(&self, length: usize) -> Result<MappedRegion, MapError> {
        if length == 0 {
            return Err(MapError::ZeroLength);
        }

        let mut state = self.state.lock();
        if let Some(budget) = state.budget.as_mut() {
            if *budget == 0 {
                return Err(MapError::OutOfMemory(length));
            }
            *budget -= 1;
        }

        let raw = Box::into_raw(vec![0u8; length].into_boxed_slice()) as *mut u8;
        let Some(base) = NonNull::new(raw) else {
            return Err(MapError::OutOfMemory(length));
        };
        let descriptor = state.next_descriptor;
        state.next_descriptor += 1;
        state.live.insert(descriptor, (base.as_ptr() as usize, length));

        // SAFETY: the allocation is live until `unmap` frees it
        Ok(unsafe { MappedRegion::from_raw_parts(descriptor, base, length) })
    }

    fn unmap(&self, region: MappedRegion) -> Result<(), MapError> {
        let descriptor = region.descriptor();
        let (base, len) = self
            .state
            .lock()
            .live
            .remove(&descriptor)
            .ok_or(MapError::Foreign(descriptor))?;
        Self::free(base, len);
        Ok(())
    }
}

impl Drop for HeapMapper {
    fn drop(&mut self) {
        for (_, (base, len)) in self.state.get_mut().live.drain() {
            Self::free(base, len);
        }
    }
}

/// Call observed on a simulated stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    Init(usize),
    Start,
    Stop,
    Release,
    ReleaseFrame(usize),
}

struct SimState {
    open_mode: Option<CameraMode>,
    open_count: usize,
    close_count: usize,
    callbacks: HashMap<EventKind, EventCallback>,
    unsupported: HashSet<EventKind>,
    fail_open: bool,
    fail_register: HashSet<EventKind>,
    fail_create: HashSet<StreamKind>,
    fail_init: HashSet<StreamKind>,
    fail_start: HashSet<StreamKind>,
    fail_dimension: bool,
    fail_actions: bool,
    complete_prepare: bool,
    ops: [Vec<StreamOp>; 3],
    live: [usize; 3],
    registered: [Vec<BufferHandle>; 3],
    actions: Vec<(bool, Action)>,
    params: Vec<ParamValue>,
    dimension: Dimension,
    crops: HashMap<StreamKind, CropInfo>,
    max_zoom: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            open_mode: None,
            open_count: 0,
            close_count: 0,
            callbacks: HashMap::new(),
            unsupported: HashSet::new(),
            fail_open: false,
            fail_register: HashSet::new(),
            fail_create: HashSet::new(),
            fail_init: HashSet::new(),
            fail_start: HashSet::new(),
            fail_dimension: false,
            fail_actions: false,
            complete_prepare: true,
            ops: Default::default(),
            live: [0; 3],
            registered: Default::default(),
            actions: Vec::new(),
            params: Vec::new(),
            dimension: Dimension {
                display: Size::new(640, 480),
                video: Size::new(640, 480),
                orig_video: Size::new(640, 480),
                picture: Size::new(2048, 1536),
                thumbnail: Size::new(512, 384),
                preview_format: PixelFormat::Nv21,
                enc_format: PixelFormat::Nv12,
            },
            crops: HashMap::new(),
            max_zoom: 30,
        }
    }
}

/// Simulated camera driver.
///
/// Events are only delivered when a test calls [`SimDriver::emit`], except
/// for prepare-snapshot completion, which is signalled from inside
/// `perform_action` unless disabled with [`SimDriver::hold_prepare`].
#[derive(Clone, Default)]
pub struct SimDriver {
    state: Arc<Mutex<SimState>>,
}

impl SimDriver {
    pub fn new() -> Self {
        info!("Creating simulated camera driver");
        Self::default()
    }

    pub fn fail_open(&self) {
        self.state.lock().fail_open = true;
    }

    pub fn fail_register(&self, kind: EventKind) {
        self.state.lock().fail_register.insert(kind);
    }

    pub fn set_event_supported(&self, kind: EventKind, supported: bool) {
        let mut state = self.state.lock();
        if supported {
            state.unsupported.remove(&kind);
        } else {
            state.unsupported.insert(kind);
        }
    }

    pub fn fail_create(&self, kind: StreamKind) {
        self.state.lock().fail_create.insert(kind);
    }

    pub fn fail_init(&self, kind: StreamKind) {
        self.state.lock().fail_init.insert(kind);
    }

    pub fn fail_start(&self, kind: StreamKind) {
        self.state.lock().fail_start.insert(kind);
    }

    pub fn fail_dimension(&self) {
        self.state.lock().fail_dimension = true;
    }

    pub fn fail_actions(&self) {
        self.state.lock().fail_actions = true;
    }

    /// Do not complete prepare-snapshot requests
    pub fn hold_prepare(&self) {
        self.state.lock().complete_prepare = false;
    }

    pub fn set_crop(&self, kind: StreamKind, crop: CropInfo) {
        self.state.lock().crops.insert(kind, crop);
    }

    pub fn set_max_zoom(&self, max_zoom: u32) {
        self.state.lock().max_zoom = max_zoom;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open_mode.is_some()
    }

    pub fn open_mode(&self) -> Option<CameraMode> {
        self.state.lock().open_mode
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    pub fn has_callback(&self, kind: EventKind) -> bool {
        self.state.lock().callbacks.contains_key(&kind)
    }

    /// Live driver-side channels of one kind
    pub fn live_streams(&self, kind: StreamKind) -> usize {
        self.state.lock().live[kind.index()]
    }

    /// Every call made on channels of one kind, oldest first
    pub fn stream_ops(&self, kind: StreamKind) -> Vec<StreamOp> {
        self.state.lock().ops[kind.index()].clone()
    }

    /// Buffers registered by the most recent init of a kind
    pub fn registered_buffers(&self, kind: StreamKind) -> Vec<BufferHandle> {
        self.state.lock().registered[kind.index()].clone()
    }

    pub fn actions(&self) -> Vec<(bool, Action)> {
        self.state.lock().actions.clone()
    }

    /// Values written through `set_param`, oldest first
    pub fn params(&self) -> Vec<ParamValue> {
        self.state.lock().params.clone()
    }

    pub fn dimension(&self) -> Dimension {
        self.state.lock().dimension
    }

    /// Deliver an event through the registered callback.
    ///
    /// Returns `false` when nothing is registered for the event's class.
    pub fn emit(&self, event: DriverEvent) -> bool {
        let callback = self.state.lock().callbacks.get(&event.kind()).cloned();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => {
                debug!("No callback registered for {:?}", event);
                false
            }
        }
    }
}

impl CameraDriver for SimDriver {
    fn open(&self, mode: CameraMode) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(DriverError::Failed(-19));
        }
        state.open_mode = Some(mode);
        state.open_count += 1;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.open_mode = None;
        state.close_count += 1;
        state.callbacks.clear();
    }

    fn is_event_supported(&self, kind: EventKind) -> bool {
        !self.state.lock().unsupported.contains(&kind)
    }

    fn register_event_callback(&self, kind: EventKind, callback: EventCallback) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.open_mode.is_none() {
            return Err(DriverError::NotOpened);
        }
        if state.fail_register.contains(&kind) {
            return Err(DriverError::Failed(-22));
        }
        state.callbacks.insert(kind, callback);
        Ok(())
    }

    fn get_param(&self, key: ParamKey) -> Result<ParamValue, DriverError> {
        let state = self.state.lock();
        if state.open_mode.is_none() {
            return Err(DriverError::NotOpened);
        }
        match key {
            ParamKey::Dimension if state.fail_dimension => Err(DriverError::Failed(-5)),
            ParamKey::Dimension => Ok(ParamValue::Dimension(state.dimension)),
            ParamKey::Crop(kind) => {
                let crop = state.crops.get(&kind).copied().unwrap_or(match kind {
                    StreamKind::Snapshot => CropInfo::Snapshot {
                        main: Rect::default(),
                        thumbnail: Rect::default(),
                    },
                    _ => CropInfo::Stream(Rect::default()),
                });
                Ok(ParamValue::Crop(crop))
            }
            ParamKey::MaxZoom => Ok(ParamValue::MaxZoom(state.max_zoom)),
        }
    }

    fn set_param(&self, value: ParamValue) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.open_mode.is_none() {
            return Err(DriverError::NotOpened);
        }
        match &value {
            ParamValue::Dimension(_) if state.fail_dimension => return Err(DriverError::Failed(-5)),
            ParamValue::Dimension(dimension) => state.dimension = *dimension,
            ParamValue::Crop(_) | ParamValue::MaxZoom(_) => {
                return Err(DriverError::InvalidParam(format!("{:?} is read-only", value)))
            }
            ParamValue::Zoom(_) | ParamValue::Fps(_) => {}
        }
        state.params.push(value);
        Ok(())
    }

    fn perform_action(&self, enable: bool, action: Action) -> Result<(), DriverError> {
        let complete = {
            let mut state = self.state.lock();
            if state.fail_actions {
                return Err(DriverError::Failed(-1));
            }
            state.actions.push((enable, action));
            enable && action == Action::PrepareSnapshot && state.complete_prepare
        };

        if complete {
            self.emit(DriverEvent::control(
                ControlEvent::PrepareSnapshotDone,
                ControlStatus::Success,
            ));
        }
        Ok(())
    }

    fn create_stream(&self, kind: StreamKind, _mode: CameraMode) -> Result<Box<dyn DriverStream>, DriverError> {
        let mut state = self.state.lock();
        if state.open_mode.is_none() {
            return Err(DriverError::NotOpened);
        }
        if state.fail_create.contains(&kind) {
            return Err(DriverError::NoResources);
        }
        state.live[kind.index()] += 1;
        Ok(Box::new(SimStream {
            kind,
            state: self.state.clone(),
        }))
    }
}

struct SimStream {
    kind: StreamKind,
    state: Arc<Mutex<SimState>>,
}

impl SimStream {
    fn record(&self, op: StreamOp) {
        self.state.lock().ops[self.kind.index()].push(op);
    }
}

impl DriverStream for SimStream {
    fn init(&mut self, buffers: &[BufferHandle]) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.fail_init.contains(&self.kind) {
            return Err(DriverError::InvalidParam(format!("{} geometry rejected", self.kind)));
        }
        state.registered[self.kind.index()] = buffers.to_vec();
        state.ops[self.kind.index()].push(StreamOp::Init(buffers.len()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.state.lock().fail_start.contains(&self.kind) {
            return Err(DriverError::Failed(-16));
        }
        self.record(StreamOp::Start);
        Ok(())
    }

    fn stop(&mut self) {
        self.record(StreamOp::Stop);
    }

    fn release(&mut self) {
        self.record(StreamOp::Release);
    }

    fn release_frame(&mut self, index: usize) -> Result<(), DriverError> {
        self.record(StreamOp::ReleaseFrame(index));
        Ok(())
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let live = &mut state.live[self.kind.index()];
        *live = live.saturating_sub(1);
    }
}

/// Call observed on a [`RecordingSurface`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCall {
    /// Descriptors of the registered heap
    Register(Vec<i32>),
    SetCrop(Rect),
    /// Descriptor of the queued buffer
    Queue(i32),
}

/// Display surface that records every call
#[derive(Default)]
pub struct RecordingSurface {
    calls: Mutex<Vec<SurfaceCall>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().clone()
    }

    pub fn queued(&self) -> Vec<i32> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SurfaceCall::Queue(descriptor) => Some(*descriptor),
                _ => None,
            })
            .collect()
    }
}

impl DisplaySurface for RecordingSurface {
    fn register_buffers(&self, heap: &[BufferHandle]) -> Result<(), DriverError> {
        let descriptors = heap.iter().map(|buffer| buffer.descriptor).collect();
        self.calls.lock().push(SurfaceCall::Register(descriptors));
        Ok(())
    }

    fn set_crop(&self, crop: Rect) -> Result<(), DriverError> {
        self.calls.lock().push(SurfaceCall::SetCrop(crop));
        Ok(())
    }

    fn queue_buffer(&self, buffer: BufferHandle) -> Result<(), DriverError> {
        self.calls.lock().push(SurfaceCall::Queue(buffer.descriptor));
        Ok(())
    }
}

/// Callback observed by a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Notify(MsgType, i32, i32),
    Data(MsgType, FrameData),
}

/// Callback sink that records every delivery
#[derive(Default)]
pub struct RecordingSink {
    callbacks: Mutex<Vec<Callback>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> Vec<Callback> {
        self.callbacks.lock().clone()
    }

    /// Number of deliveries of one message type
    pub fn count(&self, msg: MsgType) -> usize {
        self.callbacks
            .lock()
            .iter()
            .filter(|callback| match callback {
                Callback::Notify(m, ..) | Callback::Data(m, _) => *m == msg,
            })
            .count()
    }

    pub fn frames(&self, msg: MsgType) -> Vec<FrameData> {
        self.callbacks
            .lock()
            .iter()
            .filter_map(|callback| match callback {
                Callback::Data(m, frame) if *m == msg => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }
}

impl CallbackSink for RecordingSink {
    fn notify(&self, msg: MsgType, ext1: i32, ext2: i32) {
        self.callbacks.lock().push(Callback::Notify(msg, ext1, ext2));
    }

    fn data(&self, msg: MsgType, frame: FrameData) {
        self.callbacks.lock().push(Callback::Data(msg, frame));
    }
}
