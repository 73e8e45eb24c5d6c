//! Camera HAL coordinator
//!
//! Binds a vendor camera driver to a media framework. Provides:
//! - Camera state machine gating every command against the current state
//! - Preview, record and snapshot stream lifecycles with their mapped buffers
//! - Dispatch of asynchronous driver events (channel, frame, control, stats)
//! - Caller notifications gated by an enabled-message mask
//!
//! The driver, display surface and memory mapper are traits; [`sim`]
//! provides in-process implementations of all of them.

mod dispatch;
mod hardware;
mod machine;
mod pending;

pub mod buffer;
pub mod diag;
pub mod driver;
pub mod error;
pub mod event;
#[cfg(target_os = "linux")]
pub mod mmap;
pub mod notify;
pub mod params;
pub mod settings;
pub mod sim;
pub mod state;
pub mod stream;
pub mod surface;

pub use buffer::{BufferHandle, BufferStore, FrameGeometry, MapError, MappedBuffer, MappedRegion, MemoryMapper};
pub use driver::{Action, CameraDriver, DriverError, DriverStream, EventCallback, EventKind, ParamKey, ParamValue};
pub use error::{HalError, HalResult};
pub use event::{ControlEvent, ControlStatus, DriverEvent, FrameReady};
pub use hardware::{CameraHardware, HalStatus, StreamStatus};
pub use machine::FocusSession;
#[cfg(target_os = "linux")]
pub use mmap::SharedMemoryMapper;
pub use notify::{CallbackSink, FrameData, MsgType};
pub use params::{support_mode, CameraMode, CameraParameters, CropInfo, Dimension, FocusMode, PixelFormat, Rect, Size};
pub use settings::HalSettings;
pub use state::{CameraState, ChannelEvent, StreamKind};
pub use stream::{StreamHandle, StreamPhase};
pub use surface::DisplaySurface;

