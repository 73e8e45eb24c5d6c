//! HAL Error Types

use crate::buffer::MapError;
use crate::driver::DriverError;
use thiserror::Error;

/// Errors returned by the camera HAL command surface
#[derive(Debug, Error)]
pub enum HalError {
    /// No usable driver is bound, or the device is in the terminal error state
    #[error("No camera device bound or device unusable")]
    InvalidDevice,

    /// Parameter negotiation with the driver failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel or buffer resources could not be allocated
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Opaque failure reported by the driver
    #[error("Device failure: {0}")]
    Device(#[from] DriverError),

    /// The driver never completed "prepare snapshot"
    #[error("Prepare snapshot not completed after {0}ms")]
    PrepareTimeout(u64),

    /// Settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(String),
}

impl From<MapError> for HalError {
    fn from(err: MapError) -> Self {
        HalError::Allocation(err.to_string())
    }
}

impl From<config::ConfigError> for HalError {
    fn from(err: config::ConfigError) -> Self {
        HalError::Settings(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type HalResult<T> = Result<T, HalError>;
