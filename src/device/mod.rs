pub mod manager;
pub mod models;
pub mod scanner;

pub use manager::{DeviceOutcome, Dispatcher, TargetSelector, NO_DEVICE_ERROR};
pub use models::*;
pub use scanner::DeviceScanner;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(DeviceId),

    #[error("No connected devices")]
    NoConnectedDevices,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
