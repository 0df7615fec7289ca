pub mod interface;
pub mod link;
pub mod protocol;
pub mod validation;

pub use interface::{PortOpener, SerialPortOpener, SerialTransport};
pub use link::{LinkConfig, SerialLink};
pub use protocol::{Decoded, PinCommand, PinStatus};
pub use validation::validate;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Write error: {0}")]
    Write(std::io::Error),

    #[error("Communication timeout")]
    Timeout,

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("Invalid link state: {0}")]
    InvalidState(String),

    #[error("Link closed")]
    Closed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            SerialError::Write(_)
                | SerialError::Timeout
                | SerialError::Framing(_)
                | SerialError::IoError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
