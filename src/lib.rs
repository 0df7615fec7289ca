//! Bridge between serial-attached microcontrollers and a pin control API.
//!
//! `Dispatcher` is the entry point: it validates pin commands, fans them out
//! to the connected devices' `SerialLink`s and records every outcome in the
//! shared `HistoryStore`.
pub mod config;
pub mod device;
pub mod history;
pub mod serial;

pub use config::BridgeConfig;
pub use device::{DeviceId, DeviceOutcome, Dispatcher, LinkState, TargetSelector};
pub use history::{HistoryStore, StatusRecord};
pub use serial::{PinCommand, PinStatus, SerialError, SerialLink};
