use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of a device: the path of its serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Path> for DeviceId {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl From<&str> for DeviceId {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

/// Link lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
    Faulted,
}

impl LinkState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Unconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Faulted)
                | (Connected, Faulted)
                | (Connected, Closing)
                | (Closing, Unconnected)
                | (Faulted, Unconnected)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Unconnected => "unconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Closing => "closing",
            LinkState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// USB descriptor details reported by the OS for an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbInfo {
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Complete device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub port_name: String,
    pub baud_rate: u32,
    pub usb: Option<UsbInfo>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        let port_name = port_name.into();
        Self {
            id: DeviceId::new(port_name.clone()),
            port_name,
            baud_rate,
            usb: None,
            last_seen: Utc::now(),
        }
    }

    pub fn with_usb(mut self, usb: Option<UsbInfo>) -> Self {
        self.usb = usb;
        self
    }
}
