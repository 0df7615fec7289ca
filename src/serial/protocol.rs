use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Result, SerialError};

/// Line terminator closing every frame in both directions.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Inclusive bounds every numeric pin field must respect on the wire.
pub const FIELD_MIN: i64 = 0;
pub const FIELD_MAX: i64 = 255;

/// The firmware treats a ramp velocity of zero as a configuration error.
pub const MIN_VELOCITY: i64 = 1;

/// Pin control command as submitted by a caller.
///
/// Values are kept wide so untrusted input survives deserialization intact;
/// `validate` brings them into range before anything is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PinCommand {
    pub active: i64,
    #[serde(alias = "pin")]
    pub number: i64,
    pub is_analog: i64,
    pub is_output: i64,
    pub current: i64,
    pub target: i64,
    pub velocity: i64,
}

impl PinCommand {
    /// Field names paired with their values, in wire order.
    pub fn fields(&self) -> [(&'static str, i64); 7] {
        [
            ("active", self.active),
            ("number", self.number),
            ("is_analog", self.is_analog),
            ("is_output", self.is_output),
            ("current", self.current),
            ("target", self.target),
            ("velocity", self.velocity),
        ]
    }
}

/// Lowest value the device accepts for the named field.
pub(crate) fn field_floor(name: &str) -> i64 {
    if name == "velocity" {
        MIN_VELOCITY
    } else {
        FIELD_MIN
    }
}

/// Pin status as reported back by the device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PinStatus {
    pub device: String,
    pub active: i64,
    pub number: i64,
    pub is_analog: i64,
    pub is_output: i64,
    pub current: i64,
    pub target: i64,
    pub velocity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PinStatus {
    /// Status carrying only an error, used for malformed frames and failed exchanges.
    pub fn degraded(device: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// The command fields this status reflects.
    pub fn command(&self) -> PinCommand {
        PinCommand {
            active: self.active,
            number: self.number,
            is_analog: self.is_analog,
            is_output: self.is_output,
            current: self.current,
            target: self.target,
            velocity: self.velocity,
        }
    }
}

impl fmt::Display for PinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}> Status for PIN {} output: {}, towards {} at a velocity of {}.",
            self.device, self.number, self.current, self.target, self.velocity
        )?;
        if let Some(error) = &self.error {
            write!(f, " error: {}", error)?;
        }
        Ok(())
    }
}

/// Result of scanning an accumulation buffer for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// No terminator yet; nothing was consumed.
    Incomplete,
    /// A complete frame; `consumed` bytes (terminator included) belong to it.
    Frame { status: PinStatus, consumed: usize },
}

/// Serialize a command into one newline-terminated JSON frame.
pub fn encode(command: &PinCommand) -> Result<Vec<u8>> {
    for (name, value) in command.fields() {
        let floor = field_floor(name);
        if !(floor..=FIELD_MAX).contains(&value) {
            return Err(SerialError::Encode(format!(
                "field '{}' = {} outside [{}, {}]",
                name, value, floor, FIELD_MAX
            )));
        }
    }

    let mut frame = serde_json::to_vec(command).map_err(|e| SerialError::Encode(e.to_string()))?;
    frame.push(FRAME_TERMINATOR);
    Ok(frame)
}

/// Look for the first complete frame in `buffer`.
///
/// Blank lines ahead of the frame are skipped and counted as consumed. A payload
/// that is not a valid status object still yields a frame, with `error` set.
pub fn try_decode(buffer: &[u8]) -> Decoded {
    let mut start = 0;
    while let Some(offset) = buffer[start..].iter().position(|&b| b == FRAME_TERMINATOR) {
        let end = start + offset;
        let payload = trim(&buffer[start..end]);
        if payload.is_empty() {
            start = end + 1;
            continue;
        }
        return Decoded::Frame {
            status: parse_payload(payload),
            consumed: end + 1,
        };
    }
    Decoded::Incomplete
}

fn parse_payload(payload: &[u8]) -> PinStatus {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => return PinStatus::degraded("", format!("Invalid UTF-8 in status frame: {}", e)),
    };

    // Derived struct deserialization also accepts sequences; only objects are frames.
    let parsed = match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => serde_json::from_value::<PinStatus>(value),
        Ok(other) => {
            log::debug!("Status frame is not an object: {:?}", text);
            return PinStatus::degraded(
                "",
                format!("Malformed status frame: expected a JSON object, got {}", kind(&other)),
            );
        }
        Err(e) => Err(e),
    };

    match parsed {
        Ok(mut status) => {
            if status.error.as_deref().is_some_and(|e| e.trim().is_empty()) {
                status.error = None;
            }
            status
        }
        Err(e) => {
            log::debug!("Unparsable status frame {:?}: {}", text, e);
            PinStatus::degraded("", format!("Malformed status frame: {}", e))
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
