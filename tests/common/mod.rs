//! Scripted microcontrollers living on the far end of an in-memory stream.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mcu_bridge::device::Device;
use mcu_bridge::serial::{LinkConfig, SerialLink};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

pub const TEST_TIMEOUT: Duration = Duration::from_millis(300);

pub fn test_link_config() -> LinkConfig {
    LinkConfig {
        response_timeout: TEST_TIMEOUT,
        read_chunk_size: 16,
        max_read_increments: 16,
    }
}

pub fn test_link(name: &str) -> Arc<SerialLink> {
    Arc::new(SerialLink::new(Device::new(name, 57600), test_link_config()))
}

/// A connected link plus the device end of its stream.
pub async fn attached_link(name: &str) -> (Arc<SerialLink>, DuplexStream) {
    let (host, device) = tokio::io::duplex(1024);
    let link = test_link(name);
    link.attach(host).await.expect("attach should succeed on a fresh link");
    (link, device)
}

/// Device that answers every command line with the same JSON, after `delay`.
///
/// Resolves to the parsed commands once the host closes the stream.
pub fn spawn_echo_device(stream: DuplexStream, delay: Duration) -> JoinHandle<Vec<Value>> {
    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut seen = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            let command: Value = serde_json::from_str(&line).expect("command frames are JSON");
            seen.push(command.clone());
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if writer.write_all(format!("{}\n", command).as_bytes()).await.is_err() {
                break;
            }
        }
        seen
    })
}

/// Device that reads commands but never answers.
pub fn spawn_silent_device(stream: DuplexStream) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut seen = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            seen.push(line);
        }
        seen
    })
}
