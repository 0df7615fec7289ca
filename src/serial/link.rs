//! One physical connection to a device.
//!
//! The background reader task is the only consumer of the byte stream. A
//! caller's `send` registers itself as the pending responder, writes its frame
//! and waits for the reader to hand over the next completed frame. The
//! exchange lock is held for the whole exchange, so at most one request is
//! outstanding per link.
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::interface::{PortOpener, SerialTransport};
use super::protocol::{self, Decoded, PinCommand, PinStatus};
use super::{Result, SerialError};
use crate::device::{Device, DeviceId, LinkState};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64;
pub const DEFAULT_MAX_READ_INCREMENTS: usize = 16;

/// Per-link tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Upper bound on a whole exchange, write included.
    pub response_timeout: Duration,
    /// Bytes requested per read increment.
    pub read_chunk_size: usize,
    /// Reads allowed without a terminator before the frame is declared stalled.
    pub max_read_increments: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_read_increments: DEFAULT_MAX_READ_INCREMENTS,
        }
    }
}

type Responder = oneshot::Sender<Result<PinStatus>>;
type Writer = WriteHalf<Box<dyn SerialTransport>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the link handle and its reader task.
///
/// The port handles live here so that whichever side notices a fault can
/// release them.
struct Shared {
    device_id: DeviceId,
    state: watch::Sender<LinkState>,
    pending: StdMutex<Option<Responder>>,
    writer: StdMutex<Option<Writer>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Apply `next` if the lifecycle allows it from the current state.
    fn transition(&self, next: LinkState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                log::debug!("Link {}: {} -> {}", self.device_id, current, next);
                *current = next;
                applied = true;
                true
            } else {
                if *current != next {
                    log::debug!(
                        "Link {}: ignoring transition {} -> {}",
                        self.device_id,
                        current,
                        next
                    );
                }
                false
            }
        });
        applied
    }

    fn set_pending(&self, responder: Responder) {
        *lock(&self.pending) = Some(responder);
    }

    fn take_pending(&self) -> Option<Responder> {
        lock(&self.pending).take()
    }

    fn deliver(&self, status: PinStatus) {
        match self.take_pending() {
            Some(responder) => {
                let _ = responder.send(Ok(status));
            }
            None => log::debug!(
                "Link {}: no caller waiting, dropping frame: {}",
                self.device_id,
                status
            ),
        }
    }

    fn take_writer(&self) -> Option<Writer> {
        lock(&self.writer).take()
    }

    /// Hand the writer back after an exchange, unless the link left `Connected` meanwhile.
    fn restore_writer(&self, writer: Writer) {
        let mut slot = lock(&self.writer);
        // Checked under the slot lock: a concurrent `release` either ran before
        // the check or waits for this store.
        if self.current() == LinkState::Connected {
            *slot = Some(writer);
        }
    }

    /// Drop the port handles; the stream closes once the reader is gone.
    fn release(&self) {
        let writer = lock(&self.writer).take();
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            reader.abort();
        }
        if writer.is_some() {
            log::debug!("Link {}: port released", self.device_id);
        }
    }

    /// Mark the link faulted, fail whoever is waiting and release the port.
    fn fail(&self, error: SerialError) {
        log::warn!("Link {} faulted: {}", self.device_id, error);
        self.transition(LinkState::Faulted);
        if let Some(responder) = self.take_pending() {
            let _ = responder.send(Err(error));
        }
        self.release();
    }
}

/// Armed while an exchange is on the wire.
///
/// If the `send` future is dropped before the reply is resolved, the device
/// still owes an answer that nobody will claim, so the link is faulted.
struct Exchange<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> Exchange<'a> {
    fn arm(shared: &'a Shared) -> Self {
        Self { shared, armed: true }
    }

    fn finish(mut self, writer: Writer, fault: bool) {
        self.armed = false;
        self.shared.take_pending();
        if fault {
            drop(writer);
            self.shared.transition(LinkState::Faulted);
            self.shared.release();
        } else {
            self.shared.restore_writer(writer);
        }
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!(
                "Link {}: exchange abandoned before its reply, stream presumed desynchronized",
                self.shared.device_id
            );
            self.shared.take_pending();
            self.shared.transition(LinkState::Faulted);
            self.shared.release();
        }
    }
}

pub struct SerialLink {
    device: Device,
    last_seen: StdMutex<DateTime<Utc>>,
    config: LinkConfig,
    shared: Arc<Shared>,
    /// Serializes exchanges and lifecycle changes.
    exchange: Mutex<()>,
}

impl SerialLink {
    pub fn new(device: Device, config: LinkConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Unconnected);
        let shared = Arc::new(Shared {
            device_id: device.id.clone(),
            state,
            pending: StdMutex::new(None),
            writer: StdMutex::new(None),
            reader: StdMutex::new(None),
        });
        Self {
            last_seen: StdMutex::new(device.last_seen),
            device,
            config,
            shared,
            exchange: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.device.id
    }

    /// Snapshot of the device metadata.
    pub fn device(&self) -> Device {
        Device {
            last_seen: self.last_seen(),
            ..self.device.clone()
        }
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *lock(&self.last_seen)
    }

    /// Record that discovery saw the device again.
    pub fn touch(&self) {
        *lock(&self.last_seen) = Utc::now();
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.shared.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Open the device's port and start the reader.
    pub async fn connect(&self, opener: &dyn PortOpener) -> Result<()> {
        let _turn = self.exchange.lock().await;
        self.begin_connect()?;

        match opener.open(&self.device).await {
            Ok(stream) => {
                self.start(stream);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to connect to {}: {}", self.device.port_name, e);
                self.shared.transition(LinkState::Faulted);
                self.shared.transition(LinkState::Unconnected);
                Err(e)
            }
        }
    }

    /// Run the link over an already open stream.
    pub async fn attach<T: SerialTransport>(&self, stream: T) -> Result<()> {
        let _turn = self.exchange.lock().await;
        self.begin_connect()?;
        self.start(Box::new(stream));
        Ok(())
    }

    fn begin_connect(&self) -> Result<()> {
        if self.shared.transition(LinkState::Connecting) {
            Ok(())
        } else {
            Err(SerialError::InvalidState(format!(
                "cannot connect {} while {}",
                self.device.id,
                self.state()
            )))
        }
    }

    fn start(&self, stream: Box<dyn SerialTransport>) {
        let (reader, writer) = tokio::io::split(stream);
        *lock(&self.shared.writer) = Some(writer);
        self.shared.transition(LinkState::Connected);
        let handle = tokio::spawn(read_loop(self.shared.clone(), reader, self.config));
        *lock(&self.shared.reader) = Some(handle);
        log::info!(
            "Connected to {} at {} baud",
            self.device.port_name,
            self.device.baud_rate
        );
    }

    /// Send one command and wait for the device's reply.
    ///
    /// Concurrent callers queue on the exchange lock. A write error, timeout
    /// or framing error leaves the link `Faulted`, and so does dropping the
    /// returned future before it resolves.
    pub async fn send(&self, command: &PinCommand) -> Result<PinStatus> {
        let frame = protocol::encode(command)?;

        let _turn = self.exchange.lock().await;
        let (tx, rx) = oneshot::channel();
        // Registered before the write so a fast reply cannot slip past. A
        // reader fault after this point answers it with an error.
        self.shared.set_pending(tx);
        if self.state() != LinkState::Connected {
            self.shared.take_pending();
            // Release whatever a faulted reader left behind.
            self.shared.release();
            return Err(SerialError::NotConnected);
        }
        let Some(mut writer) = self.shared.take_writer() else {
            self.shared.take_pending();
            return Err(SerialError::NotConnected);
        };

        let exchange = Exchange::arm(&self.shared);
        let mut state_rx = self.shared.state.subscribe();
        let device_id = &self.device.id;
        let wire = async {
            log::trace!("Link {} => {}", device_id, hex::encode(&frame));
            writer.write_all(&frame).await.map_err(SerialError::Write)?;
            writer.flush().await.map_err(SerialError::Write)?;
            rx.await.unwrap_or(Err(SerialError::Closed))
        };

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.config.response_timeout, wire) => {
                outcome.unwrap_or(Err(SerialError::Timeout))
            }
            _ = state_rx.wait_for(|s| *s == LinkState::Closing) => Err(SerialError::Closed),
        };

        let fault = matches!(&outcome, Err(e) if e.is_link_fault());
        if matches!(outcome, Err(SerialError::Timeout)) {
            log::warn!(
                "Link {}: no reply within {:?}, stream presumed desynchronized",
                self.device.id,
                self.config.response_timeout
            );
        }
        exchange.finish(writer, fault);
        outcome
    }

    /// Close the link, releasing the port even if an exchange is in flight.
    pub async fn close(&self) {
        self.shared.transition(LinkState::Closing);
        if let Some(responder) = self.shared.take_pending() {
            let _ = responder.send(Err(SerialError::Closed));
        }

        let _turn = self.exchange.lock().await;
        // A connect may have completed while we waited for the lock.
        self.shared.transition(LinkState::Closing);
        if let Some(mut writer) = self.shared.take_writer() {
            let _ = writer.shutdown().await;
        }
        self.shared.release();
        if self.shared.transition(LinkState::Unconnected) {
            log::info!("Closed link to {}", self.device.port_name);
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.shared.release();
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<Box<dyn SerialTransport>>,
    config: LinkConfig,
) {
    // The device's accumulation buffer; only this task touches it.
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; config.read_chunk_size.max(1)];
    let mut increments = 0usize;

    let failure = loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                break SerialError::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "serial stream closed",
                ))
            }
            Ok(n) => n,
            Err(e) => break SerialError::IoError(e),
        };
        buffer.extend_from_slice(&chunk[..n]);
        increments += 1;

        while let Decoded::Frame { mut status, consumed } = protocol::try_decode(&buffer) {
            log::trace!(
                "Link {} <= {}",
                shared.device_id,
                hex::encode(&buffer[..consumed])
            );
            buffer.drain(..consumed);
            increments = 0;
            if status.device.is_empty() {
                status.device = shared.device_id.to_string();
            }
            shared.deliver(status);
        }

        if buffer.iter().all(u8::is_ascii_whitespace) {
            buffer.clear();
            increments = 0;
        } else if increments > config.max_read_increments {
            break SerialError::Framing(format!(
                "no frame terminator after {} reads ({} bytes buffered)",
                increments,
                buffer.len()
            ));
        }
    };

    buffer.clear();
    // Drop the read half before releasing so the stream closes with the writer.
    drop(reader);
    shared.fail(failure);
}
