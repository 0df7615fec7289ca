use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::RwLock;

use super::{Device, DeviceError, DeviceId, DeviceScanner, LinkState, Result};
use crate::config::BridgeConfig;
use crate::history::{HistoryStore, StatusRecord};
use crate::serial::{
    interface, validate, PinCommand, PinStatus, PortOpener, SerialLink, SerialPortOpener,
};

/// Error text reported when a command reaches no device at all.
pub const NO_DEVICE_ERROR: &str = "Failed to parse serial stream.";

/// Which devices a command is meant for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// Every currently connected device.
    All,
    /// One device by identity, whatever its state.
    Device(DeviceId),
}

/// What happened to a command on one device.
#[derive(Debug)]
pub struct DeviceOutcome {
    /// `None` when no device could be targeted.
    pub device: Option<DeviceId>,
    pub result: Result<PinStatus>,
    /// Dispatch timestamp shared by every outcome of one submission.
    pub time: DateTime<Utc>,
}

impl DeviceOutcome {
    /// The reported status, or a synthesized error status on failure.
    pub fn status(&self) -> PinStatus {
        match &self.result {
            Ok(status) => status.clone(),
            Err(DeviceError::NoConnectedDevices) => PinStatus::degraded("", NO_DEVICE_ERROR),
            Err(e) => {
                let device = self.device.as_ref().map(|d| d.to_string()).unwrap_or_default();
                PinStatus::degraded(device, e.to_string())
            }
        }
    }

    pub fn record(&self) -> StatusRecord {
        StatusRecord::new(self.device.clone(), self.status(), self.time)
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Entry point for pin commands: owns the device set and the status history.
pub struct Dispatcher {
    links: RwLock<HashMap<DeviceId, Arc<SerialLink>>>,
    history: Arc<HistoryStore>,
    scanner: DeviceScanner,
    opener: Arc<dyn PortOpener>,
    config: BridgeConfig,
}

impl Dispatcher {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialPortOpener))
    }

    pub fn with_opener(config: BridgeConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            history: Arc::new(HistoryStore::new(config.history_capacity)),
            scanner: DeviceScanner::new(config.dev_dir.clone(), config.name_patterns.clone()),
            opener,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        self.history.clone()
    }

    /// Scan for microcontrollers and register the ones not yet known.
    ///
    /// Known devices keep their link and state and have `last_seen` refreshed.
    /// Returns the newly registered ids. Finding nothing is normal; the caller
    /// retries on its own schedule.
    pub async fn discover_devices(&self) -> Vec<DeviceId> {
        let candidates: Vec<DeviceId> = self
            .scanner
            .discover()
            .map(|p| DeviceId::from(p.as_path()))
            .collect();

        let unknown = {
            let links = self.links.read().await;
            candidates.iter().any(|id| !links.contains_key(id))
        };
        // Enumerated before taking the write lock; the OS query can block.
        let usb_ports = if unknown {
            interface::usb_ports().unwrap_or_else(|e| {
                log::debug!("Could not enumerate serial ports: {}", e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        let mut links = self.links.write().await;
        // Idle entries whose endpoint vanished are dropped; live links stay.
        links.retain(|id, link| {
            let keep = candidates.contains(id) || link.state() != LinkState::Unconnected;
            if !keep {
                log::info!("Device {} is no longer present", id);
            }
            keep
        });

        if candidates.is_empty() {
            log::debug!(
                "No microcontrollers found in {}",
                self.scanner.dev_dir().display()
            );
            return Vec::new();
        }

        let mut added = Vec::new();
        for id in candidates {
            if let Some(link) = links.get(&id) {
                link.touch();
                continue;
            }
            let port_name = id.to_string();
            log::info!("Found microcontroller: {}", port_name);
            let device = Device::new(port_name.as_str(), self.config.baud_rate)
                .with_usb(usb_ports.get(&port_name).cloned());
            let link = SerialLink::new(device, self.config.link_config());
            links.insert(id.clone(), Arc::new(link));
            added.push(id);
        }
        added
    }

    /// Add an externally built link, replacing any link with the same id.
    pub async fn register_link(&self, link: Arc<SerialLink>) {
        let mut links = self.links.write().await;
        if let Some(previous) = links.insert(link.id().clone(), link) {
            log::debug!("Replaced link for {}", previous.id());
        }
    }

    pub async fn link(&self, device_id: &DeviceId) -> Option<Arc<SerialLink>> {
        self.links.read().await.get(device_id).cloned()
    }

    /// All known devices with their current link state.
    pub async fn devices(&self) -> Vec<(Device, LinkState)> {
        let links = self.links.read().await;
        let mut devices: Vec<_> = links.values().map(|l| (l.device(), l.state())).collect();
        devices.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        devices
    }

    pub async fn connect_device(&self, device_id: &DeviceId) -> Result<()> {
        let link = self
            .link(device_id)
            .await
            .ok_or_else(|| DeviceError::NotFound(device_id.clone()))?;
        log::info!(
            "Attempting to connect to {} at {} baud",
            device_id,
            link.device().baud_rate
        );
        link.connect(self.opener.as_ref()).await?;
        Ok(())
    }

    /// Connect every device currently `Unconnected`.
    pub async fn connect_all(&self) -> Vec<(DeviceId, Result<()>)> {
        let idle: Vec<_> = {
            let links = self.links.read().await;
            links
                .values()
                .filter(|l| l.state() == LinkState::Unconnected)
                .cloned()
                .collect()
        };

        let mut results = Vec::with_capacity(idle.len());
        for link in idle {
            let result = link
                .connect(self.opener.as_ref())
                .await
                .map_err(DeviceError::from);
            results.push((link.id().clone(), result));
        }
        results
    }

    pub async fn disconnect_device(&self, device_id: &DeviceId) -> Result<()> {
        let link = self
            .link(device_id)
            .await
            .ok_or_else(|| DeviceError::NotFound(device_id.clone()))?;
        link.close().await;
        Ok(())
    }

    /// Release faulted links and forget them so discovery can find them again.
    pub async fn reap_faulted(&self) -> Vec<DeviceId> {
        let faulted: Vec<_> = {
            let mut links = self.links.write().await;
            let ids: Vec<_> = links
                .iter()
                .filter(|(_, l)| l.state() == LinkState::Faulted)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| links.remove(id)).collect()
        };

        let mut removed = Vec::with_capacity(faulted.len());
        for link in faulted {
            link.close().await;
            log::info!("Removed faulted device: {}", link.id());
            removed.push(link.id().clone());
        }
        removed
    }

    /// Close every link.
    pub async fn shutdown(&self) {
        let links: Vec<_> = self.links.read().await.values().cloned().collect();
        for link in links {
            link.close().await;
        }
    }

    /// Validate a command and send it to every targeted device.
    ///
    /// Devices are driven concurrently and each outcome is recorded in the
    /// history as it completes, failures included. With no device to target
    /// a single synthesized error outcome is returned.
    pub async fn submit(
        &self,
        command: PinCommand,
        selector: &TargetSelector,
    ) -> Vec<DeviceOutcome> {
        let time = Utc::now();
        let command = validate(command);

        let targets: Vec<Arc<SerialLink>> = {
            let links = self.links.read().await;
            match selector {
                TargetSelector::All => {
                    links.values().filter(|l| l.is_connected()).cloned().collect()
                }
                TargetSelector::Device(id) => match links.get(id) {
                    Some(link) => vec![link.clone()],
                    None => {
                        return vec![self.finish(DeviceOutcome {
                            device: Some(id.clone()),
                            result: Err(DeviceError::NotFound(id.clone())),
                            time,
                        })];
                    }
                },
            }
        };

        if targets.is_empty() {
            log::warn!("No connected devices for pin {} command", command.number);
            return vec![self.finish(DeviceOutcome {
                device: None,
                result: Err(DeviceError::NoConnectedDevices),
                time,
            })];
        }

        let mut in_flight: FuturesUnordered<_> = targets
            .into_iter()
            .map(|link| async move {
                let result = link.send(&command).await.map_err(DeviceError::from);
                (link.id().clone(), result)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(in_flight.len());
        while let Some((device, result)) = in_flight.next().await {
            outcomes.push(self.finish(DeviceOutcome {
                device: Some(device),
                result,
                time,
            }));
        }
        outcomes
    }

    fn finish(&self, outcome: DeviceOutcome) -> DeviceOutcome {
        match &outcome.result {
            Ok(status) => log::info!("{}", status),
            Err(e) => log::warn!(
                "Command failed on {}: {}",
                outcome.device.as_ref().map_or("<none>", |d| d.as_str()),
                e
            ),
        }
        self.history.append(outcome.record());
        outcome
    }
}
