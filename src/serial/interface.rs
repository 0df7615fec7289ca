use std::collections::HashMap;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use super::{Result, SerialError};
use crate::device::{Device, UsbInfo};

/// Any async byte stream a link can run over.
pub trait SerialTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SerialTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens the byte stream behind a discovered device.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, device: &Device) -> Result<Box<dyn SerialTransport>>;
}

/// Opens real serial ports through tokio-serial.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self, device: &Device) -> Result<Box<dyn SerialTransport>> {
        log::info!("Opening {} at {} baud", device.port_name, device.baud_rate);
        let port = tokio_serial::new(device.port_name.as_str(), device.baud_rate)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", device.port_name, e)))?;
        Ok(Box::new(port))
    }
}

/// USB details for every port the OS reports as a USB device, keyed by port name.
pub fn usb_ports() -> Result<HashMap<String, UsbInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .filter_map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => Some((
                p.port_name,
                UsbInfo {
                    vid: usb.vid,
                    pid: usb.pid,
                    serial_number: usb.serial_number,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                },
            )),
            _ => None,
        })
        .collect())
}
