// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Serial port enumeration and device selection.
//!
//! The dimmer is located by a substring of the port description (usually
//! the USB product name) and/or of the USB serial number. A serial number
//! match, when it finds anything, takes priority over a name match.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_serial::SerialPortType;

/// A serial port as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Human-readable description, e.g. "USB-Enhanced-SERIAL CH9102 (/dev/ttyACM0)"
    pub description: String,
    /// USB serial number, if the port is a USB device that reports one
    pub serial_number: Option<String>,
    /// Identifier passed to the serial driver, e.g. "/dev/ttyACM0"
    pub device: String,
}

/// Criteria used to pick the dimmer out of the port list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    pub name: Option<String>,
    pub serial: Option<String>,
}

impl PortFilter {
    pub fn new(name: Option<String>, serial: Option<String>) -> Self {
        Self {
            name: name.filter(|s| !s.is_empty()),
            serial: serial.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.serial.is_none()
    }
}

/// Select at most one port from `ports`.
pub fn resolve<'a>(ports: &'a [PortInfo], filter: &PortFilter) -> Option<&'a PortInfo> {
    let mut matches: Vec<&PortInfo> = Vec::new();

    if let Some(name) = filter.name.as_deref().filter(|s| !s.is_empty()) {
        matches = ports.iter().filter(|p| p.description.contains(name)).collect();
    }

    if let Some(serial) = filter.serial.as_deref().filter(|s| !s.is_empty()) {
        let by_serial: Vec<&PortInfo> = ports
            .iter()
            .filter(|p| p.serial_number.as_deref().is_some_and(|sn| sn.contains(serial)))
            .collect();
        if !by_serial.is_empty() {
            matches = by_serial;
        }
    }

    matches.into_iter().next()
}

/// Source of the current serial port list.
#[async_trait]
pub trait PortEnumerator: Send + Sync {
    async fn list(&self) -> Result<Vec<PortInfo>>;
}

/// Ports reported by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl SystemPorts {
    /// Enumerate ports on the calling thread. May block on sysfs/udev.
    pub fn scan() -> Result<Vec<PortInfo>> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    description: match usb.product {
                        Some(product) => format!("{product} ({})", p.port_name),
                        None => p.port_name.clone(),
                    },
                    serial_number: usb.serial_number,
                    device: p.port_name,
                },
                _ => PortInfo {
                    description: p.port_name.clone(),
                    serial_number: None,
                    device: p.port_name,
                },
            })
            .collect())
    }
}

#[async_trait]
impl PortEnumerator for SystemPorts {
    async fn list(&self) -> Result<Vec<PortInfo>> {
        tokio::task::spawn_blocking(Self::scan).await?
    }
}
