// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Dimmer device link.
//!
//! [`DeviceLink`] is what the controller drives. [`SerialDimmer`] implements
//! it over a serial console that speaks a line protocol:
//!
//! ```text
//! -> Dimmer
//! <- 12:00:01.123 RSL: RESULT = {"POWER":"ON","Dimmer":40}
//! -> Dimmer 55
//! <- 12:00:02.241 RSL: RESULT = {"POWER":"ON","Dimmer":55}
//! ```
//!
//! Transport errors never propagate: they drop the stream, the link reports
//! disconnected, and the controller reconnects on its next tick.

use crate::config::DeviceConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Time the device gets to process a command before we read its answer.
const COMMAND_SETTLE: Duration = Duration::from_millis(100);

/// Upper bound on lines consumed while waiting for a result, so a chatty
/// console can't keep a read going forever.
const MAX_RESULT_LINES: usize = 32;

/// A connected (or connectable) dimmer.
#[async_trait]
pub trait DeviceLink: Send {
    /// Open the link. Returns true if already or newly connected.
    async fn connect(&mut self) -> bool;

    /// Close the link. No-op when already closed.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Duty currently reported by the device, or `None` on failure/timeout.
    async fn read_duty(&mut self) -> Option<u8>;

    /// Send a new duty. Returns whether the command was delivered.
    async fn write_duty(&mut self, value: u8) -> bool;

    fn port(&self) -> &str;

    /// Point the link at a different port for the next `connect`.
    fn set_port(&mut self, port: String);
}

/// Extract `field` from a `... RESULT = {json}` console line.
pub fn parse_result(line: &str, field: &str) -> Option<u8> {
    let (_, json) = line.split_once("RESULT = ")?;
    let value: serde_json::Value = serde_json::from_str(json.trim()).ok()?;
    let duty = value.get(field)?.as_u64()?;
    Some(duty.min(100) as u8)
}

/// Dimmer on a serial port.
pub struct SerialDimmer {
    port: String,
    baud_rate: u32,
    timeout: Duration,
    command: String,
    stream: Option<BufReader<SerialStream>>,
}

impl SerialDimmer {
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration, command: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
            command: command.into(),
            stream: None,
        }
    }

    pub fn from_config(cfg: &DeviceConfig) -> Self {
        Self::new(
            cfg.port.clone(),
            cfg.baud_rate,
            Duration::from_millis(cfg.timeout_ms),
            cfg.command.clone(),
        )
    }

    fn reset(&mut self) {
        if self.stream.take().is_some() {
            log::warn!("Lost connection to {}", self.port);
        }
    }

    async fn send_command(&mut self, command: &str) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        log::trace!("{} -> {command}", self.port);
        let line = format!("{command}\n");
        let result = time::timeout(self.timeout, async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                time::sleep(COMMAND_SETTLE).await;
                true
            }
            Ok(Err(e)) => {
                log::error!("Error sending '{command}' to {}: {e}", self.port);
                self.reset();
                false
            }
            Err(_) => {
                log::error!("Timed out sending '{command}' to {}", self.port);
                self.reset();
                false
            }
        }
    }

    /// Read lines until one carries a result for our command. A quiet line
    /// (read timeout) ends the wait without error.
    async fn read_result(&mut self) -> Option<u8> {
        let mut buf = Vec::new();

        for _ in 0..MAX_RESULT_LINES {
            let stream = self.stream.as_mut()?;
            buf.clear();

            match time::timeout(self.timeout, stream.read_until(b'\n', &mut buf)).await {
                Err(_) => return None,
                Ok(Ok(0)) => {
                    self.reset();
                    return None;
                }
                Ok(Ok(_)) => {
                    let line = String::from_utf8_lossy(&buf);
                    log::trace!("{} <- {}", self.port, line.trim_end());
                    if let Some(value) = parse_result(&line, &self.command) {
                        return Some(value);
                    }
                }
                Ok(Err(e)) => {
                    log::error!("Error reading from {}: {e}", self.port);
                    self.reset();
                    return None;
                }
            }
        }

        None
    }
}

#[async_trait]
impl DeviceLink for SerialDimmer {
    async fn connect(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }

        let opened = tokio_serial::new(self.port.as_str(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async();

        match opened {
            Ok(stream) => {
                log::info!("Connected to {}", self.port);
                self.stream = Some(BufReader::new(stream));
                true
            }
            Err(e) => {
                log::debug!("Unable to connect to {}: {e}", self.port);
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            log::info!("Disconnected from {}", self.port);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_duty(&mut self) -> Option<u8> {
        if !self.is_connected() {
            return None;
        }

        let command = self.command.clone();
        if !self.send_command(&command).await {
            return None;
        }
        self.read_result().await
    }

    async fn write_duty(&mut self, value: u8) -> bool {
        if !self.is_connected() {
            log::debug!("Not connected, dropping write of {value}");
            return false;
        }

        let command = format!("{} {value}", self.command);
        if !self.send_command(&command).await {
            return false;
        }

        // Consume the echo so it isn't mistaken for the answer to the next query.
        match self.read_result().await {
            Some(echo) if echo != value => {
                log::debug!("{} reports {echo} after writing {value}", self.port);
            }
            _ => {}
        }
        true
    }

    fn port(&self) -> &str {
        &self.port
    }

    fn set_port(&mut self, port: String) {
        self.port = port;
    }
}
