//! Serial transport for RS-232 / virtual COM port devices
//!
//! Wraps the `serialport` crate. Blocking serial calls run on Tokio's
//! blocking thread pool so they never stall the async runtime.

use super::Transport;
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Serial port transport.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// The actual serial port (behind Arc<Mutex> for blocking-task access)
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate`.
    ///
    /// `poll_interval` is the driver-level read timeout; [`Transport::read_bytes`]
    /// keeps polling until its own deadline.
    pub async fn open(port_name: &str, baud_rate: u32, poll_interval: Duration) -> AppResult<Self> {
        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate)
                .timeout(poll_interval)
                .open()
                .map_err(|e| {
                    LabError::Transport(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        name, baud_rate, e
                    ))
                })
        })
        .await
        .map_err(|e| LabError::Transport(format!("Serial open task panicked: {}", e)))??;

        debug!(port = %port_name, baud_rate, "Serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn port(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| LabError::NotConnected(self.port_name.clone()))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let port = self.port()?;
        let data = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> AppResult<()> {
            let mut guard = port.blocking_lock();
            guard.write_all(&data)?;
            guard.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| LabError::Transport(format!("Serial I/O task panicked: {}", e)))?
    }

    async fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        let port = self.port()?;
        let port_name = self.port_name.clone();

        tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
            let mut guard = port.blocking_lock();
            let mut buf = vec![0u8; max_len.max(1)];
            let start = Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(LabError::timeout(
                        format!("reading from serial port {}", port_name),
                        timeout,
                    ));
                }

                match guard.read(&mut buf) {
                    Ok(0) => {
                        return Err(LabError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("Unexpected EOF on {}", port_name),
                        )))
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        return Ok(buf);
                    }
                    // Port timeout is shorter than our overall timeout
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(LabError::Io(e)),
                }
            }
        })
        .await
        .map_err(|e| LabError::Transport(format!("Serial I/O task panicked: {}", e)))?
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.port_name.clone()
    }
}

/// Names of the serial ports the OS currently reports.
pub fn available_ports() -> AppResult<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| LabError::Transport(format!("Cannot enumerate serial ports: {}", e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
