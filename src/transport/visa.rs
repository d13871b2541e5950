//! VISA transport for GPIB/USB/VXI-11 instruments
//!
//! Wraps the visa-rs crate. VISA calls are blocking, so they run on Tokio's
//! blocking thread pool. Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::inst0::INSTR" (VXI-11)
//!
//! A read that outlives the async timeout keeps running on its blocking
//! thread until VISA's own I/O timeout fires.

use super::Transport;
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use visa_rs::prelude::*;

/// Resource manager and the instrument opened from it. The manager must
/// outlive the instrument session.
struct VisaSession {
    _rm: DefaultRM,
    instrument: Instrument,
}

/// VISA transport.
pub struct VisaTransport {
    resource: String,
    session: Option<Arc<Mutex<VisaSession>>>,
}

fn visa_error(context: &str, resource: &str, err: impl std::fmt::Display) -> LabError {
    LabError::Transport(format!("{} '{}': {}", context, resource, err))
}

fn resource_id(resource: &str) -> AppResult<VisaString> {
    let c_string = CString::new(resource)
        .map_err(|e| visa_error("Invalid VISA resource string", resource, e))?;
    Ok(VisaString::from(c_string))
}

impl VisaTransport {
    /// Open `resource`, giving up after `timeout`.
    pub async fn open(resource: String, timeout: Duration) -> AppResult<Self> {
        let res = resource.clone();
        let open = tokio::task::spawn_blocking(move || -> AppResult<VisaSession> {
            let rm = DefaultRM::new()
                .map_err(|e| visa_error("Failed to create VISA resource manager for", &res, e))?;
            let id = resource_id(&res)?;
            let instrument = rm
                .open(&id, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| visa_error("Failed to open VISA resource", &res, e))?;
            Ok(VisaSession {
                _rm: rm,
                instrument,
            })
        });

        let session = tokio::time::timeout(timeout, open)
            .await
            .map_err(|_| LabError::timeout(format!("opening {}", resource), timeout))?
            .map_err(|e| LabError::Transport(format!("VISA open task panicked: {}", e)))??;

        debug!(resource = %resource, "VISA resource opened");
        Ok(Self {
            resource,
            session: Some(Arc::new(Mutex::new(session))),
        })
    }

    fn session(&self) -> AppResult<Arc<Mutex<VisaSession>>> {
        self.session
            .clone()
            .ok_or_else(|| LabError::NotConnected(self.resource.clone()))
    }
}

fn lock(session: &Mutex<VisaSession>) -> std::sync::MutexGuard<'_, VisaSession> {
    match session.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl Transport for VisaTransport {
    async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let session = self.session()?;
        let data = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> AppResult<()> {
            let mut guard = lock(&session);
            guard.instrument.write_all(&data)?;
            guard.instrument.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| LabError::Transport(format!("VISA write task panicked: {}", e)))?
    }

    async fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        let session = self.session()?;
        let read = tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
            let mut guard = lock(&session);
            let mut buf = vec![0u8; max_len.max(1)];
            let n = guard.instrument.read(&mut buf)?;
            buf.truncate(n);
            Ok(buf)
        });

        let data = tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| LabError::timeout(format!("reading from {}", self.resource), timeout))?
            .map_err(|e| LabError::Transport(format!("VISA read task panicked: {}", e)))??;

        if data.is_empty() {
            return Err(LabError::timeout(
                format!("reading from {}", self.resource),
                timeout,
            ));
        }
        Ok(data)
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.session.take().is_some() {
            debug!(resource = %self.resource, "VISA resource closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.resource.clone()
    }
}

/// Resource strings the VISA library can currently see.
pub fn list_resources() -> AppResult<Vec<String>> {
    let rm = DefaultRM::new()
        .map_err(|e| visa_error("Failed to create VISA resource manager for", "?*INSTR", e))?;
    let expr = resource_id("?*INSTR")?;
    let mut list = rm
        .find_res_list(&expr)
        .map_err(|e| visa_error("VISA resource search failed for", "?*INSTR", e))?;

    let mut found = Vec::new();
    while let Some(res) = list
        .find_next()
        .map_err(|e| visa_error("VISA resource search failed for", "?*INSTR", e))?
    {
        found.push(res.to_string());
    }
    Ok(found)
}
