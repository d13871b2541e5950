//! In-memory transport for tests and dry runs.
//!
//! [`MockTransport`] is a cheap handle onto shared state: clone it before
//! handing it to a session and keep the clone to inspect what was written.
//! Replies come from a FIFO of scripted chunks and from a table of
//! command → reply pairs that fire when a matching line is written.

use super::{ConnectionParams, Connector, Transport};
use crate::error::{AppResult, LabError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
enum Scripted {
    Bytes(Vec<u8>),
    Fail(String),
}

#[derive(Debug, Default)]
struct MockState {
    written: Vec<u8>,
    pending_line: Vec<u8>,
    replies: VecDeque<Scripted>,
    responses: HashMap<String, Vec<u8>>,
    write_error: Option<String>,
    closed: bool,
    writes: usize,
    reads: usize,
}

/// Scripted transport with shared, inspectable state.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a chunk that the next read returns.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.state().replies.push_back(Scripted::Bytes(bytes.to_vec()));
    }

    /// Queue an I/O failure for the next read.
    pub fn push_read_error(&self, message: &str) {
        self.state()
            .replies
            .push_back(Scripted::Fail(message.to_string()));
    }

    /// Reply with `reply` every time the line `command` is written.
    pub fn respond_to(&self, command: &str, reply: &str) {
        self.state()
            .responses
            .insert(command.to_string(), reply.as_bytes().to_vec());
    }

    /// Make every following write fail with an I/O error.
    pub fn fail_writes(&self, message: &str) {
        self.state().write_error = Some(message.to_string());
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Everything written so far, as text.
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.state().written).into_owned()
    }

    /// Number of `write_bytes` calls.
    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    /// Number of `read_bytes` calls.
    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let mut state = self.state();
        state.writes += 1;
        if state.closed {
            return Err(LabError::NotConnected("mock".to_string()));
        }
        if let Some(message) = &state.write_error {
            return Err(LabError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                message.clone(),
            )));
        }

        state.written.extend_from_slice(bytes);
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut state.pending_line);
                let command = String::from_utf8_lossy(&line).trim().to_string();
                if let Some(reply) = state.responses.get(&command).cloned() {
                    state.replies.push_back(Scripted::Bytes(reply));
                }
            } else {
                state.pending_line.push(byte);
            }
        }
        Ok(())
    }

    async fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        let next = {
            let mut state = self.state();
            state.reads += 1;
            if state.closed {
                return Err(LabError::NotConnected("mock".to_string()));
            }
            state.replies.pop_front()
        };

        match next {
            Some(Scripted::Bytes(mut bytes)) => {
                let max_len = max_len.max(1);
                if bytes.len() > max_len {
                    let rest = bytes.split_off(max_len);
                    self.state().replies.push_front(Scripted::Bytes(rest));
                }
                Ok(bytes)
            }
            Some(Scripted::Fail(message)) => Err(LabError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                message,
            ))),
            None => {
                tokio::time::sleep(timeout).await;
                Err(LabError::timeout("reading from mock", timeout))
            }
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        self.state().closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Connector that hands out clones of one [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockConnector {
    transport: MockTransport,
    open_error: Mutex<Option<String>>,
    opened: Mutex<Vec<ConnectionParams>>,
}

impl MockConnector {
    /// Connector serving `transport`.
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    /// Connector whose every open fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            open_error: Mutex::new(Some(message.to_string())),
            ..Self::default()
        }
    }

    /// Let subsequent opens succeed.
    pub fn clear_failure(&self) {
        if let Ok(mut err) = self.open_error.lock() {
            *err = None;
        }
    }

    /// Parameters of every open attempt, successful or not.
    pub fn opened(&self) -> Vec<ConnectionParams> {
        self.opened
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, params: &ConnectionParams) -> AppResult<Box<dyn Transport>> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(params.clone());
        }
        let failure = self.open_error.lock().ok().and_then(|e| e.clone());
        match failure {
            Some(message) => Err(LabError::Transport(message)),
            None => Ok(Box::new(self.transport.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_respond_to_fires_on_complete_line() {
        let mock = MockTransport::new();
        mock.respond_to("*IDN?", "ACME,DMM,1,2\n");
        let mut transport = mock.clone();

        transport.write_bytes(b"*ID").await.unwrap();
        transport.write_bytes(b"N?\r\n").await.unwrap();
        let reply = transport
            .read_bytes(64, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reply, b"ACME,DMM,1,2\n".to_vec());
        assert_eq!(mock.written_text(), "*IDN?\r\n");
        assert_eq!(mock.write_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue_times_out() {
        let mut transport = MockTransport::new();
        let err = transport
            .read_bytes(8, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_failing_connector() {
        let connector = MockConnector::failing("no route to host");
        let params = ConnectionParams::Network {
            host: "10.0.0.1".to_string(),
        };
        let err = connector.open(&params).await.err().unwrap();
        assert!(err.to_string().contains("no route to host"));
        assert_eq!(connector.opened(), vec![params]);
    }
}
