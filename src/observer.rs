//! Injected diagnostics for sessions and buses.
//!
//! Components receive an [`IoObserver`] at construction instead of consulting
//! a process-wide debug switch. The default [`TracingObserver`] forwards every
//! event to `tracing`; [`RecordingObserver`] keeps them in memory so tests can
//! assert on the exact traffic.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One observable step of instrument or bus traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// A transport was opened for `target`.
    Connected {
        /// Instrument identifier
        target: String,
    },
    /// The transport for `target` was dropped.
    Disconnected {
        /// Instrument identifier
        target: String,
        /// Why the transport was dropped
        reason: String,
    },
    /// A command line was written.
    CommandSent {
        /// Instrument identifier
        target: String,
        /// Command without terminator
        command: String,
    },
    /// A reply to `command` was received.
    ReplyReceived {
        /// Instrument identifier
        target: String,
        /// Command that was answered
        command: String,
        /// Trimmed reply
        reply: String,
    },
    /// A register write cycle completed.
    BusWrite {
        /// 7-bit slave address
        slave: u8,
        /// Register address
        address: u32,
        /// Data bytes written
        data: Vec<u8>,
        /// Whether the combined single-frame path was used
        fast: bool,
    },
    /// A register read cycle completed.
    BusRead {
        /// 7-bit slave address
        slave: u8,
        /// Register address
        address: u32,
        /// Data bytes read
        data: Vec<u8>,
        /// Whether the combined single-frame path was used
        fast: bool,
    },
    /// An operation failed.
    Failure {
        /// Instrument identifier or bus description
        target: String,
        /// Operation that failed
        operation: String,
        /// Rendered error
        error: String,
    },
}

/// Sink for [`IoEvent`]s.
pub trait IoObserver: Send + Sync {
    /// Called once per event, in program order.
    fn on_event(&self, event: &IoEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl IoObserver for TracingObserver {
    fn on_event(&self, event: &IoEvent) {
        match event {
            IoEvent::Connected { target } => info!(instrument = %target, "Instrument connected"),
            IoEvent::Disconnected { target, reason } => {
                info!(instrument = %target, reason = %reason, "Instrument disconnected")
            }
            IoEvent::CommandSent { target, command } => {
                debug!(instrument = %target, command = %command, "Command sent")
            }
            IoEvent::ReplyReceived {
                target,
                command,
                reply,
            } => debug!(instrument = %target, command = %command, reply = %reply, "Reply received"),
            IoEvent::BusWrite {
                slave,
                address,
                data,
                fast,
            } => debug!(
                slave = *slave,
                address = *address,
                data = ?data,
                fast = *fast,
                "Register write"
            ),
            IoEvent::BusRead {
                slave,
                address,
                data,
                fast,
            } => debug!(
                slave = *slave,
                address = *address,
                data = ?data,
                fast = *fast,
                "Register read"
            ),
            IoEvent::Failure {
                target,
                operation,
                error,
            } => warn!(instrument = %target, operation = %operation, error = %error, "Operation failed"),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl IoObserver for NullObserver {
    fn on_event(&self, _event: &IoEvent) {}
}

/// An event with the time it was observed.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Observation time
    pub at: DateTime<Utc>,
    /// The event itself
    pub event: IoEvent,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, oldest first.
    pub fn events(&self) -> Vec<IoEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().map(|r| r.event.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|r| r.event.clone()).collect(),
        }
    }

    /// Snapshot including timestamps.
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl IoObserver for RecordingObserver {
    fn on_event(&self, event: &IoEvent) {
        let record = RecordedEvent {
            at: Utc::now(),
            event: event.clone(),
        };
        match self.events.lock() {
            Ok(mut events) => events.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Shared handle to an observer.
pub type SharedObserver = Arc<dyn IoObserver>;

/// The observer used when the caller does not supply one.
pub fn default_observer() -> SharedObserver {
    Arc::new(TracingObserver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        observer.on_event(&IoEvent::Connected {
            target: "GPIB:2".into(),
        });
        observer.on_event(&IoEvent::CommandSent {
            target: "GPIB:2".into(),
            command: "*RST".into(),
        });

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], IoEvent::Connected { .. }));
        assert!(matches!(events[1], IoEvent::CommandSent { .. }));

        let recorded = observer.recorded();
        assert!(recorded[0].at <= recorded[1].at);
    }
}
