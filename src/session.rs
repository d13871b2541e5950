//! Instrument sessions
//!
//! An [`InstrumentSession`] owns the transport to one instrument and turns
//! text commands into terminated writes and delimited replies. The
//! identifier is resolved when the session is created, so a bad identifier
//! fails before any connection attempt.
//!
//! ## State machine
//!
//! ```text
//! Uninitialized --connect ok--> Connected
//! Uninitialized --connect err-> Disconnected
//! Disconnected  --connect ok--> Connected
//! Connected     --close-------> Disconnected
//! Connected     --fatal error-> Disconnected   (transport dropped)
//! Connected     --timeout-----> Connected      (nothing rolled back)
//! ```
//!
//! Nothing reconnects automatically; call [`InstrumentSession::connect`] again.

use crate::config::Settings;
use crate::error::{AppResult, ErrorClass, LabError};
use crate::observer::{IoEvent, SharedObserver};
use crate::transport::{
    read_until, ConnectionParams, Connector, DiscoveryReport, InstrumentIdentifier, Listing,
    Transport, TransportKind,
};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest reply accepted before giving up on finding a delimiter.
pub const DEFAULT_MAX_REPLY_LEN: usize = 64 * 1024;

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Created, no connection attempted yet
    Uninitialized,
    /// No live transport
    Disconnected,
    /// Transport open and usable
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Framing and timing for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Upper bound on waiting for a complete reply
    pub timeout: Duration,
    /// Appended to every command
    pub line_terminator: String,
    /// Ends a reply
    pub response_delimiter: u8,
    /// Longest accepted reply
    pub max_reply_len: usize,
}

impl SessionSettings {
    /// Settings for an instrument of `kind`.
    pub fn for_kind(kind: TransportKind, settings: &Settings) -> Self {
        let (terminator, delimiter) = match kind {
            TransportKind::Network => (
                &settings.network.line_terminator,
                settings.network.response_delimiter,
            ),
            TransportKind::Gpib | TransportKind::Usb => (
                &settings.visa.line_terminator,
                settings.visa.response_delimiter,
            ),
            TransportKind::Serial => (
                &settings.serial.line_terminator,
                settings.serial.response_delimiter,
            ),
        };

        Self {
            timeout: settings.timeouts.query_timeout(),
            line_terminator: terminator.clone(),
            response_delimiter: u8::try_from(delimiter).unwrap_or(b'\n'),
            max_reply_len: DEFAULT_MAX_REPLY_LEN,
        }
    }
}

/// Text command interface shared by every instrument driver.
#[async_trait]
pub trait CommandChannel: Send {
    /// Send a command that produces no reply.
    async fn send(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and return its trimmed reply.
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// `*IDN?`
    async fn identify(&mut self) -> AppResult<String> {
        self.query("*IDN?").await
    }

    /// `*RST`
    async fn reset(&mut self) -> AppResult<()> {
        self.send("*RST").await
    }

    /// `*CLS`
    async fn clear_status(&mut self) -> AppResult<()> {
        self.send("*CLS").await
    }
}

/// Connection to one instrument.
pub struct InstrumentSession {
    identifier: InstrumentIdentifier,
    settings: SessionSettings,
    transport: Option<Box<dyn Transport>>,
    /// Bytes received after the last delimiter
    pending: BytesMut,
    state: SessionState,
    observer: SharedObserver,
}

impl fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("identifier", &self.identifier)
            .field("state", &self.state)
            .field("settings", &self.settings)
            .finish()
    }
}

impl InstrumentSession {
    /// Resolve `identifier` and prepare an unconnected session.
    ///
    /// Fails with a configuration error if the identifier is not recognized.
    pub fn new(identifier: &str, settings: &Settings, observer: SharedObserver) -> AppResult<Self> {
        let identifier = InstrumentIdentifier::parse(identifier)?;
        let session_settings = SessionSettings::for_kind(identifier.kind(), settings);
        debug!(
            instrument = %identifier,
            params = %identifier.params(),
            "Session created"
        );
        Ok(Self {
            identifier,
            settings: session_settings,
            transport: None,
            pending: BytesMut::new(),
            state: SessionState::Uninitialized,
            observer,
        })
    }

    /// Override the framing and timing derived from configuration.
    pub fn with_session_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The resolved identifier.
    pub fn identifier(&self) -> &InstrumentIdentifier {
        &self.identifier
    }

    /// Connection parameters derived from the identifier.
    pub fn params(&self) -> &ConnectionParams {
        self.identifier.params()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True while a transport is open.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Framing and timing in effect.
    pub fn session_settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Report whether discovery saw this instrument.
    ///
    /// Only logs a warning when it did not; LAN instruments in particular are
    /// often reachable without being listed.
    pub fn check_listing(&self, report: &DiscoveryReport, settings: &Settings) -> Listing {
        let listing = report.locate(self.params(), settings);
        if listing == Listing::NotListed {
            warn!(
                instrument = %self.identifier,
                resource = %self.params().visa_resource(),
                "Instrument not found by discovery; connecting anyway"
            );
        }
        listing
    }

    /// Open the transport.
    ///
    /// On failure the session is `Disconnected` and the error is returned.
    /// Connecting an already connected session does nothing.
    pub async fn connect(&mut self, connector: &dyn Connector) -> AppResult<()> {
        if self.is_connected() {
            debug!(instrument = %self.identifier, "Already connected");
            return Ok(());
        }

        match connector.open(self.identifier.params()).await {
            Ok(transport) => {
                debug!(instrument = %self.identifier, transport = %transport.describe(), "Transport opened");
                self.transport = Some(transport);
                self.pending.clear();
                self.state = SessionState::Connected;
                self.observer.on_event(&IoEvent::Connected {
                    target: self.identifier.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                self.observer.on_event(&IoEvent::Failure {
                    target: self.identifier.to_string(),
                    operation: "connect".to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Write `command` followed by the line terminator.
    ///
    /// If the write fails midway, bytes already sent stay sent.
    pub async fn send(&mut self, command: &str) -> AppResult<()> {
        let line = format!("{}{}", command, self.settings.line_terminator);
        let transport = self.live_transport()?;

        if let Err(e) = transport.write_bytes(line.as_bytes()).await {
            return Err(self.handle_failure("send", e));
        }
        self.observer.on_event(&IoEvent::CommandSent {
            target: self.identifier.to_string(),
            command: command.to_string(),
        });
        Ok(())
    }

    /// Send `command` and wait for a delimited reply, using the session timeout.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        let timeout = self.settings.timeout;
        self.query_with_timeout(command, timeout).await
    }

    /// Send `command` and wait up to `timeout` for a delimited reply.
    ///
    /// A timeout leaves the session connected; the command has been sent and
    /// a late reply may still arrive. Replies are cut at the first delimiter,
    /// so a second reply that came in the same read is kept for the next
    /// query.
    pub async fn query_with_timeout(&mut self, command: &str, timeout: Duration) -> AppResult<String> {
        self.live_transport()?;
        self.send(command).await?;

        let delimiter = self.settings.response_delimiter;
        let max_len = self.settings.max_reply_len;
        let Some(transport) = self.transport.as_mut() else {
            return Err(LabError::NotConnected(self.identifier.to_string()));
        };

        let raw = match read_until(transport.as_mut(), &mut self.pending, delimiter, max_len, timeout)
            .await
        {
            Ok(raw) => raw,
            Err(e) => return Err(self.handle_failure("query", e)),
        };

        let reply = String::from_utf8_lossy(&raw).trim().to_string();
        self.observer.on_event(&IoEvent::ReplyReceived {
            target: self.identifier.to_string(),
            command: command.to_string(),
            reply: reply.clone(),
        });
        Ok(reply)
    }

    /// Close the transport. Closing an unconnected session is a no-op.
    pub async fn close(&mut self) -> AppResult<()> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        self.state = SessionState::Disconnected;
        self.pending.clear();
        let result = transport.close().await;
        self.observer.on_event(&IoEvent::Disconnected {
            target: self.identifier.to_string(),
            reason: "closed".to_string(),
        });
        result
    }

    fn live_transport(&mut self) -> AppResult<&mut Box<dyn Transport>> {
        match self.transport.as_mut() {
            Some(transport) => Ok(transport),
            None => Err(LabError::NotConnected(self.identifier.to_string())),
        }
    }

    /// Report `err` and drop the transport if the link can no longer be trusted.
    fn handle_failure(&mut self, operation: &str, err: LabError) -> LabError {
        self.observer.on_event(&IoEvent::Failure {
            target: self.identifier.to_string(),
            operation: operation.to_string(),
            error: err.to_string(),
        });

        if err.class() == ErrorClass::Fatal && self.transport.take().is_some() {
            self.pending.clear();
            self.state = SessionState::Disconnected;
            self.observer.on_event(&IoEvent::Disconnected {
                target: self.identifier.to_string(),
                reason: err.to_string(),
            });
        }
        err
    }
}

#[async_trait]
impl CommandChannel for InstrumentSession {
    async fn send(&mut self, command: &str) -> AppResult<()> {
        InstrumentSession::send(self, command).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        InstrumentSession::query(self, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use crate::transport::{BackendScan, MockConnector, MockTransport};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn session(id: &str) -> (InstrumentSession, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::new());
        let session = InstrumentSession::new(id, &Settings::default(), observer.clone())
            .unwrap()
            .with_session_settings(SessionSettings {
                timeout: Duration::from_millis(30),
                line_terminator: "\n".to_string(),
                response_delimiter: b'\n',
                max_reply_len: 256,
            });
        (session, observer)
    }

    #[tokio::test]
    async fn test_query_before_connect_fails_without_io() {
        let (mut session, observer) = session("GPIB:2");
        let err = session.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, LabError::NotConnected(_)));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_identifier_fails_at_construction() {
        let err = InstrumentSession::new(
            "FOO:bar",
            &Settings::default(),
            Arc::new(RecordingObserver::new()),
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let (mut session, _) = session("IP:10.0.0.9");
        let connector = MockConnector::failing("connection refused");
        assert!(session.connect(&connector).await.is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.params(),
            &ConnectionParams::Network {
                host: "10.0.0.9".to_string()
            }
        );

        connector.clear_failure();
        session.connect(&connector).await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_send_and_query() {
        let mock = MockTransport::new();
        mock.respond_to("MEAS:VOLT?", "  +1.2345E+00\r\n");
        let (mut session, observer) = session("COM7");
        session.connect(&MockConnector::new(mock.clone())).await.unwrap();

        session.send("OUTP ON").await.unwrap();
        let reply = session.query("MEAS:VOLT?").await.unwrap();
        assert_eq!(reply, "+1.2345E+00");
        assert_eq!(mock.written_text(), "OUTP ON\nMEAS:VOLT?\n");

        let events = observer.events();
        assert!(matches!(events[0], IoEvent::Connected { .. }));
        assert!(matches!(events.last(), Some(IoEvent::ReplyReceived { .. })));
    }

    #[tokio::test]
    async fn test_timeout_keeps_session_connected() {
        let mock = MockTransport::new();
        let (mut session, _) = session("GPIB:2");
        session.connect(&MockConnector::new(mock.clone())).await.unwrap();

        let err = session.query("*OPC?").await.unwrap_err();
        assert!(matches!(err, LabError::Timeout { .. }));
        assert!(err.is_recoverable());
        assert_eq!(session.state(), SessionState::Connected);
        // The command itself went out and is not rolled back.
        assert_eq!(mock.written_text(), "*OPC?\n");
    }

    #[tokio::test]
    async fn test_fatal_error_drops_transport() {
        let mock = MockTransport::new();
        let (mut session, observer) = session("IP:10.0.0.9");
        session.connect(&MockConnector::new(mock.clone())).await.unwrap();

        mock.push_read_error("connection reset by peer");
        let err = session.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, LabError::Io(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(observer
            .events()
            .iter()
            .any(|e| matches!(e, IoEvent::Disconnected { .. })));

        let err = session.send("*RST").await.unwrap_err();
        assert!(matches!(err, LabError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = MockTransport::new();
        let (mut session, _) = session("USB:0x1AB1::0x04CE::DS1ZA1");
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.connect(&MockConnector::new(mock.clone())).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn test_command_channel_helpers() {
        let mock = MockTransport::new();
        mock.respond_to("*IDN?", "ACME,PSU-3000,SN42,1.0\n");
        let (mut session, _) = session("GPIB:5");
        session.connect(&MockConnector::new(mock.clone())).await.unwrap();

        let channel: &mut dyn CommandChannel = &mut session;
        assert_eq!(channel.identify().await.unwrap(), "ACME,PSU-3000,SN42,1.0");
        channel.reset().await.unwrap();
        channel.clear_status().await.unwrap();
        assert_eq!(mock.written_text(), "*IDN?\n*RST\n*CLS\n");
    }

    #[test]
    fn test_session_settings_per_kind() {
        let settings = Settings::default();
        let serial = SessionSettings::for_kind(TransportKind::Serial, &settings);
        assert_eq!(serial.line_terminator, "\r\n");
        let network = SessionSettings::for_kind(TransportKind::Network, &settings);
        assert_eq!(network.line_terminator, "\n");
        assert_eq!(network.timeout, Duration::from_millis(2000));
    }

    #[traced_test]
    #[test]
    fn test_unlisted_instrument_only_warns() {
        let (session, _) = session("IP:192.168.12.238");
        let report = DiscoveryReport {
            scans: vec![BackendScan {
                backend: "visa",
                result: Ok(vec!["GPIB0::2::INSTR".to_string()]),
            }],
        };
        let listing = session.check_listing(&report, &Settings::default());
        assert_eq!(listing, Listing::NotListed);
        assert!(logs_contain("not found by discovery"));
    }
}
