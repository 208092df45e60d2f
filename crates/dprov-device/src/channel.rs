//! # Device Command Channel
//!
//! A request/response session with the secure-element command interpreter.
//!
//! ## States
//!
//! ```text
//! Disconnected ──connect()──▶ StubLoaded ──wait_for_ready()──▶ Initialized
//!                                                                  │
//!                                                          execute("init")
//!                                                                  ▼
//!                                    Ready ◀──response── AwaitingResponse
//!                                      │                       ▲
//!                                      └──────execute()────────┘
//!
//! any state ──close()──▶ Closed
//! ```
//!
//! Transitions are validated at runtime. Exactly one command is outstanding
//! at a time; `&mut self` on every operation makes concurrent use of one
//! channel impossible. Read commands issued before `init` has succeeded are
//! rejected locally and never reach the wire.
//!
//! The channel owns its transport and releases it on [`CommandChannel::close`]
//! and on drop, whichever comes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ChannelError;
use crate::loader::{DeviceEndpoint, StubLoader};
use crate::transport::{Transport, TransportOpener};

/// Prompt printed by the command interpreter when it is ready for input.
pub const PROMPT: &str = ">>";

/// Prefix of the status line that terminates every response.
pub const STATUS_PREFIX: &str = "Status:";

/// The handshake command that must succeed before any read.
pub const INIT_COMMAND: &str = "init";

// ─── State ───────────────────────────────────────────────────────────

/// Lifecycle state of a [`CommandChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// No transport open.
    Disconnected,
    /// Stub uploaded and transport open; prompt not yet seen.
    StubLoaded,
    /// Prompt seen; only `init` is accepted.
    Initialized,
    /// Secure element initialized; reads accepted.
    Ready,
    /// One command is in flight.
    AwaitingResponse,
    /// Transport released (terminal).
    Closed,
}

impl ChannelState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::StubLoaded => "STUB_LOADED",
            Self::Initialized => "INITIALIZED",
            Self::Ready => "READY",
            Self::AwaitingResponse => "AWAITING_RESPONSE",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Record of a channel state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTransition {
    /// State before the transition.
    pub from: ChannelState,
    /// State after the transition.
    pub to: ChannelState,
}

// ─── Cancellation ────────────────────────────────────────────────────

/// Shared cancellation flag.
///
/// Clones observe the same flag. A cancelled channel stops waiting, closes
/// its transport and returns [`ChannelError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── Responses ───────────────────────────────────────────────────────

/// Status token of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// `Status: ok`.
    Ok,
    /// `Status: error[ detail]`, or any other token.
    Error(String),
}

impl Status {
    /// Parse the text after `Status:`.
    pub fn parse(rest: &str) -> Self {
        let rest = rest.trim();
        if rest.eq_ignore_ascii_case("ok") {
            Self::Ok
        } else {
            Self::Error(rest.to_string())
        }
    }
}

/// A complete, successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The command this answers.
    pub command: String,
    /// Payload lines preceding the status line.
    pub lines: Vec<String>,
}

impl Response {
    /// First payload line starting with `key` (case-insensitive), with the
    /// key stripped.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let trimmed = line.trim_start();
            let head = trimmed.get(..key.len())?;
            head.eq_ignore_ascii_case(key)
                .then(|| trimmed[key.len()..].trim())
        })
    }
}

// ─── Configuration ───────────────────────────────────────────────────

/// Timing parameters of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    /// Budget for the prompt to appear after connect.
    pub ready: Duration,
    /// Budget for one complete command response.
    pub command: Duration,
    /// Granularity at which cancellation is observed.
    pub poll: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(10),
            command: Duration::from_secs(5),
            poll: Duration::from_millis(100),
        }
    }
}

// ─── Channel ─────────────────────────────────────────────────────────

/// An owned session with one device.
pub struct CommandChannel {
    endpoint: DeviceEndpoint,
    loader: Box<dyn StubLoader>,
    opener: Box<dyn TransportOpener>,
    timeouts: ChannelTimeouts,
    cancel: CancelToken,
    transport: Option<Box<dyn Transport>>,
    state: ChannelState,
    transitions: Vec<ChannelTransition>,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl CommandChannel {
    /// A disconnected channel to `endpoint`.
    pub fn new(
        endpoint: DeviceEndpoint,
        loader: Box<dyn StubLoader>,
        opener: Box<dyn TransportOpener>,
    ) -> Self {
        Self {
            endpoint,
            loader,
            opener,
            timeouts: ChannelTimeouts::default(),
            cancel: CancelToken::new(),
            transport: None,
            state: ChannelState::Disconnected,
            transitions: Vec::new(),
        }
    }

    /// Override timing parameters.
    pub fn with_timeouts(mut self, timeouts: ChannelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Observe `token` for cancellation.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The device endpoint.
    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Ordered log of all state transitions.
    pub fn transitions(&self) -> &[ChannelTransition] {
        &self.transitions
    }

    /// Configured timeouts.
    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    /// Upload the stub and open the transport (DISCONNECTED → STUB_LOADED).
    pub fn connect(&mut self) -> Result<(), ChannelError> {
        self.check_cancelled()?;
        self.require_state(&[ChannelState::Disconnected], ChannelState::StubLoaded)?;

        self.loader
            .load(&self.endpoint)
            .map_err(|source| ChannelError::StubLoad {
                port: self.endpoint.port.clone(),
                source,
            })?;
        let transport = self
            .opener
            .open(&self.endpoint.port, self.endpoint.baud)
            .map_err(|e| ChannelError::Open {
                port: self.endpoint.port.clone(),
                reason: e.to_string(),
            })?;
        self.transport = Some(transport);
        self.do_transition(ChannelState::StubLoaded);
        tracing::info!(port = %self.endpoint.port, baud = self.endpoint.baud, "device connected");
        Ok(())
    }

    /// Consume banner output until the prompt (STUB_LOADED → INITIALIZED).
    pub fn wait_for_ready(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        self.check_cancelled()?;
        self.require_state(&[ChannelState::StubLoaded], ChannelState::Initialized)?;

        let deadline = Instant::now() + timeout;
        loop {
            let line = self.read_line(deadline, timeout, "command prompt")?;
            if line.trim() == PROMPT {
                break;
            }
            tracing::trace!(port = %self.endpoint.port, line = %line, "banner");
        }
        self.do_transition(ChannelState::Initialized);
        tracing::debug!(port = %self.endpoint.port, "command prompt received");
        Ok(())
    }

    /// Send the `init` handshake (INITIALIZED → READY).
    pub fn init(&mut self) -> Result<Response, ChannelError> {
        self.execute(INIT_COMMAND)
    }

    /// Send one command and block for its response.
    ///
    /// Any status other than `ok` is a [`ChannelError::Command`]; the channel
    /// stays usable in its prior state. Transport failures and timeouts leave
    /// the response stream unsynchronised, so the channel is closed.
    pub fn execute(&mut self, command: &str) -> Result<Response, ChannelError> {
        self.check_cancelled()?;
        let command = command.trim();
        let name = command.split_whitespace().next().unwrap_or_default();

        let resume = match self.state {
            ChannelState::Ready => ChannelState::Ready,
            ChannelState::Initialized if name == INIT_COMMAND => ChannelState::Initialized,
            ChannelState::Initialized => {
                return Err(ChannelError::NotInitialized {
                    command: command.to_string(),
                })
            }
            ChannelState::Closed => return Err(ChannelError::Closed),
            other => {
                return Err(ChannelError::InvalidTransition {
                    from: other.to_string(),
                    to: ChannelState::AwaitingResponse.to_string(),
                })
            }
        };

        self.do_transition(ChannelState::AwaitingResponse);
        tracing::debug!(port = %self.endpoint.port, command, "sending command");

        match self.exchange(command) {
            Ok((lines, Status::Ok)) => {
                self.do_transition(ChannelState::Ready);
                Ok(Response {
                    command: command.to_string(),
                    lines,
                })
            }
            Ok((_, Status::Error(status))) => {
                self.do_transition(resume);
                tracing::warn!(port = %self.endpoint.port, command, status = %status, "command rejected");
                Err(ChannelError::Command {
                    command: command.to_string(),
                    status: if status.is_empty() {
                        "error".to_string()
                    } else {
                        status
                    },
                })
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Release the transport. Idempotent; valid from any state.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            tracing::debug!(port = %self.endpoint.port, "device channel closed");
        }
        if self.state != ChannelState::Closed {
            self.do_transition(ChannelState::Closed);
        }
    }

    fn exchange(&mut self, command: &str) -> Result<(Vec<String>, Status), ChannelError> {
        let transport = self.transport.as_mut().ok_or(ChannelError::Closed)?;
        transport
            .send_line(command)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let budget = self.timeouts.command;
        let deadline = Instant::now() + budget;
        let mut lines = Vec::new();
        let status = loop {
            let line = self.read_line(deadline, budget, "command response")?;
            match line.trim_start().strip_prefix(STATUS_PREFIX) {
                Some(rest) => break Status::parse(rest),
                None if line.trim() == PROMPT => {
                    return Err(ChannelError::Protocol {
                        command: command.to_string(),
                        reason: "prompt before status line".to_string(),
                    })
                }
                None => lines.push(line),
            }
        };
        loop {
            let line = self.read_line(deadline, budget, "command prompt")?;
            if line.trim() == PROMPT {
                break;
            }
        }
        Ok((lines, status))
    }

    fn read_line(
        &mut self,
        deadline: Instant,
        budget: Duration,
        waiting_for: &str,
    ) -> Result<String, ChannelError> {
        loop {
            self.check_cancelled()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(port = %self.endpoint.port, waiting_for, "device timed out");
                return Err(ChannelError::Timeout {
                    waiting_for: waiting_for.to_string(),
                    after: budget,
                });
            }
            let transport = self.transport.as_mut().ok_or(ChannelError::Closed)?;
            match transport.recv_line(remaining.min(self.timeouts.poll)) {
                Ok(Some(line)) => return Ok(line),
                Ok(None) => continue,
                Err(e) => return Err(ChannelError::Transport(e.to_string())),
            }
        }
    }

    fn check_cancelled(&mut self) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            tracing::info!(port = %self.endpoint.port, "session cancelled");
            self.close();
            return Err(ChannelError::Cancelled);
        }
        Ok(())
    }

    fn require_state(
        &self,
        allowed: &[ChannelState],
        target: ChannelState,
    ) -> Result<(), ChannelError> {
        if self.state.is_terminal() {
            return Err(ChannelError::Closed);
        }
        if !allowed.contains(&self.state) {
            return Err(ChannelError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        Ok(())
    }

    fn do_transition(&mut self, to: ChannelState) {
        self.transitions.push(ChannelTransition {
            from: self.state,
            to,
        });
        self.state = to;
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, SimulatedDevice};

    const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn fast() -> ChannelTimeouts {
        ChannelTimeouts {
            ready: Duration::from_millis(200),
            command: Duration::from_millis(200),
            poll: Duration::from_millis(5),
        }
    }

    fn channel(dev: &SimulatedDevice) -> CommandChannel {
        dev.channel("COM7").with_timeouts(fast())
    }

    fn ready(dev: &SimulatedDevice) -> CommandChannel {
        let mut ch = channel(dev);
        ch.connect().unwrap();
        ch.wait_for_ready(fast().ready).unwrap();
        ch
    }

    #[test]
    fn full_lifecycle_transitions_in_order() {
        let dev = SimulatedDevice::new("0123456789ABCDEF", CERT);
        let mut ch = ready(&dev);
        ch.init().unwrap();
        let info = ch.execute("print-chip-info").unwrap();
        assert_eq!(info.field("Serial Number:"), Some("01 23 45 67 89 AB CD EF"));
        ch.close();

        let states: Vec<_> = ch.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            [
                ChannelState::StubLoaded,
                ChannelState::Initialized,
                ChannelState::AwaitingResponse,
                ChannelState::Ready,
                ChannelState::AwaitingResponse,
                ChannelState::Ready,
                ChannelState::Closed,
            ]
        );
        assert_eq!(dev.commands_received(), ["init", "print-chip-info"]);
        assert!(!dev.port_open());
    }

    #[test]
    fn read_before_init_is_rejected_without_touching_the_wire() {
        let dev = SimulatedDevice::new("0A0B", CERT);
        let mut ch = ready(&dev);
        let err = ch.execute("get-device-cert").unwrap_err();
        assert!(matches!(err, ChannelError::NotInitialized { .. }));
        assert_eq!(err.class(), dprov_core::ErrorClass::Command);
        assert!(dev.commands_received().is_empty());
        assert_eq!(ch.state(), ChannelState::Initialized);
    }

    #[test]
    fn failed_init_keeps_reads_locked() {
        let dev = SimulatedDevice::new("0A0B", CERT).with_fault(Fault::InitError);
        let mut ch = ready(&dev);
        let err = ch.init().unwrap_err();
        assert!(matches!(err, ChannelError::Command { ref command, .. } if command == "init"));
        assert!(matches!(
            ch.execute("print-chip-info"),
            Err(ChannelError::NotInitialized { .. })
        ));
        assert_eq!(dev.commands_received(), ["init"]);
    }

    #[test]
    fn missing_prompt_times_out() {
        let dev = SimulatedDevice::new("0A0B", CERT).with_fault(Fault::NoPrompt);
        let mut ch = channel(&dev);
        ch.connect().unwrap();
        let err = ch.wait_for_ready(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
        assert_eq!(err.class(), dprov_core::ErrorClass::Timeout);
        ch.close();
        assert!(!dev.port_open());
    }

    #[test]
    fn unresponsive_command_times_out_and_closes() {
        let dev = SimulatedDevice::new("0A0B", CERT).with_fault(Fault::Unresponsive("get-device-cert"));
        let mut ch = ready(&dev);
        ch.init().unwrap();
        assert!(matches!(
            ch.execute("get-device-cert"),
            Err(ChannelError::Timeout { .. })
        ));
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(!dev.port_open());
    }

    #[test]
    fn stub_load_failure_is_transport_error() {
        let dev = SimulatedDevice::new("0A0B", CERT).with_fault(Fault::StubLoadFails);
        let mut ch = channel(&dev);
        let err = ch.connect().unwrap_err();
        assert_eq!(err.class(), dprov_core::ErrorClass::Transport);
        assert_eq!(ch.state(), ChannelState::Disconnected);
        assert!(!dev.port_open());
    }

    #[test]
    fn open_failure_is_transport_error() {
        let dev = SimulatedDevice::new("0A0B", CERT).with_fault(Fault::OpenFails);
        let err = channel(&dev).connect().unwrap_err();
        assert!(matches!(err, ChannelError::Open { .. }));
    }

    #[test]
    fn operations_out_of_order_are_rejected() {
        let dev = SimulatedDevice::new("0A0B", CERT);
        let mut ch = channel(&dev);
        assert!(matches!(
            ch.wait_for_ready(Duration::from_millis(10)),
            Err(ChannelError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ch.execute("init"),
            Err(ChannelError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn close_is_idempotent_and_terminal() {
        let dev = SimulatedDevice::new("0A0B", CERT);
        let mut ch = ready(&dev);
        ch.close();
        ch.close();
        assert_eq!(
            ch.transitions()
                .iter()
                .filter(|t| t.to == ChannelState::Closed)
                .count(),
            1
        );
        assert!(matches!(ch.execute("init"), Err(ChannelError::Closed)));
        assert!(matches!(ch.connect(), Err(ChannelError::Closed)));
    }

    #[test]
    fn drop_releases_port() {
        let dev = SimulatedDevice::new("0A0B", CERT);
        {
            let _ch = ready(&dev);
            assert!(dev.port_open());
        }
        assert!(!dev.port_open());
    }

    #[test]
    fn cancellation_closes_and_reports() {
        let dev = SimulatedDevice::new("0A0B", CERT);
        let token = CancelToken::new();
        let mut ch = channel(&dev).with_cancel_token(token.clone());
        ch.connect().unwrap();
        token.cancel();
        let err = ch.wait_for_ready(fast().ready).unwrap_err();
        assert!(matches!(err, ChannelError::Cancelled));
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(!dev.port_open());
    }

    #[test]
    fn status_parsing() {
        assert_eq!(Status::parse(" ok"), Status::Ok);
        assert_eq!(Status::parse("OK "), Status::Ok);
        assert_eq!(
            Status::parse(" error ATECC not found"),
            Status::Error("error ATECC not found".into())
        );
    }
}
