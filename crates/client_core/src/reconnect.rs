//! Connect/reconnect state machine for the session transport.
//!
//! The machine is pure: it consumes [`ConnectionEvent`]s and returns the
//! [`ConnectionAction`]s the driver must perform. Timers, sockets and tasks
//! live in [`crate::connection`].

use std::time::Duration;

/// Close code sent on a client-initiated disconnect and treated as a
/// deliberate (non-retryable) close when received from the server.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10000),
            max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base_delay * attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: u32, delay: Duration },
    /// Attempts exhausted; only an explicit connect leaves this state.
    Failed,
    /// Manually disconnected.
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    SocketOpened,
    /// `code` is `None` when the transport failed without a close frame.
    SocketClosed { code: Option<u16> },
    ManualDisconnect,
    /// The scheduled reconnect delay elapsed.
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    OpenTransport,
    ScheduleReconnect(Duration),
    CancelReconnect,
    CloseTransport { code: u16 },
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt_count: u32,
    manual_disconnect: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            attempt_count: 0,
            manual_disconnect: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_manual_disconnect(&self) -> bool {
        self.manual_disconnect
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        match event {
            ConnectionEvent::Connect => self.on_connect(),
            ConnectionEvent::SocketOpened => {
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Open;
                    self.attempt_count = 0;
                }
                Vec::new()
            }
            ConnectionEvent::SocketClosed { code } => self.on_socket_closed(code),
            ConnectionEvent::ManualDisconnect => self.on_manual_disconnect(),
            ConnectionEvent::Tick => match self.state {
                ConnectionState::Reconnecting { .. } => {
                    self.state = ConnectionState::Connecting;
                    vec![ConnectionAction::OpenTransport]
                }
                _ => Vec::new(),
            },
        }
    }

    fn on_connect(&mut self) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => Vec::new(),
            ConnectionState::Reconnecting { .. } => {
                self.state = ConnectionState::Connecting;
                vec![
                    ConnectionAction::CancelReconnect,
                    ConnectionAction::OpenTransport,
                ]
            }
            ConnectionState::Idle | ConnectionState::Failed | ConnectionState::Closed => {
                if self.state != ConnectionState::Idle {
                    self.attempt_count = 0;
                }
                self.manual_disconnect = false;
                self.state = ConnectionState::Connecting;
                vec![ConnectionAction::OpenTransport]
            }
        }
    }

    fn on_socket_closed(&mut self, code: Option<u16>) -> Vec<ConnectionAction> {
        if !self.state.is_active() {
            return Vec::new();
        }
        if self.manual_disconnect {
            self.state = ConnectionState::Closed;
            return Vec::new();
        }
        if code == Some(NORMAL_CLOSURE) {
            self.state = ConnectionState::Idle;
            return Vec::new();
        }
        if self.attempt_count >= self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            return Vec::new();
        }
        self.attempt_count += 1;
        let delay = self.policy.delay_for(self.attempt_count);
        self.state = ConnectionState::Reconnecting {
            attempt: self.attempt_count,
            delay,
        };
        vec![ConnectionAction::ScheduleReconnect(delay)]
    }

    fn on_manual_disconnect(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Reconnecting { .. } => actions.push(ConnectionAction::CancelReconnect),
            ConnectionState::Connecting | ConnectionState::Open => actions.push(
                ConnectionAction::CloseTransport {
                    code: NORMAL_CLOSURE,
                },
            ),
            _ => {}
        }
        self.manual_disconnect = true;
        self.attempt_count = 0;
        self.state = ConnectionState::Closed;
        actions
    }
}
