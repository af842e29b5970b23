//! Connection manager: owns the single transport of a session and drives
//! the [`ConnectionMachine`] from socket, timer and caller events.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{ChatMessage, MessageBody, RoomId},
    protocol::{ClientFrame, OutboundMessage, ServerFrame},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    reconnect::{
        ConnectionAction, ConnectionEvent, ConnectionMachine, ConnectionState, ReconnectPolicy,
        NORMAL_CLOSURE,
    },
    transport::{Connector, FrameSink, TransportLink, WireEvent},
    ClientEvent,
};

/// Consumers of the inbound stream. Handlers run one at a time, in
/// registration order, for every event in arrival order.
///
/// Handlers run on the driver task, so they must not await
/// [`ConnectionHandle::send`]; use [`ConnectionHandle::queue_frame`].
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn on_message(&self, _message: &ChatMessage) {}
    async fn on_room_history(&self, _room_id: &RoomId, _messages: &[ChatMessage]) {}
    async fn on_state_change(&self, _state: ConnectionState) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGuard {
    NotOpen,
    EmptyContent,
    NoActiveRoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open transport.
    Sent,
    Skipped(SendGuard),
    /// The transport rejected the write.
    Failed,
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: StdMutex<Vec<(SubscriptionId, Arc<dyn SessionHandler>)>>,
}

impl HandlerRegistry {
    fn insert(&self, handler: Arc<dyn SessionHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

enum Command {
    Connect,
    Disconnect,
    Send {
        frame: ClientFrame,
        reply: Option<oneshot::Sender<SendOutcome>>,
    },
    Shutdown,
}

enum LinkEvent {
    Opened {
        generation: u64,
        sink: Box<dyn FrameSink>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        code: Option<u16>,
    },
}

/// Cheap, cloneable access to the session connection. No holder of a
/// handle ever touches the transport directly.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    handlers: Arc<HandlerRegistry>,
}

impl ConnectionHandle {
    /// Idempotent: ignored while connecting or open.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Closes with a normal-closure code and suppresses auto-reconnect until
    /// the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the driver has written the frame, or decided not to.
    pub async fn send(
        &self,
        room_id: &RoomId,
        content: &str,
        sender_name: &str,
        body: &MessageBody,
    ) -> SendOutcome {
        if room_id.is_empty() {
            return skipped(SendGuard::NoActiveRoom);
        }
        if content.trim().is_empty() {
            return skipped(SendGuard::EmptyContent);
        }
        self.send_frame(ClientFrame::Message(OutboundMessage::new(
            room_id.clone(),
            content,
            sender_name,
            body,
        )))
        .await
    }

    pub async fn send_frame(&self, frame: ClientFrame) -> SendOutcome {
        if !self.is_open() {
            return skipped(SendGuard::NotOpen);
        }
        let (reply, outcome) = oneshot::channel();
        let command = Command::Send {
            frame,
            reply: Some(reply),
        };
        if self.commands.send(command).is_err() {
            return skipped(SendGuard::NotOpen);
        }
        outcome.await.unwrap_or(SendOutcome::Skipped(SendGuard::NotOpen))
    }

    /// Hands the frame to the driver without waiting for the write.
    /// Returns `false` when the connection is not open.
    pub fn queue_frame(&self, frame: ClientFrame) -> bool {
        if !self.is_open() {
            return false;
        }
        self.commands
            .send(Command::Send { frame, reply: None })
            .is_ok()
    }

    pub fn subscribe(&self, handler: Arc<dyn SessionHandler>) -> SubscriptionId {
        self.handlers.insert(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.remove(id)
    }

    /// Disconnects and stops the driver task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

fn skipped(guard: SendGuard) -> SendOutcome {
    debug!(?guard, "connection: send skipped");
    SendOutcome::Skipped(guard)
}

pub struct ConnectionManager {
    url: Url,
    machine: ConnectionMachine,
    connector: Arc<dyn Connector>,
    sink: Option<Box<dyn FrameSink>>,
    link_task: Option<JoinHandle<()>>,
    generation: u64,
    reconnect_at: Option<Instant>,
    links: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Sender<ConnectionState>,
    handlers: Arc<HandlerRegistry>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConnectionManager {
    /// Starts the driver task. The connection stays `Idle` until
    /// [`ConnectionHandle::connect`] is called.
    pub fn spawn(
        url: Url,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        events: broadcast::Sender<ClientEvent>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let handlers = Arc::new(HandlerRegistry::default());

        let manager = Self {
            url,
            machine: ConnectionMachine::new(policy),
            connector,
            sink: None,
            link_task: None,
            generation: 0,
            reconnect_at: None,
            links: link_tx,
            state: state_tx,
            handlers: Arc::clone(&handlers),
            events,
        };
        let driver = tokio::spawn(manager.run(command_rx, link_rx));

        let handle = ConnectionHandle {
            commands: command_tx,
            state: state_rx,
            handlers,
        };
        (handle, driver)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            let deadline = self.reconnect_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect) => self.apply(ConnectionEvent::Connect).await,
                    Some(Command::Disconnect) => self.apply(ConnectionEvent::ManualDisconnect).await,
                    Some(Command::Send { frame, reply }) => {
                        let outcome = self.transmit(frame).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        self.apply(ConnectionEvent::ManualDisconnect).await;
                        break;
                    }
                },
                Some(link) = links.recv() => self.on_link(link).await,
                _ = wait_until(deadline) => {
                    self.reconnect_at = None;
                    self.apply(ConnectionEvent::Tick).await;
                }
            }
        }
        info!("connection: driver stopped");
    }

    async fn apply(&mut self, event: ConnectionEvent) {
        let before = self.machine.state();
        for action in self.machine.handle(event) {
            match action {
                ConnectionAction::OpenTransport => self.open_transport(),
                ConnectionAction::ScheduleReconnect(delay) => self.schedule_reconnect(delay),
                ConnectionAction::CancelReconnect => {
                    if self.reconnect_at.take().is_some() {
                        debug!("connection: pending reconnect cancelled");
                    }
                }
                ConnectionAction::CloseTransport { code } => self.close_transport(code).await,
            }
        }
        let after = self.machine.state();
        if after != before {
            self.publish_state(after).await;
        }
    }

    fn open_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.sink = None;

        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let links = self.links.clone();
        info!(%url, generation, "connection: opening transport");
        self.link_task = Some(tokio::spawn(async move {
            let TransportLink { sink, mut inbound } = match connector.open(&url).await {
                Ok(link) => link,
                Err(err) => {
                    warn!("connection: transport open failed: {err}");
                    let _ = links.send(LinkEvent::Closed {
                        generation,
                        code: None,
                    });
                    return;
                }
            };
            if links.send(LinkEvent::Opened { generation, sink }).is_err() {
                return;
            }

            let mut code = None;
            while let Some(item) = inbound.next().await {
                match item {
                    Ok(WireEvent::Text(text)) => {
                        if links.send(LinkEvent::Frame { generation, text }).is_err() {
                            return;
                        }
                    }
                    Ok(WireEvent::Closed { code: close_code }) => {
                        code = close_code;
                        break;
                    }
                    Err(err) => {
                        warn!("connection: transport receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = links.send(LinkEvent::Closed { generation, code });
        }));
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        info!(
            attempt = self.machine.attempt_count(),
            delay_ms = delay.as_millis() as u64,
            "connection: reconnect scheduled"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn close_transport(&mut self, code: u16) {
        // Events from the closed link are stale from here on.
        self.generation += 1;
        if let Some(mut sink) = self.sink.take() {
            if let Err(err) = sink.close(code, "User disconnected").await {
                debug!("connection: close frame not delivered: {err}");
            }
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
    }

    async fn on_link(&mut self, link: LinkEvent) {
        match link {
            LinkEvent::Opened { generation, mut sink } => {
                if generation != self.generation
                    || self.machine.state() != ConnectionState::Connecting
                {
                    let _ = sink.close(NORMAL_CLOSURE, "superseded").await;
                    return;
                }
                self.sink = Some(sink);
                self.apply(ConnectionEvent::SocketOpened).await;
            }
            LinkEvent::Frame { generation, text } => {
                if generation == self.generation {
                    self.dispatch(&text).await;
                }
            }
            LinkEvent::Closed { generation, code } => {
                if generation != self.generation {
                    return;
                }
                self.sink = None;
                self.link_task = None;
                info!(?code, "connection: transport closed");
                self.apply(ConnectionEvent::SocketClosed { code }).await;
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let frame = match ServerFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("connection: dropping malformed frame: {err}");
                return;
            }
        };
        match frame {
            ServerFrame::Message(message) => {
                for handler in self.handlers.snapshot() {
                    handler.on_message(&message).await;
                }
            }
            ServerFrame::RecentMessages { room_id, messages } => {
                for handler in self.handlers.snapshot() {
                    handler.on_room_history(&room_id, &messages).await;
                }
            }
            ServerFrame::Error { message } => {
                warn!("connection: server reported error: {message}");
                let _ = self.events.send(ClientEvent::ServerError(message));
            }
            ServerFrame::Pong => debug!("connection: pong"),
            ServerFrame::Other { kind } => debug!(kind, "connection: ignoring frame"),
        }
    }

    async fn transmit(&mut self, frame: ClientFrame) -> SendOutcome {
        let sink = match self.sink.as_mut() {
            Some(sink) if self.machine.state().is_open() => sink,
            _ => {
                debug!("connection: dropping outbound frame while not open");
                return SendOutcome::Skipped(SendGuard::NotOpen);
            }
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!("connection: failed to encode outbound frame: {err}");
                return SendOutcome::Failed;
            }
        };
        match sink.send_text(text).await {
            Ok(()) => SendOutcome::Sent,
            Err(err) => {
                warn!(room_id = %frame.room_id(), "connection: send failed: {err}");
                SendOutcome::Failed
            }
        }
    }

    async fn publish_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Failed => warn!("connection: reconnect attempts exhausted, offline"),
            _ => info!(?state, "connection: state changed"),
        }
        self.state.send_replace(state);
        for handler in self.handlers.snapshot() {
            handler.on_state_change(state).await;
        }
        let _ = self.events.send(ClientEvent::ConnectionStateChanged(state));
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
