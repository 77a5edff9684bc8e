//! Router Controller Layer
//!
//! Responsibilities:
//! - One persistent TCP connection per physical router
//! - Live state mirror populated from the initial dump and tallies
//! - Reconnection with backoff, event emission
//!
//! The engine and bridge talk to controllers through the `RouterPort`
//! trait; controllers never know who consumes their events.

mod connection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::common::{ControllerEvent, LockCommand, RouterId, RouterState};
use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::protocol::{Command, ProtocolKind};

use connection::{run_connection_loop, ConnectionShared, Request};

/// Capacity of the per-controller write queue
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Event channel depth; slow subscribers miss events rather than block
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Unified seam between the engine/bridge and a physical router.
///
/// `Controller` is the production implementation; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait RouterPort: Send + Sync {
    fn id(&self) -> RouterId;

    /// Socket up AND initial state dump received
    fn is_connected(&self) -> bool;

    /// Snapshot of the state mirror
    fn state(&self) -> RouterState;

    /// Issue a crosspoint change; returns once the router acknowledged.
    async fn set_route(&self, output: u16, input: u16, level: u8) -> Result<()>;

    async fn set_input_label(&self, index: u16, text: &str) -> Result<()>;

    async fn set_output_label(&self, index: u16, text: &str) -> Result<()>;

    async fn set_lock(&self, output: u16, state: LockCommand) -> Result<()>;
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub id: RouterId,
    pub host: String,
    pub port: u16,
    pub protocol: ProtocolKind,
    /// Display name (falls back to the router id)
    pub name: String,
    /// Dimensions for protocols without wire-level discovery
    pub matrix_hint: Option<(u16, u16)>,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ControllerConfig {
    pub fn new(id: RouterId, host: impl Into<String>, protocol: ProtocolKind) -> Self {
        let host = host.into();
        Self {
            id,
            port: protocol.default_port(),
            host,
            protocol,
            name: String::new(),
            matrix_hint: None,
            auto_reconnect: true,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Build from the persisted router document.
    pub fn from_router_config(id: RouterId, config: &RouterConfig, auto_reconnect: bool) -> Self {
        let mut this = Self::new(id, config.host.clone(), config.protocol);
        this.port = config.effective_port();
        this.name = config.name.clone();
        this.matrix_hint = config.matrix.map(|m| (m.inputs, m.outputs));
        this.auto_reconnect = auto_reconnect;
        this
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("router {}", self.id)
        } else {
            self.name.clone()
        }
    }
}

/// A live protocol client for one physical router.
///
/// Created on connect, dropped on disconnect; the connection task keeps
/// the mirror current for the controller's whole life.
pub struct Controller {
    config: ControllerConfig,
    mirror: Arc<RwLock<RouterState>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<ControllerEvent>,
    commands: Mutex<Option<mpsc::Sender<Request>>>,
    shutdown: broadcast::Sender<()>,
    started: AtomicBool,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            mirror: Arc::new(RwLock::new(RouterState::default())),
            connected: Arc::new(AtomicBool::new(false)),
            events,
            commands: Mutex::new(None),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Open the connection, run the handshake, and wait for the initial
    /// state dump. Spawns the connection task that owns the socket from
    /// here on.
    pub async fn connect(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        *self.commands.lock() = Some(command_tx);

        let (first_tx, first_rx) = oneshot::channel();
        let shared = ConnectionShared {
            mirror: Arc::clone(&self.mirror),
            connected: Arc::clone(&self.connected),
            events: self.events.clone(),
        };
        tokio::spawn(run_connection_loop(
            self.config.clone(),
            shared,
            command_rx,
            self.shutdown.subscribe(),
            first_tx,
        ));

        match first_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Graceful close; the connection task emits `Disconnected`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.commands.lock() = None;
        let _ = self.shutdown.send(());
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    async fn request(&self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::RouterNotConnected(self.config.id));
        }
        let sender = self
            .commands
            .lock()
            .clone()
            .ok_or(Error::RouterNotConnected(self.config.id))?;

        let (respond, receive) = oneshot::channel();
        sender
            .send(Request { command, respond })
            .await
            .map_err(|_| Error::RouterNotConnected(self.config.id))?;

        // A dropped responder means the session died with the request
        // still queued.
        receive.await.map_err(|_| Error::Timeout)?
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

#[async_trait]
impl RouterPort for Controller {
    fn id(&self) -> RouterId {
        self.config.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn state(&self) -> RouterState {
        self.mirror.read().clone()
    }

    async fn set_route(&self, output: u16, input: u16, level: u8) -> Result<()> {
        self.request(Command::SetRoute {
            output,
            input,
            level,
        })
        .await
    }

    async fn set_input_label(&self, index: u16, text: &str) -> Result<()> {
        self.request(Command::SetInputLabel {
            index,
            text: text.to_string(),
        })
        .await
    }

    async fn set_output_label(&self, index: u16, text: &str) -> Result<()> {
        self.request(Command::SetOutputLabel {
            index,
            text: text.to_string(),
        })
        .await
    }

    async fn set_lock(&self, output: u16, state: LockCommand) -> Result<()> {
        self.request(Command::SetLock { output, state }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const FIXTURE_DUMP: &str = "PROTOCOL PREAMBLE:\nVersion: 2.8\n\n\
        VIDEOHUB DEVICE:\nDevice present: true\nModel name: Test Hub\n\
        Video inputs: 8\nVideo outputs: 8\n\n\
        INPUT LABELS:\n0 Cam 1\n\n\
        OUTPUT LABELS:\n0 Mon\n\n\
        VIDEO OUTPUT ROUTING:\n0 0\n1 1\n\n\
        VIDEO OUTPUT LOCKS:\n0 U\n\n";

    /// Minimal scripted VideoHub device: dumps on connect, then answers
    /// every routing block with the echoed tally plus ACK.
    async fn spawn_fixture() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    socket.write_all(FIXTURE_DUMP.as_bytes()).await.ok();
                    let mut buf = vec![0u8; 1024];
                    let mut text = String::new();
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        text.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(pos) = text.find("\n\n") {
                            let block = text[..pos].to_string();
                            text = text[pos + 2..].to_string();
                            if let Some(rows) = block.strip_prefix("VIDEO OUTPUT ROUTING:\n") {
                                let reply =
                                    format!("VIDEO OUTPUT ROUTING:\n{}\n\nACK\n\n", rows.trim());
                                socket.write_all(reply.as_bytes()).await.ok();
                            } else {
                                socket.write_all(b"ACK\n\n").await.ok();
                            }
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    fn test_config(id: RouterId, addr: std::net::SocketAddr) -> ControllerConfig {
        let mut config = ControllerConfig::new(id, addr.ip().to_string(), ProtocolKind::VideoHub)
            .with_port(addr.port());
        config.auto_reconnect = false;
        config.request_timeout = Duration::from_secs(2);
        config
    }

    #[tokio::test]
    async fn test_connect_populates_mirror() {
        let (addr, fixture) = spawn_fixture().await;
        let controller = Controller::new(test_config(RouterId::A, addr));

        controller.connect().await.unwrap();
        assert!(controller.is_connected());

        let state = controller.state();
        assert_eq!(state.inputs, 8);
        assert_eq!(state.outputs, 8);
        assert_eq!(state.route(1), Some(1));
        assert_eq!(state.input_label(0), "Cam 1");

        fixture.abort();
    }

    #[tokio::test]
    async fn test_set_route_acks_and_updates_mirror() {
        let (addr, fixture) = spawn_fixture().await;
        let controller = Controller::new(test_config(RouterId::A, addr));
        controller.connect().await.unwrap();

        controller.set_route(2, 5, 0).await.unwrap();

        // The echoed tally lands before the ACK, so the mirror is
        // already current.
        assert_eq!(controller.state().route(2), Some(5));

        fixture.abort();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind-then-drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let controller = Controller::new(test_config(RouterId::A, addr));
        let err = controller.connect().await.unwrap_err();
        assert!(matches!(err, Error::UnreachableHost(_)));
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_write_rejected_when_not_connected() {
        let config = ControllerConfig::new(RouterId::B, "127.0.0.1", ProtocolKind::VideoHub);
        let controller = Controller::new(config);
        let err = controller.set_route(0, 0, 0).await.unwrap_err();
        assert!(matches!(err, Error::RouterNotConnected(RouterId::B)));
    }

    #[tokio::test]
    async fn test_reconnect_emits_events() {
        // Fixture that dumps then drops the first connection, then keeps
        // the second alive.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let fixture = tokio::spawn(async move {
            // First connection: dump then close.
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(FIXTURE_DUMP.as_bytes()).await.ok();
            drop(socket);
            // Second connection: dump and keep alive.
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(FIXTURE_DUMP.as_bytes()).await.ok();
            let mut buf = vec![0u8; 1024];
            loop {
                if matches!(socket.read(&mut buf).await, Ok(0) | Err(_)) {
                    return;
                }
            }
        });

        let mut config = test_config(RouterId::A, addr);
        config.auto_reconnect = true;
        config.initial_backoff = Duration::from_millis(10);
        let controller = Controller::new(config);
        let mut events = controller.subscribe();

        controller.connect().await.unwrap();

        let mut saw_disconnect = false;
        let mut saw_reconnecting = false;
        let mut saw_reconnected = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !(saw_disconnect && saw_reconnecting && saw_reconnected) {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("reconnect cycle timed out")
                .unwrap();
            match event {
                ControllerEvent::Disconnected => saw_disconnect = true,
                ControllerEvent::Reconnecting(n) => {
                    assert!(n >= 1);
                    saw_reconnecting = true;
                }
                ControllerEvent::Connected if saw_reconnecting => saw_reconnected = true,
                _ => {}
            }
        }

        assert!(controller.is_connected());
        fixture.abort();
    }
}
