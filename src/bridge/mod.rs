//! Northbound Bridge
//!
//! Responsibilities:
//! - Re-export the virtual matrix as a VideoHub 2.8 TCP device
//! - Forward client commands into the engine via the orchestrator
//! - Diff virtual-state updates and push only the changed rows
//! - Per-TCP-session lock ownership layered over physical locks
//!
//! Third-party panels connect here and drive the combined matrix without
//! knowing two routers and a tie-line pool sit underneath.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::common::{LockCommand, LockState};
use crate::error::{Error, Result};
use crate::matrix::VirtualMatrix;
use crate::protocol::videohub::{
    self, Block, BlockScanner, SECTION_DEVICE, SECTION_INPUT_LABELS, SECTION_LOCKS,
    SECTION_OUTPUT_LABELS, SECTION_PING, SECTION_PREAMBLE, SECTION_ROUTING,
};

const DEVICE_NAME: &str = "tielink Virtual Router";

/// A command forwarded from a bridge client to the orchestrator.
///
/// The reply carries success only; result detail stays engine-side and
/// the bridge answers the client with ACK/NAK.
#[derive(Debug)]
pub enum BridgeCommand {
    Route {
        output: u16,
        input: u16,
        reply: oneshot::Sender<bool>,
    },
    SetInputLabel {
        index: u16,
        text: String,
        reply: oneshot::Sender<bool>,
    },
    SetOutputLabel {
        index: u16,
        text: String,
        reply: oneshot::Sender<bool>,
    },
    /// Forward a lock change to the physical router owning the output
    SetLock { output: u16, state: LockCommand },
}

/// Status snapshot for the upstream API.
#[derive(Debug, Clone)]
pub struct BridgeStatus {
    pub running: bool,
    pub listen: String,
    pub clients: usize,
}

struct Client {
    sender: mpsc::UnboundedSender<String>,
}

struct Shared {
    commands: mpsc::Sender<BridgeCommand>,
    state: watch::Receiver<Arc<VirtualMatrix>>,
    clients: Mutex<HashMap<u64, Client>>,
    /// Virtual output -> owning client session
    session_locks: Mutex<HashMap<u16, u64>>,
}

impl Shared {
    fn matrix(&self) -> Arc<VirtualMatrix> {
        self.state.borrow().clone()
    }

    /// Lock state as seen by one client: `O` for its own holdings, `L`
    /// for other sessions or the physical router, `U` otherwise.
    fn lock_char(&self, client_id: u64, matrix: &VirtualMatrix, output: u16) -> char {
        match self.session_locks.lock().get(&output) {
            Some(owner) if *owner == client_id => 'O',
            Some(_) => 'L',
            None => match matrix.lock(output) {
                LockState::Unlocked => 'U',
                LockState::Owned | LockState::Locked => 'L',
            },
        }
    }

    fn lock_section(&self, client_id: u64, matrix: &VirtualMatrix) -> String {
        let rows: Vec<(u16, String)> = (0..matrix.outputs)
            .map(|v| (v, self.lock_char(client_id, matrix, v).to_string()))
            .collect();
        videohub::encode_rows(SECTION_LOCKS, &rows)
    }

    fn routing_section(&self, matrix: &VirtualMatrix) -> String {
        let mut rows: Vec<(u16, String)> = matrix
            .routing()
            .iter()
            .map(|(out, input)| (*out, input.to_string()))
            .collect();
        rows.sort_unstable();
        videohub::encode_rows(SECTION_ROUTING, &rows)
    }

    fn label_section(&self, matrix: &VirtualMatrix, outputs: bool) -> String {
        let (count, header) = if outputs {
            (matrix.outputs, SECTION_OUTPUT_LABELS)
        } else {
            (matrix.inputs, SECTION_INPUT_LABELS)
        };
        let rows: Vec<(u16, String)> = (0..count)
            .map(|v| {
                let label = if outputs {
                    matrix.output_label(v)
                } else {
                    matrix.input_label(v)
                };
                (v, label.unwrap_or_default().to_string())
            })
            .collect();
        videohub::encode_rows(header, &rows)
    }

    /// Everything a freshly connected client receives.
    fn full_dump(&self, client_id: u64, matrix: &VirtualMatrix) -> String {
        let mut dump = videohub::encode_preamble();
        dump.push_str(&videohub::encode_device(
            DEVICE_NAME,
            matrix.inputs,
            matrix.outputs,
        ));
        dump.push_str(&self.label_section(matrix, false));
        dump.push_str(&self.label_section(matrix, true));
        dump.push_str(&self.routing_section(matrix));
        dump.push_str(&self.lock_section(client_id, matrix));
        dump
    }

    fn send_to(&self, client_id: u64, text: String) {
        if let Some(client) = self.clients.lock().get(&client_id) {
            let _ = client.sender.send(text);
        }
    }

    /// Send per-client rendered text to every connected session.
    fn send_each(&self, render: impl Fn(u64) -> Option<String>) {
        let clients = self.clients.lock();
        for (id, client) in clients.iter() {
            if let Some(text) = render(*id) {
                let _ = client.sender.send(text);
            }
        }
    }

    /// Broadcast the lock rows for specific outputs, rendered per client.
    fn broadcast_lock_rows(&self, matrix: &VirtualMatrix, outputs: &[u16]) {
        if outputs.is_empty() {
            return;
        }
        self.send_each(|client_id| {
            let rows: Vec<(u16, String)> = outputs
                .iter()
                .map(|v| (*v, self.lock_char(client_id, matrix, *v).to_string()))
                .collect();
            Some(videohub::encode_rows(SECTION_LOCKS, &rows))
        });
    }

    /// Release every lock a departing session held; returns the outputs
    /// that changed.
    fn release_session_locks(&self, client_id: u64) -> Vec<u16> {
        let mut locks = self.session_locks.lock();
        let released: Vec<u16> = locks
            .iter()
            .filter(|(_, owner)| **owner == client_id)
            .map(|(output, _)| *output)
            .collect();
        for output in &released {
            locks.remove(output);
        }
        released
    }
}

/// The VideoHub re-export server.
pub struct BridgeServer {
    listen: String,
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    next_client: AtomicU64,
}

impl BridgeServer {
    pub fn new(
        listen: impl Into<String>,
        commands: mpsc::Sender<BridgeCommand>,
        state: watch::Receiver<Arc<VirtualMatrix>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            listen: listen.into(),
            shared: Arc::new(Shared {
                commands,
                state,
                clients: Mutex::new(HashMap::new()),
                session_locks: Mutex::new(HashMap::new()),
            }),
            shutdown,
            next_client: AtomicU64::new(1),
        }
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            running: true,
            listen: self.listen.clone(),
            clients: self.shared.clients.lock().len(),
        }
    }

    /// Accept loop plus the state-diff broadcaster.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|_| Error::Bridge(format!("invalid listen address: {}", self.listen)))?;
        let listener = TcpListener::bind(addr).await?;
        info!("Bridge listening on {} (VideoHub 2.8)", addr);

        // Diff broadcaster: one task watches the virtual state and pushes
        // changed rows to every client.
        let diff_shared = Arc::clone(&self.shared);
        let mut diff_shutdown = self.shutdown.subscribe();
        let mut state_rx = self.shared.state.clone();
        tokio::spawn(async move {
            let mut previous = state_rx.borrow().clone();
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let next = state_rx.borrow_and_update().clone();
                        broadcast_diff(&diff_shared, &previous, &next);
                        previous = next;
                    }
                    _ = diff_shutdown.recv() => return,
                }
            }
        });

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            let client_id = self.next_client.fetch_add(1, Ordering::SeqCst);
                            debug!("Bridge client #{} from {}", client_id, peer);
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(shared, socket, client_id).await {
                                    debug!("Bridge client #{} ended: {}", client_id, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Bridge accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Bridge shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Push changed rows per section; a size change triggers a full re-dump.
fn broadcast_diff(shared: &Shared, previous: &VirtualMatrix, next: &VirtualMatrix) {
    if previous.inputs != next.inputs || previous.outputs != next.outputs {
        shared.send_each(|client_id| Some(shared.full_dump(client_id, next)));
        return;
    }

    let mut routing_rows: Vec<(u16, String)> = Vec::new();
    for v in 0..next.outputs {
        let new_route = next.route(v);
        if previous.route(v) != new_route {
            if let Some(input) = new_route {
                routing_rows.push((v, input.to_string()));
            }
        }
    }

    let mut input_rows: Vec<(u16, String)> = Vec::new();
    for v in 0..next.inputs {
        if previous.input_label(v) != next.input_label(v) {
            input_rows.push((v, next.input_label(v).unwrap_or_default().to_string()));
        }
    }

    let mut output_rows: Vec<(u16, String)> = Vec::new();
    let mut lock_rows: Vec<u16> = Vec::new();
    for v in 0..next.outputs {
        if previous.output_label(v) != next.output_label(v) {
            output_rows.push((v, next.output_label(v).unwrap_or_default().to_string()));
        }
        if previous.lock(v) != next.lock(v) {
            lock_rows.push(v);
        }
    }

    if !routing_rows.is_empty() {
        let text = videohub::encode_rows(SECTION_ROUTING, &routing_rows);
        shared.send_each(|_| Some(text.clone()));
    }
    if !input_rows.is_empty() {
        let text = videohub::encode_rows(SECTION_INPUT_LABELS, &input_rows);
        shared.send_each(|_| Some(text.clone()));
    }
    if !output_rows.is_empty() {
        let text = videohub::encode_rows(SECTION_OUTPUT_LABELS, &output_rows);
        shared.send_each(|_| Some(text.clone()));
    }
    shared.broadcast_lock_rows(next, &lock_rows);
}

async fn handle_client(shared: Arc<Shared>, socket: TcpStream, client_id: u64) -> Result<()> {
    let (mut read_half, mut write_half) = socket.into_split();

    // Writer task drains this client's outbound queue.
    let (sender, mut outbox) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbox.recv().await {
            if write_half.write_all(text.as_bytes()).await.is_err() {
                return;
            }
        }
    });

    shared.clients.lock().insert(client_id, Client { sender });
    crate::app::metrics::BRIDGE_CLIENTS_ACTIVE.inc();

    // Full-status dump on connect.
    let matrix = shared.matrix();
    shared.send_to(client_id, shared.full_dump(client_id, &matrix));

    let mut scanner = BlockScanner::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for block in scanner.feed(&buf[..n]) {
            handle_block(&shared, client_id, block).await;
        }
    }

    // Session teardown: drop the client, release its locks, forward the
    // unlocks to the physical routers, tell everyone else.
    shared.clients.lock().remove(&client_id);
    crate::app::metrics::BRIDGE_CLIENTS_ACTIVE.dec();
    let released = shared.release_session_locks(client_id);
    for output in &released {
        let _ = shared
            .commands
            .send(BridgeCommand::SetLock {
                output: *output,
                state: LockCommand::Release,
            })
            .await;
    }
    shared.broadcast_lock_rows(&shared.matrix(), &released);

    writer.abort();
    debug!("Bridge client #{} disconnected", client_id);
    Ok(())
}

async fn handle_block(shared: &Arc<Shared>, client_id: u64, block: Block) {
    match block.header.as_str() {
        SECTION_PING => shared.send_to(client_id, videohub::ACK.to_string()),
        SECTION_PREAMBLE => {
            shared.send_to(client_id, videohub::encode_preamble());
        }
        SECTION_DEVICE => {
            let matrix = shared.matrix();
            shared.send_to(
                client_id,
                videohub::encode_device(DEVICE_NAME, matrix.inputs, matrix.outputs),
            );
        }
        SECTION_ROUTING => handle_routing(shared, client_id, &block.rows).await,
        SECTION_INPUT_LABELS => handle_labels(shared, client_id, &block.rows, false).await,
        SECTION_OUTPUT_LABELS => handle_labels(shared, client_id, &block.rows, true).await,
        SECTION_LOCKS => handle_locks(shared, client_id, &block.rows).await,
        other => {
            warn!("Bridge client #{} sent unknown section {:?}", client_id, other);
            shared.send_to(client_id, videohub::NAK.to_string());
        }
    }
}

async fn handle_routing(shared: &Arc<Shared>, client_id: u64, rows: &[String]) {
    if rows.is_empty() {
        // Query form: dump the section.
        let matrix = shared.matrix();
        let section = shared.routing_section(&matrix);
        shared.send_to(client_id, section);
        return;
    }

    let mut all_ok = true;
    for row in rows {
        let Some((output, input)) = parse_pair(row) else {
            all_ok = false;
            continue;
        };

        let (reply, receive) = oneshot::channel();
        let sent = shared
            .commands
            .send(BridgeCommand::Route {
                output,
                input,
                reply,
            })
            .await
            .is_ok();
        let ok = sent && receive.await.unwrap_or(false);

        if !ok {
            all_ok = false;
            // Re-broadcast the unchanged crosspoint to this client only.
            let matrix = shared.matrix();
            if let Some(current) = matrix.route(output) {
                let text = videohub::encode_rows(
                    SECTION_ROUTING,
                    &[(output, current.to_string())],
                );
                shared.send_to(client_id, text);
            }
        }
    }

    let verdict = if all_ok { videohub::ACK } else { videohub::NAK };
    shared.send_to(client_id, verdict.to_string());
}

async fn handle_labels(shared: &Arc<Shared>, client_id: u64, rows: &[String], outputs: bool) {
    if rows.is_empty() {
        let matrix = shared.matrix();
        let section = shared.label_section(&matrix, outputs);
        shared.send_to(client_id, section);
        return;
    }

    let mut all_ok = true;
    for row in rows {
        let Some((index, text)) = split_index_row(row) else {
            all_ok = false;
            continue;
        };
        let (reply, receive) = oneshot::channel();
        let command = if outputs {
            BridgeCommand::SetOutputLabel {
                index,
                text: text.to_string(),
                reply,
            }
        } else {
            BridgeCommand::SetInputLabel {
                index,
                text: text.to_string(),
                reply,
            }
        };
        let sent = shared.commands.send(command).await.is_ok();
        if !(sent && receive.await.unwrap_or(false)) {
            all_ok = false;
        }
    }

    let verdict = if all_ok { videohub::ACK } else { videohub::NAK };
    shared.send_to(client_id, verdict.to_string());
}

async fn handle_locks(shared: &Arc<Shared>, client_id: u64, rows: &[String]) {
    let matrix = shared.matrix();
    if rows.is_empty() {
        let section = shared.lock_section(client_id, &matrix);
        shared.send_to(client_id, section);
        return;
    }

    let mut all_ok = true;
    let mut changed: Vec<u16> = Vec::new();

    for row in rows {
        let Some((output, value)) = split_index_row(row) else {
            all_ok = false;
            continue;
        };
        if output >= matrix.outputs {
            all_ok = false;
            continue;
        }

        let request = value.chars().next().unwrap_or(' ');
        let forward = {
            let mut locks = shared.session_locks.lock();
            let owner = locks.get(&output).copied();

            match request {
                'O' => match owner {
                    Some(o) if o != client_id => {
                        all_ok = false;
                        None
                    }
                    Some(_) => None, // already ours
                    None => {
                        locks.insert(output, client_id);
                        changed.push(output);
                        Some(LockCommand::Own)
                    }
                },
                'U' => match owner {
                    Some(o) if o == client_id => {
                        locks.remove(&output);
                        changed.push(output);
                        Some(LockCommand::Release)
                    }
                    // Only the owner releases with U.
                    Some(_) => {
                        all_ok = false;
                        None
                    }
                    None => None,
                },
                'F' => {
                    if locks.remove(&output).is_some() {
                        changed.push(output);
                    }
                    Some(LockCommand::Force)
                }
                _ => {
                    all_ok = false;
                    None
                }
            }
        };

        if let Some(state) = forward {
            let _ = shared
                .commands
                .send(BridgeCommand::SetLock { output, state })
                .await;
        }
    }

    let verdict = if all_ok { videohub::ACK } else { videohub::NAK };
    shared.send_to(client_id, verdict.to_string());
    shared.broadcast_lock_rows(&matrix, &changed);
}

fn parse_pair(row: &str) -> Option<(u16, u16)> {
    let mut parts = row.split_whitespace();
    let output = parts.next()?.parse().ok()?;
    let input = parts.next()?.parse().ok()?;
    Some((output, input))
}

fn split_index_row(row: &str) -> Option<(u16, &str)> {
    let mut parts = row.splitn(2, ' ');
    let index = parts.next()?.parse().ok()?;
    Some((index, parts.next().unwrap_or("").trim()))
}
