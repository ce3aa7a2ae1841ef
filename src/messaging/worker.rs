use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::cluster_view::ClusterView;
use crate::config::versioned_store::VersionedConfigStore;
use crate::messaging::connection::{ConnectionId, SendOptions};
use crate::messaging::messages::{
    ConfigAdvisoryHeader, GetSnapshotHeader, Message, SnapshotReplyHeader,
};
use crate::messaging::node_addr::{ClientId, NodeId, PeerAddr};
use crate::messaging::sender::{fire_batches, FrameAction, SendError, Sender};
use crate::messaging::settings::Settings;
use crate::messaging::socket_io::{spawn_accept_loop, SocketEvent};
use crate::status::Status;

/// Key under which a node's state snapshot lives in its versioned config
///  store; GET_SNAPSHOT requests are answered from it.
pub const SNAPSHOT_KEY: &str = "state_snapshot";

const CONFIG_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of work executed to completion on the worker thread. Requests own
///  their state; anything they want back out goes through channels they
///  capture.
pub trait Request: Send + 'static {
    fn execute(self: Box<Self>, ctx: &mut WorkerContext);
}

struct ClosureRequest<F>(F);

impl<F: FnOnce(&mut WorkerContext) + Send + 'static> Request for ClosureRequest<F> {
    fn execute(self: Box<Self>, ctx: &mut WorkerContext) {
        (self.0)(ctx)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Disposition {
    /// the request is done; remove it from the registry
    Complete,
    /// keep the registry entry, further replies are expected
    KeepWaiting,
}

/// A running snapshot fetch, registered under its request id so inbound
///  SNAPSHOT_REPLY frames can be routed to it. Replies for unknown ids are
///  dropped silently - the request has completed or was cancelled.
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotRequest: Send + 'static {
    fn on_reply(&mut self, from: PeerAddr, status: Status, blob: Bytes) -> Disposition;
}

pub struct WorkerOptions {
    pub settings: Settings,
    pub cluster: ClusterView,
    /// this node's own identity; checked against HELLO destinations
    pub node_id: Option<NodeId>,
    /// bind address for inbound peers; `None` for client-only workers
    pub listen_address: Option<SocketAddr>,
    pub config_store: Option<Arc<dyn VersionedConfigStore>>,
}

enum WorkerTask {
    Request(Box<dyn Request>),
    Shutdown,
}

/// Handle on a worker thread. Work is posted in; the worker owns all
///  messaging state exclusively and runs it on a single-threaded event loop.
pub struct Worker {
    task_tx: mpsc::UnboundedSender<WorkerTask>,
    thread: Option<std::thread::JoinHandle<()>>,
    listen_address: Option<SocketAddr>,
}

impl Worker {
    pub fn spawn(options: WorkerOptions) -> anyhow::Result<Worker> {
        options.settings.validate()?;

        let listener = match options.listen_address {
            Some(addr) => {
                let listener = std::net::TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                Some(listener)
            }
            None => None,
        };
        let listen_address = match &listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("loghive-worker".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build worker runtime");
                rt.block_on(worker_main(options, listener, task_rx));
            })?;

        Ok(Worker {
            task_tx,
            thread: Some(thread),
            listen_address,
        })
    }

    /// The actual bound address, useful when binding to an ephemeral port.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        self.listen_address
    }

    pub fn post(&self, request: Box<dyn Request>) -> Result<(), Status> {
        self.task_tx
            .send(WorkerTask::Request(request))
            .map_err(|_| Status::Shutdown)
    }

    /// Convenience for posting a closure as a request.
    pub fn add(&self, f: impl FnOnce(&mut WorkerContext) + Send + 'static) -> Result<(), Status> {
        self.post(Box::new(ClosureRequest(f)))
    }

    /// Blocking: stops accepting work, closes every connection with
    ///  `Shutdown` (draining all callbacks), and joins the event loop.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        let _ = self.task_tx.send(WorkerTask::Shutdown);
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                error!("worker thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

async fn worker_main(
    options: WorkerOptions,
    listener: Option<std::net::TcpListener>,
    mut task_rx: mpsc::UnboundedReceiver<WorkerTask>,
) {
    let settings = Arc::new(options.settings);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut ctx = WorkerContext::new(
        settings,
        options.cluster,
        options.node_id,
        options.config_store,
        event_tx.clone(),
    );

    let accept_task = listener.and_then(|l| match tokio::net::TcpListener::from_std(l) {
        Ok(listener) => Some(spawn_accept_loop(listener, event_tx)),
        Err(e) => {
            error!("failed to register listener with the event loop: {}", e);
            None
        }
    });

    let mut sweep = tokio::time::interval(CONFIG_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(node = ?ctx.node_id, "worker up");
    loop {
        tokio::select! {
            task = task_rx.recv() => match task {
                Some(WorkerTask::Request(request)) => request.execute(&mut ctx),
                Some(WorkerTask::Shutdown) | None => break,
            },
            Some(event) = event_rx.recv() => ctx.on_socket_event(event),
            _ = sweep.tick() => ctx.on_sweep_tick(),
        }
    }

    info!(node = ?ctx.node_id, "worker shutting down");
    ctx.shutting_down = true;
    if let Some(task) = accept_task {
        task.abort();
    }
    let batches = ctx.sender.shutdown_sockets();
    fire_batches(batches, &mut ctx);
}

/// The worker's mutable state, passed to every request and callback. All
///  messaging operations go through here; nothing in it is shared across
///  threads.
pub struct WorkerContext {
    settings: Arc<Settings>,
    cluster: ClusterView,
    node_id: Option<NodeId>,
    config_store: Option<Arc<dyn VersionedConfigStore>>,
    pub(crate) sender: Sender,
    snapshot_requests: FxHashMap<u64, Box<dyn SnapshotRequest>>,
    next_rqid: u64,
    last_config_version: u64,
    shutting_down: bool,
}

impl WorkerContext {
    pub(crate) fn new(
        settings: Arc<Settings>,
        cluster: ClusterView,
        node_id: Option<NodeId>,
        config_store: Option<Arc<dyn VersionedConfigStore>>,
        event_tx: crate::messaging::socket_io::EventSender,
    ) -> WorkerContext {
        let last_config_version = cluster.current().version;
        let sender = Sender::new(settings.clone(), cluster.clone(), node_id, event_tx);
        WorkerContext {
            settings,
            cluster,
            node_id,
            config_store,
            sender,
            snapshot_requests: FxHashMap::default(),
            next_rqid: 0,
            last_config_version,
            shutting_down: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Sends `msg` to `peer`, creating a connection on first use. On a sync
    ///  error the caller keeps the message; once accepted, the outcome
    ///  arrives through the optional callbacks.
    pub fn send_message(
        &mut self,
        msg: Message,
        peer: PeerAddr,
        options: SendOptions,
    ) -> Result<(), SendError> {
        if self.shutting_down {
            return Err(SendError {
                status: Status::Shutdown,
                msg,
                options,
            });
        }
        let batch = self.sender.send_message(msg, peer, options)?;
        batch.fire(&peer, self);
        Ok(())
    }

    /// Initiates a connection to `node` without sending anything.
    pub fn connect(&mut self, node: NodeId) -> Result<(), Status> {
        if self.shutting_down {
            return Err(Status::Shutdown);
        }
        self.sender.connect(node)
    }

    /// Closes the connection to `peer`, firing every pending callback with
    ///  `reason`. Returns false if there is no such connection (including
    ///  when it was already closed). Idempotent.
    pub fn close_connection(&mut self, peer: PeerAddr, reason: Status) -> bool {
        match self.sender.close_connection(&peer, reason) {
            Some((peer, batch)) => {
                batch.fire(&peer, self);
                true
            }
            None => false,
        }
    }

    pub fn is_handshaken(&self, peer: PeerAddr) -> bool {
        self.sender.is_handshaken(&peer)
    }

    /// Encoded bytes awaiting transmission on the connection; 0 when the
    ///  connection does not exist.
    pub fn buffered_bytes(&self, peer: PeerAddr) -> usize {
        self.sender.buffered_bytes(&peer)
    }

    /// Everything charged against budgets on behalf of the connection,
    ///  including pre-handshake reservations.
    pub fn bytes_pending(&self, peer: PeerAddr) -> usize {
        self.sender.bytes_pending(&peer)
    }

    /// (server bytes, client bytes) currently charged against the worker's
    ///  output budgets.
    pub fn used_output_bytes(&self) -> (usize, usize) {
        self.sender.used_bytes()
    }

    /// Identity of the current connection to the node, if any. Ids are never
    ///  reused, so comparing them detects connection replacement.
    pub fn find_server_connection(&self, node_index: u64) -> Option<ConnectionId> {
        self.sender.find_server_connection(node_index)
    }

    /// Accepted inbound connections and whether each is handshaken.
    pub fn client_connections(&self) -> Vec<(ClientId, bool)> {
        self.sender.client_connections()
    }

    /// Starts a snapshot fetch from `node`: registers `request` and sends
    ///  GET_SNAPSHOT. Replies are routed to the request by id until it
    ///  returns `Disposition::Complete`.
    pub fn fetch_snapshot(
        &mut self,
        node: NodeId,
        request: Box<dyn SnapshotRequest>,
    ) -> Result<u64, SendError> {
        self.next_rqid += 1;
        let rqid = self.next_rqid;
        let msg = Message::GetSnapshot(GetSnapshotHeader { flags: 0, rqid });
        self.send_message(msg, PeerAddr::Server(node), SendOptions::new())?;
        self.snapshot_requests.insert(rqid, request);
        Ok(rqid)
    }

    /// Deregisters a running snapshot fetch; later replies for its id are
    ///  dropped silently.
    pub fn cancel_snapshot_request(&mut self, rqid: u64) -> bool {
        self.snapshot_requests.remove(&rqid).is_some()
    }

    pub(crate) fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Accepted {
                stream,
                peer_address,
            } => self.sender.on_accepted(stream, peer_address),
            SocketEvent::Connected {
                peer,
                conn_id,
                stream,
            } => self.sender.on_connected(peer, conn_id, stream),
            SocketEvent::ConnectFailed {
                peer,
                conn_id,
                error,
            } => {
                let closed = self.sender.on_connect_failed(peer, conn_id, error);
                fire_batches(closed.into_iter().collect(), self);
            }
            SocketEvent::Frame { peer, conn_id, msg } => {
                match self.sender.on_frame(peer, conn_id, msg) {
                    FrameAction::None => {}
                    FrameAction::Fire(batches) => fire_batches(batches, self),
                    FrameAction::Dispatch { from, msg } => self.dispatch_message(from, msg),
                }
            }
            SocketEvent::Flushed { peer, conn_id, seq } => {
                self.sender.on_flushed(peer, conn_id, seq)
            }
            SocketEvent::SocketClosed {
                peer,
                conn_id,
                reason,
            } => {
                let closed = self.sender.on_socket_closed(peer, conn_id, reason);
                fire_batches(closed.into_iter().collect(), self);
            }
            SocketEvent::HandshakeTimeout { peer, conn_id } => {
                let closed = self.sender.on_handshake_timeout(peer, conn_id);
                fire_batches(closed.into_iter().collect(), self);
            }
        }
    }

    /// Routes an application message from a handshaken peer.
    fn dispatch_message(&mut self, from: PeerAddr, msg: Message) {
        trace!(?from, ?msg, "dispatching message");
        match msg {
            Message::ConfigAdvisory(advisory) => self.on_config_advisory(from, advisory),
            Message::Stored(stored) => {
                // store results are routed by the append machinery, which
                //  lives above this layer
                debug!(?from, ?stored, "received STORED");
            }
            Message::GetSnapshot(request) => self.reply_snapshot(from, request),
            Message::SnapshotReply(header, blob) => self.on_snapshot_reply(from, header, blob),
            Message::Hello(_) | Message::Ack(_) => {
                // the sender routes handshake frames before dispatch
                warn!(?from, "handshake frame reached dispatch, dropping");
            }
        }
    }

    fn on_config_advisory(&mut self, from: PeerAddr, advisory: ConfigAdvisoryHeader) {
        let current = self.cluster.current().version;
        if advisory.config_version > current {
            debug!(
                ?from,
                theirs = advisory.config_version,
                ours = current,
                "peer advertises a newer configuration"
            );
        }
    }

    fn reply_snapshot(&mut self, from: PeerAddr, request: GetSnapshotHeader) {
        let (status, blob) = match &self.config_store {
            Some(store) => match store.get_config_sync(SNAPSHOT_KEY, None) {
                (Status::Ok, Some(value)) => (Status::Ok, value),
                (Status::Ok, None) | (Status::NotFound, _) => (Status::NotFound, Bytes::new()),
                (status, _) => (status, Bytes::new()),
            },
            None => (Status::NotFound, Bytes::new()),
        };

        let reply = Message::SnapshotReply(
            SnapshotReplyHeader {
                status,
                rqid: request.rqid,
            },
            blob,
        );
        if let Err(e) = self.send_message(reply, from, SendOptions::new()) {
            debug!(?from, status = %e.status, "could not send snapshot reply");
        }
    }

    fn on_snapshot_reply(&mut self, from: PeerAddr, header: SnapshotReplyHeader, blob: Bytes) {
        let Some(request) = self.snapshot_requests.get_mut(&header.rqid) else {
            trace!(rqid = header.rqid, "no running snapshot request, dropping reply");
            return;
        };
        match request.on_reply(from, header.status, blob) {
            Disposition::Complete => {
                self.snapshot_requests.remove(&header.rqid);
            }
            Disposition::KeepWaiting => {}
        }
    }

    pub(crate) fn on_sweep_tick(&mut self) {
        let snapshot = self.cluster.current();
        if snapshot.version != self.last_config_version {
            debug!(version = snapshot.version, "observed new cluster snapshot");
            self.last_config_version = snapshot.version;
            self.broadcast_config_advisory(snapshot.version);
        }

        let batches = self.sender.sweep_departed_nodes();
        fire_batches(batches, self);
    }

    fn broadcast_config_advisory(&mut self, version: u64) {
        for peer in self.sender.handshaken_peers() {
            let msg = Message::ConfigAdvisory(ConfigAdvisoryHeader {
                config_version: version,
            });
            if let Err(e) = self.send_message(msg, peer, SendOptions::new()) {
                debug!(?peer, status = %e.status, "could not send config advisory");
            }
        }
    }
}
