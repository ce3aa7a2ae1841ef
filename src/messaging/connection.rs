use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::messaging::messages::Message;
use crate::messaging::node_addr::PeerAddr;
use crate::messaging::socket_io::WireChunk;
use crate::messaging::worker::WorkerContext;
use crate::status::Status;

/// Distinguishes incarnations of a connection to the same peer: stale socket
///  events and stale lookups compare ids, never just peer addresses.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Fires once when the message leaves the send pipeline: with `Ok` when it
///  reaches the wire stage, or with the reason it never will. May reenter
///  the messaging API through the context.
pub type OnSent = Box<dyn FnOnce(Status, &PeerAddr, &mut WorkerContext)>;

/// Fires once when the connection closes, after every pending on-sent has
///  observed the same reason.
pub type OnClose = Box<dyn FnOnce(Status, &PeerAddr, &mut WorkerContext)>;

#[derive(Default)]
pub struct SendOptions {
    pub on_sent: Option<OnSent>,
    pub on_close: Option<OnClose>,
    /// a cancelled message is dropped at the wire stage; its on-sent fires
    ///  with `Cancelled`
    pub cancelled: bool,
}

impl SendOptions {
    pub fn new() -> SendOptions {
        SendOptions::default()
    }

    pub fn on_sent(
        mut self,
        cb: impl FnOnce(Status, &PeerAddr, &mut WorkerContext) + 'static,
    ) -> SendOptions {
        self.on_sent = Some(Box::new(cb));
        self
    }

    pub fn on_close(
        mut self,
        cb: impl FnOnce(Status, &PeerAddr, &mut WorkerContext) + 'static,
    ) -> SendOptions {
        self.on_close = Some(Box::new(cb));
        self
    }

    pub fn cancelled(mut self) -> SendOptions {
        self.cancelled = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    /// created, no connect() yet (outbound only)
    Fresh,
    /// TCP connect in flight
    Connecting,
    /// HELLO written, waiting for ACK
    HandshakeSent,
    /// inbound socket waiting for the peer's HELLO
    AwaitingHello,
    Handshaken,
    Closing,
    Closed,
}

/// A message accepted before the protocol version is known. Kept as the
///  typed value because encoding depends on the negotiated version; the
///  budget holds `reserved` bytes (its size at the minimum supported
///  protocol) until the drain settles the difference.
pub(crate) struct PendingSend {
    pub msg: Message,
    pub reserved: usize,
    pub on_sent: Option<OnSent>,
    pub cancelled: bool,
}

/// A frame at the wire stage. `seq` is set for frames handed to the write
///  task (their bytes are released when the flush notification comes back);
///  it is `None` for frames held in flight by error injection, which keep
///  their on-sent callback until close.
struct WireFrame {
    seq: Option<u64>,
    size: usize,
    on_sent: Option<OnSent>,
}

/// Callbacks collected by a connection mutation, to be fired by the worker
///  after the connection borrow is released. Reentrant sends and closes from
///  inside a callback are safe because each record has already been removed
///  from the connection when it fires.
#[derive(Default)]
pub(crate) struct CallbackBatch {
    pub on_sent: Vec<(Status, OnSent)>,
    pub on_close: Vec<(Status, OnClose)>,
}

impl CallbackBatch {
    pub fn fire(self, peer: &PeerAddr, ctx: &mut WorkerContext) {
        for (status, cb) in self.on_sent {
            cb(status, peer, ctx);
        }
        for (status, cb) in self.on_close {
            cb(status, peer, ctx);
        }
    }
}

/// One TCP endpoint to one peer. Owned exclusively by its worker; all I/O
///  happens in detached tasks that communicate through events, so no method
///  here blocks or suspends.
pub(crate) struct Connection {
    id: ConnectionId,
    peer: PeerAddr,
    peer_address: SocketAddr,
    state: ConnState,
    outbound: bool,
    negotiated_proto: Option<u16>,
    assigned_client_idx: Option<u32>,

    serialize_queue: VecDeque<PendingSend>,
    wire_queue: VecDeque<WireFrame>,
    /// bytes reserved for the serialization queue
    reserved_bytes: usize,
    /// bytes of encoded frames awaiting transmission
    buffered_bytes: usize,
    next_seq: u64,

    write_tx: Option<mpsc::UnboundedSender<WireChunk>>,
    proto_tx: Option<watch::Sender<u16>>,
    io_tasks: Vec<JoinHandle<()>>,
    /// not aborted on close: it drains whatever was handed to it (e.g. a
    ///  rejection ACK) and exits once `write_tx` is dropped
    write_task: Option<JoinHandle<()>>,
    handshake_timer: Option<JoinHandle<()>>,
    on_close: Vec<OnClose>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection{{{:?} {:?} {:?} q={} buf={}",
            self.id,
            self.peer,
            self.state,
            self.serialize_queue.len(),
            self.buffered_bytes,
        )?;
        if let Some(idx) = self.assigned_client_idx {
            write!(f, " our_idx_at_peer={}", idx)?;
        }
        write!(f, "}}")
    }
}

impl Connection {
    pub fn new_outbound(id: ConnectionId, peer: PeerAddr, peer_address: SocketAddr) -> Connection {
        Connection {
            id,
            peer,
            peer_address,
            state: ConnState::Fresh,
            outbound: true,
            negotiated_proto: None,
            assigned_client_idx: None,
            serialize_queue: VecDeque::new(),
            wire_queue: VecDeque::new(),
            reserved_bytes: 0,
            buffered_bytes: 0,
            next_seq: 1,
            write_tx: None,
            proto_tx: None,
            io_tasks: Vec::new(),
            write_task: None,
            handshake_timer: None,
            on_close: Vec::new(),
        }
    }

    pub fn new_inbound(id: ConnectionId, peer: PeerAddr, peer_address: SocketAddr) -> Connection {
        Connection {
            state: ConnState::AwaitingHello,
            outbound: false,
            ..Connection::new_outbound(id, peer, peer_address)
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_handshaken(&self) -> bool {
        self.state == ConnState::Handshaken
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closing | ConnState::Closed)
    }

    pub fn negotiated_proto(&self) -> Option<u16> {
        self.negotiated_proto
    }

    /// bytes of encoded frames awaiting transmission
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// everything charged against budgets on behalf of this connection
    pub fn bytes_pending(&self) -> usize {
        self.reserved_bytes + self.buffered_bytes
    }

    pub fn begin_connect(&mut self, connect_task: JoinHandle<()>, timer: JoinHandle<()>) {
        debug_assert_eq!(self.state, ConnState::Fresh);
        self.state = ConnState::Connecting;
        self.io_tasks.push(connect_task);
        self.handshake_timer = Some(timer);
    }

    /// Wires up the I/O tasks of an established socket. For outbound
    ///  connections the caller sends HELLO right afterwards.
    pub fn attach_io(
        &mut self,
        write_tx: mpsc::UnboundedSender<WireChunk>,
        proto_tx: watch::Sender<u16>,
        read_task: JoinHandle<()>,
        write_task: JoinHandle<()>,
    ) {
        self.write_tx = Some(write_tx);
        self.proto_tx = Some(proto_tx);
        self.io_tasks.push(read_task);
        self.write_task = Some(write_task);
    }

    pub fn start_handshake_timer(&mut self, timer: JoinHandle<()>) {
        self.handshake_timer = Some(timer);
    }

    pub fn mark_handshake_sent(&mut self) {
        debug_assert_eq!(self.state, ConnState::Connecting);
        self.state = ConnState::HandshakeSent;
    }

    pub fn mark_handshaken(&mut self, proto: u16, assigned_client_idx: Option<u32>) {
        debug!(conn = ?self.id, peer = ?self.peer, proto, "handshake complete");
        self.state = ConnState::Handshaken;
        self.negotiated_proto = Some(proto);
        self.assigned_client_idx = assigned_client_idx;
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
        if let Some(proto_tx) = &self.proto_tx {
            let _ = proto_tx.send(proto);
        }
    }

    /// Queues a message while the protocol version is still unknown.
    pub fn queue_pending(&mut self, pending: PendingSend) {
        debug_assert!(!self.is_handshaken() && !self.is_closed());
        self.reserved_bytes += pending.reserved;
        self.serialize_queue.push_back(pending);
    }

    pub fn take_serialize_queue(&mut self) -> VecDeque<PendingSend> {
        self.reserved_bytes = 0;
        std::mem::take(&mut self.serialize_queue)
    }

    /// Sends a control frame (HELLO / ACK) that bypasses budgets and flush
    ///  tracking.
    pub fn send_control(&mut self, bytes: BytesMut) {
        if let Some(tx) = &self.write_tx {
            let _ = tx.send(WireChunk {
                bytes: bytes.freeze(),
                seq: None,
            });
        }
    }

    /// Hands an encoded frame to the write task. The frame's bytes stay
    ///  charged until the flush notification comes back.
    pub fn enqueue_wire(&mut self, bytes: BytesMut, size: usize) {
        debug_assert_eq!(bytes.len(), size);
        let seq = self.next_seq;
        self.next_seq += 1;

        self.buffered_bytes += size;
        self.wire_queue.push_back(WireFrame {
            seq: Some(seq),
            size,
            on_sent: None,
        });
        if let Some(tx) = &self.write_tx {
            let _ = tx.send(WireChunk {
                bytes: bytes.freeze(),
                seq: Some(seq),
            });
        }
    }

    /// Books an injected frame: charged like a sent frame but never handed
    ///  to the write task, so it stays in flight until close.
    pub fn hold_injected(&mut self, size: usize, on_sent: Option<OnSent>) {
        self.buffered_bytes += size;
        self.wire_queue.push_back(WireFrame {
            seq: None,
            size,
            on_sent,
        });
    }

    pub fn register_on_close(&mut self, cb: OnClose) {
        debug_assert!(!self.is_closed());
        self.on_close.push(cb);
    }

    /// The write task finished flushing every frame up to `seq`; returns the
    ///  number of bytes released. Frames held in flight by error injection
    ///  have no sequence number and are skipped over.
    pub fn on_wire_flushed(&mut self, seq: u64) -> usize {
        let mut released = 0;
        self.wire_queue.retain(|frame| match frame.seq {
            Some(s) if s <= seq => {
                released += frame.size;
                false
            }
            _ => true,
        });
        trace!(conn = ?self.id, seq, released, "wire flushed");
        self.buffered_bytes -= released;
        released
    }

    /// Tears the connection down. Idempotent: only the first call produces
    ///  callbacks. Returns the callbacks to fire (every pending on-sent with
    ///  `reason` in send order, then every on-close) and releases all I/O
    ///  resources; the caller settles the budget via `bytes_pending` taken
    ///  *before* this call.
    pub fn close(&mut self, reason: Status) -> CallbackBatch {
        if self.is_closed() {
            return CallbackBatch::default();
        }
        debug!(conn = ?self.id, peer = ?self.peer, %reason, "closing connection");
        self.state = ConnState::Closing;

        let mut batch = CallbackBatch::default();
        for pending in self.serialize_queue.drain(..) {
            if let Some(cb) = pending.on_sent {
                batch.on_sent.push((reason, cb));
            }
        }
        for frame in self.wire_queue.drain(..) {
            if let Some(cb) = frame.on_sent {
                batch.on_sent.push((reason, cb));
            }
        }
        for cb in self.on_close.drain(..) {
            batch.on_close.push((reason, cb));
        }

        self.reserved_bytes = 0;
        self.buffered_bytes = 0;
        self.write_tx = None;
        self.proto_tx = None;
        self.write_task = None;
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
        for task in self.io_tasks.drain(..) {
            task.abort();
        }

        self.state = ConnState::Closed;
        batch
    }
}
