use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::config::cluster_view::ClusterView;
use crate::messaging::connect_throttle::ConnectThrottle;
use crate::messaging::connection::{
    CallbackBatch, ConnState, Connection, ConnectionId, OnSent, PendingSend, SendOptions,
};
use crate::messaging::messages::{AckHeader, HelloHeader, Message};
use crate::messaging::node_addr::{ClientId, NodeId, PeerAddr};
use crate::messaging::protocol::{encode_message, encoded_size, MIN_PROTOCOL_SUPPORTED};
use crate::messaging::settings::Settings;
use crate::messaging::socket_io::{
    spawn_connect, spawn_handshake_timer, spawn_io, EventSender,
};
use crate::messaging::worker::WorkerContext;
use crate::status::Status;

/// A send that failed synchronously: the caller keeps the message and its
///  callbacks, none of which have fired.
pub struct SendError {
    pub status: Status,
    pub msg: Message,
    pub options: SendOptions,
}

impl std::fmt::Debug for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendError({:?}, {:?})", self.status, self.msg)
    }
}

/// What the worker should do with an inbound frame after the sender has
///  looked at it.
pub(crate) enum FrameAction {
    None,
    Fire(Vec<(PeerAddr, CallbackBatch)>),
    Dispatch { from: PeerAddr, msg: Message },
}

/// Per-worker registry of connections and owner of the output-memory
///  budgets. All methods run on the worker thread; methods that complete
///  callbacks return them in a `CallbackBatch` for the worker to fire after
///  the sender borrow is released.
pub(crate) struct Sender {
    settings: Arc<Settings>,
    config: ClusterView,
    local_node: Option<NodeId>,
    events: EventSender,

    server_conns: FxHashMap<u64, Connection>,
    client_conns: FxHashMap<ClientId, Connection>,
    throttles: FxHashMap<SocketAddr, ConnectThrottle>,

    used_server_bytes: usize,
    used_client_bytes: usize,

    next_conn_id: u64,
    next_client_idx: u32,
}

impl Sender {
    pub fn new(
        settings: Arc<Settings>,
        config: ClusterView,
        local_node: Option<NodeId>,
        events: EventSender,
    ) -> Sender {
        Sender {
            settings,
            config,
            local_node,
            events,
            server_conns: FxHashMap::default(),
            client_conns: FxHashMap::default(),
            throttles: FxHashMap::default(),
            used_server_bytes: 0,
            used_client_bytes: 0,
            next_conn_id: 0,
            next_client_idx: 0,
        }
    }

    fn next_conn_id(&mut self) -> ConnectionId {
        self.next_conn_id += 1;
        ConnectionId(self.next_conn_id)
    }

    fn conn(&self, peer: &PeerAddr) -> Option<&Connection> {
        match peer {
            PeerAddr::Server(node) => self.server_conns.get(&node.index),
            PeerAddr::Client(client) => self.client_conns.get(client),
        }
    }

    fn conn_mut(&mut self, peer: &PeerAddr) -> Option<&mut Connection> {
        match peer {
            PeerAddr::Server(node) => self.server_conns.get_mut(&node.index),
            PeerAddr::Client(client) => self.client_conns.get_mut(client),
        }
    }

    /// Resolves an event's target, dropping events addressed to an earlier
    ///  incarnation of the connection.
    fn conn_for_event(&mut self, peer: &PeerAddr, conn_id: ConnectionId) -> Option<&mut Connection> {
        match self.conn_mut(peer) {
            Some(conn) if conn.id() == conn_id => Some(conn),
            Some(_) => {
                trace!(?peer, ?conn_id, "dropping event for a replaced connection");
                None
            }
            None => None,
        }
    }

    fn take_conn(&mut self, peer: &PeerAddr) -> Option<Connection> {
        match peer {
            PeerAddr::Server(node) => self.server_conns.remove(&node.index),
            PeerAddr::Client(client) => self.client_conns.remove(client),
        }
    }

    fn charge(&mut self, server_class: bool, bytes: usize) {
        if server_class {
            self.used_server_bytes += bytes;
        } else {
            self.used_client_bytes += bytes;
        }
    }

    fn release(&mut self, server_class: bool, bytes: usize) {
        if server_class {
            debug_assert!(self.used_server_bytes >= bytes);
            self.used_server_bytes -= bytes;
        } else {
            debug_assert!(self.used_client_bytes >= bytes);
            self.used_client_bytes -= bytes;
        }
    }

    pub fn used_bytes(&self) -> (usize, usize) {
        (self.used_server_bytes, self.used_client_bytes)
    }

    /// Admission control. The per-socket minimum admits regardless of class
    ///  totals; beyond it the class (or combined) total must still be below
    ///  its cap when the message arrives - a single message may overshoot.
    fn may_admit(&self, conn_pending: usize, server_class: bool) -> bool {
        if conn_pending < self.settings.socket_min_bytes() {
            return true;
        }
        if self.settings.per_peer_type_budget() {
            let used = if server_class {
                self.used_server_bytes
            } else {
                self.used_client_bytes
            };
            used < self.settings.outbufs_max_bytes() / 2
        } else {
            self.used_server_bytes + self.used_client_bytes < self.settings.outbufs_max_bytes()
        }
    }

    fn roll_injection(&self) -> Option<Status> {
        let chance = self.settings.message_error_injection_chance_percent;
        if chance == 0 {
            return None;
        }
        let status = self.settings.message_error_injection_status?;
        if chance >= 100 || rand::rng().random_range(0..100u8) < chance {
            Some(status)
        } else {
            None
        }
    }

    fn throttle_mut(&mut self, address: SocketAddr) -> &mut ConnectThrottle {
        let settings = self.settings.connect_throttle;
        self.throttles
            .entry(address)
            .or_insert_with(|| ConnectThrottle::new(settings))
    }

    /// Fallible factory for an outbound connection. `NotInConfig` when the
    ///  node cannot be resolved, `ConnFailed` when the throttle forbids a
    ///  fresh attempt.
    fn create_server_connection(&mut self, node: NodeId) -> Result<(), Status> {
        let snapshot = self.config.current();
        let Some(info) = snapshot.lookup(node.index) else {
            return Err(Status::NotInConfig);
        };
        if !node.matches(NodeId::new(node.index, info.generation)) {
            return Err(Status::NotInConfig);
        }
        if !self.throttle_mut(info.address).may_connect() {
            debug!(?node, "connect throttled");
            return Err(Status::ConnFailed);
        }

        let id = self.next_conn_id();
        let peer = PeerAddr::Server(NodeId::new(node.index, info.generation));
        let mut conn = Connection::new_outbound(id, peer, info.address);

        let connect_task = spawn_connect(peer, id, info.address, self.events.clone());
        let timer =
            spawn_handshake_timer(peer, id, self.settings.handshake_timeout, self.events.clone());
        conn.begin_connect(connect_task, timer);

        debug!(?peer, ?id, address = %info.address, "created outbound connection");
        self.server_conns.insert(node.index, conn);
        Ok(())
    }

    /// Explicit connect. `Ok` on the first call; `IsConn` / `Already` when a
    ///  connection to the node already exists.
    pub fn connect(&mut self, node: NodeId) -> Result<(), Status> {
        if let Some(conn) = self.server_conns.get(&node.index) {
            return Err(if conn.is_handshaken() {
                Status::IsConn
            } else {
                Status::Already
            });
        }
        self.create_server_connection(node)
    }

    /// The send entry point. Synchronous errors hand the message back; an
    ///  accepted message either reaches the wire or fails through its
    ///  callbacks.
    pub fn send_message(
        &mut self,
        msg: Message,
        peer: PeerAddr,
        options: SendOptions,
    ) -> Result<CallbackBatch, SendError> {
        let fail = |status, msg, options| Err(SendError {
            status,
            msg,
            options,
        });

        match peer {
            PeerAddr::Server(node) => {
                let snapshot = self.config.current();
                if !snapshot.contains(node) {
                    return fail(Status::NotInConfig, msg, options);
                }
                if self.server_conns.get(&node.index).is_none() {
                    if let Err(status) = self.create_server_connection(node) {
                        return fail(status, msg, options);
                    }
                }
            }
            PeerAddr::Client(client) => {
                if self.client_conns.get(&client).is_none() {
                    return fail(Status::Unreachable, msg, options);
                }
            }
        }

        let conn = self.conn(&peer).expect("connection just resolved");
        let state = conn.state();
        let pending = conn.bytes_pending();
        let proto = conn.negotiated_proto();
        let server_class = peer.is_server();

        match state {
            ConnState::AwaitingHello => fail(Status::Unreachable, msg, options),
            ConnState::Closing | ConnState::Closed => fail(Status::Shutdown, msg, options),

            ConnState::Fresh | ConnState::Connecting | ConnState::HandshakeSent => {
                let reserved = encoded_size(&msg, MIN_PROTOCOL_SUPPORTED);
                if !self.may_admit(pending, server_class) {
                    return fail(Status::NoBufs, msg, options);
                }
                self.charge(server_class, reserved);
                let conn = self.conn_mut(&peer).expect("connection just resolved");
                conn.queue_pending(PendingSend {
                    msg,
                    reserved,
                    on_sent: options.on_sent,
                    cancelled: options.cancelled,
                });
                if let Some(cb) = options.on_close {
                    conn.register_on_close(cb);
                }
                Ok(CallbackBatch::default())
            }

            ConnState::Handshaken => {
                let proto = proto.expect("handshaken connection has a protocol");
                if msg.min_protocol() > proto {
                    return fail(Status::ProtoNoSupport, msg, options);
                }
                if !self.may_admit(pending, server_class) {
                    return fail(Status::NoBufs, msg, options);
                }
                if let Some(cb) = options.on_close {
                    self.conn_mut(&peer)
                        .expect("connection just resolved")
                        .register_on_close(cb);
                }

                let mut batch = CallbackBatch::default();
                if let Some(completion) =
                    self.wire_stage(&peer, msg, proto, options.on_sent, options.cancelled)
                {
                    batch.on_sent.push(completion);
                }
                Ok(batch)
            }
        }
    }

    /// The wire stage: the last point where a message can still fail or be
    ///  dropped. Returns the on-sent completion to fire, if any.
    fn wire_stage(
        &mut self,
        peer: &PeerAddr,
        msg: Message,
        proto: u16,
        on_sent: Option<OnSent>,
        cancelled: bool,
    ) -> Option<(Status, OnSent)> {
        if cancelled {
            trace!(?peer, "dropping cancelled message at the wire stage");
            return on_sent.map(|cb| (Status::Cancelled, cb));
        }

        let size = encoded_size(&msg, proto);
        match self.roll_injection() {
            Some(Status::Dropped) => {
                self.charge(peer.is_server(), size);
                self.conn_mut(peer)
                    .expect("caller resolved the connection")
                    .hold_injected(size, on_sent);
                None
            }
            Some(injected) => {
                warn!(?peer, %injected, "error injection: failing message");
                on_sent.map(|cb| (injected, cb))
            }
            None => {
                self.charge(peer.is_server(), size);
                let bytes = encode_message(&msg, proto);
                self.conn_mut(peer)
                    .expect("caller resolved the connection")
                    .enqueue_wire(bytes, size);
                on_sent.map(|cb| (Status::Ok, cb))
            }
        }
    }

    fn build_hello(&self, destination: NodeId) -> HelloHeader {
        HelloHeader {
            proto_min: MIN_PROTOCOL_SUPPORTED,
            proto_max: self.settings.max_protocol,
            destination: self
                .settings
                .include_destination_on_handshake
                .then_some(destination),
            cluster_name: self
                .settings
                .include_cluster_name_on_handshake
                .then(|| self.config.current().cluster_name.clone()),
            build_info: None,
        }
    }

    pub fn on_accepted(&mut self, stream: TcpStream, peer_address: SocketAddr) {
        self.next_client_idx += 1;
        let client = ClientId(self.next_client_idx);
        let id = self.next_conn_id();
        let peer = PeerAddr::Client(client);

        let mut conn = Connection::new_inbound(id, peer, peer_address);
        let io = spawn_io(stream, peer, id, self.events.clone());
        conn.attach_io(io.write_tx, io.proto_tx, io.read_task, io.write_task);
        conn.start_handshake_timer(spawn_handshake_timer(
            peer,
            id,
            self.settings.handshake_timeout,
            self.events.clone(),
        ));

        debug!(?peer, ?id, %peer_address, "registered inbound connection");
        self.client_conns.insert(client, conn);
    }

    pub fn on_connected(&mut self, peer: PeerAddr, conn_id: ConnectionId, stream: TcpStream) {
        let events = self.events.clone();
        let hello = match peer.as_node() {
            Some(node) => self.build_hello(node),
            None => return,
        };
        let Some(conn) = self.conn_for_event(&peer, conn_id) else {
            return;
        };
        debug_assert_eq!(conn.state(), ConnState::Connecting);

        let io = spawn_io(stream, peer, conn_id, events);
        conn.attach_io(io.write_tx, io.proto_tx, io.read_task, io.write_task);
        conn.send_control(encode_message(
            &Message::Hello(hello),
            MIN_PROTOCOL_SUPPORTED,
        ));
        conn.mark_handshake_sent();
    }

    pub fn on_connect_failed(
        &mut self,
        peer: PeerAddr,
        conn_id: ConnectionId,
        error: std::io::Error,
    ) -> Option<(PeerAddr, CallbackBatch)> {
        self.conn_for_event(&peer, conn_id)?;
        debug!(?peer, "connect failed: {}", error);
        self.close_connection(&peer, Status::ConnFailed)
    }

    pub fn on_socket_closed(
        &mut self,
        peer: PeerAddr,
        conn_id: ConnectionId,
        reason: Status,
    ) -> Option<(PeerAddr, CallbackBatch)> {
        self.conn_for_event(&peer, conn_id)?;
        self.close_connection(&peer, reason)
    }

    pub fn on_handshake_timeout(
        &mut self,
        peer: PeerAddr,
        conn_id: ConnectionId,
    ) -> Option<(PeerAddr, CallbackBatch)> {
        let conn = self.conn_for_event(&peer, conn_id)?;
        if conn.is_handshaken() {
            return None;
        }
        warn!(?peer, "no ACK within the handshake timeout");
        self.close_connection(&peer, Status::TimedOut)
    }

    pub fn on_flushed(&mut self, peer: PeerAddr, conn_id: ConnectionId, seq: u64) {
        let Some(conn) = self.conn_for_event(&peer, conn_id) else {
            return;
        };
        let released = conn.on_wire_flushed(seq);
        self.release(peer.is_server(), released);
    }

    pub fn on_frame(&mut self, peer: PeerAddr, conn_id: ConnectionId, msg: Message) -> FrameAction {
        let Some(conn) = self.conn_for_event(&peer, conn_id) else {
            return FrameAction::None;
        };
        let state = conn.state();

        match msg {
            Message::Ack(ack) if state == ConnState::HandshakeSent => self.handle_ack(peer, ack),
            Message::Hello(hello) if state == ConnState::AwaitingHello => {
                self.handle_hello(peer, hello)
            }
            Message::Hello(_) | Message::Ack(_) => {
                warn!(?peer, ?state, "unexpected handshake frame");
                self.close_as_violation(&peer)
            }
            msg if state == ConnState::Handshaken => FrameAction::Dispatch { from: peer, msg },
            msg => {
                warn!(?peer, ?state, msg_type = ?msg.message_type(), "message before handshake");
                self.close_as_violation(&peer)
            }
        }
    }

    fn close_as_violation(&mut self, peer: &PeerAddr) -> FrameAction {
        match self.close_connection(peer, Status::BadMessage) {
            Some(closed) => FrameAction::Fire(vec![closed]),
            None => FrameAction::None,
        }
    }

    /// The connecting side's view of the handshake conclusion.
    fn handle_ack(&mut self, peer: PeerAddr, ack: AckHeader) -> FrameAction {
        if ack.status != Status::Ok {
            debug!(?peer, status = %ack.status, "handshake rejected by peer");
            return match self.close_connection(&peer, ack.status) {
                Some(closed) => FrameAction::Fire(vec![closed]),
                None => FrameAction::None,
            };
        }
        if ack.proto < MIN_PROTOCOL_SUPPORTED || ack.proto > self.settings.max_protocol {
            warn!(?peer, proto = ack.proto, "peer granted a protocol outside our range");
            return match self.close_connection(&peer, Status::ProtoNoSupport) {
                Some(closed) => FrameAction::Fire(vec![closed]),
                None => FrameAction::None,
            };
        }

        let address = {
            let conn = self.conn_mut(&peer).expect("resolved by on_frame");
            conn.mark_handshaken(ack.proto, Some(ack.client_idx));
            conn.peer_address()
        };
        self.throttle_mut(address).on_success();

        FrameAction::Fire(vec![self.drain_serialize_queue(peer, ack.proto)])
    }

    /// Re-validates and encodes everything queued before the protocol was
    ///  known, in FIFO order. Reservations are settled against actual
    ///  encoded sizes without re-admission.
    fn drain_serialize_queue(&mut self, peer: PeerAddr, proto: u16) -> (PeerAddr, CallbackBatch) {
        let server_class = peer.is_server();
        let queue = self
            .conn_mut(&peer)
            .expect("resolved by caller")
            .take_serialize_queue();

        let mut batch = CallbackBatch::default();
        for pending in queue {
            self.release(server_class, pending.reserved);

            if pending.msg.min_protocol() > proto {
                debug!(?peer, msg = ?pending.msg, proto, "queued message needs a newer protocol");
                if let Some(cb) = pending.on_sent {
                    batch.on_sent.push((Status::ProtoNoSupport, cb));
                }
                continue;
            }
            if let Some(completion) =
                self.wire_stage(&peer, pending.msg, proto, pending.on_sent, pending.cancelled)
            {
                batch.on_sent.push(completion);
            }
        }
        (peer, batch)
    }

    /// The accepting side's view of the handshake: validate HELLO, reply
    ///  with ACK, and either promote the connection or close it with the
    ///  rejection reason (the ACK is flushed before the socket goes down).
    fn handle_hello(&mut self, peer: PeerAddr, hello: HelloHeader) -> FrameAction {
        let negotiated = hello.proto_max.min(self.settings.max_protocol);
        let floor = hello.proto_min.max(MIN_PROTOCOL_SUPPORTED);

        let mut status = Status::Ok;
        if negotiated < floor {
            status = Status::ProtoNoSupport;
        } else if let Some(name) = &hello.cluster_name {
            if *name != self.config.current().cluster_name {
                warn!(?peer, cluster = %name, "peer belongs to a different cluster");
                status = Status::InvalidCluster;
            }
        }
        if status == Status::Ok {
            if let Some(destination) = hello.destination {
                let matches_us = self
                    .local_node
                    .map(|me| destination.matches(me))
                    .unwrap_or(false);
                if !matches_us {
                    warn!(?peer, ?destination, local = ?self.local_node, "HELLO addressed to someone else");
                    status = Status::DestinationMismatch;
                }
            }
        }

        let client_idx = peer.as_client().map(|c| c.0).unwrap_or(0);
        let ack = AckHeader {
            options: 0,
            rqid: 0,
            client_idx,
            proto: if status == Status::Ok { negotiated } else { 0 },
            status,
        };
        let ack_bytes = encode_message(&Message::Ack(ack), MIN_PROTOCOL_SUPPORTED);

        let conn = self.conn_mut(&peer).expect("resolved by on_frame");
        if status == Status::Ok {
            // order matters: the read task must know the protocol before the
            //  peer can react to the ACK with checksummed frames
            conn.mark_handshaken(negotiated, None);
            conn.send_control(ack_bytes);
            FrameAction::None
        } else {
            conn.send_control(ack_bytes);
            match self.close_connection(&peer, status) {
                Some(closed) => FrameAction::Fire(vec![closed]),
                None => FrameAction::None,
            }
        }
    }

    /// Removes the connection from the index and tears it down. The returned
    ///  batch must be fired after the sender borrow is released; by then the
    ///  index no longer knows the connection, so a send from inside an
    ///  on-close callback creates a fresh one.
    pub fn close_connection(
        &mut self,
        peer: &PeerAddr,
        reason: Status,
    ) -> Option<(PeerAddr, CallbackBatch)> {
        let mut conn = self.take_conn(peer)?;
        if conn.is_outbound() && !conn.is_handshaken() && reason != Status::Shutdown {
            self.throttle_mut(conn.peer_address()).on_failure();
        }
        self.release(conn.peer().is_server(), conn.bytes_pending());
        let batch = conn.close(reason);
        Some((conn.peer(), batch))
    }

    /// Closes every connection, draining all callbacks with `Shutdown`.
    pub fn shutdown_sockets(&mut self) -> Vec<(PeerAddr, CallbackBatch)> {
        let peers: Vec<PeerAddr> = self
            .server_conns
            .values()
            .chain(self.client_conns.values())
            .map(|c| c.peer())
            .collect();

        peers
            .into_iter()
            .filter_map(|peer| self.close_connection(&peer, Status::Shutdown))
            .collect()
    }

    /// Closes connections whose node has left the configuration (or came
    ///  back with a different generation).
    pub fn sweep_departed_nodes(&mut self) -> Vec<(PeerAddr, CallbackBatch)> {
        let snapshot = self.config.current();
        let departed: Vec<PeerAddr> = self
            .server_conns
            .values()
            .filter(|conn| match conn.peer().as_node() {
                Some(node) => !snapshot.contains(node),
                None => false,
            })
            .map(|c| c.peer())
            .collect();

        departed
            .into_iter()
            .filter_map(|peer| {
                debug!(?peer, "node left the configuration");
                self.close_connection(&peer, Status::NotInConfig)
            })
            .collect()
    }

    pub fn find_server_connection(&self, node_index: u64) -> Option<ConnectionId> {
        self.server_conns.get(&node_index).map(|c| c.id())
    }

    pub fn client_connections(&self) -> Vec<(ClientId, bool)> {
        let mut out: Vec<(ClientId, bool)> = self
            .client_conns
            .values()
            .filter_map(|c| c.peer().as_client().map(|id| (id, c.is_handshaken())))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Peers that completed the handshake, for control-plane broadcasts.
    pub fn handshaken_peers(&self) -> Vec<PeerAddr> {
        self.server_conns
            .values()
            .chain(self.client_conns.values())
            .filter(|c| c.is_handshaken())
            .map(|c| c.peer())
            .collect()
    }

    pub fn is_handshaken(&self, peer: &PeerAddr) -> bool {
        self.conn(peer).map(|c| c.is_handshaken()).unwrap_or(false)
    }

    pub fn buffered_bytes(&self, peer: &PeerAddr) -> usize {
        self.conn(peer).map(|c| c.buffered_bytes()).unwrap_or(0)
    }

    pub fn bytes_pending(&self, peer: &PeerAddr) -> usize {
        self.conn(peer).map(|c| c.bytes_pending()).unwrap_or(0)
    }
}

/// Fires a set of callback batches. Standalone so both the worker loop and
///  reentrant call sites can use it after their sender borrow ends.
pub(crate) fn fire_batches(batches: Vec<(PeerAddr, CallbackBatch)>, ctx: &mut WorkerContext) {
    for (peer, batch) in batches {
        batch.fire(&peer, ctx);
    }
}
