use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::messaging::connection::ConnectionId;
use crate::messaging::messages::Message;
use crate::messaging::node_addr::PeerAddr;
use crate::messaging::protocol::{FrameDecoder, FrameError, MIN_PROTOCOL_SUPPORTED};
use crate::status::Status;

/// One write-task work item: a fully encoded frame. `seq` correlates the
///  flush notification; control frames (HELLO / ACK) carry `None` and are
///  not flush-tracked.
pub(crate) struct WireChunk {
    pub bytes: Bytes,
    pub seq: Option<u64>,
}

/// Everything the I/O tasks report back into the worker loop. All connection
///  state lives with the worker; these tasks only move bytes.
pub(crate) enum SocketEvent {
    Accepted {
        stream: TcpStream,
        peer_address: SocketAddr,
    },
    Connected {
        peer: PeerAddr,
        conn_id: ConnectionId,
        stream: TcpStream,
    },
    ConnectFailed {
        peer: PeerAddr,
        conn_id: ConnectionId,
        error: std::io::Error,
    },
    Frame {
        peer: PeerAddr,
        conn_id: ConnectionId,
        msg: Message,
    },
    /// every frame up to `seq` has been written to the socket
    Flushed {
        peer: PeerAddr,
        conn_id: ConnectionId,
        seq: u64,
    },
    /// the read or write side failed or the peer went away
    SocketClosed {
        peer: PeerAddr,
        conn_id: ConnectionId,
        reason: Status,
    },
    HandshakeTimeout {
        peer: PeerAddr,
        conn_id: ConnectionId,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<SocketEvent>;

pub(crate) fn spawn_accept_loop(listener: TcpListener, events: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_address)) => {
                    debug!(%peer_address, "accepted inbound connection");
                    if events
                        .send(SocketEvent::Accepted {
                            stream,
                            peer_address,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    })
}

pub(crate) fn spawn_connect(
    peer: PeerAddr,
    conn_id: ConnectionId,
    address: SocketAddr,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        trace!(?peer, ?conn_id, %address, "connecting");
        let event = match TcpStream::connect(address).await {
            Ok(stream) => SocketEvent::Connected {
                peer,
                conn_id,
                stream,
            },
            Err(error) => SocketEvent::ConnectFailed {
                peer,
                conn_id,
                error,
            },
        };
        let _ = events.send(event);
    })
}

pub(crate) fn spawn_handshake_timer(
    peer: PeerAddr,
    conn_id: ConnectionId,
    timeout: Duration,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = events.send(SocketEvent::HandshakeTimeout { peer, conn_id });
    })
}

pub(crate) struct IoHandles {
    pub write_tx: mpsc::UnboundedSender<WireChunk>,
    pub proto_tx: watch::Sender<u16>,
    pub read_task: JoinHandle<()>,
    pub write_task: JoinHandle<()>,
}

/// Splits an established socket into a frame-parsing read task and a
///  sequential write task.
pub(crate) fn spawn_io(stream: TcpStream, peer: PeerAddr, conn_id: ConnectionId, events: EventSender) -> IoHandles {
    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (proto_tx, proto_rx) = watch::channel(MIN_PROTOCOL_SUPPORTED);

    let read_task = tokio::spawn(read_loop(read_half, peer, conn_id, proto_rx, events.clone()));
    let write_task = tokio::spawn(write_loop(write_half, peer, conn_id, write_rx, events));

    IoHandles {
        write_tx,
        proto_tx,
        read_task,
        write_task,
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    peer: PeerAddr,
    conn_id: ConnectionId,
    proto_rx: watch::Receiver<u16>,
    events: EventSender,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(64 * 1024);

    let reason = loop {
        // the negotiated protocol determines checksum presence; the worker
        //  publishes it before the peer can legally send checksummed frames
        let proto = *proto_rx.borrow();
        if proto > decoder.protocol() {
            decoder.set_protocol(proto);
        }

        match decoder.decode(&mut buf) {
            Ok(Some(msg)) => {
                // an ACK concludes the handshake for the connecting side;
                //  later frames in this very buffer may already be
                //  checksummed at the granted version
                if let Message::Ack(ack) = &msg {
                    if ack.status == Status::Ok {
                        decoder.set_protocol(ack.proto);
                    }
                }
                if events
                    .send(SocketEvent::Frame {
                        peer,
                        conn_id,
                        msg,
                    })
                    .is_err()
                {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(FrameError::TooBig { len }) => {
                warn!(?peer, len, "dropping connection: oversized frame");
                break Status::BadMessage;
            }
            Err(FrameError::BadMessage(e)) => {
                warn!(?peer, "dropping connection: bad message: {}", e);
                break Status::BadMessage;
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                if buf.is_empty() {
                    debug!(?peer, "peer closed the connection");
                } else {
                    warn!(?peer, "stream ended mid-frame with {} bytes pending", buf.len());
                }
                break Status::ConnFailed;
            }
            Ok(n) => {
                trace!(?peer, n, "read bytes");
            }
            Err(e) => {
                debug!(?peer, "read error: {}", e);
                break Status::ConnFailed;
            }
        }
    };

    let _ = events.send(SocketEvent::SocketClosed {
        peer,
        conn_id,
        reason,
    });
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    peer: PeerAddr,
    conn_id: ConnectionId,
    mut write_rx: mpsc::UnboundedReceiver<WireChunk>,
    events: EventSender,
) {
    while let Some(chunk) = write_rx.recv().await {
        if let Err(e) = write_half.write_all(&chunk.bytes).await {
            debug!(?peer, "write error: {}", e);
            let _ = events.send(SocketEvent::SocketClosed {
                peer,
                conn_id,
                reason: Status::ConnFailed,
            });
            return;
        }
        if let Some(seq) = chunk.seq {
            if events
                .send(SocketEvent::Flushed {
                    peer,
                    conn_id,
                    seq,
                })
                .is_err()
            {
                return;
            }
        }
    }
    // channel closed: the connection is being torn down
    let _ = write_half.shutdown().await;
}
