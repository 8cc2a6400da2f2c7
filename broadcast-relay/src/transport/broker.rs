//! Message-broker relay: clients identify themselves with a routing id and
//! the broker fans payload frames out by routing id.
//!
//! # Wire format
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes
//! ([`LengthDelimitedCodec`] defaults). The first frame a client sends is its
//! routing id (1 to 255 bytes). Every later frame is a payload. An empty
//! payload frame is a probe: it makes the client a member without being
//! broadcast. Frames the broker sends back carry bare payloads.
//!
//! # Structure
//!
//! One task per TCP connection decodes frames and forwards
//! `(routing id, payload)` events to a single router task, which owns the
//! sessions and runs every broadcast. Delivery queues the frame on the
//! recipient's unbounded outbound channel; a per-connection writer task
//! drains it onto the socket.

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::AsyncWrite,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{debug, info, warn};

use crate::{
    fanout::{AsyncDeliver, FanOutMode, broadcast_async},
    peer::RoutingId,
    registry::Registry,
    session::Session,
    shutdown,
};

/// Upper bound on a single frame, routing id or payload.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed before a routing id was sent")]
    MissingRoutingId,
    #[error("routing id must be 1 to {max} bytes, got {len}", max = RoutingId::MAX_LEN)]
    InvalidRoutingId { len: usize },
    #[error("routing id {0} is already connected")]
    DuplicateRoutingId(RoutingId),
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Client side of the handshake: announce `id` on a fresh connection.
pub async fn send_routing_id<W>(
    writer: &mut FramedWrite<W, LengthDelimitedCodec>,
    id: &RoutingId,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.send(Bytes::copy_from_slice(id.as_bytes())).await
}

/// Outbound queue of every connected routing id.
#[derive(Clone, Default)]
pub struct Routes {
    queues: Arc<Mutex<HashMap<RoutingId, mpsc::UnboundedSender<Bytes>>>>,
}

impl Routes {
    fn lock(&self) -> MutexGuard<'_, HashMap<RoutingId, mpsc::UnboundedSender<Bytes>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `id` for a connection. Refuses ids that are already connected.
    fn bind(&self, id: &RoutingId, queue: mpsc::UnboundedSender<Bytes>) -> bool {
        let mut queues = self.lock();
        if queues.contains_key(id) {
            return false;
        }
        queues.insert(id.clone(), queue);
        true
    }

    fn unbind(&self, id: &RoutingId) {
        self.lock().remove(id);
    }

    fn enqueue(&self, id: &RoutingId, payload: &[u8]) -> io::Result<()> {
        let queues = self.lock();
        let queue = queues.get(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, format!("no route to {id}"))
        })?;
        queue.send(Bytes::copy_from_slice(payload)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("{id} stopped reading"))
        })
    }
}

impl AsyncDeliver<RoutingId> for Routes {
    fn deliver(
        &self,
        peer: &RoutingId,
        payload: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send {
        std::future::ready(self.enqueue(peer, payload))
    }
}

/// Events from connection tasks to the router. `connection` is the accept
/// serial, so a routing id that reconnects is told apart from its
/// predecessor.
#[derive(Debug)]
enum RouterEvent {
    Frame {
        from: RoutingId,
        connection: u64,
        payload: Bytes,
    },
    Closed {
        from: RoutingId,
        connection: u64,
    },
}

/// A routing id's session together with the connection that owns it.
struct Attached {
    connection: u64,
    session: Session<RoutingId>,
}

pub struct BrokerRelay {
    listener: TcpListener,
    registry: Registry<RoutingId>,
    routes: Routes,
    mode: FanOutMode,
}

impl BrokerRelay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Registry::new(),
            routes: Routes::default(),
            mode: FanOutMode::Sequential,
        }
    }

    pub fn with_mode(mut self, mode: FanOutMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry<RoutingId> {
        self.registry.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let BrokerRelay {
            listener,
            registry,
            routes,
            mode,
        } = self;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(route_events(events_rx, registry, routes.clone(), mode));
        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();
        let mut next_serial = 0_u64;
        tokio::pin!(shutdown);

        info!("router message loop started");
        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_serial += 1;
                        let serial = next_serial;
                        let routes = routes.clone();
                        let events = events_tx.clone();
                        let cancel = cancel.clone();
                        connections.spawn(async move {
                            let served =
                                serve_connection(stream, serial, routes, events, cancel).await;
                            if let Err(err) = served {
                                warn!(peer = %addr, error = ?err, "connection error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
            }
        }

        info!("broker shutting down");
        cancel.cancel();
        connections.close();
        connections.wait().await;
        // Every connection has reported `Closed`; dropping the last sender
        // lets the router drain its queue and stop.
        drop(events_tx);
        router.await.context("router task failed")?;
        Ok(())
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown::signal()).await
    }
}

async fn route_events(
    mut events: mpsc::UnboundedReceiver<RouterEvent>,
    registry: Registry<RoutingId>,
    routes: Routes,
    mode: FanOutMode,
) {
    let mut sessions: HashMap<RoutingId, Attached> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            RouterEvent::Frame {
                from,
                connection,
                payload,
            } => {
                let attached = sessions.entry(from.clone()).or_insert_with(|| Attached {
                    connection,
                    session: Session::new(from.clone(), registry.clone()),
                });
                if attached.connection != connection {
                    // The previous connection's `Closed` is still in flight.
                    // Its session ends here, the new one starts fresh.
                    *attached = Attached {
                        connection,
                        session: Session::new(from, registry.clone()),
                    };
                }
                let session = &mut attached.session;
                if let Some(payload) = session.receive(&payload) {
                    debug!(from = %session.peer(), len = payload.len(), "received payload");
                    broadcast_async(payload, &registry, &routes, mode).await;
                }
            }
            RouterEvent::Closed { from, connection } => {
                // Dropping the session deregisters the peer.
                if sessions
                    .get(&from)
                    .is_some_and(|attached| attached.connection == connection)
                {
                    sessions.remove(&from);
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    serial: u64,
    routes: Routes,
    events: mpsc::UnboundedSender<RouterEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, codec());
    let id = read_routing_id(&mut frames).await?;

    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Bytes>();
    if !routes.bind(&id, queue_tx) {
        return Err(FrameError::DuplicateRoutingId(id).into());
    }

    let mut sink = FramedWrite::new(writer, codec());
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = queue_rx.recv().await {
            if let Err(err) = sink.send(frame).await {
                debug!(peer = %writer_id, error = ?err, "failed to write frame");
                break;
            }
        }
    });

    let outcome = pump_frames(&id, serial, &mut frames, &events, &cancel).await;

    routes.unbind(&id);
    let _ = events.send(RouterEvent::Closed {
        from: id,
        connection: serial,
    });
    // Unbinding dropped the last queue sender, so the writer drains and exits.
    let _ = writer.await;
    outcome
}

async fn pump_frames<R>(
    id: &RoutingId,
    serial: u64,
    frames: &mut FramedRead<R, LengthDelimitedCodec>,
    events: &mpsc::UnboundedSender<RouterEvent>,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let frame = select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = frames.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let payload = frame.with_context(|| format!("malformed frame from {id}"))?;
        if events
            .send(RouterEvent::Frame {
                from: id.clone(),
                connection: serial,
                payload: payload.freeze(),
            })
            .is_err()
        {
            return Ok(());
        }
    }
}

async fn read_routing_id<R>(frames: &mut FramedRead<R, LengthDelimitedCodec>) -> Result<RoutingId>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let frame = frames
        .next()
        .await
        .ok_or(FrameError::MissingRoutingId)?
        .context("failed to read routing id")?;
    let len = frame.len();
    Ok(RoutingId::new(frame.freeze()).ok_or(FrameError::InvalidRoutingId { len })?)
}
