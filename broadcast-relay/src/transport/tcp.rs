//! Newline-delimited TCP relay driven by a Tokio scheduler.
//!
//! Run it on a `current_thread` runtime to get the cooperative model: every
//! session, every registry change and every broadcast interleave on one
//! thread, suspending only at socket reads and writes.

use std::{
    fmt,
    future::Future,
    hash::{Hash, Hasher},
    io,
    net::SocketAddr,
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::Mutex,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    fanout::{AsyncDeliver, FanOutMode, broadcast_async},
    registry::Registry,
    session::Session,
    shutdown,
    transport::{is_blank_line, is_complete_line},
};

/// A live connection. Identity is the accept serial; the write half rides
/// along so any session can deliver to it.
#[derive(Clone)]
pub struct Connection {
    serial: u64,
    addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl Connection {
    fn new(serial: u64, addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            serial,
            addr,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.serial, self.addr)
    }
}

/// Writes whole lines to a connection under that connection's own lock.
struct LineWriter;

impl AsyncDeliver<Connection> for LineWriter {
    fn deliver(
        &self,
        peer: &Connection,
        payload: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            let mut writer = peer.writer.lock().await;
            writer.write_all(payload).await?;
            writer.flush().await
        }
    }
}

pub struct TcpRelay {
    listener: TcpListener,
    registry: Registry<Connection>,
    mode: FanOutMode,
}

impl TcpRelay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Registry::new(),
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

    pub fn registry(&self) -> Registry<Connection> {
        self.registry.clone()
    }

    /// Accepts connections until `shutdown` resolves, then stops every session
    /// at its next read and waits for in-flight broadcasts to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let TcpRelay {
            listener,
            registry,
            mode,
        } = self;
        let cancel = CancellationToken::new();
        let sessions = TaskTracker::new();
        let mut next_serial = 0_u64;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_serial += 1;
                        let serial = next_serial;
                        let registry = registry.clone();
                        let cancel = cancel.clone();
                        sessions.spawn(async move {
                            let served = serve_connection(
                                stream, addr, serial, registry, mode, cancel,
                            )
                            .await;
                            if let Err(err) = served {
                                warn!(peer = %addr, error = ?err, "session error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
            }
        }

        info!("relay shutting down");
        cancel.cancel();
        sessions.close();
        sessions.wait().await;
        Ok(())
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown::signal()).await
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    serial: u64,
    registry: Registry<Connection>,
    mode: FanOutMode,
    cancel: CancellationToken,
) -> Result<()> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %addr, error = ?err, "failed to disable nagle");
    }
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut session = Session::new(Connection::new(serial, addr, writer), registry.clone());
    let mut line = Vec::new();

    loop {
        line.clear();
        // Cancellation is only observed while waiting for input, never
        // while a broadcast is under way.
        let read = select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        read.with_context(|| format!("failed to read from {addr}"))?;
        if !is_complete_line(&line) {
            break;
        }

        let unit: &[u8] = if is_blank_line(&line) { &[] } else { &line };
        if let Some(payload) = session.receive(unit) {
            broadcast_async(payload, &registry, &LineWriter, mode).await;
        }
    }

    session.close();
    debug!(peer = %session.peer().addr(), "connection closed");
    Ok(())
}
