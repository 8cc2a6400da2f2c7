//! Newline-delimited TCP relay with one OS thread per connection.
//!
//! All connection threads share one [`Registry`]. A broadcast copies the
//! registry under its lock, releases it, and then writes to each recipient
//! under that recipient's own lock, so a stalled client only ever holds up
//! writers that target it.

use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    io::{self, BufRead, BufReader, Write},
    net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{
    fanout::{Deliver, broadcast},
    registry::Registry,
    session::Session,
    transport::{is_blank_line, is_complete_line},
};

#[derive(Clone)]
pub struct Connection {
    serial: u64,
    addr: SocketAddr,
    writer: Arc<Mutex<TcpStream>>,
}

impl Connection {
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

struct BlockingWriter;

impl Deliver<Connection> for BlockingWriter {
    fn deliver(&self, peer: &Connection, payload: &[u8]) -> io::Result<()> {
        let mut writer = peer.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(payload)?;
        writer.flush()
    }
}

/// Read halves of every accepted connection, so shutdown can unblock them.
#[derive(Clone, Default)]
struct OpenConnections {
    streams: Arc<Mutex<HashMap<u64, TcpStream>>>,
}

impl OpenConnections {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, serial: u64, stream: TcpStream) {
        self.lock().insert(serial, stream);
    }

    fn remove(&self, serial: u64) {
        self.lock().remove(&serial);
    }

    fn shutdown_reads(&self) {
        for stream in self.lock().values() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }
}

/// Stops a running [`ThreadedRelay`] from any thread.
#[derive(Clone)]
pub struct StopHandle {
    stopping: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // The accept loop is parked in a blocking accept(); hand it a
        // connection so it wakes up and sees the flag.
        if let Err(err) = TcpStream::connect(self.wake_addr) {
            debug!(error = ?err, "failed to wake accept loop");
        }
    }
}

pub struct ThreadedRelay {
    listener: TcpListener,
    registry: Registry<Connection>,
    stopping: Arc<AtomicBool>,
}

impl ThreadedRelay {
    pub fn bind(addr: impl std::net::ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("failed to bind listener")?;
        Ok(Self::new(listener))
    }

    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Registry::new(),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry<Connection> {
        self.registry.clone()
    }

    pub fn stop_handle(&self) -> io::Result<StopHandle> {
        let mut wake_addr = self.listener.local_addr()?;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(match wake_addr {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            });
        }
        Ok(StopHandle {
            stopping: Arc::clone(&self.stopping),
            wake_addr,
        })
    }

    /// Accepts until [`StopHandle::stop`] is called, then closes every
    /// connection's read side and joins the connection threads.
    pub fn run(self) -> Result<()> {
        let ThreadedRelay {
            listener,
            registry,
            stopping,
        } = self;
        let open = OpenConnections::default();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut next_serial = 0_u64;

        for accepted in listener.incoming() {
            if stopping.load(Ordering::SeqCst) {
                break;
            }
            let stream = match accepted {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = ?err, "failed to accept connection");
                    continue;
                }
            };

            next_serial += 1;
            let serial = next_serial;
            match spawn_connection(stream, serial, &registry, &open) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    open.remove(serial);
                    warn!(error = ?err, "failed to start connection thread");
                }
            }
            workers.retain(|worker| !worker.is_finished());
        }

        info!("relay shutting down");
        open.shutdown_reads();
        for worker in workers {
            if worker.join().is_err() {
                warn!("connection thread panicked");
            }
        }
        Ok(())
    }
}

fn spawn_connection(
    stream: TcpStream,
    serial: u64,
    registry: &Registry<Connection>,
    open: &OpenConnections,
) -> Result<JoinHandle<()>> {
    let addr = stream.peer_addr()?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %addr, error = ?err, "failed to disable nagle");
    }
    open.insert(serial, stream.try_clone()?);

    let registry = registry.clone();
    let open = open.clone();
    let worker = thread::Builder::new()
        .name(format!("relay-conn-{serial}"))
        .spawn(move || {
            if let Err(err) = serve_connection(stream, addr, serial, registry) {
                warn!(peer = %addr, error = ?err, "session error");
            }
            open.remove(serial);
        })?;
    Ok(worker)
}

fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    serial: u64,
    registry: Registry<Connection>,
) -> Result<()> {
    let connection = Connection {
        serial,
        addr,
        writer: Arc::new(Mutex::new(stream.try_clone()?)),
    };
    let mut session = Session::new(connection, registry.clone());
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("failed to read from {addr}"))?;
        if !is_complete_line(&line) {
            break;
        }

        let unit: &[u8] = if is_blank_line(&line) { &[] } else { &line };
        if let Some(payload) = session.receive(unit) {
            broadcast(payload, &registry, &BlockingWriter);
        }
    }

    session.close();
    debug!(peer = %session.peer().addr(), "connection closed");
    Ok(())
}
