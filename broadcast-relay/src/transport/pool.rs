//! Blocking datagram workers that share one UDP port.
//!
//! Every worker thread owns its own socket, bound to the same port with
//! `SO_REUSEADDR` and (on unix) `SO_REUSEPORT`, so the kernel spreads
//! incoming datagrams across them. All workers share one [`Registry`].
//!
//! Two relays are built on the pool:
//!
//! - [`DatagramPool::unicast`]: senders become members, like the async UDP
//!   relay but load-shared across threads.
//! - [`DatagramPool::multicast`]: the only member is the multicast group
//!   endpoint; every datagram is forwarded to the group.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::{
    fanout::{Deliver, broadcast},
    registry::Registry,
    transport::MAX_DATAGRAM,
};

/// How often a blocked worker wakes up to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

impl Deliver<SocketAddr> for UdpSocket {
    fn deliver(&self, peer: &SocketAddr, payload: &[u8]) -> io::Result<()> {
        self.send_to(payload, peer).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    /// Every sender joins on its first datagram.
    ObserveSenders,
    /// Membership is fixed at startup.
    Fixed,
}

/// Opens `count` sockets bound to the same IPv4 port.
///
/// With `port == 0` the first socket picks an ephemeral port and the others
/// follow it.
pub fn bind_shared(port: u16, count: usize) -> io::Result<Vec<UdpSocket>> {
    let mut sockets = Vec::with_capacity(count);
    let mut addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    for _ in 0..count.max(1) {
        let socket = shared_socket()?;
        socket.bind(&SocketAddr::V4(addr).into())?;
        let socket: UdpSocket = socket.into();
        addr.set_port(socket.local_addr()?.port());
        sockets.push(socket);
    }
    Ok(sockets)
}

fn shared_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    Ok(socket)
}

pub struct DatagramPool {
    sockets: Vec<UdpSocket>,
    registry: Registry<SocketAddr>,
    membership: Membership,
}

impl DatagramPool {
    /// Relays every datagram back to every sender seen so far.
    pub fn unicast(port: u16, threads: usize) -> Result<Self> {
        let sockets = bind_shared(port, threads)
            .with_context(|| format!("failed to bind UDP port {port}"))?;
        Ok(Self {
            sockets,
            registry: Registry::new(),
            membership: Membership::ObserveSenders,
        })
    }

    /// Relays every datagram to `group` on the pool's port.
    pub fn multicast(port: u16, group: Ipv4Addr, threads: usize) -> Result<Self> {
        ensure!(group.is_multicast(), "{group} is not a multicast address");
        let sockets = bind_shared(port, threads)
            .with_context(|| format!("failed to bind UDP port {port}"))?;
        let port = sockets[0].local_addr()?.port();
        for socket in &sockets {
            socket.set_multicast_loop_v4(true)?;
        }

        let registry = Registry::new();
        let destination = SocketAddr::V4(SocketAddrV4::new(group, port));
        registry.observe(&destination);
        info!(%destination, "broadcasting to multicast group");
        Ok(Self {
            sockets,
            registry,
            membership: Membership::Fixed,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sockets[0].local_addr()
    }

    pub fn registry(&self) -> Registry<SocketAddr> {
        self.registry.clone()
    }

    /// Starts one worker thread per socket.
    pub fn spawn(self) -> Result<PoolHandle> {
        let local_addr = self.local_addr()?;
        let stopping = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(self.sockets.len());

        for (index, socket) in self.sockets.into_iter().enumerate() {
            socket.set_read_timeout(Some(POLL_INTERVAL))?;
            let registry = self.registry.clone();
            let stopping = Arc::clone(&stopping);
            let membership = self.membership;
            let worker = thread::Builder::new()
                .name(format!("relay-worker-{index}"))
                .spawn(move || serve_datagrams(socket, registry, membership, stopping))
                .context("failed to start worker thread")?;
            workers.push(worker);
        }

        Ok(PoolHandle {
            local_addr,
            stopping,
            workers,
        })
    }
}

/// Running pool. Dropping it without [`PoolHandle::stop`] leaves the
/// workers running.
pub struct PoolHandle {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker and waits for them. A worker mid-broadcast
    /// finishes that broadcast first.
    pub fn stop(self) {
        self.stopping.store(true, Ordering::SeqCst);
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("datagram worker panicked");
            }
        }
        info!("relay shutting down");
    }
}

fn serve_datagrams(
    socket: UdpSocket,
    registry: Registry<SocketAddr>,
    membership: Membership,
    stopping: Arc<AtomicBool>,
) {
    let mut buf = vec![0_u8; MAX_DATAGRAM];
    let own_port = socket.local_addr().map(|addr| addr.port()).ok();
    let worker = thread::current();
    let worker = worker.name().unwrap_or("relay-worker");

    while !stopping.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => {
                warn!(worker, error = ?err, "receive error");
                continue;
            }
        };

        match membership {
            Membership::ObserveSenders => {
                if registry.observe(&from) {
                    debug!(worker, peer = %from, "sender handled by worker");
                }
            }
            // Group traffic we sent ourselves comes back to every socket on
            // the port once any local socket joins the group.
            Membership::Fixed if Some(from.port()) == own_port => continue,
            Membership::Fixed => {}
        }
        if len > 0 {
            broadcast(&buf[..len], &registry, &socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_sockets_follow_the_first_ephemeral_port() -> io::Result<()> {
        let sockets = bind_shared(0, 3)?;
        assert_eq!(sockets.len(), 3);
        let port = sockets[0].local_addr()?.port();
        assert_ne!(port, 0);
        for socket in &sockets {
            assert_eq!(socket.local_addr()?.port(), port);
        }
        Ok(())
    }

    #[test]
    fn multicast_requires_a_group_address() {
        let err = DatagramPool::multicast(0, Ipv4Addr::new(10, 0, 0, 1), 1)
            .err()
            .expect("unicast address must be refused");
        assert!(err.to_string().contains("not a multicast address"));
    }

    #[test]
    fn multicast_membership_is_the_group_only() -> Result<()> {
        let group = Ipv4Addr::new(239, 255, 12, 34);
        let pool = DatagramPool::multicast(0, group, 2)?;
        let port = pool.local_addr()?.port();
        assert_eq!(
            pool.registry().snapshot(),
            vec![SocketAddr::V4(SocketAddrV4::new(group, port))]
        );
        Ok(())
    }

    #[test]
    fn unicast_pool_relays_to_every_sender() -> Result<()> {
        let pool = DatagramPool::unicast(0, 2)?;
        let registry = pool.registry();
        let handle = pool.spawn()?;
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, handle.local_addr().port()));

        let alice = UdpSocket::bind("127.0.0.1:0")?;
        let bob = UdpSocket::bind("127.0.0.1:0")?;
        for socket in [&alice, &bob] {
            socket.set_read_timeout(Some(Duration::from_secs(2)))?;
        }
        let mut buf = [0_u8; 64];

        alice.send_to(b"a", target)?;
        let (len, _) = alice.recv_from(&mut buf)?;
        assert_eq!(&buf[..len], b"a");

        bob.send_to(b"b", target)?;
        let (len, _) = bob.recv_from(&mut buf)?;
        assert_eq!(&buf[..len], b"b");
        let (len, _) = alice.recv_from(&mut buf)?;
        assert_eq!(&buf[..len], b"b");
        assert_eq!(registry.len(), 2);

        handle.stop();
        Ok(())
    }
}
