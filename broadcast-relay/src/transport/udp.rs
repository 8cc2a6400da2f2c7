//! Unicast datagram relay driven by a Tokio scheduler.
//!
//! Any datagram makes its sender a member; every non-empty datagram is sent
//! back out to every member, the sender included. Datagrams carry no
//! disconnect signal, so without an idle timeout membership only grows.

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::{net::UdpSocket, select, time};
use tracing::{debug, info, warn};

use crate::{
    fanout::{AsyncDeliver, FanOutMode, broadcast_async},
    registry::Registry,
    shutdown,
    transport::MAX_DATAGRAM,
};

impl AsyncDeliver<SocketAddr> for UdpSocket {
    fn deliver(
        &self,
        peer: &SocketAddr,
        payload: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send {
        let peer = *peer;
        async move { self.send_to(payload, peer).await.map(|_| ()) }
    }
}

/// Last time each member was heard from, for the optional idle eviction.
struct IdleTracker {
    timeout: Duration,
    last_seen: HashMap<SocketAddr, Instant>,
}

impl IdleTracker {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: HashMap::new(),
        }
    }

    fn touch(&mut self, peer: SocketAddr, now: Instant) {
        self.last_seen.insert(peer, now);
    }

    /// Forgets every member silent for longer than the timeout.
    fn sweep(&mut self, registry: &Registry<SocketAddr>, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut evicted = 0;
        self.last_seen.retain(|peer, seen| {
            let idle = now.saturating_duration_since(*seen) > timeout;
            if idle && registry.forget(peer) {
                evicted += 1;
            }
            !idle
        });
        evicted
    }

    fn sweep_period(&self) -> Duration {
        (self.timeout / 2).max(Duration::from_millis(10))
    }
}

pub struct UdpRelay {
    socket: UdpSocket,
    registry: Registry<SocketAddr>,
    idle_timeout: Option<Duration>,
}

impl UdpRelay {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr).await?))
    }

    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            registry: Registry::new(),
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> Registry<SocketAddr> {
        self.registry.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let UdpRelay {
            socket,
            registry,
            idle_timeout,
        } = self;
        let mut idle = idle_timeout.map(IdleTracker::new);
        let period = idle
            .as_ref()
            .map_or(Duration::from_secs(3600), IdleTracker::sweep_period);
        let mut sweep = time::interval(period);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut buf = vec![0_u8; MAX_DATAGRAM];
        tokio::pin!(shutdown);

        loop {
            let received = select! {
                _ = &mut shutdown => break,
                _ = sweep.tick(), if idle.is_some() => {
                    if let Some(idle) = idle.as_mut() {
                        let evicted = idle.sweep(&registry, Instant::now());
                        if evicted > 0 {
                            debug!(evicted, "evicted idle peers");
                        }
                    }
                    continue;
                }
                received = socket.recv_from(&mut buf) => received,
            };

            let (len, from) = match received {
                Ok(received) => received,
                Err(err) => {
                    // ICMP errors from earlier sends surface here on some
                    // platforms; they say nothing about this socket.
                    warn!(error = ?err, "receive error");
                    continue;
                }
            };

            registry.observe(&from);
            if let Some(idle) = idle.as_mut() {
                idle.touch(from, Instant::now());
            }
            if len > 0 {
                broadcast_async(&buf[..len], &registry, &socket, FanOutMode::Sequential).await;
            }
        }

        info!("relay shutting down");
        Ok(())
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown::signal()).await
    }
}
