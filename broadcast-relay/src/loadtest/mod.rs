//! Load-test harness: many synthetic clients, one probe each, round-trip
//! latency measured through the relay.
//!
//! Every client connects, waits at a shared [`StartLatch`] until all
//! clients are connected, sends one [`Probe`](probe::Probe) and then
//! watches broadcast traffic for the rest of the observation window. The
//! first copy of its own probe gives a latency sample.

pub mod clients;
pub mod latch;
pub mod probe;
pub mod stats;

use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use tokio::{net::lookup_host, task::JoinSet, time};
use tracing::{debug, warn};

use self::{
    latch::{StartLatch, StartTicket},
    probe::{Probe, ReplyWatch},
    stats::LoadReport,
};

/// Extra time a client gets on top of the window to connect and finish.
const GRACE: Duration = Duration::from_secs(5);

/// What one client measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOutcome {
    /// Round trip of the client's own probe, in microseconds.
    Latency(u64),
    /// The window closed before the probe came back.
    NoReply,
}

/// Everything a client task gets from the harness.
#[derive(Debug)]
pub struct ClientContext {
    pub id: usize,
    pub tag: String,
    pub window: Duration,
    ticket: Option<StartTicket>,
}

impl ClientContext {
    pub fn new(id: usize, window: Duration, ticket: StartTicket) -> Self {
        Self {
            id,
            tag: id.to_string(),
            window,
            ticket: Some(ticket),
        }
    }

    /// Waits for every other client to connect. Call once the client is
    /// ready to send; a client that bails out earlier releases its slot
    /// when the context is dropped.
    pub async fn start(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.arrive_and_wait().await;
        }
    }

    /// A freshly stamped probe carrying this client's tag.
    pub fn probe(&self) -> Probe {
        Probe::now(self.tag.clone())
    }

    /// Starts the observation window.
    pub fn watch(&self) -> ReplyWatch {
        ReplyWatch::new(self.tag.clone(), time::Instant::now() + self.window)
    }
}

/// Runs `clients` copies of `client` concurrently and aggregates them.
pub async fn run_load_test<F, Fut>(clients: usize, window: Duration, client: F) -> LoadReport
where
    F: Fn(ClientContext) -> Fut,
    Fut: Future<Output = Result<ClientOutcome>> + Send + 'static,
{
    let started = time::Instant::now();
    let latch = StartLatch::new(clients);
    let mut tasks = JoinSet::new();
    for id in 0..clients {
        let run = client(ClientContext::new(id, window, latch.ticket()));
        tasks.spawn(async move { (id, time::timeout(window + GRACE, run).await) });
    }

    let mut report = LoadReport {
        clients,
        ..LoadReport::default()
    };
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(Ok(ClientOutcome::Latency(micros))))) => {
                debug!(client = id, micros, "probe returned");
                report.samples.push(micros);
            }
            Ok((id, Ok(Ok(ClientOutcome::NoReply)))) => {
                debug!(client = id, "no reply within the window");
                report.timeouts += 1;
            }
            Ok((id, Ok(Err(err)))) => {
                warn!(client = id, error = ?err, "client failed");
                report.failures += 1;
            }
            Ok((id, Err(_))) => {
                warn!(client = id, "client did not finish in time");
                report.failures += 1;
            }
            Err(err) => {
                warn!(error = ?err, "client task panicked");
                report.failures += 1;
            }
        }
    }
    report.elapsed = started.elapsed();
    report
}

/// Resolves `host:port`, preferring IPv4 since the relays listen on IPv4.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("{host}:{port} resolved to no addresses"))
}
