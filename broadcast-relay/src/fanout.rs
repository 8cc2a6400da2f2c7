//! Snapshot-and-fan-out broadcast.
//!
//! A broadcast copies the registry, then attempts delivery to every peer in
//! that copy. Peers that join mid-broadcast wait for the next one; peers that
//! leave mid-broadcast still get an attempt, which fails and is counted.
//! A failed recipient never stops the loop and never fails the broadcast.
//!
//! Two flavours share the same accounting:
//!
//! - [`broadcast`] for blocking transports driven by OS threads.
//! - [`broadcast_async`] for transports driven by a Tokio scheduler, either
//!   awaiting each write in turn or all of them at once (see [`FanOutMode`]).

use std::{
    future::Future,
    io,
    time::{Duration, Instant},
};

use futures::future::join_all;
use tracing::{info, warn};

use crate::{peer::Peer, registry::Registry};

/// Blocking "deliver payload to peer" capability of a transport.
pub trait Deliver<P> {
    fn deliver(&self, peer: &P, payload: &[u8]) -> io::Result<()>;
}

/// Async "deliver payload to peer" capability of a transport.
///
/// Implementations may take a per-recipient lock but must never hold anything
/// that blocks registry mutation while writing.
pub trait AsyncDeliver<P>: Sync {
    fn deliver(&self, peer: &P, payload: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// How an async broadcast schedules its per-recipient writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FanOutMode {
    /// Await each write before starting the next. A stalled recipient delays
    /// the rest of the round and the broadcasting session's next read.
    #[default]
    Sequential,
    /// Start every write of the round at once and wait for all of them.
    Concurrent,
}

#[derive(Debug)]
pub struct DeliveryFailure<P> {
    pub peer: P,
    pub error: io::Error,
}

/// Outcome of one broadcast attempt.
#[derive(Debug)]
pub struct BroadcastReport<P> {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub failures: Vec<DeliveryFailure<P>>,
}

impl<P> BroadcastReport<P> {
    /// True when every recipient in the snapshot accepted the payload.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Delivers `payload` to every peer registered at the time of the call.
///
/// `payload` must be non-empty; adapters drop blank units before calling.
pub fn broadcast<P, D>(payload: &[u8], registry: &Registry<P>, transport: &D) -> BroadcastReport<P>
where
    P: Peer,
    D: Deliver<P> + ?Sized,
{
    let recipients = registry.snapshot();
    let started = Instant::now();
    let outcomes: Vec<_> = recipients
        .iter()
        .map(|peer| transport.deliver(peer, payload))
        .collect();
    tally(recipients, outcomes, started.elapsed())
}

/// Async counterpart of [`broadcast`].
///
/// The future always runs every delivery of the snapshot before resolving;
/// callers that support cancellation must only observe it between broadcasts.
pub async fn broadcast_async<P, D>(
    payload: &[u8],
    registry: &Registry<P>,
    transport: &D,
    mode: FanOutMode,
) -> BroadcastReport<P>
where
    P: Peer,
    D: AsyncDeliver<P>,
{
    let recipients = registry.snapshot();
    let started = Instant::now();
    let outcomes = match mode {
        FanOutMode::Sequential => {
            let mut outcomes = Vec::with_capacity(recipients.len());
            for peer in &recipients {
                outcomes.push(transport.deliver(peer, payload).await);
            }
            outcomes
        }
        FanOutMode::Concurrent => {
            join_all(
                recipients
                    .iter()
                    .map(|peer| transport.deliver(peer, payload)),
            )
            .await
        }
    };
    tally(recipients, outcomes, started.elapsed())
}

fn tally<P: Peer>(
    recipients: Vec<P>,
    outcomes: Vec<io::Result<()>>,
    elapsed: Duration,
) -> BroadcastReport<P> {
    let attempted = recipients.len();
    let failures: Vec<_> = recipients
        .into_iter()
        .zip(outcomes)
        .filter_map(|(peer, outcome)| outcome.err().map(|error| DeliveryFailure { peer, error }))
        .collect();

    for failure in &failures {
        warn!(peer = ?failure.peer, error = %failure.error, "write error");
    }

    let failed = failures.len();
    let report = BroadcastReport {
        attempted,
        succeeded: attempted - failed,
        failed,
        elapsed,
        failures,
    };
    info!(
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failed,
        "broadcast took {}us",
        report.elapsed.as_micros()
    );
    report
}
