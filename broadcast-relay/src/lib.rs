//! Best-effort broadcast relays: whatever one peer sends, every connected
//! peer (the sender included) receives.
//!
//! See `README.md` for the binaries and their wire formats. The relay core
//! is transport independent:
//!
//! - [`peer`] names what a member is and the broker's routing ids.
//! - [`registry`] holds the current members behind one lock and hands out
//!   snapshots.
//! - [`fanout`] delivers one payload to a snapshot, isolating per-recipient
//!   failures and timing the whole attempt.
//! - [`session`] tracks one peer from first unit to disconnect and keeps the
//!   registry in step with it.
//!
//! Around it:
//!
//! - [`transport`] has one relay per transport: async TCP, thread-per-connection
//!   TCP, a routing-id broker, async UDP and a pool of `SO_REUSEPORT` workers
//!   for unicast or multicast.
//! - [`loadtest`] drives many synthetic clients through a relay and reports
//!   round-trip latency.
//! - [`cli`], [`shutdown`] and [`telemetry`] are shared by the binaries.

pub mod cli;
pub mod fanout;
pub mod loadtest;
pub mod peer;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod telemetry;
pub mod transport;
