//! Transport adapters. Each one owns its sockets and accept/receive loop and
//! turns transport events into registry updates and broadcasts.
//!
//! - [`tcp`]: newline-delimited TCP on a Tokio scheduler.
//! - [`threaded`]: newline-delimited TCP with one OS thread per connection.
//! - [`broker`]: routing-id framed message broker over TCP.
//! - [`udp`]: unicast datagrams on a Tokio scheduler.
//! - [`pool`]: blocking datagram workers sharing one port (`SO_REUSEPORT`),
//!   relaying to senders or to a multicast group.

pub mod broker;
pub mod pool;
pub mod tcp;
pub mod threaded;
pub mod udp;

/// Largest payload a UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// A unit read by `read_until(b'\n')` is only usable if the delimiter arrived;
/// anything else is a half line cut off by EOF.
pub(crate) fn is_complete_line(line: &[u8]) -> bool {
    line.last() == Some(&b'\n')
}

pub(crate) fn is_blank_line(line: &[u8]) -> bool {
    line.iter().all(|byte| matches!(byte, b'\r' | b'\n'))
}
