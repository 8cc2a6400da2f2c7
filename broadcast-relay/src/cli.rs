//! Command-line arguments for the relay and load-test binaries.
//!
//! Every binary takes positional arguments only (`<port>` for servers,
//! `<host> <port> <clients>` for load tests); the long flags are optional
//! tuning knobs whose defaults reproduce the plain behaviour.

use std::{net::Ipv4Addr, num::NonZeroUsize, time::Duration};

use clap::{Args, Parser};

use crate::fanout::FanOutMode;

/// Parses `T` from the process arguments.
///
/// Usage errors go to stderr with exit status 1; `--help` and `--version`
/// print to stdout and exit 0.
pub fn parse_or_exit<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    }
}

/// Stream relay (`tcp-async-server`, `broker-server`).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct StreamServerArgs {
    /// TCP port to listen on. Use 0 for an ephemeral port.
    pub port: u16,

    /// Write to all recipients of a broadcast at once instead of one by one.
    #[arg(long)]
    pub concurrent: bool,
}

impl StreamServerArgs {
    pub fn fan_out_mode(&self) -> FanOutMode {
        if self.concurrent {
            FanOutMode::Concurrent
        } else {
            FanOutMode::Sequential
        }
    }
}

/// Thread-per-connection relay (`tcp-thread-server`).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// TCP port to listen on. Use 0 for an ephemeral port.
    pub port: u16,
}

/// Single-task datagram relay (`udp-async-server`).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct DatagramServerArgs {
    /// UDP port to listen on. Use 0 for an ephemeral port.
    pub port: u16,

    /// Forget senders that stay silent for this many seconds. Off by default:
    /// datagram senders never announce that they left.
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,
}

impl DatagramServerArgs {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.map(Duration::from_secs)
    }
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Number of receive threads sharing the port. Defaults to the available
    /// parallelism.
    #[arg(long)]
    pub threads: Option<NonZeroUsize>,
}

impl WorkerArgs {
    pub fn thread_count(&self) -> usize {
        self.threads
            .or_else(|| std::thread::available_parallelism().ok())
            .map_or(4, NonZeroUsize::get)
    }
}

/// Kernel load-shared datagram relay (`udp-reuseport-server`).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ReusePortServerArgs {
    /// UDP port every worker binds.
    pub port: u16,

    #[command(flatten)]
    pub workers: WorkerArgs,
}

/// Multicast relay (`udp-multicast-server`).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct MulticastServerArgs {
    /// UDP port to receive on; also the destination port on the group.
    pub port: u16,

    /// IPv4 multicast group the relay forwards every datagram to.
    pub multicast_group: Ipv4Addr,

    #[command(flatten)]
    pub workers: WorkerArgs,
}

/// TCP, UDP and broker load tests.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct LoadTestArgs {
    /// Relay host name or address.
    pub host: String,

    /// Relay port.
    pub port: u16,

    /// Number of simulated clients.
    pub clients: usize,

    /// Seconds each client keeps listening for broadcasts after sending.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub window: u64,
}

impl LoadTestArgs {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}

/// Multicast load test.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct MulticastLoadTestArgs {
    /// Relay host name or address.
    pub host: String,

    /// Relay port, also the port the group traffic arrives on.
    pub port: u16,

    /// IPv4 multicast group to join.
    pub multicast_group: Ipv4Addr,

    /// Number of simulated clients.
    pub clients: usize,

    /// Seconds each client keeps listening for broadcasts after sending.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub window: u64,
}

impl MulticastLoadTestArgs {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window)
    }
}
