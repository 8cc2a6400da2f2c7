use anyhow::Result;
use tracing::info;

use broadcast_relay::{
    cli::{MulticastServerArgs, parse_or_exit},
    shutdown,
    telemetry::init_tracing,
    transport::pool::DatagramPool,
};

fn main() -> Result<()> {
    init_tracing();
    let args: MulticastServerArgs = parse_or_exit();

    let pool = DatagramPool::multicast(
        args.port,
        args.multicast_group,
        args.workers.thread_count(),
    )?;
    let handle = pool.spawn()?;
    info!(workers = handle.worker_count(), "datagram workers started");
    info!("server listening on {}", handle.local_addr());

    shutdown::wait_blocking()?;
    handle.stop();
    Ok(())
}
