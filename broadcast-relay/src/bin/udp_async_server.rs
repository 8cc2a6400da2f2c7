use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use tracing::{info, warn};

use broadcast_relay::{
    cli::{DatagramServerArgs, parse_or_exit},
    telemetry::init_tracing,
    transport::udp::UdpRelay,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let args: DatagramServerArgs = parse_or_exit();

    let relay = UdpRelay::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)))
        .await
        .with_context(|| format!("failed to bind UDP port {}", args.port))?
        .with_idle_timeout(args.idle_timeout());
    info!("server listening on {}", relay.local_addr()?);

    if let Err(err) = relay.run_until_signal().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
