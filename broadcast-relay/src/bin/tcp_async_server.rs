use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use broadcast_relay::{
    cli::{StreamServerArgs, parse_or_exit},
    telemetry::init_tracing,
    transport::tcp::TcpRelay,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let args: StreamServerArgs = parse_or_exit();

    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind TCP port {}", args.port))?;
    let relay = TcpRelay::new(listener).with_mode(args.fan_out_mode());
    info!("server listening on {}", relay.local_addr()?);

    if let Err(err) = relay.run_until_signal().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
