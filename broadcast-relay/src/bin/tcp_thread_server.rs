use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use broadcast_relay::{
    cli::{ServerArgs, parse_or_exit},
    shutdown,
    telemetry::init_tracing,
    transport::threaded::ThreadedRelay,
};

fn main() -> Result<()> {
    init_tracing();
    let args: ServerArgs = parse_or_exit();

    let relay = ThreadedRelay::bind(("0.0.0.0", args.port))
        .with_context(|| format!("failed to bind TCP port {}", args.port))?;
    let stop = relay.stop_handle()?;
    info!("server listening on {}", relay.local_addr()?);

    let acceptor = thread::Builder::new()
        .name("relay-accept".into())
        .spawn(move || relay.run())?;
    shutdown::wait_blocking()?;
    stop.stop();
    acceptor
        .join()
        .map_err(|_| anyhow!("accept thread panicked"))?
}
