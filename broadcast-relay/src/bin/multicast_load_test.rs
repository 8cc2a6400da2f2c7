use anyhow::Result;

use broadcast_relay::{
    cli::{MulticastLoadTestArgs, parse_or_exit},
    loadtest::{clients, resolve, run_load_test},
    telemetry::init_tracing,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args: MulticastLoadTestArgs = parse_or_exit();

    println!(
        "Spawning {} clients connecting to {}:{} (group {})...",
        args.clients, args.host, args.port, args.multicast_group
    );
    let server = resolve(&args.host, args.port).await?;
    let group = args.multicast_group;
    let report = run_load_test(args.clients, args.window(), |ctx| {
        clients::multicast(server, group, ctx)
    })
    .await;
    println!("{report}");
    Ok(())
}
