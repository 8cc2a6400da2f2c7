//! Wire-level load-test clients, one per relay flavour.
//!
//! Each client connects, waits at the start gate, sends its probe once and
//! keeps reading until the window closes, even after its own reply shows
//! up, so the relay keeps a live audience for everybody else's probes.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, UdpSocket},
    time::timeout_at,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{ClientContext, ClientOutcome};
use crate::{
    peer::RoutingId,
    transport::{
        MAX_DATAGRAM,
        broker::{codec, send_routing_id},
    },
};

/// Newline-delimited TCP relays (`tcp-async-server`, `tcp-thread-server`).
pub async fn tcp(server: SocketAddr, mut ctx: ClientContext) -> Result<ClientOutcome> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    ctx.start().await;
    let mut line = ctx.probe().encode().into_bytes();
    line.push(b'\n');
    writer.write_all(&line).await.context("failed to send probe")?;

    let mut watch = ctx.watch();
    let mut received = Vec::new();
    loop {
        received.clear();
        let Ok(read) = timeout_at(watch.deadline(), reader.read_until(b'\n', &mut received)).await
        else {
            break;
        };
        if read.context("failed to read broadcast")? == 0 {
            if watch.latency().is_none() {
                bail!("relay closed the connection before the probe came back");
            }
            break;
        }
        watch.offer(&received);
    }
    Ok(watch.outcome())
}

/// Unicast datagram relays (`udp-async-server`, `udp-reuseport-server`).
pub async fn udp(server: SocketAddr, mut ctx: ClientContext) -> Result<ClientOutcome> {
    let socket = UdpSocket::bind(unspecified_for(server)).await?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    ctx.start().await;
    socket
        .send(ctx.probe().encode().as_bytes())
        .await
        .context("failed to send probe")?;

    let mut watch = ctx.watch();
    let mut buf = vec![0_u8; MAX_DATAGRAM];
    while let Ok(received) = timeout_at(watch.deadline(), socket.recv(&mut buf)).await {
        let len = received.context("failed to receive broadcast")?;
        watch.offer(&buf[..len]);
    }
    Ok(watch.outcome())
}

/// Routing-id broker (`broker-server`). Identifies as `load_client_<id>`.
pub async fn broker(server: SocketAddr, mut ctx: ClientContext) -> Result<ClientOutcome> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, codec());
    let mut sink = FramedWrite::new(writer, codec());

    let id = RoutingId::new(format!("load_client_{}", ctx.id))
        .context("client id does not fit in a routing id")?;
    send_routing_id(&mut sink, &id).await?;
    // Empty frame: joins the broadcast without sending anything.
    sink.send(Bytes::new()).await?;

    ctx.start().await;
    sink.send(Bytes::from(ctx.probe().encode()))
        .await
        .context("failed to send probe")?;

    let mut watch = ctx.watch();
    while let Ok(frame) = timeout_at(watch.deadline(), frames.next()).await {
        let Some(frame) = frame else {
            if watch.latency().is_none() {
                bail!("broker closed the connection before the probe came back");
            }
            break;
        };
        watch.offer(&frame.context("failed to read frame")?);
    }
    Ok(watch.outcome())
}

/// Multicast relay (`udp-multicast-server`): the probe goes to the relay by
/// unicast and comes back on `group`, on the relay's port.
pub async fn multicast(
    server: SocketAddr,
    group: Ipv4Addr,
    mut ctx: ClientContext,
) -> Result<ClientOutcome> {
    let sender = UdpSocket::bind(unspecified_for(server)).await?;
    sender
        .connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    let receiver = group_receiver(group, server.port())
        .with_context(|| format!("failed to join {group}:{}", server.port()))?;

    ctx.start().await;
    sender
        .send(ctx.probe().encode().as_bytes())
        .await
        .context("failed to send probe")?;

    let mut watch = ctx.watch();
    let mut buf = vec![0_u8; MAX_DATAGRAM];
    while let Ok(received) = timeout_at(watch.deadline(), receiver.recv_from(&mut buf)).await {
        let (len, _) = received.context("failed to receive broadcast")?;
        watch.offer(&buf[..len]);
    }
    Ok(watch.outcome())
}

/// A socket on `group:port` that many clients on one host can share.
fn group_receiver(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    // Binding the group address keeps unicast traffic for the relay's port
    // away from this socket. Windows only accepts the wildcard.
    #[cfg(unix)]
    let local = SocketAddrV4::new(group, port);
    #[cfg(not(unix))]
    let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&SocketAddr::V4(local).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn unspecified_for(server: SocketAddr) -> SocketAddr {
    match server {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        loadtest::run_load_test,
        transport::{broker::BrokerRelay, tcp::TcpRelay, udp::UdpRelay},
    };

    const WINDOW: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn tcp_clients_see_their_own_probes() -> Result<()> {
        let relay = TcpRelay::new(TcpListener::bind("127.0.0.1:0").await?);
        let addr = relay.local_addr()?;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(relay.run_until(async {
            let _ = stop_rx.await;
        }));

        let report = run_load_test(5, WINDOW, |ctx| tcp(addr, ctx)).await;
        assert_eq!(report.samples.len(), 5, "{report}");
        assert_eq!(report.errors(), 0, "{report}");

        let _ = stop_tx.send(());
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn udp_clients_see_their_own_probes() -> Result<()> {
        let relay = UdpRelay::bind("127.0.0.1:0".parse()?).await?;
        let addr = relay.local_addr()?;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(relay.run_until(async {
            let _ = stop_rx.await;
        }));

        let report = run_load_test(3, WINDOW, |ctx| udp(addr, ctx)).await;
        assert_eq!(report.samples.len(), 3, "{report}");

        let _ = stop_tx.send(());
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn broker_clients_see_their_own_probes() -> Result<()> {
        let relay = BrokerRelay::new(TcpListener::bind("127.0.0.1:0").await?);
        let addr = relay.local_addr()?;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(relay.run_until(async {
            let _ = stop_rx.await;
        }));

        let report = run_load_test(4, WINDOW, |ctx| broker(addr, ctx)).await;
        assert_eq!(report.samples.len(), 4, "{report}");
        assert_eq!(report.errors(), 0, "{report}");

        let _ = stop_tx.send(());
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_relay_counts_as_transport_failure() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let report = run_load_test(2, WINDOW, |ctx| tcp(addr, ctx)).await;
        assert_eq!(report.failures, 2);
        assert!(report.samples.is_empty());
        Ok(())
    }
}
