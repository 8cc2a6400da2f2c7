use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    thread,
    time::Duration,
};

use anyhow::Result;
use broadcast_relay::{
    fanout::FanOutMode,
    loadtest::{clients, run_load_test},
    peer::{Peer, RoutingId},
    registry::Registry,
    transport::{
        broker::{BrokerRelay, codec, send_routing_id},
        pool::DatagramPool,
        tcp::TcpRelay,
        threaded::ThreadedRelay,
        udp::UdpRelay,
    },
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

fn spawn_until_stopped<R, F>(run: R) -> (oneshot::Sender<()>, JoinHandle<Result<()>>)
where
    R: FnOnce(oneshot::Receiver<()>) -> F,
    F: Future<Output = Result<()>> + Send + 'static,
{
    let (stop_tx, stop_rx) = oneshot::channel();
    (stop_tx, tokio::spawn(run(stop_rx)))
}

async fn wait_for_members<P: Peer>(registry: &Registry<P>, expected: usize) {
    timeout(READ_TIMEOUT, async {
        while registry.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {expected} members"));
}

struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let (reader, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        let mut line = String::new();
        timeout(READ_TIMEOUT, self.reader.read_line(&mut line)).await??;
        Ok(line)
    }
}

#[tokio::test]
async fn tcp_relay_survives_a_departed_peer() -> Result<()> {
    let relay = TcpRelay::new(TcpListener::bind("127.0.0.1:0").await?)
        .with_mode(FanOutMode::Concurrent);
    let addr = relay.local_addr()?;
    let registry = relay.registry();
    let (stop, server) = spawn_until_stopped(|stop_rx| {
        relay.run_until(async move {
            let _ = stop_rx.await;
        })
    });

    let mut alice = LineClient::connect(addr).await?;
    let mut bob = LineClient::connect(addr).await?;
    let mut carol = LineClient::connect(addr).await?;
    for (client, name) in [(&mut alice, "alice"), (&mut bob, "bob"), (&mut carol, "carol")] {
        client.send(&format!("{name} joined")).await?;
        assert_eq!(client.recv().await?, format!("{name} joined\n"));
    }
    wait_for_members(&registry, 3).await;
    // Drain the join lines the others saw.
    assert_eq!(alice.recv().await?, "bob joined\n");
    assert_eq!(alice.recv().await?, "carol joined\n");
    assert_eq!(bob.recv().await?, "carol joined\n");

    drop(carol);
    wait_for_members(&registry, 2).await;

    alice.send("still here").await?;
    assert_eq!(alice.recv().await?, "still here\n");
    assert_eq!(bob.recv().await?, "still here\n");

    let _ = stop.send(());
    server.await??;
    Ok(())
}

#[tokio::test]
async fn tcp_relay_ignores_blank_lines() -> Result<()> {
    let relay = TcpRelay::new(TcpListener::bind("127.0.0.1:0").await?);
    let addr = relay.local_addr()?;
    let registry = relay.registry();
    let (stop, server) = spawn_until_stopped(|stop_rx| {
        relay.run_until(async move {
            let _ = stop_rx.await;
        })
    });

    let mut client = LineClient::connect(addr).await?;
    client.send("").await?;
    wait_for_members(&registry, 1).await;
    client.send("after the blank").await?;
    assert_eq!(client.recv().await?, "after the blank\n");

    let _ = stop.send(());
    server.await??;
    assert!(registry.is_empty());
    Ok(())
}

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

async fn broker_client(addr: SocketAddr, id: &'static str) -> Result<(FrameReader, FrameWriter)> {
    let (reader, writer) = TcpStream::connect(addr).await?.into_split();
    let mut frames = FramedWrite::new(writer, codec());
    send_routing_id(&mut frames, &RoutingId::new(id).expect("valid routing id")).await?;
    Ok((FramedRead::new(reader, codec()), frames))
}

#[tokio::test]
async fn broker_routes_payloads_by_routing_id() -> Result<()> {
    let relay = BrokerRelay::new(TcpListener::bind("127.0.0.1:0").await?);
    let addr = relay.local_addr()?;
    let registry = relay.registry();
    let (stop, server) = spawn_until_stopped(|stop_rx| {
        relay.run_until(async move {
            let _ = stop_rx.await;
        })
    });

    let (mut alice_in, mut alice_out) = broker_client(addr, "alice").await?;
    let (mut bob_in, mut bob_out) = broker_client(addr, "bob").await?;
    alice_out.send(Bytes::new()).await?;
    bob_out.send(Bytes::new()).await?;
    wait_for_members(&registry, 2).await;

    bob_out.send(Bytes::from_static(b"hi all")).await?;
    let to_alice = timeout(READ_TIMEOUT, alice_in.next()).await?.expect("frame")?;
    let to_bob = timeout(READ_TIMEOUT, bob_in.next()).await?.expect("frame")?;
    assert_eq!(&to_alice[..], b"hi all");
    assert_eq!(&to_bob[..], b"hi all");

    // A second connection claiming a live routing id is turned away.
    let (mut impostor_in, _impostor_out) = broker_client(addr, "alice").await?;
    let closed = timeout(READ_TIMEOUT, impostor_in.next()).await?;
    assert!(closed.is_none());
    assert_eq!(registry.len(), 2);

    drop((bob_in, bob_out));
    wait_for_members(&registry, 1).await;
    assert!(registry.contains(&RoutingId::new("alice").expect("valid routing id")));

    let _ = stop.send(());
    server.await??;
    Ok(())
}

#[tokio::test]
async fn udp_relay_echoes_to_every_sender() -> Result<()> {
    let relay = UdpRelay::bind("127.0.0.1:0".parse()?).await?;
    let addr = relay.local_addr()?;
    let (stop, server) = spawn_until_stopped(|stop_rx| {
        relay.run_until(async move {
            let _ = stop_rx.await;
        })
    });

    let alice = UdpSocket::bind("127.0.0.1:0").await?;
    let bob = UdpSocket::bind("127.0.0.1:0").await?;
    let mut buf = [0_u8; 64];

    alice.send_to(b"one", addr).await?;
    let (len, _) = timeout(READ_TIMEOUT, alice.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..len], b"one");

    bob.send_to(b"two", addr).await?;
    for socket in [&alice, &bob] {
        let (len, from) = timeout(READ_TIMEOUT, socket.recv_from(&mut buf)).await??;
        assert_eq!(&buf[..len], b"two");
        assert_eq!(from, addr);
    }

    let _ = stop.send(());
    server.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_test_through_the_threaded_relay() -> Result<()> {
    let relay = ThreadedRelay::bind("127.0.0.1:0")?;
    let addr = relay.local_addr()?;
    let registry = relay.registry();
    let stop = relay.stop_handle()?;
    let server = thread::spawn(move || relay.run());

    let window = Duration::from_millis(500);
    let report = run_load_test(6, window, |ctx| clients::tcp(addr, ctx)).await;
    assert_eq!(report.clients, 6);
    assert_eq!(report.samples.len(), 6, "{report}");
    assert_eq!(report.errors(), 0, "{report}");
    let summary = report.summary().expect("samples were recorded");
    assert!(summary.min <= summary.max);

    tokio::task::spawn_blocking(move || {
        stop.stop();
        server.join().expect("relay thread panicked")
    })
    .await??;
    assert!(registry.is_empty());
    Ok(())
}

/// Joins `group` on `port` the way the multicast load-test clients do.
fn group_listener(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    #[cfg(unix)]
    let local = SocketAddrV4::new(group, port);
    #[cfg(not(unix))]
    let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&SocketAddr::V4(local).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multicast_relay_forwards_each_datagram_to_the_group_once() -> Result<()> {
    let group = Ipv4Addr::new(239, 255, 77, 7);
    let handle = DatagramPool::multicast(0, group, 2)?.spawn()?;
    let port = handle.local_addr().port();
    let server = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = group_listener(group, port)?;

    let window = Duration::from_millis(800);
    let (report, forwarded) = tokio::join!(
        run_load_test(3, window, |ctx| clients::multicast(server, group, ctx)),
        async {
            let mut buf = [0_u8; 256];
            let mut forwarded = 0;
            let deadline = Instant::now() + window;
            while let Ok(Ok(_)) = timeout_at(deadline, listener.recv_from(&mut buf)).await {
                forwarded += 1;
            }
            forwarded
        }
    );

    assert_eq!(report.samples.len(), 3, "{report}");
    assert_eq!(report.errors(), 0, "{report}");
    // One probe per client reaches the group; the relay's own group
    // traffic looping back is never forwarded again.
    assert_eq!(forwarded, 3);

    tokio::task::spawn_blocking(move || handle.stop()).await?;
    Ok(())
}
