//! Integration tests for stop-and-wait data transfer over loopback.
//!
//! Loss is scripted with small [`Impairment`] implementations so that every
//! retransmission path is exercised deterministically.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use rudp_stream::{
    config::{ImpairmentConfig, TransportConfig},
    connection::{ConnError, Connection},
    packet::{flags, Packet, PacketError, MAX_PAYLOAD},
    simulator::{Fault, Impairment, Simulator},
    socket::Socket,
    state::ConnectionState,
    timer::CancelToken,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast() -> TransportConfig {
    TransportConfig::with_base_timeout(Duration::from_millis(50))
}

async fn ephemeral() -> Socket {
    Socket::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
        .await
        .expect("bind socket")
}

/// Counts outgoing data packets and, while `blackout` is set, drops them.
#[derive(Clone, Default)]
struct DataTap {
    sent: Arc<AtomicUsize>,
    blackout: Arc<AtomicBool>,
}

impl Impairment for DataTap {
    fn outgoing(&mut self, packet: &Packet) -> Fault {
        if packet.header.flags != 0 {
            return Fault::Deliver;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.blackout.load(Ordering::SeqCst) {
            Fault::Drop
        } else {
            Fault::Deliver
        }
    }

    fn incoming(&mut self, _datagram: &[u8]) -> Fault {
        Fault::Deliver
    }
}

/// Drops the first `remaining` outgoing pure ACKs.
struct LoseAcks {
    remaining: usize,
}

impl Impairment for LoseAcks {
    fn outgoing(&mut self, packet: &Packet) -> Fault {
        if self.remaining > 0 && packet.header.flags == flags::ACK {
            self.remaining -= 1;
            Fault::Drop
        } else {
            Fault::Deliver
        }
    }

    fn incoming(&mut self, _datagram: &[u8]) -> Fault {
        Fault::Deliver
    }
}

/// Spawn a server that accepts once and collects every message until the
/// client closes the stream.
fn spawn_collector(mut server: Connection) -> tokio::task::JoinHandle<Result<(Connection, Vec<Vec<u8>>), ConnError>> {
    tokio::spawn(async move {
        server.accept().await?;
        let mut got = Vec::new();
        while let Some(msg) = server.receive_stop_and_wait().await? {
            got.push(msg);
        }
        Ok((server, got))
    })
}

async fn join_collector(
    task: tokio::task::JoinHandle<Result<(Connection, Vec<Vec<u8>>), ConnError>>,
) -> (Connection, Vec<Vec<u8>>) {
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("server timed out")
        .expect("server task panicked")
        .expect("server failed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Connect, send one greeting, close; the server sees the greeting and then
/// end-of-stream.
#[tokio::test]
async fn hello_server_round_trip() {
    let socket = ephemeral().await;
    let server_addr = socket.local_addr;
    let server = Connection::new(socket, None, fast()).unwrap();
    let task = spawn_collector(server);

    let mut client = Connection::new(ephemeral().await, Some(server_addr), fast()).unwrap();
    client.send_stop_and_wait(b"Hello, server!").await.expect("send");
    assert!(client.is_connected(), "send should have connected implicitly");
    client.disconnect().await.expect("disconnect");
    assert_eq!(client.state(), ConnectionState::Closed);

    let (server, got) = join_collector(task).await;
    assert_eq!(got, vec![b"Hello, server!".to_vec()]);
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn messages_arrive_in_order() {
    let socket = ephemeral().await;
    let server_addr = socket.local_addr;
    let task = spawn_collector(Connection::new(socket, None, fast()).unwrap());

    let mut client = Connection::new(ephemeral().await, Some(server_addr), fast()).unwrap();
    client.connect().await.expect("connect");
    let isn = client.seq_num();

    let messages: Vec<Vec<u8>> = (0..10).map(|i| format!("message #{i}").into_bytes()).collect();
    for m in &messages {
        client.send_stop_and_wait(m).await.expect("send");
    }
    assert_eq!(client.seq_num(), isn.wrapping_add(10));
    client.close().await.expect("close");

    let (_, got) = join_collector(task).await;
    assert_eq!(got, messages);
}

/// When the receiver's ACK is lost the sender retransmits; the receiver
/// re-acknowledges without delivering the payload a second time.
#[tokio::test]
async fn lost_ack_does_not_duplicate_delivery() {
    let socket = ephemeral().await.with_impairment(LoseAcks { remaining: 1 });
    let server_addr = socket.local_addr;
    let task = spawn_collector(Connection::new(socket, None, fast()).unwrap());

    let tap = DataTap::default();
    let socket = ephemeral().await.with_impairment(tap.clone());
    let mut client = Connection::new(socket, Some(server_addr), fast()).unwrap();

    client.send_stop_and_wait(b"first").await.expect("send first");
    client.send_stop_and_wait(b"second").await.expect("send second");
    client.close().await.expect("close");

    let (_, got) = join_collector(task).await;
    assert_eq!(got, vec![b"first".to_vec(), b"second".to_vec()]);
    assert!(
        tap.sent.load(Ordering::SeqCst) >= 3,
        "first message should have been retransmitted"
    );
}

/// With every data packet lost the sender makes exactly `max_retries`
/// attempts, waiting 1+2+4+8+8 base timeouts in total, then gives up
/// without breaking the connection.
#[tokio::test]
async fn total_loss_times_out_after_bounded_retries() {
    let base = Duration::from_millis(20);
    let config = TransportConfig::with_base_timeout(base);

    let socket = ephemeral().await;
    let server_addr = socket.local_addr;
    let mut server = Connection::new(socket, None, config.clone()).unwrap();
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        server.accept().await?;
        let _ = go_rx.await;
        let data = server.receive_stop_and_wait().await?;
        Ok::<_, ConnError>(data)
    });

    let tap = DataTap::default();
    let socket = ephemeral().await.with_impairment(tap.clone());
    let mut client = Connection::new(socket, Some(server_addr), config).unwrap();
    client.connect().await.expect("connect");
    let isn = client.seq_num();

    tap.blackout.store(true, Ordering::SeqCst);
    let started = Instant::now();
    let result = client.send_stop_and_wait(b"into the void").await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(ConnError::SendTimeout)), "got: {result:?}");
    assert_eq!(tap.sent.load(Ordering::SeqCst), 5);
    assert!(elapsed >= base * 23, "gave up too early: {elapsed:?}");
    assert!(elapsed < base * 23 + Duration::from_millis(500), "took too long: {elapsed:?}");
    assert_eq!(client.seq_num(), isn, "sequence number must not move on failure");
    assert!(client.is_connected());
    assert!(!client.sender.has_unacked());

    // The link heals; the same connection keeps working.
    tap.blackout.store(false, Ordering::SeqCst);
    go_tx.send(()).unwrap();
    client.send_stop_and_wait(b"second try").await.expect("send after recovery");

    let data = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server timed out")
        .unwrap()
        .expect("server failed");
    assert_eq!(data.as_deref(), Some(&b"second try"[..]));
}

#[tokio::test]
async fn oversized_payload_is_rejected_before_any_io() {
    // Nobody listens here; a connect attempt would time out instead.
    let nowhere: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let mut client = Connection::new(ephemeral().await, Some(nowhere), fast()).unwrap();

    let payload = vec![0u8; MAX_PAYLOAD + 1];
    let result = client.send_stop_and_wait(&payload).await;

    assert!(
        matches!(result, Err(ConnError::Packet(PacketError::PayloadTooLarge { len })) if len == MAX_PAYLOAD + 1),
        "got: {result:?}"
    );
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn receive_with_no_traffic_times_out() {
    let config = TransportConfig::with_base_timeout(Duration::from_millis(10));
    let mut conn = Connection::new(ephemeral().await, None, config).unwrap();
    let result = conn.receive_stop_and_wait().await;
    assert!(matches!(result, Err(ConnError::ReceiveTimeout)), "got: {result:?}");
}

/// Random loss and corruption on the client's link, in both directions,
/// must not lose, reorder or duplicate anything.
#[tokio::test]
async fn lossy_link_still_delivers_everything() {
    let config = TransportConfig {
        max_retries: 10,
        ..TransportConfig::with_base_timeout(Duration::from_millis(30))
    };

    let socket = ephemeral().await;
    let server_addr = socket.local_addr;
    let mut server = Connection::new(socket, None, config.clone()).unwrap();
    let stop = CancelToken::new();
    let server_task = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut got = Vec::new();
            loop {
                match server.accept_with_cancel(&stop).await {
                    Ok(_) => {}
                    Err(ConnError::Cancelled) => return Ok(got),
                    Err(e) => return Err(e),
                }
                loop {
                    match server.receive_stop_and_wait().await {
                        Ok(Some(msg)) => got.push(msg),
                        Ok(None) | Err(ConnError::ReceiveTimeout) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        })
    };

    let lossy = Simulator::with_rng(ImpairmentConfig::new(0.1, 0.05), StdRng::seed_from_u64(2024));
    let socket = ephemeral().await.with_impairment(lossy);
    let mut client = Connection::new(socket, Some(server_addr), config).unwrap();

    let messages: Vec<Vec<u8>> = (0..20).map(|i| format!("chunk {i:02}").into_bytes()).collect();
    for m in &messages {
        client.send_stop_and_wait(m).await.expect("send over lossy link");
    }
    client.close().await.expect("close");

    // Let the server finish acknowledging before it is told to stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.cancel();

    let got = tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .expect("server timed out")
        .unwrap()
        .expect("server failed");
    assert_eq!(got, messages);
}

/// Abandoning a send by dropping its future must not poison the next one.
#[tokio::test]
async fn send_after_dropped_send_succeeds() {
    let socket = ephemeral().await;
    let server_addr = socket.local_addr;
    let mut server = Connection::new(socket, None, fast()).unwrap();
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        server.accept().await?;
        let _ = go_rx.await;
        let data = server.receive_stop_and_wait().await?;
        Ok::<_, ConnError>(data)
    });

    let tap = DataTap::default();
    let socket = ephemeral().await.with_impairment(tap.clone());
    let mut client = Connection::new(socket, Some(server_addr), fast()).unwrap();
    client.connect().await.expect("connect");
    let isn = client.seq_num();

    tap.blackout.store(true, Ordering::SeqCst);
    let abandoned =
        tokio::time::timeout(Duration::from_millis(30), client.send_stop_and_wait(b"a")).await;
    assert!(abandoned.is_err(), "send should still have been waiting for its ACK");
    assert!(client.is_connected());

    tap.blackout.store(false, Ordering::SeqCst);
    go_tx.send(()).unwrap();
    client.send_stop_and_wait(b"b").await.expect("send after dropped send");
    assert_eq!(client.seq_num(), isn.wrapping_add(1));
    assert!(!client.sender.has_unacked());

    let data = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server timed out")
        .unwrap()
        .expect("server failed");
    assert_eq!(data.as_deref(), Some(&b"b"[..]));
}

/// Request/reply: the server's ACK for the request is lost and it starts
/// sending its reply.  The client's retransmitted request arrives while the
/// server waits for its own ACK and must be re-acknowledged there, or both
/// sides would stall.
#[tokio::test]
async fn duplicate_is_reacked_while_sending_reply() {
    let socket = ephemeral().await.with_impairment(LoseAcks { remaining: 1 });
    let server_addr = socket.local_addr;
    let mut server = Connection::new(socket, None, fast()).unwrap();
    let server_task = tokio::spawn(async move {
        server.accept().await?;
        let request = server.receive_stop_and_wait().await?;
        server.send_stop_and_wait(b"reply").await?;
        Ok::<_, ConnError>(request)
    });

    let tap = DataTap::default();
    let socket = ephemeral().await.with_impairment(tap.clone());
    let mut client = Connection::new(socket, Some(server_addr), fast()).unwrap();

    client.send_stop_and_wait(b"req").await.expect("send request");
    assert!(
        tap.sent.load(Ordering::SeqCst) >= 2,
        "request should have been retransmitted"
    );
    let reply = client.receive_stop_and_wait().await.expect("receive reply");
    assert_eq!(reply.as_deref(), Some(&b"reply"[..]));

    let request = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server timed out")
        .unwrap()
        .expect("server failed");
    assert_eq!(request.as_deref(), Some(&b"req"[..]));
}
