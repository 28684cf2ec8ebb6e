use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use stonenet::message::{Chat, Message, MessageRouter, NetStat};
use stonenet::network::{ByteAccumulator, Frame, FrameCodec};
use stonenet::{
    setup_local_tracing, AppError, AppResult, ConnectionServer, FrameHandler, ServerConfig,
    ServerHandle,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

/// Replies to every frame with the same frame; `MsgQuit` drops the sender.
#[derive(Default)]
struct Echo {
    seen: Arc<AtomicUsize>,
}

impl FrameHandler for Echo {
    async fn on_frame_decoded(
        &self,
        server: &ServerHandle,
        session_id: &str,
        frame: Frame,
    ) -> AppResult<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if frame.type_tag == "MsgQuit" {
            server.disconnect(session_id);
            return Ok(());
        }
        server.send_frame(session_id, &frame.type_tag, &frame.body)
    }
}

struct TestClient {
    stream: TcpStream,
    accumulator: ByteAccumulator,
    codec: FrameCodec,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        TestClient {
            stream: TcpStream::connect(addr).await.unwrap(),
            accumulator: ByteAccumulator::default(),
            codec: FrameCodec::default(),
        }
    }

    fn encode(type_tag: &str, body: &str) -> BytesMut {
        let mut buffer = BytesMut::new();
        FrameCodec::default()
            .encode_frame(type_tag, body, &mut buffer)
            .unwrap();
        buffer
    }

    async fn send(&mut self, type_tag: &str, body: &str) {
        let buffer = Self::encode(type_tag, body);
        self.stream.write_all(&buffer).await.unwrap();
    }

    async fn send_message<M: Message>(&mut self, message: &M) {
        let frame = message.to_frame().unwrap();
        self.send(&frame.type_tag, &frame.body).await;
    }

    /// Next frame from the server, `None` once the server closed the socket.
    async fn read_frame(&mut self) -> Option<Frame> {
        timeout(WAIT, async {
            loop {
                if let Some(frame) = self.codec.try_extract_frame(&mut self.accumulator).unwrap() {
                    return Some(frame);
                }
                let mut buf = [0u8; 1024];
                let n = self.stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    return None;
                }
                self.accumulator.write(&buf[..n]);
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    async fn expect_closed(&mut self) {
        assert_eq!(self.read_frame().await, None);
    }
}

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.network.ip = "127.0.0.1".to_string();
    config.network.port = 0;
    config.session.announce = false;
    config
}

async fn start_server<H: FrameHandler>(
    config: ServerConfig,
    handler: H,
) -> (ServerHandle, JoinHandle<AppResult<()>>, SocketAddr) {
    setup_local_tracing().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (server, join) = ConnectionServer::from_listener(listener, config, handler).start();
    (server, join, addr)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_echo_unicast() {
    let (server, _join, addr) = start_server(test_config(), Echo::default()).await;
    let mut client = TestClient::connect(addr).await;

    client.send("MsgChat", r#"{"message":"hello"}"#).await;
    assert_eq!(
        client.read_frame().await,
        Some(Frame::new("MsgChat", r#"{"message":"hello"}"#))
    );

    let session = server.sessions().snapshot().pop().unwrap();
    assert_eq!(session.stats().frames_received(), 1);
    wait_until(|| session.stats().frames_sent() == 1).await;
}

#[tokio::test]
async fn test_bad_magic_disconnects_without_dispatch() {
    let echo = Echo::default();
    let seen = echo.seen.clone();
    let (server, _join, addr) = start_server(test_config(), echo).await;
    let mut client = TestClient::connect(addr).await;
    wait_until(|| server.session_count() == 1).await;

    client
        .stream
        .write_all(b"JUNK\x00\x00\x00\x08\x00\x00\x00\x00\x00\x00\x00\x00")
        .await
        .unwrap();
    client.expect_closed().await;
    wait_until(|| server.session_count() == 0).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_oversized_frame_disconnects() {
    let mut config = test_config();
    config.buffer.max_frame_size = 64;
    let (server, _join, addr) = start_server(config, Echo::default()).await;
    let mut client = TestClient::connect(addr).await;

    client.send("MsgChat", &"x".repeat(100)).await;
    client.expect_closed().await;
    wait_until(|| server.session_count() == 0).await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let (server, _join, addr) = start_server(test_config(), Echo::default()).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TestClient::connect(addr).await);
    }
    wait_until(|| server.session_count() == 3).await;

    let queued = server
        .broadcast(&Chat {
            message: "to all".to_string(),
        })
        .unwrap();
    assert_eq!(queued, 3);
    for client in clients.iter_mut() {
        let frame = client.read_frame().await.unwrap();
        assert_eq!(Chat::decode_body(&frame.body).unwrap().message, "to all");
    }
}

#[tokio::test]
async fn test_byte_by_byte_delivery() {
    let echo = Echo::default();
    let seen = echo.seen.clone();
    let (_server, _join, addr) = start_server(test_config(), echo).await;
    let mut client = TestClient::connect(addr).await;

    let mut wire = TestClient::encode("MsgChat", r#"{"message":"one"}"#);
    wire.extend_from_slice(&TestClient::encode("MsgChat", r#"{"message":"two"}"#));
    for byte in wire.iter() {
        client.stream.write_all(&[*byte]).await.unwrap();
        client.stream.flush().await.unwrap();
    }

    assert_eq!(
        client.read_frame().await.unwrap().body,
        r#"{"message":"one"}"#
    );
    assert_eq!(
        client.read_frame().await.unwrap().body,
        r#"{"message":"two"}"#
    );
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_large_frame_grows_buffer() {
    let mut config = test_config();
    config.buffer.initial_buffer_size = 16;
    let (_server, _join, addr) = start_server(config, Echo::default()).await;
    let mut client = TestClient::connect(addr).await;

    let body = format!(r#"{{"message":"{}"}}"#, "y".repeat(10_000));
    client.send("MsgChat", &body).await;
    assert_eq!(client.read_frame().await.unwrap().body, body);
}

#[tokio::test]
async fn test_buffer_ceiling_is_protocol_error() {
    let mut config = test_config();
    config.buffer.initial_buffer_size = 16;
    config.buffer.max_frame_size = 0;
    config.buffer.max_buffer_size = 64;
    config.validate().unwrap();
    let (server, _join, addr) = start_server(config, Echo::default()).await;
    let mut client = TestClient::connect(addr).await;

    client.send("MsgChat", &"z".repeat(500)).await;
    client.expect_closed().await;
    wait_until(|| server.session_count() == 0).await;
}

#[tokio::test]
async fn test_largest_frame_fits_buffer_ceiling() {
    let mut config = test_config();
    config.buffer.initial_buffer_size = 16;
    config.buffer.max_buffer_size = 64;
    config.buffer.max_frame_size = 56;
    config.validate().unwrap();
    let (_server, _join, addr) = start_server(config, Echo::default()).await;
    let mut client = TestClient::connect(addr).await;

    // 4 + 7 + 4 + 41 = 56 payload bytes
    let body = "b".repeat(41);
    for _ in 0..3 {
        client.send("MsgChat", &body).await;
        assert_eq!(client.read_frame().await.unwrap().body, body);
    }
}

#[tokio::test]
async fn test_unicast_to_unknown_session() {
    let (server, _join, _addr) = start_server(test_config(), Echo::default()).await;
    let err = server.send_frame("no-such-session", "MsgChat", "{}").unwrap_err();
    assert!(matches!(err, AppError::UnknownSession(_)));
    assert!(!server.disconnect("no-such-session"));
}

#[tokio::test]
async fn test_handler_disconnects_its_session() {
    let (server, _join, addr) = start_server(test_config(), Echo::default()).await;
    let mut client = TestClient::connect(addr).await;
    let mut other = TestClient::connect(addr).await;
    wait_until(|| server.session_count() == 2).await;

    client.send("MsgQuit", "{}").await;
    client.expect_closed().await;
    wait_until(|| server.session_count() == 1).await;

    other.send("MsgChat", r#"{"message":"still here"}"#).await;
    assert!(other.read_frame().await.is_some());
}

#[tokio::test]
async fn test_partial_frame_then_close() {
    let (server, _join, addr) = start_server(test_config(), Echo::default()).await;
    let mut client = TestClient::connect(addr).await;
    wait_until(|| server.session_count() == 1).await;

    let wire = TestClient::encode("MsgChat", r#"{"message":"cut"}"#);
    client.stream.write_all(&wire[..5]).await.unwrap();
    client.stream.shutdown().await.unwrap();
    wait_until(|| server.session_count() == 0).await;
    wait_until(|| server.accumulator_pool().available() == server.accumulator_pool().created())
        .await;
}

#[tokio::test]
async fn test_unrouted_message_disconnects() {
    let router = MessageRouter::new().route(|server: ServerHandle, _id, chat: Chat| async move {
        server.broadcast(&chat)?;
        Ok(())
    });
    let (server, _join, addr) = start_server(test_config(), router).await;
    let mut client = TestClient::connect(addr).await;

    client
        .send_message(&Chat {
            message: "relayed".to_string(),
        })
        .await;
    assert_eq!(client.read_frame().await.unwrap().type_tag, "MsgChat");

    client.send("MsgTeleport", "{}").await;
    client.expect_closed().await;
    wait_until(|| server.session_count() == 0).await;
}

#[tokio::test]
async fn test_announce_handshake() {
    let echo = Echo::default();
    let seen = echo.seen.clone();
    let mut config = test_config();
    config.session.announce = true;
    let (server, _join, addr) = start_server(config, echo).await;
    let mut client = TestClient::connect(addr).await;

    let frame = client.read_frame().await.unwrap();
    assert_eq!(frame.type_tag, NetStat::TYPE_TAG);
    let announced = NetStat::decode_body(&frame.body).unwrap();
    let session = server.session(&announced.id).unwrap();
    assert_eq!(session.remote_address(), session.peer_addr().to_string());

    client
        .send_message(&NetStat {
            id: announced.id.clone(),
            ip_address: "10.0.0.9".to_string(),
        })
        .await;
    wait_until(|| session.remote_address() == "10.0.0.9").await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_announce_reply_cannot_relabel_another_session() {
    let mut config = test_config();
    config.session.announce = true;
    let (server, _join, addr) = start_server(config, Echo::default()).await;
    let mut first = TestClient::connect(addr).await;
    let mut second = TestClient::connect(addr).await;
    let first_id = NetStat::decode_body(&first.read_frame().await.unwrap().body)
        .unwrap()
        .id;
    second.read_frame().await.unwrap();

    second
        .send_message(&NetStat {
            id: first_id.clone(),
            ip_address: "10.6.6.6".to_string(),
        })
        .await;
    // the refused reply is not fatal, the sender keeps being served
    second.send("MsgChat", r#"{"message":"after"}"#).await;
    assert_eq!(
        second.read_frame().await.unwrap().body,
        r#"{"message":"after"}"#
    );
    let first_session = server.session(&first_id).unwrap();
    assert_eq!(
        first_session.remote_address(),
        first_session.peer_addr().to_string()
    );
}

#[tokio::test]
async fn test_announce_reply_reaches_routed_handler() {
    let replies = Arc::new(AtomicUsize::new(0));
    let counter = replies.clone();
    let router = MessageRouter::new().route(move |_server, _id, stat: NetStat| {
        let counter = counter.clone();
        async move {
            assert_eq!(stat.ip_address, "10.0.0.10");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let mut config = test_config();
    config.session.announce = true;
    let (server, _join, addr) = start_server(config, router).await;
    let mut client = TestClient::connect(addr).await;

    let announced = NetStat::decode_body(&client.read_frame().await.unwrap().body).unwrap();
    client
        .send_message(&NetStat {
            id: announced.id.clone(),
            ip_address: "10.0.0.10".to_string(),
        })
        .await;
    wait_until(|| replies.load(Ordering::SeqCst) == 1).await;
    assert_eq!(
        server.session(&announced.id).unwrap().remote_address(),
        "10.0.0.10"
    );
}

#[tokio::test]
async fn test_idle_sessions_are_evicted() {
    let mut config = test_config();
    config.session.idle_timeout_ms = 200;
    config.session.reap_interval_ms = 20;
    let (server, _join, addr) = start_server(config, Echo::default()).await;
    let mut client = TestClient::connect(addr).await;
    wait_until(|| server.session_count() == 1).await;

    client.expect_closed().await;
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = test_config();
    config.network.max_connection = 1;
    let (server, _join, addr) = start_server(config, Echo::default()).await;

    let first = TestClient::connect(addr).await;
    wait_until(|| server.session_count() == 1).await;
    let mut second = TestClient::connect(addr).await;
    second.send("MsgChat", r#"{"message":"waiting"}"#).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count(), 1);

    drop(first);
    // served once the first client's permit is released
    assert_eq!(
        second.read_frame().await.unwrap().body,
        r#"{"message":"waiting"}"#
    );
}

#[tokio::test]
async fn test_stop_closes_every_session() {
    let (server, join, addr) = start_server(test_config(), Echo::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    wait_until(|| server.session_count() == 2).await;

    server.stop();
    a.expect_closed().await;
    b.expect_closed().await;
    timeout(WAIT, join).await.unwrap().unwrap().unwrap();
    assert_eq!(server.session_count(), 0);
    assert!(server.is_stopped());
}

#[tokio::test]
async fn test_run_until_shutdown_signal() {
    setup_local_tracing().unwrap();
    let server = ConnectionServer::bind(test_config(), Echo::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let join = tokio::spawn(server.run(async move {
        let _ = rx.await;
    }));

    let mut client = TestClient::connect(addr).await;
    wait_until(|| handle.session_count() == 1).await;
    tx.send(()).unwrap();
    client.expect_closed().await;
    timeout(WAIT, join).await.unwrap().unwrap().unwrap();
}
