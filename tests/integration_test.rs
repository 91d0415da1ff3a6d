//! Integration tests for Conduit
//!
//! Runs real servers and clients over loopback:
//! - End-to-end relaying between outsiders and a local service
//! - Shared-secret authentication
//! - Port exclusivity and teardown
//! - Subdomain routing through a gateway
//! - Raw protocol behaviour seen by a hand-driven peer
//! - Handshake deadline, keepalives and idle timeouts

use async_trait::async_trait;
use bytes::Bytes;
use conduit::client::{ClientError, ClientPhase, ClientStatus};
use conduit::config::{ClientConfig, ServerConfig};
use conduit::crypto::{Cipher, HandshakeRole, KeyExchange};
use conduit::gateway::{GatewayError, RouteGateway};
use conduit::protocol::{MessageType, RequestStatus};
use conduit::server::Registry;
use conduit::transport::{open_frame, seal_frame};
use conduit::tunnel::{Frame, FrameParser};
use conduit::{Client, Server};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn server_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        control_port: 0,
        tunnel_bind_address: "127.0.0.1".to_string(),
        ..ServerConfig::default()
    }
}

async fn start_server(
    config: ServerConfig,
    gateway: Option<Arc<dyn RouteGateway>>,
) -> (SocketAddr, Arc<Registry>) {
    let server = Server::bind(config, gateway).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(server.serve());
    (addr, registry)
}

fn client_config(server: SocketAddr, local_port: u16) -> ClientConfig {
    ClientConfig {
        server: "127.0.0.1".to_string(),
        control_port: server.port(),
        local_host: "127.0.0.1".to_string(),
        local_port,
        ..ClientConfig::default()
    }
}

/// Local service that echoes every connection back to itself
async fn start_echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

fn spawn_client(config: ClientConfig) -> (watch::Receiver<ClientStatus>, JoinHandle<Result<(), ClientError>>) {
    let client = Client::new(config).unwrap();
    let status = client.status();
    (status, tokio::spawn(client.run()))
}

async fn wait_active(status: &mut watch::Receiver<ClientStatus>) -> ClientStatus {
    tokio::time::timeout(WAIT, async {
        loop {
            {
                let current = status.borrow_and_update();
                if current.phase == ClientPhase::Active {
                    return current.clone();
                }
            }
            status.changed().await.expect("client stopped before becoming active");
        }
    })
    .await
    .expect("client never became active")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_end_to_end_echo() {
    let (server, registry) = start_server(server_config(), None).await;
    let local_port = start_echo_service().await;

    let (mut status, client) = spawn_client(client_config(server, local_port));
    let port = wait_active(&mut status).await.assigned_port.unwrap();
    assert!(registry.is_port_leased(port));

    let mut outsider = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    outsider.write_all(b"hello through the tunnel").await.unwrap();

    let mut reply = vec![0u8; b"hello through the tunnel".len()];
    tokio::time::timeout(WAIT, outsider.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"hello through the tunnel");

    client.abort();
}

#[tokio::test]
async fn test_connections_keep_their_own_order() {
    let (server, _registry) = start_server(server_config(), None).await;
    let local_port = start_echo_service().await;

    let (mut status, client) = spawn_client(client_config(server, local_port));
    let port = wait_active(&mut status).await.assigned_port.unwrap();

    let mut outsiders = Vec::new();
    for tag in [b'a', b'b', b'c'] {
        outsiders.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let expected: Vec<u8> = (0..200u32)
                .flat_map(|i| format!("{}{:03};", tag as char, i).into_bytes())
                .collect();

            let (mut reader, mut writer) = stream.split();
            let send = async {
                for chunk in expected.chunks(5) {
                    writer.write_all(chunk).await.unwrap();
                }
            };
            let mut received = vec![0u8; expected.len()];
            let recv = reader.read_exact(&mut received);
            let (_, read) = tokio::join!(send, recv);
            read.unwrap();
            assert_eq!(received, expected);
        }));
    }

    for outsider in outsiders {
        tokio::time::timeout(WAIT, outsider).await.unwrap().unwrap();
    }
    client.abort();
}

#[tokio::test]
async fn test_secret_authentication() {
    let config = ServerConfig {
        secret: Some("s3cret".to_string()),
        ..server_config()
    };
    let (server, _registry) = start_server(config, None).await;
    let local_port = start_echo_service().await;

    let good = ClientConfig {
        secret: Some("s3cret".to_string()),
        ..client_config(server, local_port)
    };
    let (mut status, client) = spawn_client(good);
    wait_active(&mut status).await;
    client.abort();

    let wrong = ClientConfig {
        secret: Some("guess".to_string()),
        ..client_config(server, local_port)
    };
    let result = Client::new(wrong).unwrap().run().await;
    assert!(matches!(result, Err(ClientError::AuthenticationRejected)));

    let missing = client_config(server, local_port);
    let result = Client::new(missing).unwrap().run().await;
    assert!(matches!(result, Err(ClientError::AuthenticationRejected)));
}

#[tokio::test]
async fn test_secret_sent_to_open_server() {
    let (server, _registry) = start_server(server_config(), None).await;
    let local_port = start_echo_service().await;

    let config = ClientConfig {
        secret: Some("unused".to_string()),
        ..client_config(server, local_port)
    };
    let (mut status, client) = spawn_client(config);
    wait_active(&mut status).await;
    client.abort();
}

#[tokio::test]
async fn test_specific_port_is_exclusive() {
    let (server, registry) = start_server(server_config(), None).await;
    let local_port = start_echo_service().await;

    let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let wanted = vacant.local_addr().unwrap().port();
    drop(vacant);

    let mut clients = Vec::new();
    for _ in 0..5 {
        let config = ClientConfig {
            remote_port: Some(wanted),
            ..client_config(server, local_port)
        };
        clients.push(spawn_client(config).1);
    }

    let mut rejected = 0;
    let mut running = Vec::new();
    for mut client in clients {
        match tokio::time::timeout(Duration::from_secs(2), &mut client).await {
            Ok(result) => {
                assert!(matches!(
                    result.unwrap(),
                    Err(ClientError::PortUnavailable(Some(port))) if port == wanted
                ));
                rejected += 1;
            }
            Err(_) => running.push(client),
        }
    }

    assert_eq!(running.len(), 1);
    assert_eq!(rejected, 4);
    assert!(registry.is_port_leased(wanted));
    assert_eq!(registry.port_count(), 1);

    for client in running {
        client.abort();
    }
}

#[tokio::test]
async fn test_client_disconnect_releases_everything() {
    let (server, registry) = start_server(server_config(), None).await;
    let local_port = start_echo_service().await;

    let (mut status, client) = spawn_client(client_config(server, local_port));
    let port = wait_active(&mut status).await.assigned_port.unwrap();

    let mut outsider = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    outsider.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    outsider.read_exact(&mut reply).await.unwrap();

    client.abort();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, outsider.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    eventually(|| !registry.is_port_leased(port)).await;
    TcpListener::bind(("127.0.0.1", port)).await.unwrap();
}

#[derive(Default)]
struct RecordingGateway {
    calls: Mutex<Vec<String>>,
}

impl RecordingGateway {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteGateway for RecordingGateway {
    async fn bootstrap(&self, hostname: &str) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push(format!("bootstrap {}", hostname));
        Ok(())
    }

    async fn add_route(&self, hostname: &str, subdomain: &str, port: u16) -> Result<(), GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("add {}.{} {}", subdomain, hostname, port));
        Ok(())
    }

    async fn remove_route(&self, hostname: &str, subdomain: &str) -> Result<(), GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("remove {}.{}", subdomain, hostname));
        Ok(())
    }
}

#[tokio::test]
async fn test_subdomain_routing() {
    let gateway = Arc::new(RecordingGateway::default());
    let config = ServerConfig {
        hostname: Some("conduit.test".to_string()),
        ..server_config()
    };
    let (server, registry) = start_server(config, Some(gateway.clone())).await;
    let local_port = start_echo_service().await;

    let config = ClientConfig {
        subdomain: Some("app".to_string()),
        ..client_config(server, local_port)
    };
    let (mut status, first) = spawn_client(config.clone());
    let active = wait_active(&mut status).await;
    assert_eq!(active.subdomain.as_deref(), Some("app"));
    let port = active.assigned_port.unwrap();
    assert!(registry.is_subdomain_leased("app"));
    assert_eq!(
        gateway.calls(),
        vec![
            "bootstrap conduit.test".to_string(),
            format!("add app.conduit.test {}", port),
        ]
    );

    let result = Client::new(config).unwrap().run().await;
    assert!(matches!(result, Err(ClientError::SubdomainUnavailable(name)) if name == "app"));

    first.abort();
    eventually(|| !registry.is_subdomain_leased("app")).await;
    assert!(gateway.calls().contains(&"remove app.conduit.test".to_string()));
}

#[tokio::test]
async fn test_subdomain_without_hostname_is_unsupported() {
    let (server, registry) = start_server(server_config(), None).await;
    let local_port = start_echo_service().await;

    let config = ClientConfig {
        subdomain: Some("app".to_string()),
        ..client_config(server, local_port)
    };
    let result = Client::new(config).unwrap().run().await;
    assert!(matches!(result, Err(ClientError::SubdomainUnsupported)));

    eventually(|| registry.port_count() == 0).await;
}

/// Hand-driven client speaking the wire protocol directly
struct RawPeer {
    stream: TcpStream,
    parser: FrameParser,
    sealer: Option<Cipher>,
    opener: Option<Cipher>,
    buf: Vec<u8>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        Self::from_stream(TcpStream::connect(addr).await.unwrap())
    }

    fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            parser: FrameParser::new(),
            sealer: None,
            opener: None,
            buf: vec![0u8; 64 * 1024],
        }
    }

    async fn handshake(&mut self) {
        let server_key = self.recv().await.expect("server closed during handshake");
        assert_eq!(server_key.message_type, MessageType::CryptoExchange);

        let exchange = KeyExchange::new(HandshakeRole::Initiator).unwrap();
        let key = Bytes::copy_from_slice(exchange.public_key().as_bytes());
        self.send(Frame::control(MessageType::CryptoExchange, key)).await;

        let ciphers = exchange.complete(&server_key.payload).unwrap();
        self.sealer = Some(ciphers.sealer);
        self.opener = Some(ciphers.opener);
    }

    /// Key exchange from the server's side, for standing in as a server
    async fn accept_handshake(&mut self) {
        let exchange = KeyExchange::new(HandshakeRole::Responder).unwrap();
        let key = Bytes::copy_from_slice(exchange.public_key().as_bytes());
        self.send(Frame::control(MessageType::CryptoExchange, key)).await;

        let client_key = self.recv().await.expect("client closed during handshake");
        assert_eq!(client_key.message_type, MessageType::CryptoExchange);

        let ciphers = exchange.complete(&client_key.payload).unwrap();
        self.sealer = Some(ciphers.sealer);
        self.opener = Some(ciphers.opener);
    }

    async fn send(&mut self, frame: Frame) {
        let wire = seal_frame(self.sealer.as_mut(), frame).unwrap();
        self.stream.write_all(&wire).await.unwrap();
    }

    /// Next non-keepalive frame, or `None` once the other side hangs up
    async fn recv(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv_any().await?;
            if frame.message_type != MessageType::Keepalive {
                return Some(frame);
            }
        }
    }

    /// Next frame of any type, keepalives included
    async fn recv_any(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.parser.try_parse_one().unwrap() {
                return Some(open_frame(self.opener.as_mut(), frame).unwrap());
            }
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut self.buf))
                .await
                .expect("timed out waiting for a frame")
                .ok()?;
            if n == 0 {
                return None;
            }
            self.parser.add_data(&self.buf[..n]);
        }
    }

    async fn request_any_port(&mut self) -> u16 {
        self.send(Frame::control(MessageType::PortRequest, Bytes::new())).await;
        let reply = self.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::PortAssigned);
        u16::from_be_bytes([reply.payload[0], reply.payload[1]])
    }
}

#[tokio::test]
async fn test_frame_before_key_exchange_is_refused() {
    let config = ServerConfig {
        secret: Some("s3cret".to_string()),
        ..server_config()
    };
    let (server, registry) = start_server(config, None).await;

    let mut peer = RawPeer::connect(server).await;
    let server_key = peer.recv().await.unwrap();
    assert_eq!(server_key.message_type, MessageType::CryptoExchange);

    peer.send(Frame::control(MessageType::PortRequest, Bytes::new())).await;
    assert!(peer.recv().await.is_none());
    assert_eq!(registry.port_count(), 0);
}

#[tokio::test]
async fn test_port_request_before_secret_is_rejected() {
    let config = ServerConfig {
        secret: Some("s3cret".to_string()),
        ..server_config()
    };
    let (server, registry) = start_server(config, None).await;

    let mut peer = RawPeer::connect(server).await;
    peer.handshake().await;
    peer.send(Frame::control(MessageType::PortRequest, Bytes::new())).await;

    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.message_type, MessageType::SecretExchange);
    assert!(peer.recv().await.is_none());
    assert_eq!(registry.port_count(), 0);
}

#[tokio::test]
async fn test_raw_peer_multiplexing() {
    let (server, _registry) = start_server(server_config(), None).await;

    let mut peer = RawPeer::connect(server).await;
    peer.handshake().await;
    let port = peer.request_any_port().await;

    let mut outsider = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let opened = peer.recv().await.unwrap();
    assert_eq!(opened.message_type, MessageType::NewConnection);
    let id = opened.connection_id;
    assert_ne!(id, 0);

    outsider.write_all(b"request").await.unwrap();
    let data = peer.recv().await.unwrap();
    assert_eq!(data.message_type, MessageType::Data);
    assert_eq!(data.connection_id, id);
    assert_eq!(data.payload, Bytes::from_static(b"request"));

    peer.send(Frame::data(id, Bytes::from_static(b"response"))).await;
    let mut reply = [0u8; 8];
    outsider.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"response");

    peer.send(Frame::connection_closed(id)).await;
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(WAIT, outsider.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // Closed by us, so the server must not echo a CONNECTION_CLOSED back
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let next = peer.recv().await.unwrap();
    assert_eq!(next.message_type, MessageType::NewConnection);
    assert_ne!(next.connection_id, id);

    second.shutdown().await.unwrap();
    drop(second);
    let closed = peer.recv().await.unwrap();
    assert_eq!(closed.message_type, MessageType::ConnectionClosed);
    assert_eq!(closed.connection_id, next.connection_id);
}

#[tokio::test]
async fn test_raw_peer_subdomain_before_port_is_ignored() {
    let gateway = Arc::new(RecordingGateway::default());
    let config = ServerConfig {
        hostname: Some("conduit.test".to_string()),
        ..server_config()
    };
    let (server, registry) = start_server(config, Some(gateway)).await;

    let mut peer = RawPeer::connect(server).await;
    peer.handshake().await;
    peer.send(Frame::control(MessageType::SubdomainRequest, Bytes::from_static(b"early")))
        .await;
    let port = peer.request_any_port().await;
    assert!(!registry.is_subdomain_leased("early"));

    peer.send(Frame::control(MessageType::SubdomainRequest, Bytes::from_static(b"late")))
        .await;
    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.message_type, MessageType::SubdomainResponse);
    assert_eq!(reply.payload[..], [RequestStatus::Success as u8]);
    assert!(registry.is_subdomain_leased("late"));
    assert!(registry.is_port_leased(port));
}

#[tokio::test]
async fn test_silent_peer_hits_handshake_timeout() {
    let config = ServerConfig {
        handshake_timeout: 1,
        ..server_config()
    };
    let (server, registry) = start_server(config, None).await;

    let mut peer = RawPeer::connect(server).await;
    let server_key = peer.recv().await.unwrap();
    assert_eq!(server_key.message_type, MessageType::CryptoExchange);

    let started = tokio::time::Instant::now();
    assert!(peer.recv_any().await.is_none());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(registry.port_count(), 0);
}

#[tokio::test]
async fn test_keepalives_start_once_active() {
    let config = ServerConfig {
        keepalive_interval: 1,
        idle_timeout: 5,
        ..server_config()
    };
    let (server, _registry) = start_server(config, None).await;

    let mut peer = RawPeer::connect(server).await;
    peer.handshake().await;

    // Past one keepalive period while still negotiating
    tokio::time::sleep(Duration::from_millis(1500)).await;
    peer.send(Frame::control(MessageType::PortRequest, Bytes::new())).await;

    let first = peer.recv_any().await.unwrap();
    assert_eq!(first.message_type, MessageType::PortAssigned);

    let keepalive = peer.recv_any().await.unwrap();
    assert_eq!(keepalive.message_type, MessageType::Keepalive);
    assert_eq!(keepalive.connection_id, 0);
    assert!(keepalive.payload.is_empty());
}

#[tokio::test]
async fn test_server_drops_idle_session() {
    let config = ServerConfig {
        keepalive_interval: 1,
        idle_timeout: 2,
        ..server_config()
    };
    let (server, registry) = start_server(config, None).await;

    let mut peer = RawPeer::connect(server).await;
    peer.handshake().await;
    let port = peer.request_any_port().await;
    assert!(registry.is_port_leased(port));

    let mut keepalives = 0;
    while let Some(frame) = peer.recv_any().await {
        assert_eq!(frame.message_type, MessageType::Keepalive);
        keepalives += 1;
    }
    assert!(keepalives >= 1);
    eventually(|| !registry.is_port_leased(port)).await;
}

#[tokio::test]
async fn test_client_gives_up_on_silent_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = listener.local_addr().unwrap();
    let fake_server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = RawPeer::from_stream(stream);
        peer.accept_handshake().await;

        let request = peer.recv().await.unwrap();
        assert_eq!(request.message_type, MessageType::PortRequest);
        peer.send(Frame::control(
            MessageType::PortAssigned,
            Bytes::copy_from_slice(&40000u16.to_be_bytes()),
        ))
        .await;

        // Listen without ever answering
        let mut keepalives = 0;
        while let Some(frame) = peer.recv_any().await {
            if frame.message_type == MessageType::Keepalive {
                keepalives += 1;
            }
        }
        keepalives
    });

    let config = ClientConfig {
        keepalive_interval: 1,
        idle_timeout: 2,
        ..client_config(server, 1)
    };
    let (mut status, client) = spawn_client(config);
    assert_eq!(wait_active(&mut status).await.assigned_port, Some(40000));

    let result = tokio::time::timeout(WAIT, client).await.unwrap().unwrap();
    assert!(matches!(result, Err(ClientError::IdleTimeout)));

    let keepalives = tokio::time::timeout(WAIT, fake_server).await.unwrap().unwrap();
    assert!(keepalives >= 1);
}
