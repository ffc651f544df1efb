use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::{
    rustls::{
        self,
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    },
    TlsAcceptor,
};
use wsdial::{
    handshake::accept_key,
    proxy::{EnvProxyResolver, Route},
    tls::TlsSettings,
    transport::{PrepareHook, Transport},
    ClientConfig, Connector, HeaderInput, MaybeTlsStream, WebSocketError,
};

fn init_logger() {
    let _ = simple_logger::init_with_level(log::Level::Debug);
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await?);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn upgrade_response(head: &str, subprotocol: Option<&str>) -> String {
    let key = header(head, "Sec-WebSocket-Key").expect("key");
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(key)
    );
    if let Some(protocol) = subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");
    response
}

/// Accepts one connection, answers the upgrade, sends `trailing` right behind the response and
/// returns the request head together with what the client did with the socket afterwards.
async fn spawn_server(
    subprotocol: Option<&'static str>,
    trailing: &'static [u8],
) -> (u16, JoinHandle<(String, io::Result<usize>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await.unwrap();

        let mut response = upgrade_response(&head, subprotocol).into_bytes();
        response.extend_from_slice(trailing);
        socket.write_all(&response).await.unwrap();

        let mut buf = [0u8; 64];
        let after = socket.read(&mut buf).await;
        (head, after)
    });

    (port, handle)
}

#[tokio::test]
async fn test_connect_without_subprotocol() {
    init_logger();
    let (port, server) = spawn_server(None, b"").await;

    let conn = Connector::default()
        .connect(&format!("ws://127.0.0.1:{port}/socket"))
        .await
        .unwrap();
    assert_eq!(conn.subprotocol(), None);
    assert!(conn.is_masked());
    assert!(!conn.get_ref().is_tls());
    conn.close().await.unwrap();

    let (head, _) = server.await.unwrap();
    assert!(head.starts_with("GET /socket HTTP/1.1\r\n"));
    assert_eq!(header(&head, "Sec-WebSocket-Version"), Some("13"));
    assert_eq!(header(&head, "Sec-WebSocket-Protocol"), None);
}

#[tokio::test]
async fn test_unrequested_subprotocol_accepted() {
    let (port, server) = spawn_server(Some("xml"), b"").await;

    let conn = Connector::default()
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap();
    assert_eq!(conn.subprotocol(), Some("xml"));
    drop(conn);
    server.await.unwrap();
}

#[tokio::test]
async fn test_requested_subprotocol_selected() {
    let (port, server) = spawn_server(Some("json"), b"").await;
    let config = ClientConfig::default()
        .with_subprotocols(["chat", "json"])
        .with_max_payload_size(1 << 20)
        .with_max_fragments(16);

    let conn = Connector::new(config)
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap();
    assert_eq!(conn.subprotocol(), Some("json"));
    assert_eq!(conn.max_payload_size(), Some(1 << 20));
    assert_eq!(conn.max_fragments(), Some(16));
    drop(conn);

    let (head, _) = server.await.unwrap();
    assert_eq!(header(&head, "Sec-WebSocket-Protocol"), Some("chat, json"));
}

#[tokio::test]
async fn test_subprotocol_mismatch_closes_socket() {
    let (port, server) = spawn_server(Some("xml"), b"").await;
    let config = ClientConfig::default().with_subprotocols(vec!["chat", "json"]);

    let err = Connector::new(config)
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, WebSocketError::SubprotocolMismatch { .. }));
    assert!(message.contains("chat, json"), "{message}");
    assert!(message.contains("xml"), "{message}");

    // the client shut the socket down
    let (_, after) = server.await.unwrap();
    assert!(matches!(after, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_unrequested_subprotocol_list_accepted_verbatim() {
    let (port, server) = spawn_server(Some("chat, json"), b"").await;

    let conn = Connector::default()
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap();
    assert_eq!(conn.subprotocol(), Some("chat, json"));
    drop(conn);
    server.await.unwrap();
}

#[tokio::test]
async fn test_subprotocol_list_is_a_mismatch() {
    let (port, server) = spawn_server(Some("chat, json"), b"").await;
    let config = ClientConfig::default().with_subprotocols(["chat", "json"]);

    let err = Connector::new(config)
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap_err();
    assert!(
        matches!(
            &err,
            WebSocketError::SubprotocolMismatch { requested, received }
                if requested == "chat, json" && received == "chat, json"
        ),
        "{err}"
    );

    let (_, after) = server.await.unwrap();
    assert!(matches!(after, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_subprotocol_missing() {
    let (port, server) = spawn_server(None, b"").await;
    let config = ClientConfig::default().with_subprotocols("chat");

    let err = Connector::new(config)
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, WebSocketError::SubprotocolMissing { requested } if requested == "chat")
    );

    let (_, after) = server.await.unwrap();
    assert!(matches!(after, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_leftover_bytes_served_first() {
    // unmasked text frame "hi"
    let (port, server) = spawn_server(None, &[0x81, 0x02, b'h', b'i']).await;

    let mut conn = Connector::default()
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap();
    let mut frame = [0u8; 4];
    conn.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, [0x81, 0x02, b'h', b'i']);

    // masked close frame, no payload
    conn.write_all(&[0x88, 0x80, 1, 2, 3, 4]).await.unwrap();
    let (_, after) = server.await.unwrap();
    assert_eq!(after.unwrap(), 6);
}

#[tokio::test]
async fn test_early_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_head(&mut socket).await;
    });

    let err = Connector::default()
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            WebSocketError::HandshakeFailed(_) | WebSocketError::ConnectFailed(_)
        ),
        "{err}"
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_rejected_upgrade() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 8];
        socket.read(&mut buf).await
    });

    let err = Connector::default()
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap_err();
    assert!(matches!(&err, WebSocketError::HandshakeFailed(detail) if detail.contains("403")));
    assert!(err.is_handshake_level());
    assert!(matches!(server.await.unwrap(), Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_handshake_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await.unwrap();
        // never answer, wait for the client to give up
        let mut buf = [0u8; 8];
        socket.read(&mut buf).await
    });

    let config = ClientConfig::default().with_handshake_timeout(Duration::from_millis(100));
    let err = Connector::new(config)
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::HandshakeFailed(_)), "{err}");
    assert!(matches!(server.await.unwrap(), Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = Connector::default()
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::ConnectFailed(_)), "{err}");
}

#[tokio::test]
async fn test_request_headers_and_overrides() {
    let (port, server) = spawn_server(None, b"").await;
    let config = ClientConfig::default()
        .with_headers([
            ("X-Token", HeaderInput::from("secret")),
            ("X-Accept", HeaderInput::from(vec!["a", "b"])),
        ])
        .unwrap()
        .with_protocol_version("8");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let conn = Connector::new(config)
        .connect("ws://chat.example.invalid:8080/room?id=7")
        .host("127.0.0.1")
        .port(port)
        .prepare(move |_: &TcpSocket| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    drop(conn);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (head, _) = server.await.unwrap();
    assert!(head.starts_with("GET /room?id=7 HTTP/1.1\r\n"), "{head}");
    assert_eq!(header(&head, "Host"), Some("chat.example.invalid:8080"));
    assert_eq!(header(&head, "Sec-WebSocket-Version"), Some("8"));

    let extra: Vec<&str> = head
        .lines()
        .filter(|line| line.starts_with("x-"))
        .collect();
    assert_eq!(extra, ["x-accept: a", "x-accept: b", "x-token: secret"]);
}

#[tokio::test]
async fn test_connect_through_proxy() {
    let (port, server) = spawn_server(None, b"").await;

    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let proxy_task = tokio::spawn(async move {
        let (mut client, _) = proxy.accept().await.unwrap();
        let head = read_head(&mut client).await.unwrap();
        let target = head
            .split_whitespace()
            .nth(1)
            .expect("authority")
            .to_owned();

        let mut upstream = TcpStream::connect(target.as_str()).await.unwrap();
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        head
    });

    let resolver = EnvProxyResolver::from_lookup(move |name| {
        (name == "http_proxy").then(|| format!("http://{proxy_addr}"))
    });
    let conn = Connector::new(ClientConfig::default().with_env_proxy())
        .with_resolver(resolver)
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap();
    assert_eq!(conn.subprotocol(), None);
    conn.close().await.unwrap();

    server.await.unwrap();
    let connect_head = proxy_task.await.unwrap();
    assert!(connect_head.starts_with(&format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n")));
}

#[tokio::test]
async fn test_proxy_ignored_without_env_proxy() {
    let (port, server) = spawn_server(None, b"").await;
    let resolver =
        EnvProxyResolver::from_lookup(|_| Some("http://127.0.0.1:1".to_owned()));

    let conn = Connector::default()
        .with_resolver(resolver)
        .connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .unwrap();
    drop(conn);
    server.await.unwrap();
}

#[tokio::test]
async fn test_invalid_proxy_variable() {
    let resolver = EnvProxyResolver::from_lookup(|name| {
        (name == "ws_proxy").then(|| "socks5://127.0.0.1:1080".to_owned())
    });
    let err = Connector::new(ClientConfig::default().with_env_proxy())
        .with_resolver(resolver)
        .connect("ws://127.0.0.1:9/")
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::InvalidProxy(_)), "{err}");
}

/// Counts connect calls and never produces a socket.
#[derive(Clone, Default)]
struct StalledTransport {
    calls: Arc<AtomicUsize>,
}

impl Transport for StalledTransport {
    fn connect<'a>(
        &'a self,
        _host: &'a str,
        _port: u16,
        _route: &'a Route,
        _prepare: Option<&'a PrepareHook>,
        _tls: Option<&'a TlsSettings>,
    ) -> BoxFuture<'a, io::Result<MaybeTlsStream>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(futures::future::pending())
    }
}

#[tokio::test]
async fn test_invalid_scheme_skips_transport() {
    let transport = StalledTransport::default();
    let connector = Connector::default().with_transport(transport.clone());

    for uri in ["http://127.0.0.1/", "ftp://127.0.0.1/"] {
        let err = connector.connect(uri).await.unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidScheme(_)), "{err}");
    }
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_timeout() {
    let transport = StalledTransport::default();
    let config = ClientConfig::default().with_timeout(Duration::from_millis(50));

    let err = Connector::new(config)
        .with_transport(transport.clone())
        .connect("ws://127.0.0.1:9/")
        .await
        .unwrap_err();
    assert!(matches!(&err, WebSocketError::ConnectFailed(msg) if msg.contains("timed out")));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_connects() {
    let (port_a, server_a) = spawn_server(Some("chat"), b"").await;
    let (port_b, server_b) = spawn_server(Some("json"), b"").await;
    let connector = Connector::new(ClientConfig::default().with_subprotocols(["chat", "json"]));

    let (a, b) = tokio::join!(
        connector.connect(&format!("ws://127.0.0.1:{port_a}/")),
        connector.connect(&format!("ws://127.0.0.1:{port_b}/")),
    );
    assert_eq!(a.unwrap().subprotocol(), Some("chat"));
    assert_eq!(b.unwrap().subprotocol(), Some("json"));
    server_a.await.unwrap();
    server_b.await.unwrap();
}

struct TlsServer {
    port: u16,
    cert_pem: String,
    handle: JoinHandle<()>,
}

/// Serves one `wss` upgrade with a self-signed certificate for `localhost`.
async fn spawn_tls_server() -> TlsServer {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![cert.der().clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    )
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        // a client rejecting the certificate aborts the TLS handshake
        let Ok(mut stream) = acceptor.accept(socket).await else {
            return;
        };
        let head = read_head(&mut stream).await.unwrap();
        stream
            .write_all(upgrade_response(&head, None).as_bytes())
            .await
            .unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 8];
        let _ = stream.read(&mut buf).await;
    });

    TlsServer {
        port,
        cert_pem: cert.pem(),
        handle,
    }
}

#[tokio::test]
async fn test_wss_without_verification() {
    let server = spawn_tls_server().await;

    let conn = Connector::new(ClientConfig::default().without_tls_verify())
        .connect(&format!("wss://localhost:{}/", server.port))
        .host("127.0.0.1")
        .await
        .unwrap();
    assert!(conn.get_ref().is_tls());
    conn.close().await.unwrap();
    server.handle.await.unwrap();
}

#[tokio::test]
async fn test_wss_with_ca_file() {
    let server = spawn_tls_server().await;
    let dir = tempfile::tempdir().unwrap();
    let ca_file = dir.path().join("ca.pem");
    tokio::fs::write(&ca_file, &server.cert_pem).await.unwrap();

    let conn = Connector::new(ClientConfig::default().with_ca_file(&ca_file))
        .connect(&format!("wss://localhost:{}/", server.port))
        .host("127.0.0.1")
        .await
        .unwrap();
    assert!(conn.get_ref().is_tls());
    conn.close().await.unwrap();
    server.handle.await.unwrap();
}

#[tokio::test]
async fn test_wss_untrusted_certificate() {
    let server = spawn_tls_server().await;

    let err = Connector::default()
        .connect(&format!("wss://localhost:{}/", server.port))
        .host("127.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::ConnectFailed(_)), "{err}");
    server.handle.await.unwrap();
}
