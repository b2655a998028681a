//! Shared utilities for integration testing.
//!
//! Mock backends are raw TCP servers bound to ephemeral ports so tests can
//! run in parallel.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_gateway::config::{GatewayConfig, RouteConfig};
use api_gateway::net::Listener;
use api_gateway::{GatewayServer, Shutdown};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// A running gateway bound to an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn route(prefix: &str, backend: SocketAddr, websocket: bool) -> RouteConfig {
    RouteConfig {
        prefix: prefix.into(),
        backend: format!("http://{backend}"),
        websocket,
    }
}

pub fn gateway_config(routes: Vec<RouteConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.routes = routes;
    config.listener.shutdown_drain_secs = 1;
    config
}

pub async fn spawn_gateway(config: GatewayConfig) -> TestGateway {
    let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::new(inner, config.listener.max_connections);
    let addr = listener.local_addr().unwrap();

    let server = GatewayServer::new(config).unwrap();
    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, receiver).await;
    });

    TestGateway { addr, shutdown }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Read one request (head plus content-length body) from `socket`.
async fn read_request(socket: &mut TcpStream) -> Option<(String, String, Vec<(String, String)>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(len)) = req.parse(&buf) {
            let method = req.method.unwrap_or_default().to_string();
            let path = req.path.unwrap_or_default().to_string();
            let headers: Vec<(String, String)> = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            let content_length = headers
                .iter()
                .find(|(name, _)| name == "content-length")
                .and_then(|(_, v)| v.parse::<usize>().ok())
                .unwrap_or(0);

            let mut body = buf[len..].to_vec();
            while body.len() < content_length {
                let n = socket.read(&mut chunk).await.ok()?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
            return Some((method, path, headers, body));
        }
    }
}

/// An HTTP backend that answers every request with a JSON description of
/// what it received.
pub struct EchoBackend {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl EchoBackend {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn start_echo_backend() -> EchoBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let Some((method, path, headers, body)) = read_request(&mut socket).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let header = |name: &str| {
                    headers
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| v.clone())
                };
                let payload = serde_json::json!({
                    "method": method,
                    "path": path,
                    "host": header("host"),
                    "x_forwarded_for": header("x-forwarded-for"),
                    "body": String::from_utf8_lossy(&body),
                })
                .to_string();

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    payload.len(),
                    payload
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    EchoBackend { addr, hits }
}

/// A backend that accepts and reads but answers only after `delay`.
pub async fn start_slow_backend(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_request(&mut socket).await;
                tokio::time::sleep(delay).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nslow")
                    .await;
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn dead_backend_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A WebSocket echo backend that records what it saw.
///
/// A `hangup` text frame makes it drop the socket without a close frame.
pub struct WsBackend {
    pub addr: SocketAddr,
    pub sessions: Arc<AtomicUsize>,
    /// `X-Forwarded-For` and `Host` of the last handshake.
    pub handshake: Arc<Mutex<Option<(Option<String>, Option<String>)>>>,
    /// Notified whenever a session's socket goes away.
    pub closed: Arc<Notify>,
}

pub async fn start_ws_backend() -> WsBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sessions = Arc::new(AtomicUsize::new(0));
    let handshake = Arc::new(Mutex::new(None));
    let closed = Arc::new(Notify::new());

    let (s, h, c) = (Arc::clone(&sessions), Arc::clone(&handshake), Arc::clone(&closed));
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let (sessions, handshake, closed) = (Arc::clone(&s), Arc::clone(&h), Arc::clone(&c));
            tokio::spawn(async move {
                let seen = Arc::clone(&handshake);
                let record = move |req: &Request, res: Response| -> Result<Response, ErrorResponse> {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned)
                    };
                    *seen.lock().unwrap() = Some((header("x-forwarded-for"), header("host")));
                    Ok(res)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, record).await else {
                    closed.notify_one();
                    return;
                };
                sessions.fetch_add(1, Ordering::SeqCst);

                while let Some(Ok(msg)) = ws.next().await {
                    if msg.to_text().is_ok_and(|text| text == "hangup") {
                        break;
                    }
                    if msg.is_text() || msg.is_binary() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    } else if msg.is_close() {
                        break;
                    }
                }
                closed.notify_one();
            });
        }
    });

    WsBackend {
        addr,
        sessions,
        handshake,
        closed,
    }
}

/// A WebSocket handshake for `path` as raw bytes.
pub fn handshake(path: &str, forwarded_for: Option<&str>) -> String {
    let mut head = format!(
        "GET {path} HTTP/1.1\r\nHost: gateway.test\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n"
    );
    if let Some(xff) = forwarded_for {
        head.push_str(&format!("X-Forwarded-For: {xff}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// Read from `stream` until the received bytes end with `suffix`.
pub async fn read_until(stream: &mut TcpStream, suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !out.ends_with(suffix) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early: {:?}", String::from_utf8_lossy(&out));
            out.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("response did not arrive");
    out
}

/// Write `request` and read until the gateway closes the connection.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("gateway did not close the connection")
        .ok();
    out
}
