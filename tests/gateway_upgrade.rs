//! End-to-end tests for listener-level upgrade dispatch.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn websocket_is_relayed_both_ways() {
    let chat = common::start_ws_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/chat",
        chat.addr,
        true,
    )]))
    .await;

    let (mut ws, response) =
        tokio_tungstenite::connect_async(format!("ws://{}/api/v1/chat/room-1", gateway.addr))
            .await
            .unwrap();
    assert_eq!(response.status(), 101);

    for text in ["hello", "second frame"] {
        ws.send(Message::text(text)).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed.into_text().unwrap().as_str(), text);
    }
    ws.close(None).await.unwrap();

    assert_eq!(chat.sessions.load(Ordering::SeqCst), 1);
    let (forwarded, host) = chat.handshake.lock().unwrap().clone().unwrap();
    assert_eq!(forwarded.as_deref(), Some("127.0.0.1"));
    assert_eq!(host, Some(chat.addr.to_string()));
}

#[tokio::test]
async fn upgrade_chain_is_appended() {
    let chat = common::start_ws_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/chat",
        chat.addr,
        true,
    )]))
    .await;

    let request = common::handshake("/api/v1/chat", Some("1.2.3.4"));
    let mut stream = tokio::net::TcpStream::connect(gateway.addr).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let n = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::io::AsyncReadExt::read(&mut stream, &mut buf),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 101"));

    let (forwarded, _) = chat.handshake.lock().unwrap().clone().unwrap();
    assert_eq!(forwarded.as_deref(), Some("1.2.3.4, 127.0.0.1"));
}

#[tokio::test]
async fn upgrade_on_http_only_route_never_reaches_backend() {
    let users = common::start_echo_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/user",
        users.addr,
        false,
    )]))
    .await;

    let result =
        tokio_tungstenite::connect_async(format!("ws://{}/api/v1/user", gateway.addr)).await;
    assert!(result.is_err());

    let raw = common::raw_exchange(
        gateway.addr,
        common::handshake("/api/v1/user", None).as_bytes(),
    )
    .await;
    assert!(raw.is_empty(), "expected a silent close, got {raw:?}");
    assert_eq!(users.hits(), 0);
}

#[tokio::test]
async fn unmatched_upgrade_is_closed_silently() {
    let chat = common::start_ws_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/chat",
        chat.addr,
        true,
    )]))
    .await;

    let raw =
        common::raw_exchange(gateway.addr, common::handshake("/api/v1/unknown", None).as_bytes())
            .await;
    assert!(raw.is_empty());
    assert_eq!(chat.sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rate_limited_upgrade_gets_raw_429() {
    let chat = common::start_ws_backend().await;
    let mut config = common::gateway_config(vec![common::route("/api/v1/chat", chat.addr, true)]);
    config.rate_limit.max_requests = 1;
    let gateway = common::spawn_gateway(config).await;

    // the plain request and the upgrade draw from the same budget
    let res = common::client()
        .get(gateway.url("/api/v1/chat/history"))
        .send()
        .await
        .unwrap();
    assert_ne!(res.status(), 429);

    let raw =
        common::raw_exchange(gateway.addr, common::handshake("/api/v1/chat", None).as_bytes())
            .await;
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.starts_with("HTTP/1.1 429 Too Many Requests\r\n"), "{raw}");
    assert!(raw.to_ascii_lowercase().contains("retry-after: "));
    assert!(raw.ends_with("Too many requests from this IP, please try again later."));
    assert_eq!(chat.sessions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upgrade_to_dead_backend_is_bad_gateway() {
    let dead = common::dead_backend_addr().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/notification",
        dead,
        true,
    )]))
    .await;

    let raw = common::raw_exchange(
        gateway.addr,
        common::handshake("/api/v1/notification", None).as_bytes(),
    )
    .await;
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
}

#[tokio::test]
async fn kept_alive_connection_can_upgrade_later() {
    let chat = common::start_ws_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/chat",
        chat.addr,
        true,
    )]))
    .await;

    // an ordinary request first, answered locally, on the same socket
    let mut stream = tokio::net::TcpStream::connect(gateway.addr).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        b"GET /nowhere HTTP/1.1\r\nHost: gateway.test\r\n\r\n",
    )
    .await
    .unwrap();
    let first = common::read_until(&mut stream, b"No matching route found").await;
    assert!(String::from_utf8_lossy(&first).starts_with("HTTP/1.1 404 Not Found\r\n"));

    let (mut ws, response) = tokio_tungstenite::client_async(
        format!("ws://{}/api/v1/chat/room-2", gateway.addr),
        stream,
    )
    .await
    .unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::text("after keep-alive")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed.into_text().unwrap().as_str(), "after keep-alive");
    ws.close(None).await.unwrap();

    assert_eq!(chat.sessions.load(Ordering::SeqCst), 1);
    let (forwarded, host) = chat.handshake.lock().unwrap().clone().unwrap();
    assert_eq!(forwarded.as_deref(), Some("127.0.0.1"));
    assert_eq!(host, Some(chat.addr.to_string()));
}

#[tokio::test]
async fn kept_alive_upgrade_on_http_only_route_is_refused() {
    let users = common::start_echo_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/user",
        users.addr,
        false,
    )]))
    .await;

    let mut pipelined = String::from("GET /nowhere HTTP/1.1\r\nHost: gateway.test\r\n\r\n");
    pipelined.push_str(&common::handshake("/api/v1/user", None));

    let raw = common::raw_exchange(gateway.addr, pipelined.as_bytes()).await;
    let raw = String::from_utf8_lossy(&raw);
    assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\n"), "{raw}");
    assert!(raw.contains("HTTP/1.1 400 Bad Request\r\n"), "{raw}");
    assert_eq!(users.hits(), 0);
}

#[tokio::test]
async fn backend_close_reaches_client() {
    let notifications = common::start_ws_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/notification",
        notifications.addr,
        true,
    )]))
    .await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!(
        "ws://{}/api/v1/notification/stream",
        gateway.addr
    ))
    .await
    .unwrap();

    ws.send(Message::text("subscribe")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed.into_text().unwrap().as_str(), "subscribe");

    ws.send(Message::text("hangup")).await.unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client never saw the backend go away");
}

#[tokio::test]
async fn client_close_reaches_backend_promptly() {
    let chat = common::start_ws_backend().await;
    let gateway = common::spawn_gateway(common::gateway_config(vec![common::route(
        "/api/v1/chat",
        chat.addr,
        true,
    )]))
    .await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/api/v1/chat", gateway.addr))
            .await
            .unwrap();
    ws.send(Message::text("ping")).await.unwrap();
    let _ = ws.next().await;

    // drop the TCP connection without a close frame
    drop(ws);

    tokio::time::timeout(Duration::from_secs(2), chat.closed.notified())
        .await
        .expect("backend socket was not closed after the client went away");
}
