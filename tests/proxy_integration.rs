//! End-to-end proxy tests: real listeners, real backends, real bytes.

use nautiluslb::cluster::ApiClient;
use nautiluslb::config::ListenerConfig;
use nautiluslb::discovery::Discoverer;
use nautiluslb::model::Endpoint;
use nautiluslb::proxy::{Proxy, ProxyState};
use nautiluslb::shutdown::ShutdownController;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn listener_config(addr: &str, port_name: &str) -> ListenerConfig {
    ListenerConfig {
        name: format!("{}_configuration", port_name),
        listener_address: addr.to_string(),
        request_timeout: 1,
        backend_port_name: port_name.to_string(),
        namespace: String::new(),
    }
}

async fn free_port_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Backend that answers every connection with a fixed tag and closes.
async fn spawn_tagged_backend(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(tag.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// Backend that echoes until the peer closes.
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = io::copy(&mut r, &mut w).await;
            });
        }
    });

    addr
}

async fn read_tag(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn test_round_robin_across_backends() {
    let backend_a = spawn_tagged_backend("backend-a").await;
    let backend_b = spawn_tagged_backend("backend-b").await;

    let controller = ShutdownController::new();
    let listen_addr = free_port_addr().await;
    let proxy = Arc::new(Proxy::new(
        listener_config(&listen_addr.to_string(), "http"),
        controller.clone(),
    ));
    proxy
        .publish(vec![
            Endpoint::new("127.0.0.1", backend_a.port(), "http"),
            Endpoint::new("127.0.0.1", backend_b.port(), "http"),
        ])
        .await;

    let run = tokio::spawn(proxy.clone().run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Four sequential connections alternate between the two backends.
    let tags = [
        read_tag(listen_addr).await,
        read_tag(listen_addr).await,
        read_tag(listen_addr).await,
        read_tag(listen_addr).await,
    ];

    assert_eq!(tags[0], tags[2]);
    assert_eq!(tags[1], tags[3]);
    assert_ne!(tags[0], tags[1]);

    let seen: HashSet<&str> = tags.iter().map(String::as_str).collect();
    assert_eq!(seen.len(), 2);

    controller.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
}

#[tokio::test]
async fn test_bidirectional_relay_with_half_close() {
    let echo = spawn_echo_backend().await;

    let controller = ShutdownController::new();
    let listen_addr = free_port_addr().await;
    let proxy = Arc::new(Proxy::new(
        listener_config(&listen_addr.to_string(), "http"),
        controller.clone(),
    ));
    proxy
        .publish(vec![Endpoint::new("127.0.0.1", echo.port(), "http")])
        .await;

    let run = tokio::spawn(proxy.clone().run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    client.write_all(b"first chunk ").await.unwrap();
    client.write_all(b"second chunk").await.unwrap();

    // Half-close the sending side; the reply must still drain fully.
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"first chunk second chunk");

    controller.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
}

#[tokio::test]
async fn test_unhealthy_backend_is_skipped() {
    let live = spawn_tagged_backend("live").await;
    let dead = free_port_addr().await;

    let controller = ShutdownController::new();
    let listen_addr = free_port_addr().await;
    let proxy = Arc::new(Proxy::new(
        listener_config(&listen_addr.to_string(), "http"),
        controller.clone(),
    ));
    proxy
        .publish(vec![
            Endpoint::new("127.0.0.1", dead.port(), "http"),
            Endpoint::new("127.0.0.1", live.port(), "http"),
        ])
        .await;

    // Mark the dead endpoint unhealthy, as its probe eventually would.
    for endpoint in proxy.pool().snapshot().await {
        if endpoint.port == dead.port() {
            endpoint.set_healthy(false);
        }
    }

    let run = tokio::spawn(proxy.clone().run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..4 {
        assert_eq!(read_tag(listen_addr).await, "live");
    }

    controller.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
}

#[tokio::test]
async fn test_client_closed_when_no_backends() {
    let controller = ShutdownController::new();
    let listen_addr = free_port_addr().await;
    let proxy = Arc::new(Proxy::new(
        listener_config(&listen_addr.to_string(), "http"),
        controller.clone(),
    ));

    let run = tokio::spawn(proxy.clone().run());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let tag = read_tag(listen_addr).await;
    assert!(tag.is_empty());

    controller.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
}

#[tokio::test]
async fn test_discovered_backend_serves_traffic() {
    // Full path: mock cluster API -> discovery -> pool -> accept -> relay.
    let echo = spawn_echo_backend().await;

    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{
                "metadata": {
                    "name": "echo",
                    "namespace": "default",
                    "annotations": {"nautiluslb.cloudresty.io/enabled": "true"}
                },
                "spec": {
                    "type": "ClusterIP",
                    "clusterIP": "127.0.0.1",
                    "ports": [{"name": "echo", "port": 7, "targetPort": echo.port()}]
                }
            }]
        })))
        .mount(&api)
        .await;

    let controller = ShutdownController::new();
    let listen_addr = free_port_addr().await;
    let proxy = Arc::new(Proxy::new(
        listener_config(&listen_addr.to_string(), "echo"),
        controller.clone(),
    ));

    let client = Arc::new(ApiClient::new(api.uri()));
    let discoverer = Discoverer::new(client, vec![proxy.clone()], controller.clone());
    discoverer.cycle().await;

    assert_eq!(proxy.pool().len().await, 1);

    let run = tokio::spawn(proxy.clone().run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(proxy.state(), ProxyState::Listening);

    let mut stream = TcpStream::connect(listen_addr).await.unwrap();
    stream.write_all(b"hello through the mesh").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"hello through the mesh");

    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("proxy did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(proxy.state(), ProxyState::Stopped);
}
