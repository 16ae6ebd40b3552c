// Transport failover under endpoint loss: when the primary dies
// mid-subscription, the stream is re-established on the secondary within the
// backoff budget and messages keep flowing.
use arbflow::config::{EndpointConfig, TransportConfig};
use arbflow::transport::WebSocketManager;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Single-connection websocket server that tags every frame it sends.
async fn spawn_ws_server(tag: &'static str) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { continue };
            loop {
                tokio::select! {
                    frame = ws.next() => {
                        match frame {
                            // Subscribe frames are acknowledged by ticking.
                            Some(Ok(_)) => {}
                            _ => break,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {
                        let tick = json!({ "server": tag, "price": 2000.0 });
                        if ws.send(Message::Text(tick.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    (addr, handle)
}

fn endpoint(id: &str, addr: SocketAddr, priority: u8) -> EndpointConfig {
    EndpointConfig {
        id: id.into(),
        ws_url: format!("ws://{addr}"),
        http_url: format!("http://{addr}"),
        priority,
        weight: 1.0,
        rate_limit: 100,
    }
}

#[tokio::test]
async fn subscription_fails_over_to_secondary() {
    let (addr_a, server_a) = spawn_ws_server("a").await;
    let (addr_b, _server_b) = spawn_ws_server("b").await;

    let config = TransportConfig {
        endpoints: vec![endpoint("a", addr_a, 0), endpoint("b", addr_b, 1)],
        reconnect_delay_ms: 25,
        max_reconnect_delay_ms: 200,
        max_reconnect_attempts: 10,
        ..TransportConfig::default()
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = WebSocketManager::new(config, shutdown_rx);
    assert_eq!(manager.primary().as_deref(), Some("a"));

    let mut rx = manager.subscribe(json!({ "op": "subscribe", "channel": "ticker" }));

    // First messages come from the preferred endpoint.
    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message within deadline")
        .expect("open stream");
    assert_eq!(first["server"], "a");

    // Kill the primary mid-subscription.
    server_a.abort();

    // Messages must resume from the secondary within the backoff budget.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut from_b = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(message)) => {
                if message["server"] == "b" {
                    from_b = true;
                    break;
                }
            }
            Ok(None) => panic!("subscription channel closed"),
            Err(_) => {}
        }
    }
    assert!(from_b, "subscription did not re-establish on the secondary");
}

#[tokio::test]
async fn primary_selection_tracks_health() {
    let (addr_a, _server_a) = spawn_ws_server("a").await;
    let (addr_b, _server_b) = spawn_ws_server("b").await;
    let config = TransportConfig {
        endpoints: vec![endpoint("a", addr_a, 0), endpoint("b", addr_b, 1)],
        ..TransportConfig::default()
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = WebSocketManager::new(config, shutdown_rx);

    assert_eq!(manager.primary().as_deref(), Some("a"));
    assert_eq!(manager.failover_endpoint().as_deref(), Some("b"));

    manager.mark_endpoint_unhealthy("a");
    assert_eq!(manager.primary().as_deref(), Some("b"));
    assert!(manager.failover_endpoint().is_none());
}
