//! End-to-end walks of the register/heartbeat/evict lifecycle over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use matchmaker::server::{router, ApiContext};
use matchmaker::store::ServerStore;
use roomforge_base::{CoreMetrics, Environment, ErrorEnvelope};
use roomforge_core::ServerInfo;
use serde_json::{json, Value};

async fn spawn_app(heartbeat_timeout: u64) -> (SocketAddr, Arc<ServerStore>) {
    let store = Arc::new(ServerStore::new(heartbeat_timeout));
    let metrics = Arc::new(
        CoreMetrics::new("matchmaker-test", None, prometheus::Registry::new()).unwrap(),
    );
    let context = ApiContext {
        store: store.clone(),
        metrics,
        environment: Environment::Development,
        debug: true,
        cleanup_interval: 10,
    };
    let app = router(context, tower_http::cors::CorsLayer::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, store)
}

fn registration() -> Value {
    json!({
        "ip": "192.168.1.10",
        "port": 8081,
        "name": "R",
        "max_players": 20,
        "current_players": 0,
    })
}

#[tokio::test]
async fn register_heartbeat_and_expire() {
    let (addr, _store) = spawn_app(1).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/register"))
        .json(&registration())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["server_id"], "192.168.1.10:8081");

    // Freshly registered servers are active without any explicit heartbeat.
    let listed: Vec<ServerInfo> = client
        .get(format!("http://{addr}/servers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].server_id, "192.168.1.10:8081");

    // Let the heartbeat lapse.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let listed: Vec<ServerInfo> = client
        .get(format!("http://{addr}/servers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());

    let response = client
        .get(format!("http://{addr}/servers/192.168.1.10:8081"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 410);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, 410);
    assert!(envelope.error.path.contains("/servers/"));
    assert!(!envelope.error.timestamp.is_empty());
}

#[tokio::test]
async fn heartbeat_refreshes_and_reports_players() {
    let (addr, _store) = spawn_app(30).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{addr}/register"))
        .json(&registration())
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!(
            "http://{addr}/heartbeat/192.168.1.10:8081?current_players=7"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");

    let info: ServerInfo = client
        .get(format!("http://{addr}/servers/192.168.1.10:8081"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.current_players, 7);
    assert_eq!(info.name, "R");
    assert!(info.uptime >= 0);
}

#[tokio::test]
async fn heartbeat_for_unknown_server_is_enveloped_404() {
    let (addr, _store) = spawn_app(30).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/heartbeat/1.2.3.4:9999"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, 404);
    assert_eq!(envelope.error.message, "Server not found");
    assert_eq!(envelope.error.path, "/heartbeat/1.2.3.4:9999");
}

#[tokio::test]
async fn unregister_removes_the_entry() {
    let (addr, store) = spawn_app(30).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{addr}/register"))
        .json(&registration())
        .send()
        .await
        .unwrap();
    assert_eq!(store.total(), 1);

    let response = client
        .delete(format!("http://{addr}/servers/192.168.1.10:8081"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(store.total(), 0);

    let response = client
        .delete(format!("http://{addr}/servers/192.168.1.10:8081"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn health_reports_statistics() {
    let (addr, _store) = spawn_app(30).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{addr}/register"))
        .json(&registration())
        .send()
        .await
        .unwrap();

    let body: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["statistics"]["active_servers"], 1);
    assert_eq!(body["configuration"]["heartbeat_timeout"], 30);
}
