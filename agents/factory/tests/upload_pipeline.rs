//! HTTP-level walks of the upload pipeline with a mocked container
//! runtime.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use factory::analyze::JsAnalyzer;
use factory::build::ImageBuilder;
use factory::registry::InstanceRegistry;
use factory::server::{router, DockerStack, FactoryConfig, FactoryState};
use factory::supervisor::{Supervisor, SupervisorLimits};
use factory::validate::UploadValidator;
use roomforge_base::{CoreMetrics, Environment, ErrorEnvelope};
use roomforge_core::{ContainerRuntime, ContainerState, ResourceSnapshot};
use roomforge_test::MockContainerRuntime;

const BASE_PORT: u16 = 18081;

fn happy_runtime() -> MockContainerRuntime {
    let mut runtime = MockContainerRuntime::new();
    runtime
        .expect_used_host_ports()
        .returning(|| Ok(HashSet::new()));
    runtime
        .expect_build_image()
        .returning(|_, _| Ok("sha256:feedface".to_owned()));
    runtime
        .expect_run_container()
        .returning(|_| Ok("c0ffee00c0ffee".to_owned()));
    runtime
        .expect_container_state()
        .returning(|_| Ok(ContainerState::Running));
    runtime
        .expect_container_stats()
        .returning(|_| Ok(ResourceSnapshot::default()));
    runtime
        .expect_container_logs()
        .returning(|_, _| Ok(vec!["game server listening on 8080".to_owned()]));
    runtime
}

fn state_with(runtime: Option<MockContainerRuntime>, max_containers: usize) -> Arc<FactoryState> {
    let metrics =
        Arc::new(CoreMetrics::new("factory-test", None, prometheus::Registry::new()).unwrap());
    let runtime: Option<Arc<dyn ContainerRuntime>> =
        runtime.map(|r| Arc::new(r) as Arc<dyn ContainerRuntime>);

    let docker = runtime.clone().map(|runtime| {
        let limits = SupervisorLimits {
            max_containers,
            idle_timeout: Duration::from_secs(1800),
            max_error_count: 5,
            stop_timeout: Duration::from_secs(10),
        };
        let (supervisor, _events) = Supervisor::new(runtime.clone(), limits, metrics.clone());
        let builder = Arc::new(ImageBuilder::new(
            runtime.clone(),
            BASE_PORT,
            "game-network".to_owned(),
            "http://localhost:8000".to_owned(),
            Duration::from_secs(10),
            None,
            None,
        ));
        DockerStack {
            runtime,
            supervisor,
            builder,
        }
    });

    Arc::new(FactoryState {
        registry: Arc::new(InstanceRegistry::new(runtime)),
        docker,
        validator: UploadValidator::new(
            1024 * 1024,
            vec![
                ".js".into(),
                ".mjs".into(),
                ".html".into(),
                ".htm".into(),
                ".zip".into(),
            ],
        ),
        analyzer: JsAnalyzer::new(),
        metrics,
        http: reqwest::Client::new(),
        config: FactoryConfig {
            environment: Environment::Development,
            debug: true,
            max_containers,
            idle_timeout_seconds: 1800,
            matchmaker_url: "http://localhost:8000".to_owned(),
            matchmaker_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
        },
    })
}

async fn spawn_app(state: Arc<FactoryState>) -> SocketAddr {
    let app = router(state, tower_http::cors::CorsLayer::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn upload_form(code: &str) -> reqwest::multipart::Form {
    reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(code.as_bytes().to_vec()).file_name("game.js"),
        )
        .text("name", "Game")
        .text("description", "d")
        .text("max_players", "10")
}

#[tokio::test]
async fn happy_js_upload_launches_a_container() {
    let addr = spawn_app(state_with(Some(happy_runtime()), 50)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/upload"))
        .multipart(upload_form(
            "module.exports = { handleConnection: s => s.emit('hi') };",
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();

    let server_id = body["server_id"].as_str().unwrap();
    let id_re = regex::Regex::new(r"^user_[0-9]+_game_001$").unwrap();
    assert!(id_re.is_match(server_id), "unexpected server id {server_id}");
    assert_eq!(body["server"]["status"], "running");
    let port = body["server"]["port"].as_u64().unwrap() as u16;
    assert!((BASE_PORT..BASE_PORT + 1000).contains(&port));

    // The new instance shows up in the refreshed listing.
    let listed: Value = client
        .get(format!("http://{addr}/servers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["server_id"], server_id);
}

#[tokio::test]
async fn dangerous_upload_is_rejected_with_findings() {
    // No runtime needed: the rejection happens before any launch.
    let addr = spawn_app(state_with(None, 50)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/upload"))
        .multipart(upload_form("module.exports = {};\neval(\"x\");"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, 400);
    assert_eq!(envelope.error.path, "/upload");
    let details = envelope.error.details.expect("details populated");
    let issues = details["security_issues"].as_array().unwrap();
    assert!(issues
        .iter()
        .any(|i| i["severity"] == "high" && i["message"].as_str().unwrap().contains("eval")));
}

#[tokio::test]
async fn admission_ceiling_turns_uploads_away() {
    let state = state_with(Some(happy_runtime()), 1);
    state
        .docker
        .as_ref()
        .unwrap()
        .supervisor
        .register("existing", "container-existing");
    let addr = spawn_app(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/upload"))
        .multipart(upload_form(
            "module.exports = { handleConnection: s => s.emit('hi') };",
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);

    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, 503);
    assert!(envelope
        .error
        .message
        .contains("maximum container limit"));
}

#[tokio::test]
async fn launch_failure_keeps_the_instance_with_error_status() {
    let mut runtime = MockContainerRuntime::new();
    runtime
        .expect_used_host_ports()
        .returning(|| Ok(HashSet::new()));
    runtime.expect_build_image().returning(|_, _| {
        Err(roomforge_core::RuntimeError::Build(
            "npm install failed".to_owned(),
        ))
    });
    runtime.expect_remove_image().returning(|_| Ok(()));

    let addr = spawn_app(state_with(Some(runtime), 50)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/upload"))
        .multipart(upload_form(
            "module.exports = { handleConnection: s => s.emit('hi') };",
        ))
        .send()
        .await
        .unwrap();
    // The upload succeeded even though the launch did not.
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["server"]["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("failed"));
}

#[tokio::test]
async fn unknown_server_paths_are_enveloped_404s() {
    let addr = spawn_app(state_with(None, 50)).await;
    let client = reqwest::Client::new();

    for (method, path) in [
        ("GET", "/servers/nope"),
        ("POST", "/servers/nope/stop"),
        ("DELETE", "/servers/nope"),
        ("GET", "/servers/nope/logs"),
        ("POST", "/servers/nope/activity"),
    ] {
        let request = match method {
            "GET" => client.get(format!("http://{addr}{path}")),
            "POST" => client.post(format!("http://{addr}{path}")),
            _ => client.delete(format!("http://{addr}{path}")),
        };
        let response = request.send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404, "{method} {path}");
        let envelope: ErrorEnvelope = response.json().await.unwrap();
        assert_eq!(envelope.error.code, 404, "{method} {path}");
        assert!(!envelope.error.message.is_empty());
    }
}

#[tokio::test]
async fn system_endpoints_require_the_runtime() {
    let addr = spawn_app(state_with(None, 50)).await;
    let client = reqwest::Client::new();

    for path in ["/system/resources", "/system/idle-containers"] {
        let response = client
            .get(format!("http://{addr}{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503, "{path}");
    }
}

#[tokio::test]
async fn missing_multipart_fields_are_rejected() {
    let addr = spawn_app(state_with(None, 50)).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().text("name", "Game");
    let response = client
        .post(format!("http://{addr}/upload"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert!(envelope.error.message.contains("file"));
}
