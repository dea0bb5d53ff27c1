//! Build-context materialization, image build and container launch.
//!
//! For each accepted upload the builder renders a Node build context
//! (package.json, Dockerfile, generated template server, user payload),
//! builds an image tagged with the sanitized instance id, and runs the
//! container on a leased host port. Every failure edge unwinds the partial
//! artifacts it created.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use roomforge_core::{
    BuildContext, ContainerRuntime, RunSpec, RuntimeError, CONTAINER_PORT, INSTANCE_ID_LABEL,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

use crate::validate::ValidatedUpload;

/// Image repository images are tagged under.
pub const IMAGE_PREFIX: &str = "game-server";
/// How many ports past `base_port` the allocator probes before giving up.
pub const PORT_PROBE_WINDOW: u16 = 1000;

/// Restrict an instance id to the tag charset: lowercase alphanumerics,
/// `_`, `.` and `-`, no leading `.` or `-`, at most 128 characters.
pub fn sanitize_image_tag(raw: &str) -> String {
    let mut sanitized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    sanitized.make_ascii_lowercase();
    let sanitized = sanitized.trim_start_matches(['.', '-']);
    let mut sanitized = if sanitized.is_empty() {
        "game".to_owned()
    } else {
        sanitized.to_owned()
    };
    sanitized.truncate(128);
    sanitized
}

/// The image tag for an instance.
pub fn image_tag_for(instance_id: &str) -> String {
    format!("{IMAGE_PREFIX}:{}", sanitize_image_tag(instance_id))
}

/// Serialized host-port allocation.
///
/// Concurrent launches must never pick the same port: the probe over
/// runtime-observed ports plus the lease insertion happen under one lock,
/// and a lease stays held until the runtime itself owns the port (the
/// container exists) or the launch failed.
#[derive(Debug)]
pub struct PortAllocator {
    base_port: u16,
    leased: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// An allocator probing upward from `base_port`.
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Lease a free host port. Both the runtime's port mapping and the
    /// bind probe are advisory; the authoritative test is the runtime's
    /// refusal to start the container.
    pub async fn lease(&self, runtime: &dyn ContainerRuntime) -> Result<u16, RuntimeError> {
        let used = match runtime.used_host_ports().await {
            Ok(ports) => ports,
            Err(err) => {
                warn!(%err, "failed to snapshot used ports, probing blind");
                HashSet::new()
            }
        };

        let mut leased = self.leased.lock().await;
        for offset in 0..PORT_PROBE_WINDOW {
            let Some(port) = self.base_port.checked_add(offset) else {
                break;
            };
            if used.contains(&port) || leased.contains(&port) {
                continue;
            }
            if std::net::TcpListener::bind(("0.0.0.0", port)).is_err() {
                continue;
            }
            leased.insert(port);
            info!(port, "leased host port");
            return Ok(port);
        }
        Err(RuntimeError::Api(format!(
            "no free host port: exhausted {PORT_PROBE_WINDOW} candidates from {}",
            self.base_port
        )))
    }

    /// Return a lease once the runtime owns the port or the launch failed.
    pub async fn release(&self, port: u16) {
        self.leased.lock().await.remove(&port);
    }
}

/// A successful launch.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// Started container.
    pub container_id: String,
    /// Host port it is published on.
    pub host_port: u16,
    /// Image it runs.
    pub image_id: String,
}

/// Renders build contexts and drives the runtime through
/// build → run → verify, unwinding partial artifacts on failure.
#[derive(Debug)]
pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    network: String,
    matchmaker_url: String,
    stop_timeout: Duration,
    memory_limit_bytes: Option<i64>,
    cpu_limit: Option<f64>,
}

impl ImageBuilder {
    /// A builder launching containers onto `network`, wiring the given
    /// matchmaker endpoint into every template.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        base_port: u16,
        network: String,
        matchmaker_url: String,
        stop_timeout: Duration,
        memory_limit_bytes: Option<i64>,
        cpu_limit: Option<f64>,
    ) -> Self {
        Self {
            runtime,
            ports: PortAllocator::new(base_port),
            network,
            matchmaker_url,
            stop_timeout,
            memory_limit_bytes,
            cpu_limit,
        }
    }

    /// Build and run a container for an accepted upload. Admission must
    /// already have been granted by the supervisor.
    pub async fn launch(
        &self,
        instance_id: &str,
        display_name: &str,
        max_players: u32,
        payload: &ValidatedUpload,
    ) -> Result<LaunchOutcome, RuntimeError> {
        let host_port = self.ports.lease(self.runtime.as_ref()).await?;
        let outcome = self
            .launch_on_port(instance_id, display_name, max_players, payload, host_port)
            .await;
        // Whether the launch succeeded (runtime now owns the port) or
        // failed (port is free again), the lease has served its purpose.
        self.ports.release(host_port).await;
        outcome
    }

    async fn launch_on_port(
        &self,
        instance_id: &str,
        display_name: &str,
        max_players: u32,
        payload: &ValidatedUpload,
        host_port: u16,
    ) -> Result<LaunchOutcome, RuntimeError> {
        let context = render_build_context(payload, display_name, &self.matchmaker_url);
        let tag = image_tag_for(instance_id);

        info!(instance_id, tag, "building image");
        let image_id = match self.runtime.build_image(&tag, context).await {
            Ok(id) => id,
            Err(err) => {
                // Remove any partially tagged image; never create a container.
                let _ = self.runtime.remove_image(&tag).await;
                return Err(RuntimeError::Build(format!("image build failed: {err}")));
            }
        };

        let game_type = match payload {
            ValidatedUpload::Js { .. } => "js",
            ValidatedUpload::Html { .. } | ValidatedUpload::Zip { .. } => "html",
        };
        let spec = RunSpec {
            image: tag.clone(),
            name: format!("{IMAGE_PREFIX}-{}", sanitize_image_tag(instance_id)),
            container_port: CONTAINER_PORT,
            host_port,
            env: vec![
                ("PORT".to_owned(), CONTAINER_PORT.to_string()),
                ("EXTERNAL_PORT".to_owned(), host_port.to_string()),
                ("ROOM_NAME".to_owned(), display_name.to_owned()),
                ("MATCHMAKER_URL".to_owned(), self.matchmaker_url.clone()),
                ("MAX_PLAYERS".to_owned(), max_players.to_string()),
                ("NODE_ENV".to_owned(), "production".to_owned()),
            ],
            labels: vec![
                (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
                (INSTANCE_ID_LABEL.to_owned(), instance_id.to_owned()),
                ("game_type".to_owned(), game_type.to_owned()),
            ],
            network: self.network.clone(),
            restart_policy: "unless-stopped".to_owned(),
            memory_limit_bytes: self.memory_limit_bytes,
            cpu_limit: self.cpu_limit,
        };

        let container_id = match self.runtime.run_container(spec).await {
            Ok(id) => id,
            Err(err) => {
                let _ = self.runtime.remove_image(&tag).await;
                return Err(err);
            }
        };

        // The runtime accepted the container; make sure it actually came up.
        match self.runtime.container_state(&container_id).await {
            Ok(state) if state.is_running() => {
                info!(instance_id, container_id, host_port, "container started");
                Ok(LaunchOutcome {
                    container_id,
                    host_port,
                    image_id,
                })
            }
            Ok(state) => {
                self.unwind_container(&container_id, &tag).await;
                Err(RuntimeError::Api(format!(
                    "container entered state {state} after start"
                )))
            }
            Err(err) => {
                self.unwind_container(&container_id, &tag).await;
                Err(err)
            }
        }
    }

    async fn unwind_container(&self, container_id: &str, tag: &str) {
        let _ = self
            .runtime
            .stop_container(container_id, self.stop_timeout)
            .await;
        let _ = self.runtime.remove_container(container_id, true).await;
        let _ = self.runtime.remove_image(tag).await;
    }
}

fn render_build_context(
    payload: &ValidatedUpload,
    display_name: &str,
    matchmaker_url: &str,
) -> BuildContext {
    let mut context = BuildContext::new();

    match payload {
        ValidatedUpload::Js { source } => {
            context.add_file(
                "package.json",
                render_package_json("game-server", true).into_bytes(),
            );
            context.add_file("Dockerfile", render_dockerfile(&["user_game.js"]).into_bytes());
            context.add_file(
                "server.js",
                render_js_server(display_name, matchmaker_url).into_bytes(),
            );
            context.add_file("user_game.js", prepare_user_code(source).into_bytes());
        }
        ValidatedUpload::Html { index_html } => {
            add_html_context(&mut context, display_name, matchmaker_url, index_html, &[]);
        }
        ValidatedUpload::Zip {
            index_html,
            other_files,
        } => {
            add_html_context(
                &mut context,
                display_name,
                matchmaker_url,
                index_html,
                other_files,
            );
        }
    }

    context
}

fn add_html_context(
    context: &mut BuildContext,
    display_name: &str,
    matchmaker_url: &str,
    index_html: &str,
    other_files: &[(String, Vec<u8>)],
) {
    context.add_file(
        "package.json",
        render_package_json("html-game-server", false).into_bytes(),
    );
    context.add_file("Dockerfile", render_dockerfile(&["game"]).into_bytes());
    context.add_file(
        "server.js",
        render_html_server(display_name, matchmaker_url).into_bytes(),
    );
    context.add_file("game/index.html", index_html.as_bytes().to_vec());
    for (path, contents) in other_files {
        context.add_file(format!("game/{path}"), contents.clone());
    }
}

fn render_package_json(name: &str, with_socket: bool) -> String {
    let mut dependencies = serde_json::Map::new();
    dependencies.insert("express".to_owned(), "^4.18.2".into());
    if with_socket {
        dependencies.insert("socket.io".to_owned(), "^4.7.2".into());
    }
    dependencies.insert("axios".to_owned(), "^1.6.0".into());
    dependencies.insert("dotenv".to_owned(), "^16.3.1".into());

    let package = serde_json::json!({
        "name": name,
        "version": "1.0.0",
        "main": "server.js",
        "scripts": { "start": "node server.js" },
        "dependencies": dependencies,
    });
    serde_json::to_string_pretty(&package).expect("static package.json")
}

fn render_dockerfile(extra_copies: &[&str]) -> String {
    let mut dockerfile = String::from(
        "FROM node:16-alpine\n\n\
         WORKDIR /usr/src/app\n\n\
         COPY package.json ./\n\
         RUN npm install\n\n\
         COPY server.js ./\n",
    );
    for copy in extra_copies {
        dockerfile.push_str(&format!("COPY {copy} ./{copy}\n"));
    }
    dockerfile.push_str(
        "\nEXPOSE 8080\n\n\
         ENV NODE_ENV=production\n\n\
         CMD [\"node\", \"server.js\"]\n",
    );
    dockerfile
}

fn prepare_user_code(source: &str) -> String {
    if source.contains("module.exports") {
        return source.to_owned();
    }
    // Wrap exportless uploads with a default shim so the template can
    // always require() them.
    format!(
        "{source}\n\n\
         module.exports = {{\n\
         \x20   initGame: typeof initGame !== 'undefined' ? initGame : () => ({{ clickCount: 0 }}),\n\
         \x20   handlePlayerAction: typeof handlePlayerAction !== 'undefined' ? handlePlayerAction :\n\
         \x20       (gameState, action, data) => {{\n\
         \x20           if (action === 'click') {{\n\
         \x20               gameState.clickCount = (gameState.clickCount || 0) + 1;\n\
         \x20           }}\n\
         \x20           return gameState;\n\
         \x20       }}\n\
         }};\n"
    )
}

fn render_heartbeat(game_type: &str) -> String {
    format!(
        r#"async function sendHeartbeat() {{
    try {{
        await axios.post(`${{MATCHMAKER_URL}}/register`, {{
            ip: 'localhost',
            port: Number(EXTERNAL_PORT),
            name: ROOM_NAME,
            max_players: MAX_PLAYERS,
            current_players: connectedPlayers,
            metadata: {{
                created_by: 'roomforge-factory',
                game_type: '{game_type}',
                internal_port: Number(PORT),
                external_port: Number(EXTERNAL_PORT)
            }}
        }});
        setTimeout(sendHeartbeat, HEARTBEAT_INTERVAL);
    }} catch (error) {{
        console.error('heartbeat failed:', error.message);
        setTimeout(sendHeartbeat, RETRY_INTERVAL);
    }}
}}"#
    )
}

fn render_common_prelude(display_name: &str, matchmaker_url: &str) -> String {
    format!(
        r#"const PORT = process.env.PORT || 8080;
const EXTERNAL_PORT = process.env.EXTERNAL_PORT || PORT;
const MATCHMAKER_URL = process.env.MATCHMAKER_URL || '{matchmaker_url}';
const ROOM_NAME = process.env.ROOM_NAME || '{name}';
const MAX_PLAYERS = parseInt(process.env.MAX_PLAYERS) || 20;
const HEARTBEAT_INTERVAL = parseInt(process.env.HEARTBEAT_INTERVAL) || 25000;
const RETRY_INTERVAL = parseInt(process.env.RETRY_INTERVAL) || 5000;"#,
        name = display_name.replace('\'', "\\'"),
    )
}

fn render_js_server(display_name: &str, matchmaker_url: &str) -> String {
    format!(
        r#"const express = require('express');
const http = require('http');
const socketIo = require('socket.io');
const axios = require('axios');
require('dotenv').config();

const app = express();
const server = http.createServer(app);
const io = socketIo(server, {{ cors: {{ origin: '*', methods: ['GET', 'POST'] }} }});

{prelude}

let userGameLogic;
try {{
    userGameLogic = require('./user_game.js');
}} catch (error) {{
    console.error('failed to load user game code:', error);
    userGameLogic = {{
        initGame: () => ({{ clickCount: 0 }}),
        handlePlayerAction: (gameState, action, data) => {{
            if (action === 'click') {{
                gameState.clickCount = (gameState.clickCount || 0) + 1;
            }}
            return gameState;
        }}
    }};
}}

let gameState = userGameLogic.initGame ? userGameLogic.initGame() : {{ clickCount: 0 }};
let connectedPlayers = 0;

app.get('/', (req, res) => {{
    res.send(`<!DOCTYPE html>
<html>
<head>
  <title>${{ROOM_NAME}}</title>
  <script src="/socket.io/socket.io.js"></script>
</head>
<body>
  <h1>${{ROOM_NAME}}</h1>
  <div id="gameState"></div>
  <button onclick="sendClick()">click</button>
  <script>
    const socket = io();
    socket.on('gameState', (state) => {{
        document.getElementById('gameState').innerHTML =
            '<pre>' + JSON.stringify(state, null, 2) + '</pre>';
    }});
    function sendClick() {{
        socket.emit('playerAction', {{ action: 'click' }});
    }}
  </script>
</body>
</html>`);
}});

app.get('/health', (req, res) => {{
    res.json({{ status: 'healthy', room: ROOM_NAME, port: PORT, external_port: EXTERNAL_PORT }});
}});

io.on('connection', (socket) => {{
    connectedPlayers++;
    socket.emit('gameState', gameState);

    socket.on('playerAction', (data) => {{
        try {{
            if (userGameLogic.handlePlayerAction) {{
                gameState = userGameLogic.handlePlayerAction(gameState, data.action, data);
            }} else if (data.action === 'click') {{
                gameState.clickCount = (gameState.clickCount || 0) + 1;
            }}
            io.emit('gameState', gameState);
        }} catch (error) {{
            console.error('player action failed:', error);
            socket.emit('error', {{ message: 'action failed' }});
        }}
    }});

    socket.on('disconnect', () => {{
        connectedPlayers--;
    }});
}});

server.listen(PORT, () => {{
    console.log(`game server listening on ${{PORT}} (external ${{EXTERNAL_PORT}})`);
    sendHeartbeat();
}});

{heartbeat}

process.on('SIGTERM', () => {{
    server.close(() => process.exit(0));
}});
"#,
        prelude = render_common_prelude(display_name, matchmaker_url),
        heartbeat = render_heartbeat("js"),
    )
}

fn render_html_server(display_name: &str, matchmaker_url: &str) -> String {
    format!(
        r#"const express = require('express');
const http = require('http');
const path = require('path');
const axios = require('axios');
require('dotenv').config();

const app = express();
const server = http.createServer(app);

{prelude}

let connectedPlayers = 0;

app.use(express.static(path.join(__dirname, 'game')));

app.get('/', (req, res) => {{
    res.sendFile(path.join(__dirname, 'game', 'index.html'));
}});

app.get('/health', (req, res) => {{
    res.json({{ status: 'healthy', room: ROOM_NAME, port: PORT, external_port: EXTERNAL_PORT }});
}});

server.listen(PORT, () => {{
    console.log(`html game server listening on ${{PORT}} (external ${{EXTERNAL_PORT}})`);
    sendHeartbeat();
}});

{heartbeat}

process.on('SIGTERM', () => {{
    server.close(() => process.exit(0));
}});
"#,
        prelude = render_common_prelude(display_name, matchmaker_url),
        heartbeat = render_heartbeat("html"),
    )
}

#[cfg(test)]
mod tests {
    use roomforge_test::MockContainerRuntime;

    use roomforge_core::ContainerState;

    use super::*;

    fn builder_with(runtime: MockContainerRuntime, base_port: u16) -> ImageBuilder {
        ImageBuilder::new(
            Arc::new(runtime),
            base_port,
            "game-network".to_owned(),
            "http://localhost:8000".to_owned(),
            Duration::from_secs(10),
            Some(512 * 1024 * 1024),
            Some(1.0),
        )
    }

    fn js_payload() -> ValidatedUpload {
        ValidatedUpload::Js {
            source: "module.exports = { handleConnection: s => s.emit('hi') };".to_owned(),
        }
    }

    #[test]
    fn tag_sanitizer_enforces_charset() {
        assert_eq!(sanitize_image_tag("User_42 Game!"), "user_42game");
        assert_eq!(sanitize_image_tag("..-weird--id"), "weird--id");
        assert_eq!(sanitize_image_tag("好玩"), "game");
        let long = sanitize_image_tag(&"a".repeat(300));
        assert_eq!(long.len(), 128);
        let re = regex::Regex::new(r"^[a-z0-9_][a-z0-9_.-]{0,127}$").unwrap();
        for raw in ["Hello World", "-lead", ".dot", "MiXeD.Case-42_"] {
            assert!(re.is_match(&sanitize_image_tag(raw)), "raw = {raw}");
        }
    }

    #[test]
    fn js_context_contains_template_and_wrapped_user_code() {
        let context = render_build_context(&js_payload(), "Game", "http://localhost:8000");
        let paths: Vec<&str> = context.files().iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec!["package.json", "Dockerfile", "server.js", "user_game.js"]
        );

        let server = String::from_utf8(context.files()[2].1.clone()).unwrap();
        assert!(server.contains("/register"));
        assert!(server.contains("playerAction"));

        let package = String::from_utf8(context.files()[0].1.clone()).unwrap();
        assert!(package.contains("socket.io"));
    }

    #[test]
    fn exportless_user_code_gets_a_shim() {
        let wrapped = prepare_user_code("function initGame() { return {}; }");
        assert!(wrapped.contains("module.exports"));

        let untouched = prepare_user_code("module.exports = { x: 1 };");
        assert_eq!(untouched, "module.exports = { x: 1 };");
    }

    #[test]
    fn zip_context_preserves_auxiliary_files() {
        let payload = ValidatedUpload::Zip {
            index_html: "<html></html>".to_owned(),
            other_files: vec![("assets/sprite.png".to_owned(), vec![1, 2, 3])],
        };
        let context = render_build_context(&payload, "Game", "http://localhost:8000");
        let paths: Vec<&str> = context.files().iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"game/index.html"));
        assert!(paths.contains(&"game/assets/sprite.png"));

        let package = String::from_utf8(context.files()[0].1.clone()).unwrap();
        assert!(!package.contains("socket.io"));
    }

    #[tokio::test]
    async fn launch_builds_runs_and_verifies() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_used_host_ports()
            .returning(|| Ok(HashSet::new()));
        runtime
            .expect_build_image()
            .withf(|tag, _| tag == "game-server:user_1_game_001")
            .returning(|_, _| Ok("sha256:image".to_owned()));
        runtime
            .expect_run_container()
            .withf(|spec| {
                spec.container_port == 8080
                    && spec.restart_policy == "unless-stopped"
                    && spec
                        .env
                        .iter()
                        .any(|(k, v)| k == "EXTERNAL_PORT" && v == &spec.host_port.to_string())
                    && spec
                        .labels
                        .iter()
                        .any(|(k, v)| k == INSTANCE_ID_LABEL && v == "user_1_game_001")
            })
            .returning(|_| Ok("container-1".to_owned()));
        runtime
            .expect_container_state()
            .returning(|_| Ok(ContainerState::Running));

        let builder = builder_with(runtime, 18081);
        let outcome = builder
            .launch("user_1_game_001", "Game", 10, &js_payload())
            .await
            .unwrap();
        assert_eq!(outcome.container_id, "container-1");
        assert_eq!(outcome.image_id, "sha256:image");
        assert!(outcome.host_port >= 18081);
    }

    #[tokio::test]
    async fn build_failure_removes_partial_image_and_creates_no_container() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_used_host_ports()
            .returning(|| Ok(HashSet::new()));
        runtime
            .expect_build_image()
            .returning(|_, _| Err(RuntimeError::Build("npm install failed".to_owned())));
        runtime
            .expect_remove_image()
            .times(1)
            .returning(|_| Ok(()));
        runtime.expect_run_container().never();

        let builder = builder_with(runtime, 18181);
        let err = builder
            .launch("user_2_game_001", "Game", 10, &js_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Build(_)));
    }

    #[tokio::test]
    async fn non_running_container_is_unwound() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_used_host_ports()
            .returning(|| Ok(HashSet::new()));
        runtime
            .expect_build_image()
            .returning(|_, _| Ok("sha256:image".to_owned()));
        runtime
            .expect_run_container()
            .returning(|_| Ok("container-2".to_owned()));
        runtime
            .expect_container_state()
            .returning(|_| Ok(ContainerState::Exited));
        runtime
            .expect_stop_container()
            .times(1)
            .returning(|_, _| Ok(()));
        runtime
            .expect_remove_container()
            .times(1)
            .returning(|_, _| Ok(()));
        runtime
            .expect_remove_image()
            .times(1)
            .returning(|_| Ok(()));

        let builder = builder_with(runtime, 18281);
        let err = builder
            .launch("user_3_game_001", "Game", 10, &js_payload())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn concurrent_launches_get_distinct_ports() {
        // Emulate runtime port ownership: once a container runs, its host
        // port shows up in the used-port snapshot.
        let owned = Arc::new(std::sync::Mutex::new(HashSet::new()));

        let mut runtime = MockContainerRuntime::new();
        let snapshot = owned.clone();
        runtime
            .expect_used_host_ports()
            .returning(move || Ok(snapshot.lock().unwrap().clone()));
        runtime
            .expect_build_image()
            .returning(|_, _| Ok("sha256:image".to_owned()));
        let claimed = owned.clone();
        runtime.expect_run_container().returning(move |spec| {
            claimed.lock().unwrap().insert(spec.host_port);
            Ok(format!("container-{}", spec.host_port))
        });
        runtime
            .expect_container_state()
            .returning(|_| Ok(ContainerState::Running));

        let builder = Arc::new(builder_with(runtime, 18381));
        let launches = (0..4).map(|i| {
            let builder = builder.clone();
            tokio::spawn(async move {
                builder
                    .launch(&format!("user_{i}_game_001"), "Game", 10, &js_payload())
                    .await
                    .unwrap()
            })
        });

        let mut seen = HashSet::new();
        for launch in launches {
            let outcome = launch.await.unwrap();
            assert!(
                seen.insert(outcome.host_port),
                "port {} allocated twice",
                outcome.host_port
            );
        }
    }

    #[tokio::test]
    async fn exhausted_probe_window_fails_without_leaking() {
        let mut runtime = MockContainerRuntime::new();
        // Every candidate is reported used by the runtime.
        runtime.expect_used_host_ports().returning(|| {
            Ok((18481..18481 + PORT_PROBE_WINDOW).collect())
        });
        runtime.expect_build_image().never();
        runtime.expect_run_container().never();

        let builder = builder_with(runtime, 18481);
        let err = builder
            .launch("user_4_game_001", "Game", 10, &js_payload())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no free host port"));
    }
}
