use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, warn, Instrument};

use roomforge_base::{run_all, serve, BaseAgent, CoreMetrics};
use roomforge_core::ContainerRuntime;
use roomforge_docker::DockerRuntime;

use crate::analyze::JsAnalyzer;
use crate::build::ImageBuilder;
use crate::registry::{run_event_loop, InstanceRegistry};
use crate::server::{router, DockerStack, FactoryConfig, FactoryState};
use crate::settings::{parse_memory_limit, FactorySettings};
use crate::supervisor::{Supervisor, SupervisorEvent, SupervisorLimits};
use crate::validate::UploadValidator;

/// Grace given to containers on stop before force removal.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// The factory agent: upload pipeline, supervisor and instance registry
/// behind one HTTP server.
#[derive(Debug)]
pub struct Factory {
    listen_addr: SocketAddr,
    cors: tower_http::cors::CorsLayer,
    cleanup_interval: Duration,
    state: Arc<FactoryState>,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SupervisorEvent>>>,
}

#[async_trait]
impl BaseAgent for Factory {
    const AGENT_NAME: &'static str = "factory";

    type Settings = FactorySettings;

    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self>
    where
        Self: Sized,
    {
        info!(
            environment = %settings.app.environment,
            host = %settings.app.host,
            port = settings.app.port,
            max_file_size = settings.max_file_size,
            max_containers = settings.max_containers,
            docker_network = %settings.docker_network,
            matchmaker_url = %settings.matchmaker_url,
            "factory starting",
        );

        // Connect to Docker if we can; without it the factory still serves
        // uploads but every launch is recorded as an error.
        let runtime: Option<Arc<dyn ContainerRuntime>> = match DockerRuntime::connect() {
            Ok(runtime) => match runtime.ping().await {
                Ok(()) => {
                    runtime.ensure_network(&settings.docker_network).await?;
                    info!("container runtime connected");
                    Some(Arc::new(runtime))
                }
                Err(err) => {
                    warn!(%err, "container runtime unreachable, running in limited mode");
                    None
                }
            },
            Err(err) => {
                warn!(%err, "container runtime unavailable, running in limited mode");
                None
            }
        };

        let mut events = None;
        let docker = runtime.clone().map(|runtime| {
            let limits = SupervisorLimits {
                max_containers: settings.max_containers,
                idle_timeout: Duration::from_secs(settings.idle_timeout_seconds),
                max_error_count: settings.max_error_count,
                stop_timeout: STOP_TIMEOUT,
            };
            let (supervisor, receiver) = Supervisor::new(runtime.clone(), limits, metrics.clone());
            events = Some(receiver);

            let builder = Arc::new(ImageBuilder::new(
                runtime.clone(),
                settings.base_port,
                settings.docker_network.clone(),
                settings.matchmaker_url.clone(),
                STOP_TIMEOUT,
                parse_memory_limit(&settings.container_memory_limit),
                Some(settings.container_cpu_limit),
            ));

            DockerStack {
                runtime,
                supervisor,
                builder,
            }
        });

        let matchmaker_timeout = Duration::from_secs(settings.matchmaker_timeout);
        let state = Arc::new(FactoryState {
            registry: Arc::new(InstanceRegistry::new(runtime)),
            docker,
            validator: UploadValidator::new(
                settings.max_file_size,
                settings.allowed_extensions.clone(),
            ),
            analyzer: JsAnalyzer::new(),
            metrics,
            http: reqwest::Client::builder()
                .timeout(matchmaker_timeout)
                .build()?,
            config: FactoryConfig {
                environment: settings.app.environment,
                debug: settings.app.debug,
                max_containers: settings.max_containers,
                idle_timeout_seconds: settings.idle_timeout_seconds,
                matchmaker_url: settings.matchmaker_url.clone(),
                matchmaker_timeout,
                stop_timeout: STOP_TIMEOUT,
            },
        });

        Ok(Self {
            listen_addr: settings.app.socket_addr()?,
            cors: settings.app.cors_layer(),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_seconds),
            state,
            events: std::sync::Mutex::new(events),
        })
    }

    #[allow(clippy::async_yields_async)]
    async fn run(&self) -> Instrumented<JoinHandle<Result<()>>> {
        let mut tasks = vec![self.run_server()];

        if let Some(docker) = &self.state.docker {
            tasks.push(docker.supervisor.clone().run(self.cleanup_interval));
        }
        if let Some(events) = self.events.lock().unwrap_or_else(|e| e.into_inner()).take() {
            tasks.push(run_event_loop(self.state.registry.clone(), events));
        }

        run_all(tasks)
    }
}

impl Factory {
    fn run_server(&self) -> Instrumented<JoinHandle<Result<()>>> {
        let app = router(self.state.clone(), self.cors.clone());
        let addr = self.listen_addr;

        tokio::spawn(async move { serve(addr, app).await }).instrument(info_span!("http_server"))
    }
}
