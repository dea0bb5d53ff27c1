use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, Instrument};

use roomforge_base::{run_all, serve, BaseAgent, CoreMetrics, Environment};

use crate::server::{router, ApiContext};
use crate::settings::MatchmakerSettings;
use crate::store::ServerStore;

/// The matchmaker agent: HTTP registry plus a background reaper.
#[derive(Debug)]
pub struct Matchmaker {
    listen_addr: SocketAddr,
    environment: Environment,
    debug: bool,
    cleanup_interval: Duration,
    cors: tower_http::cors::CorsLayer,
    store: Arc<ServerStore>,
    metrics: Arc<CoreMetrics>,
}

#[async_trait]
impl BaseAgent for Matchmaker {
    const AGENT_NAME: &'static str = "matchmaker";

    type Settings = MatchmakerSettings;

    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self>
    where
        Self: Sized,
    {
        info!(
            environment = %settings.app.environment,
            host = %settings.app.host,
            port = settings.app.port,
            heartbeat_timeout = settings.heartbeat_timeout,
            cleanup_interval = settings.cleanup_interval,
            "matchmaker starting",
        );

        Ok(Self {
            listen_addr: settings.app.socket_addr()?,
            environment: settings.app.environment,
            debug: settings.app.debug,
            cleanup_interval: Duration::from_secs(settings.cleanup_interval),
            cors: settings.app.cors_layer(),
            store: Arc::new(ServerStore::new(settings.heartbeat_timeout)),
            metrics,
        })
    }

    #[allow(clippy::async_yields_async)]
    async fn run(&self) -> Instrumented<JoinHandle<Result<()>>> {
        run_all(vec![self.run_server(), self.run_reaper()])
    }
}

impl Matchmaker {
    fn run_server(&self) -> Instrumented<JoinHandle<Result<()>>> {
        let context = ApiContext {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            environment: self.environment,
            debug: self.debug,
            cleanup_interval: self.cleanup_interval.as_secs(),
        };
        let app = router(context, self.cors.clone());
        let addr = self.listen_addr;

        tokio::spawn(async move { serve(addr, app).await }).instrument(info_span!("http_server"))
    }

    /// Periodically evict stale servers. Failures are logged and the loop
    /// keeps going; it never exits on its own.
    fn run_reaper(&self) -> Instrumented<JoinHandle<Result<()>>> {
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let interval = self.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so a fresh store is not
            // scanned before anything could register.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.cleanup_stale();
                metrics.evictions().inc_by(removed as u64);
                metrics.registered_servers().set(store.total() as i64);
                if removed > 0 {
                    info!(removed, "cleaned up stale server(s)");
                }
            }
        })
        .instrument(info_span!("reaper"))
    }
}
