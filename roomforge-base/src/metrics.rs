use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Router};
use prometheus::{
    labels, opts, register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Metric namespace prefix.
const NAMESPACE: &str = "roomforge";

macro_rules! namespaced {
    ($name:expr) => {
        format!("{NAMESPACE}_{}", $name)
    };
}

/// Prometheus metrics shared by an agent's components.
pub struct CoreMetrics {
    registry: Registry,
    listen_port: Option<u16>,

    uploads: IntCounterVec,
    instances: IntGaugeVec,
    tracked_containers: IntGauge,
    supervisor_stops: IntCounterVec,
    registered_servers: IntGauge,
    heartbeats: IntCounter,
    evictions: IntCounter,
}

impl std::fmt::Debug for CoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreMetrics")
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

impl CoreMetrics {
    /// Track metrics for a particular agent name.
    ///
    /// - `for_agent` name of the agent these metrics are tracking.
    /// - `listen_port` port to serve the metrics report on. If None the
    ///   server will not be started.
    /// - `registry` prometheus registry to attach the metrics to
    pub fn new(
        for_agent: &str,
        listen_port: Option<u16>,
        registry: Registry,
    ) -> prometheus::Result<Self> {
        let const_labels: HashMap<String, String> = labels! {
            "agent".into() => for_agent.into(),
        };
        let const_labels_ref = const_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<HashMap<_, _>>();

        let uploads = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("uploads_total"),
                "Uploads processed, by outcome",
                const_labels_ref
            ),
            &["outcome"],
            registry
        )?;

        let instances = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("instances"),
                "Managed game instances, by status",
                const_labels_ref
            ),
            &["status"],
            registry
        )?;

        let tracked_containers = register_int_gauge_with_registry!(
            opts!(
                namespaced!("tracked_containers"),
                "Containers registered with the supervisor",
                const_labels_ref
            ),
            registry
        )?;

        let supervisor_stops = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("supervisor_stops_total"),
                "Containers stopped by the supervisor, by reason",
                const_labels_ref
            ),
            &["reason"],
            registry
        )?;

        let registered_servers = register_int_gauge_with_registry!(
            opts!(
                namespaced!("registered_servers"),
                "Servers currently present in the matchmaker store",
                const_labels_ref
            ),
            registry
        )?;

        let heartbeats = register_int_counter_with_registry!(
            opts!(
                namespaced!("heartbeats_total"),
                "Heartbeats accepted by the matchmaker",
                const_labels_ref
            ),
            registry
        )?;

        let evictions = register_int_counter_with_registry!(
            opts!(
                namespaced!("evictions_total"),
                "Stale servers evicted by the reaper",
                const_labels_ref
            ),
            registry
        )?;

        Ok(Self {
            registry,
            listen_port,
            uploads,
            instances,
            tracked_containers,
            supervisor_stops,
            registered_servers,
            heartbeats,
            evictions,
        })
    }

    /// Upload counter for one outcome (`accepted`, `rejected`, `failed`).
    pub fn upload(&self, outcome: &str) {
        self.uploads.with_label_values(&[outcome]).inc();
    }

    /// Set the instance gauge for one status.
    pub fn set_instances(&self, status: &str, count: i64) {
        self.instances.with_label_values(&[status]).set(count);
    }

    /// Gauge of containers in the supervisor's activity table.
    pub fn tracked_containers(&self) -> &IntGauge {
        &self.tracked_containers
    }

    /// Count one supervisor stop with its reason.
    pub fn supervisor_stop(&self, reason: &str) {
        self.supervisor_stops.with_label_values(&[reason]).inc();
    }

    /// Gauge of registered matchmaker servers.
    pub fn registered_servers(&self) -> &IntGauge {
        &self.registered_servers
    }

    /// Counter of accepted heartbeats.
    pub fn heartbeats(&self) -> &IntCounter {
        &self.heartbeats
    }

    /// Counter of reaper evictions.
    pub fn evictions(&self) -> &IntCounter {
        &self.evictions
    }

    /// Gather available metrics into an encoded (plaintext) report.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }

    /// Run an HTTP server serving the metrics report on `/metrics`, if a
    /// listen port was configured.
    pub fn run_http_server(self: Arc<Self>) -> JoinHandle<()> {
        let Some(port) = self.listen_port else {
            return tokio::spawn(async {});
        };
        info!(port, "starting metrics server on 0.0.0.0");

        let server = self.clone();
        tokio::spawn(async move {
            let app = Router::new().route(
                "/metrics",
                get(move || {
                    let server = server.clone();
                    async move {
                        match server.gather() {
                            Ok(report) => (
                                StatusCode::OK,
                                [("Content-Type", "text/plain; charset=utf-8")],
                                report,
                            ),
                            Err(_) => (
                                StatusCode::INTERNAL_SERVER_ERROR,
                                [("Content-Type", "text/plain; charset=utf-8")],
                                b"failed to encode metrics".to_vec(),
                            ),
                        }
                    }
                }),
            );

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(err) = axum::serve(listener, app).await {
                        warn!(%err, "metrics server exited");
                    }
                }
                Err(err) => warn!(%err, port, "failed to bind metrics server"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_registered_metrics() {
        let metrics = CoreMetrics::new("test", None, Registry::new()).unwrap();
        metrics.upload("accepted");
        metrics.heartbeats().inc();
        let report = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(report.contains("roomforge_uploads_total"));
        assert!(report.contains("roomforge_heartbeats_total"));
    }
}
