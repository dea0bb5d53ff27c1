use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};

use roomforge_core::{
    BuildContext, ContainerRuntime, ContainerState, ContainerSummary, ResourceSnapshot, RunSpec,
    RuntimeError, SystemSummary, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

const MIB: f64 = 1024.0 * 1024.0;

/// A [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using the standard local defaults (unix socket or
    /// `DOCKER_HOST`). The connection is lazy; call
    /// [`ContainerRuntime::ping`] to verify the daemon is reachable.
    pub fn connect() -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn managed_filter() -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_owned(),
            vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")],
        );
        filters
    }
}

fn to_runtime_error(err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        bollard::errors::Error::IOError { err } => RuntimeError::Unavailable(err.to_string()),
        other => RuntimeError::Api(other.to_string()),
    }
}

fn tar_context(context: &BuildContext) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in context.files() {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, contents.as_slice())?;
    }
    builder.into_inner()
}

fn map_summary_state(state: Option<&str>) -> ContainerState {
    state.map(ContainerState::parse).unwrap_or(ContainerState::Unknown)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(network = name, "bridge network already exists");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let mut labels = HashMap::new();
                labels.insert(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned());
                self.client
                    .create_network(CreateNetworkOptions {
                        name: name.to_owned(),
                        driver: "bridge".to_owned(),
                        labels,
                        ..Default::default()
                    })
                    .await
                    .map_err(to_runtime_error)?;
                info!(network = name, "created bridge network");
                Ok(())
            }
            Err(err) => Err(to_runtime_error(err)),
        }
    }

    async fn build_image(&self, tag: &str, context: BuildContext) -> Result<String, RuntimeError> {
        let tarball = tar_context(&context)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_owned(),
            t: tag.to_owned(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut image_id = None;
        let mut stream =
            self.client
                .build_image(options, None, Some(bytes::Bytes::from(tarball)));
        while let Some(step) = stream.next().await {
            let info = step.map_err(|e| RuntimeError::Build(e.to_string()))?;
            if let Some(message) = info.error {
                return Err(RuntimeError::Build(message));
            }
            if let Some(line) = info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    debug!(tag, "build: {line}");
                }
            }
            if let Some(aux) = info.aux {
                if let Some(id) = aux.id {
                    image_id = Some(id);
                }
            }
        }

        match image_id {
            Some(id) => Ok(id),
            // Some daemons omit the aux record; fall back to an inspect.
            None => {
                let inspected = self
                    .client
                    .inspect_image(tag)
                    .await
                    .map_err(to_runtime_error)?;
                inspected
                    .id
                    .ok_or_else(|| RuntimeError::Build(format!("built image {tag} has no id")))
            }
        }
    }

    async fn run_container(&self, spec: RunSpec) -> Result<String, RuntimeError> {
        let exposed = format!("{}/tcp", spec.container_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            exposed.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_owned()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(exposed, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(match spec.restart_policy.as_str() {
                    "always" => RestartPolicyNameEnum::ALWAYS,
                    "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
                    _ => RestartPolicyNameEnum::UNLESS_STOPPED,
                }),
                maximum_retry_count: None,
            }),
            memory: spec.memory_limit_bytes,
            nano_cpus: spec.cpu_limit.map(|cores| (cores * 1e9) as i64),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>(),
            ),
            labels: Some(spec.labels.iter().cloned().collect::<HashMap<_, _>>()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(to_runtime_error)?;

        if let Err(err) = self
            .client
            .start_container::<String>(&created.id, None)
            .await
        {
            // Unwind the created-but-unstartable container.
            let _ = self
                .client
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(to_runtime_error(err));
        }

        Ok(created.id)
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState, RuntimeError> {
        let inspected = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(to_runtime_error)?;
        let status = inspected
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string());
        Ok(map_summary_state(status.as_deref()))
    }

    async fn container_stats(
        &self,
        container_id: &str,
    ) -> Result<ResourceSnapshot, RuntimeError> {
        let mut stream = self.client.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = match stream.next().await {
            Some(stats) => stats.map_err(to_runtime_error)?,
            None => return Ok(ResourceSnapshot::default()),
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let cores = stats
            .cpu_stats
            .online_cpus
            .unwrap_or_else(|| {
                stats
                    .cpu_stats
                    .cpu_usage
                    .percpu_usage
                    .as_ref()
                    .map(|v| v.len() as u64)
                    .unwrap_or(1)
            })
            .max(1);
        let cpu_percent = if system_delta > 0 && cpu_delta > 0 {
            (cpu_delta as f64 / system_delta as f64) * cores as f64 * 100.0
        } else {
            0.0
        };

        let memory_mb = stats.memory_stats.usage.unwrap_or(0) as f64 / MIB;
        let memory_limit_mb = stats.memory_stats.limit.unwrap_or(0) as f64 / MIB;

        let (mut rx, mut tx) = (0u64, 0u64);
        if let Some(networks) = &stats.networks {
            for interface in networks.values() {
                rx += interface.rx_bytes;
                tx += interface.tx_bytes;
            }
        }

        Ok(ResourceSnapshot {
            cpu_percent: (cpu_percent * 100.0).round() / 100.0,
            memory_mb: (memory_mb * 100.0).round() / 100.0,
            memory_limit_mb: (memory_limit_mb * 100.0).round() / 100.0,
            network_rx_mb: (rx as f64 / MIB * 100.0).round() / 100.0,
            network_tx_mb: (tx as f64 / MIB * 100.0).round() / 100.0,
        })
    }

    async fn container_logs(
        &self,
        container_id: &str,
        tail: usize,
    ) -> Result<Vec<String>, RuntimeError> {
        let mut stream = self.client.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                timestamps: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let output = chunk.map_err(to_runtime_error)?;
            for line in output.to_string().lines() {
                let line = line.trim_end();
                if !line.is_empty() {
                    lines.push(line.to_owned());
                }
            }
        }
        Ok(lines)
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        self.client
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
            .map_err(to_runtime_error)
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError> {
        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(to_runtime_error)
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        self.client
            .remove_image(
                tag,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map(|_| ())
            .map_err(to_runtime_error)
    }

    async fn containers_with_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_owned(), vec![format!("{key}={value}")]);
        let listed = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(to_runtime_error)?;

        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                state: map_summary_state(c.state.as_deref()),
                labels: c.labels.unwrap_or_default(),
                host_ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.public_port)
                    .filter_map(|p| u16::try_from(p).ok())
                    .collect(),
            })
            .collect())
    }

    async fn used_host_ports(&self) -> Result<HashSet<u16>, RuntimeError> {
        let managed = self
            .containers_with_label(MANAGED_BY_LABEL, MANAGED_BY_VALUE)
            .await?;
        Ok(managed
            .into_iter()
            .flat_map(|c| c.host_ports)
            .collect())
    }

    async fn system_summary(&self) -> Result<SystemSummary, RuntimeError> {
        let version = self
            .client
            .version()
            .await
            .map_err(to_runtime_error)?
            .version
            .unwrap_or_else(|| "unknown".to_owned());

        let all = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(to_runtime_error)?;

        let managed = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Self::managed_filter(),
                ..Default::default()
            }))
            .await
            .map_err(to_runtime_error)?;

        let running = managed
            .iter()
            .filter(|c| map_summary_state(c.state.as_deref()).is_running())
            .count();

        Ok(SystemSummary {
            runtime_version: version,
            total_containers: all.len(),
            game_containers: managed.len(),
            running_game_containers: running,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_context_round_trips_entries() {
        let mut context = BuildContext::new();
        context.add_file("Dockerfile", b"FROM node:16-alpine\n".to_vec());
        context.add_file("server.js", b"console.log('up');\n".to_vec());

        let tarball = tar_context(&context).unwrap();
        let mut archive = tar::Archive::new(tarball.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile", "server.js"]);
    }

    #[test]
    fn summary_state_parses_docker_strings() {
        assert_eq!(map_summary_state(Some("running")), ContainerState::Running);
        assert_eq!(map_summary_state(Some("exited")), ContainerState::Exited);
        assert_eq!(map_summary_state(None), ContainerState::Unknown);
    }
}
