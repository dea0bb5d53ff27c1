//! The factory-side instance registry: the authoritative map of managed
//! game instances and its projection to HTTP.
//!
//! Reads refresh each instance against the runtime (status, stats, log
//! tail); supervisor events are consumed here and translated into status
//! transitions, so the supervisor never reaches back into this map.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use eyre::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, instrument::Instrumented, Instrument};

use roomforge_core::{ContainerRuntime, ContainerState, GameInstance, InstanceStatus};

use crate::supervisor::SupervisorEvent;

/// Internally recorded log lines kept ahead of the container tail in
/// merged projections.
const INTERNAL_LOG_HEAD: usize = 10;
/// Container log lines fetched during a detail refresh.
const REFRESH_LOG_TAIL: usize = 50;

/// Derive an instance id from its display name and upload ordinal.
fn derive_instance_id(name: &str, description: &str, ordinal: u64) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    description.hash(&mut hasher);
    let user_tag = hasher.finish() % 10_000;
    let slug = name.trim().to_lowercase().replace(' ', "_");
    format!("user_{user_tag}_{slug}_{ordinal:03}")
}

/// The instance map plus the monotonic upload counter.
#[derive(Debug)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<String, GameInstance>>,
    uploads: AtomicU64,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl InstanceRegistry {
    /// A registry refreshing against `runtime` when one is available.
    pub fn new(runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            uploads: AtomicU64::new(0),
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, GameInstance>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mint the id for the next upload.
    pub fn next_instance_id(&self, name: &str, description: &str) -> String {
        let ordinal = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        derive_instance_id(name, description, ordinal)
    }

    /// Insert a freshly created instance.
    pub fn insert(&self, instance: GameInstance) {
        self.lock().insert(instance.server_id.clone(), instance);
    }

    /// Number of managed instances.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether an instance exists.
    pub fn contains(&self, instance_id: &str) -> bool {
        self.lock().contains_key(instance_id)
    }

    /// A plain (un-refreshed) snapshot of one instance.
    pub fn get(&self, instance_id: &str) -> Option<GameInstance> {
        self.lock().get(instance_id).cloned()
    }

    /// Mutate one instance in place; returns whether it existed.
    pub fn update<F: FnOnce(&mut GameInstance)>(&self, instance_id: &str, mutate: F) -> bool {
        let mut instances = self.lock();
        match instances.get_mut(instance_id) {
            Some(instance) => {
                mutate(instance);
                instance.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove an instance from the map.
    pub fn remove(&self, instance_id: &str) -> Option<GameInstance> {
        self.lock().remove(instance_id)
    }

    /// All instances, each refreshed against the runtime.
    pub async fn list_refreshed(&self) -> Vec<GameInstance> {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        let mut listed = Vec::with_capacity(ids.len());
        for id in ids {
            self.refresh_status(&id).await;
            if let Some(instance) = self.get(&id) {
                listed.push(instance);
            }
        }
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        listed
    }

    /// One instance, refreshed, with the container log tail merged after
    /// the first internally recorded lines.
    pub async fn get_refreshed(&self, instance_id: &str) -> Option<GameInstance> {
        if !self.contains(instance_id) {
            return None;
        }
        self.refresh_status(instance_id).await;

        let mut instance = self.get(instance_id)?;
        if let (Some(runtime), Some(container_id)) = (&self.runtime, &instance.container_id) {
            if let Ok(lines) = runtime.container_logs(container_id, REFRESH_LOG_TAIL).await {
                let mut merged: Vec<String> =
                    instance.logs.iter().take(INTERNAL_LOG_HEAD).cloned().collect();
                merged.extend(lines);
                instance.logs = merged;
            }
        }
        Some(instance)
    }

    /// Merged logs for the logs endpoint, trimmed to the last `tail`
    /// lines.
    pub async fn merged_logs(&self, instance_id: &str, tail: usize) -> Option<Vec<String>> {
        let instance = self.get(instance_id)?;
        let mut logs = instance.logs.clone();
        if let (Some(runtime), Some(container_id)) = (&self.runtime, &instance.container_id) {
            if let Ok(lines) = runtime.container_logs(container_id, tail).await {
                logs.extend(lines.into_iter().map(|line| format!("[container] {line}")));
            }
        }
        if logs.len() > tail {
            logs.drain(..logs.len() - tail);
        }
        Some(logs)
    }

    /// Query the runtime for an instance's container and fold the result
    /// back into its status, stats and log buffer.
    async fn refresh_status(&self, instance_id: &str) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let Some(container_id) = self.get(instance_id).and_then(|i| i.container_id) else {
            return;
        };

        match runtime.container_state(&container_id).await {
            Ok(state) => {
                let stats = if state.is_running() {
                    runtime.container_stats(&container_id).await.ok()
                } else {
                    None
                };
                self.update(instance_id, |instance| {
                    match state {
                        ContainerState::Running => instance.status = InstanceStatus::Running,
                        ContainerState::Exited => instance.status = InstanceStatus::Stopped,
                        // Transitional states leave the recorded status as is.
                        _ => {}
                    }
                    if let Some(stats) = stats {
                        instance.resource_usage = stats;
                    }
                });
            }
            Err(err) if err.is_not_found() => {
                self.update(instance_id, |instance| {
                    instance.status = InstanceStatus::Error;
                    instance.push_log(format!(
                        "container missing or removed: {}",
                        Utc::now().to_rfc3339()
                    ));
                });
            }
            Err(err) => {
                error!(instance_id, %err, "status refresh failed");
            }
        }
    }

    /// Instances currently marked running.
    pub fn running_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|i| i.status == InstanceStatus::Running)
            .count()
    }
}

/// Consume supervisor events and apply the corresponding status
/// transitions.
pub fn run_event_loop(
    registry: Arc<InstanceRegistry>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) -> Instrumented<JoinHandle<Result<()>>> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SupervisorEvent::Stopped {
                    instance_id,
                    reason,
                } => {
                    info!(instance_id, reason, "container stopped by supervisor");
                    registry.update(&instance_id, |instance| {
                        instance.status = InstanceStatus::Stopped;
                        instance.push_log(format!(
                            "container stopped ({reason}): {}",
                            Utc::now().to_rfc3339()
                        ));
                    });
                }
                SupervisorEvent::Errored {
                    instance_id,
                    reason,
                    ..
                } => {
                    error!(instance_id, reason, "container error reported by supervisor");
                    registry.update(&instance_id, |instance| {
                        instance.status = InstanceStatus::Error;
                        instance.push_log(format!(
                            "container error: {reason}: {}",
                            Utc::now().to_rfc3339()
                        ));
                    });
                }
            }
        }
        Ok(())
    })
    .instrument(info_span!("supervisor_events"))
}

#[cfg(test)]
mod tests {
    use roomforge_core::ResourceSnapshot;
    use roomforge_test::MockContainerRuntime;

    use super::*;

    fn instance(id: &str) -> GameInstance {
        GameInstance::new(id.to_owned(), "Game".to_owned(), "d".to_owned(), 10)
    }

    #[test]
    fn instance_ids_follow_the_derivation_scheme() {
        let registry = InstanceRegistry::new(None);
        let first = registry.next_instance_id("Game", "d");
        let second = registry.next_instance_id("Game", "d");

        let re = regex::Regex::new(r"^user_[0-9]+_game_001$").unwrap();
        assert!(re.is_match(&first), "id was {first}");
        assert!(second.ends_with("_002"));
    }

    #[test]
    fn ids_slug_spaces_and_case() {
        let id = derive_instance_id("My Cool Game", "d", 7);
        assert!(id.contains("_my_cool_game_007"), "id was {id}");
    }

    #[tokio::test]
    async fn refresh_maps_runtime_states() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_container_state()
            .returning(|id| match id {
                "container-running" => Ok(ContainerState::Running),
                "container-exited" => Ok(ContainerState::Exited),
                other => Err(roomforge_core::RuntimeError::NotFound(other.to_owned())),
            });
        runtime
            .expect_container_stats()
            .returning(|_| {
                Ok(ResourceSnapshot {
                    cpu_percent: 12.0,
                    ..Default::default()
                })
            });

        let registry = InstanceRegistry::new(Some(Arc::new(runtime)));
        for (id, container) in [
            ("a", "container-running"),
            ("b", "container-exited"),
            ("c", "container-gone"),
        ] {
            let mut inst = instance(id);
            inst.container_id = Some(container.to_owned());
            inst.status = InstanceStatus::Running;
            registry.insert(inst);
        }

        let listed = registry.list_refreshed().await;
        let by_id: HashMap<String, GameInstance> = listed
            .into_iter()
            .map(|i| (i.server_id.clone(), i))
            .collect();
        assert_eq!(by_id["a"].status, InstanceStatus::Running);
        assert!((by_id["a"].resource_usage.cpu_percent - 12.0).abs() < f64::EPSILON);
        assert_eq!(by_id["b"].status, InstanceStatus::Stopped);
        assert_eq!(by_id["c"].status, InstanceStatus::Error);
        assert!(by_id["c"].logs.iter().any(|l| l.contains("missing")));
    }

    #[tokio::test]
    async fn merged_logs_keep_internal_head_and_respect_tail() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_container_logs().returning(|_, _| {
            Ok(vec!["line one".to_owned(), "line two".to_owned()])
        });

        let registry = InstanceRegistry::new(Some(Arc::new(runtime)));
        let mut inst = instance("a");
        inst.container_id = Some("container-a".to_owned());
        inst.push_log("upload accepted");
        registry.insert(inst);

        let logs = registry.merged_logs("a", 100).await.unwrap();
        assert_eq!(logs[0], "upload accepted");
        assert!(logs[1..].iter().all(|l| l.starts_with("[container] ")));

        let trimmed = registry.merged_logs("a", 2).await.unwrap();
        assert_eq!(trimmed.len(), 2);
    }

    #[tokio::test]
    async fn event_loop_translates_events_into_status() {
        let registry = Arc::new(InstanceRegistry::new(None));
        let mut inst = instance("a");
        inst.status = InstanceStatus::Running;
        registry.insert(inst);

        let (tx, rx) = mpsc::unbounded_channel();
        let _task = run_event_loop(registry.clone(), rx);

        tx.send(SupervisorEvent::Stopped {
            instance_id: "a".to_owned(),
            reason: "idle_timeout".to_owned(),
        })
        .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let stopped = registry.get("a").unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert!(stopped.logs.iter().any(|l| l.contains("idle_timeout")));

        tx.send(SupervisorEvent::Errored {
            instance_id: "a".to_owned(),
            container_id: "container-a".to_owned(),
            reason: "exit 137".to_owned(),
        })
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(registry.get("a").unwrap().status, InstanceStatus::Error);
    }
}
