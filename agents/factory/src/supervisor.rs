//! Container supervision: activity tracking, idle detection, error-budget
//! enforcement and orderly teardown.
//!
//! The supervisor owns the activity table. One background loop ticks every
//! cleanup interval; each tick refreshes stats, detects exited containers,
//! stops idle ones and retires those whose error budget is spent. Lifecycle
//! outcomes flow to the instance registry as [`SupervisorEvent`]s over a
//! channel, so the supervisor never holds a reference back into the
//! registry. The table lock is never held across a runtime call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, warn, Instrument};

use roomforge_base::CoreMetrics;
use roomforge_core::{ContainerActivity, ContainerRuntime, ContainerState, INSTANCE_ID_LABEL};

use crate::build::image_tag_for;

/// Reason string reported when the idle reaper stops a container.
pub const IDLE_STOP_REASON: &str = "idle_timeout";

/// Lifecycle outcomes the supervisor reports to the instance registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A container was stopped by the supervisor.
    Stopped {
        /// Owning instance.
        instance_id: String,
        /// Why it was stopped, e.g. [`IDLE_STOP_REASON`].
        reason: String,
    },
    /// A container failed (exited, vanished, or exhausted its error
    /// budget).
    Errored {
        /// Owning instance.
        instance_id: String,
        /// The failed container.
        container_id: String,
        /// Description of the failure.
        reason: String,
    },
}

/// Ceilings and windows the supervisor enforces.
#[derive(Debug, Clone)]
pub struct SupervisorLimits {
    /// Hard ceiling on tracked containers.
    pub max_containers: usize,
    /// Idle window; strictly exceeding it with zero connections stops the
    /// container.
    pub idle_timeout: Duration,
    /// Errors tolerated before a container is retired.
    pub max_error_count: u32,
    /// Grace given to a container on stop before force removal.
    pub stop_timeout: Duration,
}

/// Aggregate view over the activity table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SupervisorStats {
    /// When this snapshot was taken.
    pub timestamp: String,
    /// Tracked containers.
    pub total_containers: usize,
    /// Currently idle containers.
    pub idle_containers: usize,
    /// Containers past the error budget.
    pub error_containers: usize,
    /// The admission ceiling.
    pub max_containers: usize,
    /// Summed CPU usage, percent.
    pub total_cpu_usage: f64,
    /// Summed memory usage, MiB.
    pub total_memory_usage_mb: f64,
    /// Configured idle window, seconds.
    pub idle_timeout_seconds: u64,
    /// Whether the background loop is running.
    pub monitoring_active: bool,
}

/// The container supervisor. See the module docs for the lifecycle.
#[derive(Debug)]
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    limits: SupervisorLimits,
    activities: Mutex<HashMap<String, ContainerActivity>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    metrics: Arc<CoreMetrics>,
}

impl Supervisor {
    /// Create a supervisor and the event stream its consumer reads.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        limits: SupervisorLimits,
        metrics: Arc<CoreMetrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                runtime,
                limits,
                activities: Mutex::new(HashMap::new()),
                events,
                metrics,
            }),
            receiver,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ContainerActivity>> {
        self.activities.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SupervisorEvent) {
        // The receiver lives as long as the factory; a send failure only
        // happens during shutdown.
        let _ = self.events.send(event);
    }

    /// Whether a new container may be admitted, with the refusal reason.
    pub fn can_create(&self) -> (bool, String) {
        let current = self.lock().len();
        if current >= self.limits.max_containers {
            return (
                false,
                format!(
                    "maximum container limit reached ({})",
                    self.limits.max_containers
                ),
            );
        }
        (true, "container can be created".to_owned())
    }

    /// Start tracking a launched container.
    pub fn register(&self, instance_id: &str, container_id: &str) {
        let mut activities = self.lock();
        activities.insert(
            instance_id.to_owned(),
            ContainerActivity::new(instance_id.to_owned(), container_id.to_owned()),
        );
        self.metrics
            .tracked_containers()
            .set(activities.len() as i64);
        info!(instance_id, container_id, "container registered with supervisor");
    }

    /// Stop tracking an instance; returns whether it was tracked.
    pub fn unregister(&self, instance_id: &str) -> bool {
        let mut activities = self.lock();
        let removed = activities.remove(instance_id).is_some();
        self.metrics
            .tracked_containers()
            .set(activities.len() as i64);
        if removed {
            info!(instance_id, "container unregistered from supervisor");
        }
        removed
    }

    /// Record a heartbeat: refresh the activity timestamp, set the
    /// connection count and clear the idle/notified marks.
    pub fn update_activity(&self, instance_id: &str, connection_count: u32) -> bool {
        let mut activities = self.lock();
        let Some(activity) = activities.get_mut(instance_id) else {
            return false;
        };
        activity.last_activity = Utc::now();
        activity.connection_count = connection_count;
        activity.is_idle = false;
        activity.notified = false;
        true
    }

    /// Count an error against an instance's budget. No events fire here.
    pub fn record_error(&self, instance_id: &str, message: impl Into<String>) {
        let mut activities = self.lock();
        if let Some(activity) = activities.get_mut(instance_id) {
            activity.error_count += 1;
            let message = message.into();
            warn!(
                instance_id,
                error_count = activity.error_count,
                message, "container error recorded",
            );
            activity.last_error = Some(message);
        }
    }

    /// Snapshot of one activity row.
    pub fn activity(&self, instance_id: &str) -> Option<ContainerActivity> {
        self.lock().get(instance_id).cloned()
    }

    /// Number of tracked containers.
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn idle_activities_at(&self, now: DateTime<Utc>) -> Vec<ContainerActivity> {
        let idle_timeout =
            chrono::Duration::from_std(self.limits.idle_timeout).unwrap_or(chrono::Duration::MAX);
        let mut activities = self.lock();
        let mut idle = Vec::new();
        for activity in activities.values_mut() {
            // Strict comparison: exactly at the timeout is not yet idle.
            if now - activity.last_activity > idle_timeout && activity.connection_count == 0 {
                activity.is_idle = true;
                idle.push(activity.clone());
            }
        }
        idle
    }

    /// Containers idle past the timeout with no connections.
    pub fn idle_activities(&self) -> Vec<ContainerActivity> {
        self.idle_activities_at(Utc::now())
    }

    /// Containers whose error budget is spent.
    pub fn error_activities(&self) -> Vec<ContainerActivity> {
        self.lock()
            .values()
            .filter(|a| a.error_count >= self.limits.max_error_count)
            .cloned()
            .collect()
    }

    /// Mark an instance notified; returns false when it already was (or is
    /// no longer tracked), so each error run fires exactly one event.
    fn mark_notified(&self, instance_id: &str) -> bool {
        let mut activities = self.lock();
        match activities.get_mut(instance_id) {
            Some(activity) if !activity.notified => {
                activity.notified = true;
                true
            }
            _ => false,
        }
    }

    /// Aggregate stats for the resource endpoints.
    pub fn stats(&self) -> SupervisorStats {
        let idle = self.idle_activities().len();
        let activities = self.lock();
        let error = activities
            .values()
            .filter(|a| a.error_count >= self.limits.max_error_count)
            .count();
        SupervisorStats {
            timestamp: Utc::now().to_rfc3339(),
            total_containers: activities.len(),
            idle_containers: idle,
            error_containers: error,
            max_containers: self.limits.max_containers,
            total_cpu_usage: activities.values().map(|a| a.cpu_percent).sum(),
            total_memory_usage_mb: activities.values().map(|a| a.memory_mb).sum(),
            idle_timeout_seconds: self.limits.idle_timeout.as_secs(),
            monitoring_active: true,
        }
    }

    /// One supervision pass: refresh stats, report exited containers, stop
    /// idle ones, retire those past the error budget. Order matters and no
    /// two ticks run concurrently (single loop task).
    pub async fn tick(&self) {
        // 1. Stats refresh. Snapshot under the lock, talk to the runtime
        //    without it, reacquire to mutate.
        let tracked: Vec<(String, String)> = self
            .lock()
            .values()
            .map(|a| (a.instance_id.clone(), a.container_id.clone()))
            .collect();

        let mut exited: Vec<(String, String, String)> = Vec::new();
        for (instance_id, container_id) in &tracked {
            match self.runtime.container_state(container_id).await {
                Ok(state) if state.is_running() => {
                    match self.runtime.container_stats(container_id).await {
                        Ok(stats) => {
                            let mut activities = self.lock();
                            if let Some(activity) = activities.get_mut(instance_id) {
                                activity.cpu_percent = stats.cpu_percent;
                                activity.memory_mb = stats.memory_mb;
                            }
                        }
                        Err(err) => {
                            self.record_error(instance_id, format!("stats query failed: {err}"))
                        }
                    }
                }
                Ok(state) => {
                    self.record_error(instance_id, format!("container state is {state}"));
                    if state == ContainerState::Exited {
                        let last_log = self
                            .runtime
                            .container_logs(container_id, 10)
                            .await
                            .ok()
                            .and_then(|lines| lines.last().cloned())
                            .unwrap_or_else(|| "none".to_owned());
                        exited.push((
                            instance_id.clone(),
                            container_id.clone(),
                            format!("container exited, last log: {last_log}"),
                        ));
                    }
                }
                Err(err) if err.is_not_found() => {
                    self.record_error(instance_id, "container no longer exists");
                    exited.push((
                        instance_id.clone(),
                        container_id.clone(),
                        "container was removed externally".to_owned(),
                    ));
                }
                Err(err) => {
                    self.record_error(instance_id, format!("state query failed: {err}"));
                }
            }
        }

        // 2. Report exited/vanished containers. The rows stay in the table;
        //    the user-level delete path owns removal.
        for (instance_id, container_id, reason) in exited {
            if self.mark_notified(&instance_id) {
                self.emit(SupervisorEvent::Errored {
                    instance_id,
                    container_id,
                    reason,
                });
            }
        }

        // 3. Stop idle containers.
        for activity in self.idle_activities() {
            info!(
                instance_id = activity.instance_id,
                idle_timeout = self.limits.idle_timeout.as_secs(),
                "stopping idle container",
            );
            match self
                .runtime
                .stop_container(&activity.container_id, self.limits.stop_timeout)
                .await
            {
                Ok(()) => {
                    self.metrics.supervisor_stop(IDLE_STOP_REASON);
                    self.emit(SupervisorEvent::Stopped {
                        instance_id: activity.instance_id,
                        reason: IDLE_STOP_REASON.to_owned(),
                    });
                }
                Err(err) => {
                    warn!(instance_id = activity.instance_id, %err, "failed to stop idle container")
                }
            }
        }

        // 4. Retire containers past the error budget.
        for activity in self.error_activities() {
            if activity.notified {
                continue;
            }
            info!(
                instance_id = activity.instance_id,
                error_count = activity.error_count,
                "stopping container over error budget",
            );
            if let Err(err) = self
                .runtime
                .stop_container(&activity.container_id, self.limits.stop_timeout)
                .await
            {
                warn!(instance_id = activity.instance_id, %err, "failed to stop error container");
            }
            if self.mark_notified(&activity.instance_id) {
                self.metrics.supervisor_stop("error");
                self.emit(SupervisorEvent::Errored {
                    instance_id: activity.instance_id.clone(),
                    container_id: activity.container_id.clone(),
                    reason: activity
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "error budget exhausted".to_owned()),
                });
            }
        }
    }

    /// Stop the container, delete every runtime resource belonging to the
    /// instance (containers and image), and drop the activity row. True
    /// iff the instance was tracked and all runtime operations succeeded.
    pub async fn force_cleanup(&self, instance_id: &str) -> bool {
        let Some(activity) = self.activity(instance_id) else {
            return false;
        };

        let mut ok = true;

        if let Err(err) = self
            .runtime
            .stop_container(&activity.container_id, self.limits.stop_timeout)
            .await
        {
            if !err.is_not_found() {
                warn!(instance_id, %err, "force cleanup: stop failed");
                ok = false;
            }
        }

        match self
            .runtime
            .containers_with_label(INSTANCE_ID_LABEL, instance_id)
            .await
        {
            Ok(containers) => {
                for container in containers {
                    if container.state.is_running() {
                        if let Err(err) = self
                            .runtime
                            .stop_container(&container.id, self.limits.stop_timeout)
                            .await
                        {
                            if !err.is_not_found() {
                                warn!(instance_id, %err, "force cleanup: stop failed");
                                ok = false;
                            }
                        }
                    }
                    if let Err(err) = self.runtime.remove_container(&container.id, true).await {
                        if !err.is_not_found() {
                            warn!(instance_id, %err, "force cleanup: remove failed");
                            ok = false;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(instance_id, %err, "force cleanup: listing failed");
                ok = false;
            }
        }

        if let Err(err) = self.runtime.remove_image(&image_tag_for(instance_id)).await {
            if !err.is_not_found() {
                warn!(instance_id, %err, "force cleanup: image removal failed");
                ok = false;
            }
        }

        self.unregister(instance_id);
        info!(instance_id, ok, "force cleanup finished");
        ok
    }

    /// Run the supervision loop with the given tick period.
    pub fn run(self: Arc<Self>, interval: Duration) -> Instrumented<JoinHandle<Result<()>>> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
        .instrument(info_span!("supervisor"))
    }
}
