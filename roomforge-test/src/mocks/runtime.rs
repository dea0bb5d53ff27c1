use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;

use roomforge_core::{
    BuildContext, ContainerRuntime, ContainerState, ContainerSummary, ResourceSnapshot, RunSpec,
    RuntimeError, SystemSummary,
};

mock! {
    pub ContainerRuntime {}

    #[async_trait]
    impl ContainerRuntime for ContainerRuntime {
        async fn ping(&self) -> Result<(), RuntimeError>;

        async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

        async fn build_image(
            &self,
            tag: &str,
            context: BuildContext,
        ) -> Result<String, RuntimeError>;

        async fn run_container(&self, spec: RunSpec) -> Result<String, RuntimeError>;

        async fn container_state(
            &self,
            container_id: &str,
        ) -> Result<ContainerState, RuntimeError>;

        async fn container_stats(
            &self,
            container_id: &str,
        ) -> Result<ResourceSnapshot, RuntimeError>;

        async fn container_logs(
            &self,
            container_id: &str,
            tail: usize,
        ) -> Result<Vec<String>, RuntimeError>;

        async fn stop_container(
            &self,
            container_id: &str,
            timeout: Duration,
        ) -> Result<(), RuntimeError>;

        async fn remove_container(
            &self,
            container_id: &str,
            force: bool,
        ) -> Result<(), RuntimeError>;

        async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError>;

        async fn containers_with_label(
            &self,
            key: &str,
            value: &str,
        ) -> Result<Vec<ContainerSummary>, RuntimeError>;

        async fn used_host_ports(&self) -> Result<HashSet<u16>, RuntimeError>;

        async fn system_summary(&self) -> Result<SystemSummary, RuntimeError>;
    }
}

impl std::fmt::Debug for MockContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockContainerRuntime")
    }
}
