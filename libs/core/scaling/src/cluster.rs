//! Cluster-API scaling backend (§4.E.2): drives a deployment's replica
//! count through the `kubectl` CLI.

use async_trait::async_trait;
use tracing::info;

use crate::backend::{BackendHealth, ScalingBackend, ScalingError, ScalingResult};
use crate::cli;

pub struct ClusterBackend {
    namespace: String,
    max_replicas: u32,
}

impl ClusterBackend {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), max_replicas: 50 }
    }

    pub fn with_max_replicas(mut self, max_replicas: u32) -> Self {
        self.max_replicas = max_replicas;
        self
    }

    fn deployment(&self, class: &str) -> String {
        format!("deployment/{class}-worker")
    }
}

#[async_trait]
impl ScalingBackend for ClusterBackend {
    async fn list(&self, class: &str) -> ScalingResult<u32> {
        let out = cli::run(
            "kubectl",
            &["get", &self.deployment(class), "-n", &self.namespace, "-o", "jsonpath={.status.replicas}"],
        )
        .await?;
        out.trim().parse().or(Ok(0))
    }

    async fn scale(&self, class: &str, target: u32) -> ScalingResult<u32> {
        if target > self.max_replicas {
            return Err(ScalingError::OutOfBounds { target, max_replicas: self.max_replicas });
        }

        let current = self.list(class).await?;
        if current != target {
            cli::run(
                "kubectl",
                &["scale", &self.deployment(class), "-n", &self.namespace, &format!("--replicas={target}")],
            )
            .await?;
        }

        let observed = self.list(class).await?;
        info!(class, target, observed, "cluster backend applied scale");
        Ok(observed)
    }

    async fn health(&self) -> BackendHealth {
        match cli::run("kubectl", &["version", "--client", "-o", "json"]).await {
            Ok(_) => BackendHealth::Ok,
            Err(_) => BackendHealth::Degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_name_derives_from_class() {
        let backend = ClusterBackend::new("default");
        assert_eq!(backend.deployment("scraper"), "deployment/scraper-worker");
    }

    #[tokio::test]
    async fn scale_refuses_target_above_max_replicas() {
        let backend = ClusterBackend::new("default").with_max_replicas(3);
        let result = backend.scale("demo", 4).await;
        assert_eq!(result, Err(ScalingError::OutOfBounds { target: 4, max_replicas: 3 }));
    }
}
