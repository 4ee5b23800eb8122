//! Container-API scaling backend (§4.E.1): a local container daemon driven
//! through the `docker` CLI rather than an embedded Docker Engine API
//! client.

use async_trait::async_trait;
use tracing::info;

use crate::backend::{BackendHealth, ScalingBackend, ScalingError, ScalingResult};
use crate::cli;

/// Environment passed to every container this backend starts for a class,
/// beyond the class-derived `--label`/image defaults.
#[derive(Debug, Clone)]
pub struct ContainerWorkerSpec {
    pub image: String,
    pub metrics_port: u16,
}

pub struct ContainerBackend {
    spec: ContainerWorkerSpec,
    max_replicas: u32,
    label_prefix: String,
}

impl ContainerBackend {
    pub fn new(spec: ContainerWorkerSpec) -> Self {
        Self { spec, max_replicas: 50, label_prefix: "queue.class".to_string() }
    }

    pub fn with_max_replicas(mut self, max_replicas: u32) -> Self {
        self.max_replicas = max_replicas;
        self
    }

    fn label_filter(&self, class: &str) -> String {
        format!("label={}={class}", self.label_prefix)
    }

    async fn running_ids(&self, class: &str) -> ScalingResult<Vec<String>> {
        let out = cli::run(
            "docker",
            &["ps", "--filter", &self.label_filter(class), "--filter", "status=running", "-q"],
        )
        .await?;
        Ok(out.lines().map(str::to_string).filter(|s| !s.is_empty()).collect())
    }

    async fn start_one(&self, class: &str) -> ScalingResult<()> {
        let label = format!("{}={class}", self.label_prefix);
        let metrics_port = self.spec.metrics_port.to_string();
        cli::run(
            "docker",
            &[
                "run",
                "-d",
                "--label",
                &label,
                "--env",
                &format!("WORKER_CLASS={class}"),
                "--env",
                &format!("METRICS_PORT={metrics_port}"),
                "-P",
                &self.spec.image,
            ],
        )
        .await?;
        Ok(())
    }

    async fn stop_one(&self, container_id: &str) -> ScalingResult<()> {
        cli::run("docker", &["stop", container_id]).await?;
        Ok(())
    }
}

#[async_trait]
impl ScalingBackend for ContainerBackend {
    async fn list(&self, class: &str) -> ScalingResult<u32> {
        Ok(self.running_ids(class).await?.len() as u32)
    }

    async fn scale(&self, class: &str, target: u32) -> ScalingResult<u32> {
        if target > self.max_replicas {
            return Err(ScalingError::OutOfBounds { target, max_replicas: self.max_replicas });
        }

        let running = self.running_ids(class).await?;
        let current = running.len() as u32;

        if target > current {
            for _ in 0..(target - current) {
                self.start_one(class).await?;
            }
        } else if target < current {
            for id in running.iter().take((current - target) as usize) {
                self.stop_one(id).await?;
            }
        }

        let observed = self.list(class).await?;
        info!(class, target, observed, "container backend applied scale");
        Ok(observed)
    }

    async fn health(&self) -> BackendHealth {
        match cli::run("docker", &["info", "--format", "{{.ServerVersion}}"]).await {
            Ok(_) => BackendHealth::Ok,
            Err(_) => BackendHealth::Degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_filter_uses_class_as_value() {
        let backend = ContainerBackend::new(ContainerWorkerSpec { image: "worker:latest".to_string(), metrics_port: 9100 });
        assert_eq!(backend.label_filter("scraper"), "label=queue.class=scraper");
    }

    #[tokio::test]
    async fn scale_refuses_target_above_max_replicas() {
        let backend = ContainerBackend::new(ContainerWorkerSpec { image: "worker:latest".to_string(), metrics_port: 9100 })
            .with_max_replicas(5);

        let result = backend.scale("demo", 6).await;
        assert_eq!(result, Err(ScalingError::OutOfBounds { target: 6, max_replicas: 5 }));
    }
}
