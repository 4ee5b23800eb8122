//! Cloud-fleet scaling backend (§4.E.3): a generic `<cloud> instance-group
//! resize`-style command, parameterised so a concrete vendor CLI can be
//! substituted at deployment time without touching the scaling service.

use async_trait::async_trait;
use tracing::info;

use crate::backend::{BackendHealth, ScalingBackend, ScalingError, ScalingResult};
use crate::cli;

/// Command-template parameters for one cloud vendor's fleet-resize CLI.
#[derive(Debug, Clone)]
pub struct CloudFleetSpec {
    /// Vendor CLI binary, e.g. `"gcloud"`, `"aws"`.
    pub cli_binary: String,
    /// Subcommand words preceding the group name, e.g.
    /// `["compute", "instance-groups", "managed"]`.
    pub subcommand: Vec<String>,
    pub region: String,
}

pub struct CloudBackend {
    spec: CloudFleetSpec,
    max_replicas: u32,
}

impl CloudBackend {
    pub fn new(spec: CloudFleetSpec) -> Self {
        Self { spec, max_replicas: 50 }
    }

    pub fn with_max_replicas(mut self, max_replicas: u32) -> Self {
        self.max_replicas = max_replicas;
        self
    }

    fn group_name(&self, class: &str) -> String {
        format!("{class}-pool")
    }
}

#[async_trait]
impl ScalingBackend for CloudBackend {
    async fn list(&self, class: &str) -> ScalingResult<u32> {
        let group = self.group_name(class);
        let mut args: Vec<&str> = self.spec.subcommand.iter().map(String::as_str).collect();
        args.push("describe");
        args.push(&group);
        args.push("--region");
        args.push(&self.spec.region);
        args.push("--format=value(targetSize)");

        let out = cli::run(&self.spec.cli_binary, &args).await?;
        out.trim().parse().or(Ok(0))
    }

    async fn scale(&self, class: &str, target: u32) -> ScalingResult<u32> {
        if target > self.max_replicas {
            return Err(ScalingError::OutOfBounds { target, max_replicas: self.max_replicas });
        }

        let current = self.list(class).await?;
        if current != target {
            let group = self.group_name(class);
            let size = format!("--size={target}");
            let mut args: Vec<&str> = self.spec.subcommand.iter().map(String::as_str).collect();
            args.push("resize");
            args.push(&group);
            args.push("--region");
            args.push(&self.spec.region);
            args.push(&size);

            cli::run(&self.spec.cli_binary, &args).await?;
        }

        let observed = self.list(class).await?;
        info!(class, target, observed, "cloud backend applied scale");
        Ok(observed)
    }

    async fn health(&self) -> BackendHealth {
        match cli::run(&self.spec.cli_binary, &["version"]).await {
            Ok(_) => BackendHealth::Ok,
            Err(_) => BackendHealth::Degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_derives_from_class() {
        let backend = CloudBackend::new(CloudFleetSpec {
            cli_binary: "gcloud".to_string(),
            subcommand: vec!["compute".to_string(), "instance-groups".to_string(), "managed".to_string()],
            region: "us-central1".to_string(),
        });
        assert_eq!(backend.group_name("scraper"), "scraper-pool");
    }

    #[tokio::test]
    async fn scale_refuses_target_above_max_replicas() {
        let backend = CloudBackend::new(CloudFleetSpec {
            cli_binary: "gcloud".to_string(),
            subcommand: vec!["compute".to_string()],
            region: "us-central1".to_string(),
        })
        .with_max_replicas(2);

        let result = backend.scale("demo", 3).await;
        assert_eq!(result, Err(ScalingError::OutOfBounds { target: 3, max_replicas: 2 }));
    }
}
