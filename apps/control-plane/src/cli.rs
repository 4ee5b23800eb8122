//! Command-line surface for the control-plane binary, per the documented
//! autoscaler/orchestrator CLI: `--check-interval`, `--orchestrator
//! {container|cluster|cloud}`, `--class <name>`, `--metrics-url`,
//! `--store-url`, `--fallback-store-url`.

use clap::{Parser, ValueEnum};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OrchestratorKind {
    Container,
    Cluster,
    Cloud,
}

#[derive(Parser, Debug)]
#[command(
    name = "control-plane",
    about = "Autoscaler loop and orchestrator API for a distributed task-execution control plane"
)]
pub struct Cli {
    /// Seconds between autoscaler ticks.
    #[arg(long, default_value_t = 30)]
    pub check_interval: u64,

    /// Which scaling backend drives `scale`/`list` for every configured class.
    #[arg(long, value_enum, default_value_t = OrchestratorKind::Container)]
    pub orchestrator: OrchestratorKind,

    /// Worker class to manage; repeat for more than one.
    #[arg(long = "class", required = true)]
    pub classes: Vec<String>,

    /// Bind address for this binary's own `/health`, `/metrics`, and
    /// orchestrator admin routes (overrides `HOST`/`PORT`).
    #[arg(long)]
    pub metrics_url: Option<String>,

    /// Overrides `STORE_URL`.
    #[arg(long)]
    pub store_url: Option<String>,

    /// Overrides `STORE_FALLBACK_URL`.
    #[arg(long)]
    pub fallback_store_url: Option<String>,
}
