use clap::Parser;
use control_plane::cli::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    control_plane::run(cli).await
}
