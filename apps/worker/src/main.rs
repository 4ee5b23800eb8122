#[tokio::main]
async fn main() -> eyre::Result<()> {
    worker::run().await
}
