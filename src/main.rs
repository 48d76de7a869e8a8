#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trackhaul_lib::run().await
}
