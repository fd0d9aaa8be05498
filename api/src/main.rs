#[tokio::main]
async fn main() -> anyhow::Result<()> {
    listening_api::run().await
}
