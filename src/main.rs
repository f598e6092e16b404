#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gemini_relay::run().await
}
