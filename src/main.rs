#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pipa_rig_lib::run().await
}
