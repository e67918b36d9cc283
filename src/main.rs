#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = insightgrader_rust::run().await {
        eprintln!("insightgrader-rust fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
