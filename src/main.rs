use anyhow::Context;
use profile_geocoder::{init_tracing, run, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();
    let summary = run(&config)
        .await
        .with_context(|| format!("geocoding {} failed", config.input_path.display()))?;
    println!("\n{summary}");
    Ok(())
}
