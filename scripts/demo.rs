// Script to demonstrate how feature store data is available to the developer
// Run with: cargo run --bin demo

use anyhow::Context;
use feature_store_db::config::load_env_file;
use feature_store_db::feature_store_engine;
use tracing_subscriber::EnvFilter;

const ENV_FILE: &str = "./.env.dev";

const LOCATION_QUERY: &str = r#"
SELECT TOP (10) [horizon_datetime]
      ,[csn]
      ,[location_admission_datetime]
      ,[hl7_location]
      ,[log_datetime]
  FROM [dbo].[location_v1]
  ORDER BY [dbo].[location_v1].[horizon_datetime] DESC
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    load_env_file(ENV_FILE)?;
    let engine = feature_store_engine().context("Failed to create feature store engine")?;

    let table = engine
        .read_table(LOCATION_QUERY)
        .await
        .context("Failed to query location_v1")?;

    tracing::info!(rows = table.len(), "Read location_v1");
    print!("{}", table.head(5));

    Ok(())
}
