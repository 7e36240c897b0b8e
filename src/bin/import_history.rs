use anyhow::{anyhow, Context};
use playlog_api::db::{self, PgStore};
use playlog_api::ingest::{self, LogProgress};
use playlog_api::spotify::SpotifyClient;
use playlog_api::store::Datastore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("import_history=info,playlog_api=info")
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <auth0_id> <export.json>", args[0]);
        eprintln!("  <auth0_id>    - Identity-provider subject of the target user");
        eprintln!("  <export.json> - Spotify extended streaming history export file");
        return Err(anyhow!("Missing required arguments"));
    }
    let auth0_id = &args[1];
    let path = &args[2];

    let pool = db::init_db().await.context("Failed to initialize database")?;
    let store = PgStore::new(pool);
    tracing::info!("Database connection established.");

    let user = store
        .user_by_auth0_id(auth0_id)
        .await?
        .with_context(|| format!("No user found for {}", auth0_id))?;

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read export file {}", path))?;
    let payload: serde_json::Value =
        serde_json::from_str(&raw).context("Export file is not valid JSON")?;
    let records = ingest::parse_export(&payload)?;
    tracing::info!("Parsed {} raw records from {}", records.len(), path);

    let api = SpotifyClient::new(
        std::env::var("SPOTIFY_CLIENT_ID").unwrap_or_default(),
        std::env::var("SPOTIFY_CLIENT_SECRET").unwrap_or_default(),
    );

    let summary = ingest::ingest_batch(&store, &api, user.user_id, &records, &LogProgress)
        .await
        .context("Batch ingestion failed")?;

    tracing::info!(
        "Import finished for {}: {} inserted, {} skipped, {} total",
        auth0_id,
        summary.inserted,
        summary.skipped,
        summary.total
    );

    Ok(())
}
