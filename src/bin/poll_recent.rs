use anyhow::Context;
use playlog_api::db::{self, PgStore};
use playlog_api::ingest::{self, NullProgress};
use playlog_api::spotify::SpotifyClient;
use playlog_api::store::Datastore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("poll_recent=info,playlog_api=info")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let auth0_id: Option<&String> = args.get(1);

    let pool = db::init_db().await.context("Failed to initialize database")?;
    let store = PgStore::new(pool);

    let api = SpotifyClient::new(
        std::env::var("SPOTIFY_CLIENT_ID").unwrap_or_default(),
        std::env::var("SPOTIFY_CLIENT_SECRET").unwrap_or_default(),
    );

    let user_ids = match auth0_id {
        Some(auth0_id) => {
            let user = store
                .user_by_auth0_id(auth0_id)
                .await?
                .with_context(|| format!("No user found for {}", auth0_id))?;
            vec![user.user_id]
        }
        None => store.all_user_ids().await?,
    };

    tracing::info!("Polling recently played for {} user(s)", user_ids.len());

    let mut failures = 0;
    for user_id in user_ids {
        match ingest::poll_recent(&store, &api, user_id, &NullProgress).await {
            Ok(summary) => {
                tracing::info!(
                    "User {}: {} inserted, {} skipped",
                    user_id,
                    summary.inserted,
                    summary.skipped
                );
            }
            Err(err) => {
                // One user's broken credentials must not stop the sweep.
                tracing::error!("Poll failed for user {}: {}", user_id, err);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} poll cycle(s) failed", failures);
    }
    Ok(())
}
