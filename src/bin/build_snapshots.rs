use anyhow::{anyhow, Context};
use chrono::Utc;
use playlog_api::db::{self, PgMarkerStore, PgStore};
use playlog_api::snapshot::{Aggregator, SnapshotOutcome};
use playlog_api::store::Datastore;
use playlog_api::window::Period;

fn usage(program: &str) {
    eprintln!("Usage: {} all", program);
    eprintln!("       {} <day|week|month|year>", program);
    eprintln!("       {} <day|week|month|year|lifetime> <auth0_id>", program);
    eprintln!("       {} custom <auth0_id> <start> <end>", program);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("build_snapshots=info,playlog_api=info")
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
        return Err(anyhow!("Missing required argument: period"));
    }

    let pool = db::init_db().await.context("Failed to initialize database")?;
    let store = PgStore::new(pool.clone());
    let markers = PgMarkerStore::new(pool);
    let aggregator = Aggregator::new(&store, &markers);
    let now = Utc::now();

    // Scheduled bulk refresh: every user, rolling periods, no marker.
    if args.len() == 2 {
        let periods: Vec<Period> = if args[1] == "all" {
            Period::ROLLING.to_vec()
        } else {
            vec![args[1].parse()?]
        };
        for period in &periods {
            aggregator.build_all(period, now).await?;
        }
        return Ok(());
    }

    // On-demand path for a single user.
    let (period, auth0_id) = if args[1] == "custom" {
        if args.len() < 5 {
            usage(&args[0]);
            return Err(anyhow!("custom period needs <auth0_id> <start> <end>"));
        }
        let start = args[3].parse().context("Invalid start timestamp")?;
        let end = args[4].parse().context("Invalid end timestamp")?;
        (Period::Custom { start, end }, &args[2])
    } else {
        (args[1].parse()?, &args[2])
    };

    let user = store
        .user_by_auth0_id(auth0_id)
        .await?
        .with_context(|| format!("No user found for {}", auth0_id))?;

    match aggregator.get_or_build(user.user_id, &period, now).await? {
        SnapshotOutcome::Ready(view) => {
            let snapshot = &view.snapshot;
            tracing::info!(
                "Snapshot {} for {} [{} .. {}]: {} plays",
                snapshot.snapshot_id,
                period.range_type(),
                snapshot.range_start,
                snapshot.range_end,
                snapshot.total_plays
            );
            if let Some(top) = &view.top_song {
                tracing::info!("  most played: {} - {}", top.artist_name, top.track_name);
            }
            if let Some(binge) = &view.binge_song {
                tracing::info!(
                    "  longest binge: {} - {} ({} plays)",
                    binge.artist_name,
                    binge.track_name,
                    snapshot.binge_length
                );
            }
        }
        SnapshotOutcome::InProgress => {
            tracing::warn!("Snapshot computation already in progress, try again shortly");
        }
        SnapshotOutcome::NoData => {
            tracing::warn!("No play events recorded; nothing to snapshot");
        }
    }

    Ok(())
}
