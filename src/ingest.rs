//! Ingestion pipeline: raw play-event records (bulk export files or the
//! recently-played poll) -> canonical, deduplicated usage-log rows.
//!
//! One bad record never aborts a batch; it is skipped and counted. Only
//! structural problems (input not a list, unknown user, missing credentials)
//! fail the whole batch. Re-ingesting a batch is safe: deduplication keys on
//! (user, event timestamp).

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogResolver, Resolution};
use crate::models::{NewPlayEvent, SpotifyTokens};
use crate::retry::RetryPolicy;
use crate::spotify::{ApiError, CatalogApi};
use crate::store::Datastore;

/// One raw event as it appears in a Spotify extended-streaming-history
/// export. Only `ts` and `spotify_track_uri` are required; everything else
/// is stored as-is or null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPlayRecord {
    pub ts: Option<String>,
    pub spotify_track_uri: Option<String>,
    pub ms_played: Option<i32>,
    pub platform: Option<String>,
    pub conn_country: Option<String>,
    pub ip_addr: Option<String>,
    pub episode_name: Option<String>,
    pub episode_show_name: Option<String>,
    pub reason_start: Option<String>,
    pub reason_end: Option<String>,
    pub shuffle: Option<bool>,
    pub skipped: Option<bool>,
    pub offline: Option<bool>,
    pub incognito_mode: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub total: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Observable side channel for long batches. Reporting is best-effort and
/// has no bearing on correctness.
pub trait ProgressSink: Send + Sync {
    fn report(&self, processed: usize, total: usize);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _processed: usize, _total: usize) {}
}

/// Logs progress through tracing, for job runs driven from a binary.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, processed: usize, total: usize) {
        tracing::info!("ingested {}/{} records", processed, total);
    }
}

/// Parse an uploaded export payload. The payload must be a JSON list;
/// anything else is a batch-level failure. Elements that are not objects
/// still yield a record (with no fields set) so they are counted as skips,
/// not errors.
pub fn parse_export(payload: &serde_json::Value) -> Result<Vec<RawPlayRecord>> {
    let items = match payload.as_array() {
        Some(items) => items,
        None => bail!("uploaded payload is not a JSON list"),
    };
    Ok(items
        .iter()
        .map(|item| serde_json::from_value(item.clone()).unwrap_or_default())
        .collect())
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Run the per-record pipeline over a batch: validate timestamp,
/// deduplicate, resolve the track, insert. Records are processed in input
/// order; final state is order-independent.
pub async fn ingest_batch<S: Datastore, C: CatalogApi>(
    store: &S,
    api: &C,
    user_id: i64,
    records: &[RawPlayRecord],
    progress: &dyn ProgressSink,
) -> Result<IngestSummary> {
    if !store.user_exists(user_id).await? {
        bail!("user {} not found", user_id);
    }

    let resolver = CatalogResolver::new(store, api);
    let mut summary = IngestSummary {
        total: records.len(),
        ..IngestSummary::default()
    };

    for (index, record) in records.iter().enumerate() {
        if index % 10 == 0 {
            progress.report(index, summary.total);
        }

        let ts = match record.ts.as_deref().and_then(parse_ts) {
            Some(ts) => ts,
            None => {
                summary.skipped += 1;
                continue;
            }
        };
        let uri = match record.spotify_track_uri.as_deref() {
            Some(uri) if !uri.is_empty() => uri,
            _ => {
                summary.skipped += 1;
                continue;
            }
        };

        if store.play_event_exists(user_id, ts).await? {
            summary.skipped += 1;
            continue;
        }

        let song_id = match resolver.resolve_track(uri).await? {
            Resolution::Resolved(song_id) => song_id,
            Resolution::Skip => {
                summary.skipped += 1;
                continue;
            }
        };

        store
            .insert_play_event(&NewPlayEvent {
                user_id,
                song_id,
                ts,
                ms_played: record.ms_played,
                platform: record.platform.clone(),
                conn_country: record.conn_country.clone(),
                ip_addr: record.ip_addr.clone(),
                episode_name: record.episode_name.clone(),
                episode_show_name: record.episode_show_name.clone(),
                reason_start: record.reason_start.clone(),
                reason_end: record.reason_end.clone(),
                shuffle: record.shuffle,
                skipped: record.skipped,
                offline: record.offline,
                incognito_mode: record.incognito_mode,
            })
            .await?;
        summary.inserted += 1;
    }

    progress.report(summary.total, summary.total);
    Ok(summary)
}

/// Return a usable access token for the user, exchanging the refresh token
/// first if the stored one has expired. The rotated credential is persisted
/// before any poll call is made.
async fn fresh_access_token<S: Datastore, C: CatalogApi>(
    store: &S,
    api: &C,
    user_id: i64,
    force: bool,
) -> Result<String> {
    let tokens = store
        .tokens(user_id)
        .await?
        .with_context(|| format!("no spotify credentials stored for user {}", user_id))?;

    if !force && tokens.expires_at > Utc::now() {
        return Ok(tokens.access_token);
    }

    let grant = RetryPolicy::default()
        .run("token refresh", || api.refresh_token(&tokens.refresh_token))
        .await
        .map_err(|err| match err {
            ApiError::Unauthorized => {
                anyhow::anyhow!("refresh credential revoked for user {}", user_id)
            }
            err => anyhow::anyhow!("token refresh failed for user {}: {}", user_id, err),
        })?;

    let refreshed = SpotifyTokens {
        user_id,
        access_token: grant.access_token.clone(),
        // The service may not rotate the refresh token; keep the old one.
        refresh_token: grant.refresh_token.unwrap_or(tokens.refresh_token),
        expires_at: grant.expires_at,
    };
    store.save_tokens(&refreshed).await?;

    Ok(refreshed.access_token)
}

/// Incremental ingestion from the live recently-played poll. Same per-record
/// algorithm as [`ingest_batch`], preceded by the credential-refresh flow.
/// An authorization rejection with a seemingly-valid token gets exactly one
/// forced refresh-and-retry before the poll cycle fails.
pub async fn poll_recent<S: Datastore, C: CatalogApi>(
    store: &S,
    api: &C,
    user_id: i64,
    progress: &dyn ProgressSink,
) -> Result<IngestSummary> {
    let retry = RetryPolicy::default();
    let token = fresh_access_token(store, api, user_id, false).await?;

    let records = match retry
        .run("recently played", || api.recently_played(&token))
        .await
    {
        Ok(records) => records,
        Err(ApiError::Unauthorized) => {
            tracing::warn!(
                "poll rejected a seemingly valid token for user {}, forcing refresh",
                user_id
            );
            let token = fresh_access_token(store, api, user_id, true).await?;
            retry
                .run("recently played", || api.recently_played(&token))
                .await
                .map_err(|err| anyhow::anyhow!("poll failed for user {}: {}", user_id, err))?
        }
        Err(err) => bail!("poll failed for user {}: {}", user_id, err),
    };

    ingest_batch(store, api, user_id, &records, progress).await
}
