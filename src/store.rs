//! Collaborator interfaces: the relational datastore and the shared
//! TTL'd marker store. Production code runs against the Postgres
//! implementations in [`crate::db`]; the ingestion pipeline and the
//! aggregator are generic over these traits.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::*;

/// Transactional table store holding users, the shared catalog, the play-event
/// log, snapshots, and per-user Spotify credentials.
///
/// Uniqueness is the store's job: `insert_artist` and `insert_song` must be
/// race-safe under concurrent calls for the same URI — on a unique-constraint
/// conflict the implementation re-reads by key and returns the winner's id,
/// never an error.
#[allow(async_fn_in_trait)]
pub trait Datastore: Send + Sync {
    async fn user_by_auth0_id(&self, auth0_id: &str) -> Result<Option<User>>;
    async fn user_exists(&self, user_id: i64) -> Result<bool>;
    async fn all_user_ids(&self) -> Result<Vec<i64>>;

    async fn find_artist_by_uri(&self, spotify_uri: &str) -> Result<Option<i64>>;
    async fn insert_artist(&self, artist: &NewArtist) -> Result<i64>;
    async fn find_song_by_uri(&self, spotify_uri: &str) -> Result<Option<i64>>;
    async fn insert_song(&self, song: &NewSong) -> Result<i64>;

    /// Existence check on the (user_id, ts) natural key.
    async fn play_event_exists(&self, user_id: i64, ts: DateTime<Utc>) -> Result<bool>;
    async fn insert_play_event(&self, event: &NewPlayEvent) -> Result<()>;

    /// Play events with start <= ts <= end, joined with the catalog, ordered
    /// ascending by ts. The end bound is inclusive so a lifetime window
    /// (ending exactly at the last play) covers that play.
    async fn events_in_window(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WindowEvent>>;

    /// (min ts, max ts) over the user's whole play log, or None if the user
    /// has no events.
    async fn play_bounds(&self, user_id: i64) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> Result<i64>;
    async fn latest_snapshot(&self, user_id: i64, range_type: &str) -> Result<Option<Snapshot>>;
    async fn song_display(&self, song_id: i64) -> Result<Option<SongDisplay>>;

    async fn tokens(&self, user_id: i64) -> Result<Option<SpotifyTokens>>;
    async fn save_tokens(&self, tokens: &SpotifyTokens) -> Result<()>;
}

/// Shared TTL'd flag store backing the per-(user, period) in-progress marker.
///
/// Advisory single-flight only: two near-simultaneous acquires may both
/// succeed across store instances, which the aggregator tolerates. A marker
/// must never outlive its TTL, so a stuck computation self-heals.
#[allow(async_fn_in_trait)]
pub trait MarkerStore: Send + Sync {
    /// Set the marker if no live marker exists. Returns true if this caller
    /// won the slot.
    async fn try_acquire(&self, user_id: i64, range_type: &str, ttl: Duration) -> Result<bool>;
    async fn release(&self, user_id: i64, range_type: &str) -> Result<()>;
}
