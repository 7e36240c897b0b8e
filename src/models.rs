use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: i64,
    pub auth0_id: String,
    pub email: String,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Artist {
    pub artist_id: i64,
    pub spotify_uri: String,
    pub name: String,
    pub followers: Option<i32>,
    pub popularity: Option<i32>,
    pub genres: serde_json::Value,
    pub image_urls: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Song {
    pub song_id: i64,
    pub spotify_uri: String,
    pub artist_id: i64,
    pub track_name: String,
    pub album_name: Option<String>,
    pub album_id: Option<String>,
    pub album_type: Option<String>,
    pub album_uri: Option<String>,
    pub release_date: Option<String>,
    pub release_date_precision: Option<String>,
    pub duration_ms: Option<i32>,
    pub is_explicit: Option<bool>,
    pub image_url: Option<String>,
    pub preview_url: Option<String>,
    pub popularity: Option<i32>,
    pub is_local: Option<bool>,
    pub created_at: DateTime<Utc>,
}

/// One persisted snapshot row. Append-only; "latest" for a (user, range_type)
/// pair is the row with the greatest snapshot_time.
#[derive(Debug, Clone, FromRow)]
pub struct Snapshot {
    pub snapshot_id: i64,
    pub user_id: i64,
    pub range_type: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub total_plays: i64,
    pub top_song_id: Option<i64>,
    pub top_artist_name: Option<String>,
    pub binge_song_id: Option<i64>,
    pub binge_length: i32,
    pub binge_start: Option<DateTime<Utc>>,
    pub binge_end: Option<DateTime<Utc>>,
    pub snapshot_time: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SpotifyTokens {
    pub user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Insert payload for a new artist row, built from catalog metadata.
#[derive(Debug, Clone)]
pub struct NewArtist {
    pub spotify_uri: String,
    pub name: String,
    pub followers: Option<i32>,
    pub popularity: Option<i32>,
    pub genres: Vec<String>,
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewSong {
    pub spotify_uri: String,
    pub artist_id: i64,
    pub track_name: String,
    pub album_name: Option<String>,
    pub album_id: Option<String>,
    pub album_type: Option<String>,
    pub album_uri: Option<String>,
    pub release_date: Option<String>,
    pub release_date_precision: Option<String>,
    pub duration_ms: Option<i32>,
    pub is_explicit: Option<bool>,
    pub image_url: Option<String>,
    pub preview_url: Option<String>,
    pub popularity: Option<i32>,
    pub is_local: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewPlayEvent {
    pub user_id: i64,
    pub song_id: i64,
    pub ts: DateTime<Utc>,
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

#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub user_id: i64,
    pub range_type: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub total_plays: i64,
    pub top_song_id: Option<i64>,
    pub top_artist_name: Option<String>,
    pub binge_song_id: Option<i64>,
    pub binge_length: i32,
    pub binge_start: Option<DateTime<Utc>>,
    pub binge_end: Option<DateTime<Utc>>,
    pub snapshot_time: DateTime<Utc>,
}

/// One play event joined against the catalog, as fed to the aggregator.
/// Ordered ascending by ts when produced by `Datastore::events_in_window`.
#[derive(Debug, Clone, FromRow)]
pub struct WindowEvent {
    pub song_id: i64,
    pub artist_id: i64,
    pub artist_name: String,
    pub ts: DateTime<Utc>,
    pub ms_played: Option<i32>,
}

/// Display fields joined in at read time when hydrating a snapshot.
#[derive(Debug, Clone, FromRow)]
pub struct SongDisplay {
    pub song_id: i64,
    pub track_name: String,
    pub artist_name: String,
    pub image_url: Option<String>,
}
