//! Postgres-backed implementations of the [`Datastore`] and [`MarkerStore`]
//! interfaces.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::models::*;
use crate::store::{Datastore, MarkerStore};

pub async fn init_db() -> Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/playlog".to_string());

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(50)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(&database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Datastore for PgStore {
    async fn user_by_auth0_id(&self, auth0_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT user_id, auth0_id, email, username, created_at
             FROM core_users WHERE auth0_id = $1",
        )
        .bind(auth0_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn user_exists(&self, user_id: i64) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM core_users WHERE user_id = $1)")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn all_user_ids(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT user_id FROM core_users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn find_artist_by_uri(&self, spotify_uri: &str) -> Result<Option<i64>> {
        let artist_id: Option<i64> =
            sqlx::query_scalar("SELECT artist_id FROM core_artists WHERE spotify_uri = $1")
                .bind(spotify_uri)
                .fetch_optional(&self.pool)
                .await?;
        Ok(artist_id)
    }

    async fn insert_artist(&self, artist: &NewArtist) -> Result<i64> {
        // Attempt the insert; on a unique-constraint conflict another writer
        // won, so re-read by key and use their row.
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO core_artists (spotify_uri, name, followers, popularity, genres, image_urls)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (spotify_uri) DO NOTHING
            RETURNING artist_id
            "#,
        )
        .bind(&artist.spotify_uri)
        .bind(&artist.name)
        .bind(artist.followers)
        .bind(artist.popularity)
        .bind(serde_json::json!(artist.genres))
        .bind(serde_json::json!(artist.image_urls))
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(artist_id) => Ok(artist_id),
            None => self
                .find_artist_by_uri(&artist.spotify_uri)
                .await?
                .with_context(|| {
                    format!("artist {} vanished after insert conflict", artist.spotify_uri)
                }),
        }
    }

    async fn find_song_by_uri(&self, spotify_uri: &str) -> Result<Option<i64>> {
        let song_id: Option<i64> =
            sqlx::query_scalar("SELECT song_id FROM core_songs WHERE spotify_uri = $1")
                .bind(spotify_uri)
                .fetch_optional(&self.pool)
                .await?;
        Ok(song_id)
    }

    async fn insert_song(&self, song: &NewSong) -> Result<i64> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO core_songs (
                spotify_uri, artist_id, track_name,
                album_name, album_id, album_type, album_uri,
                release_date, release_date_precision,
                duration_ms, is_explicit, image_url, preview_url,
                popularity, is_local
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (spotify_uri) DO NOTHING
            RETURNING song_id
            "#,
        )
        .bind(&song.spotify_uri)
        .bind(song.artist_id)
        .bind(&song.track_name)
        .bind(&song.album_name)
        .bind(&song.album_id)
        .bind(&song.album_type)
        .bind(&song.album_uri)
        .bind(&song.release_date)
        .bind(&song.release_date_precision)
        .bind(song.duration_ms)
        .bind(song.is_explicit)
        .bind(&song.image_url)
        .bind(&song.preview_url)
        .bind(song.popularity)
        .bind(song.is_local)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(song_id) => Ok(song_id),
            None => self
                .find_song_by_uri(&song.spotify_uri)
                .await?
                .with_context(|| {
                    format!("song {} vanished after insert conflict", song.spotify_uri)
                }),
        }
    }

    async fn play_event_exists(&self, user_id: i64, ts: DateTime<Utc>) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM usage_logs WHERE user_id = $1 AND ts = $2)",
        )
        .bind(user_id)
        .bind(ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_play_event(&self, event: &NewPlayEvent) -> Result<()> {
        // The (user_id, ts) unique constraint absorbs the check-then-insert
        // race from a concurrently resubmitted batch.
        sqlx::query(
            r#"
            INSERT INTO usage_logs (
                user_id, song_id, ts, ms_played, platform, conn_country, ip_addr,
                episode_name, episode_show_name, reason_start, reason_end,
                shuffle, skipped, offline, incognito_mode
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (user_id, ts) DO NOTHING
            "#,
        )
        .bind(event.user_id)
        .bind(event.song_id)
        .bind(event.ts)
        .bind(event.ms_played)
        .bind(&event.platform)
        .bind(&event.conn_country)
        .bind(&event.ip_addr)
        .bind(&event.episode_name)
        .bind(&event.episode_show_name)
        .bind(&event.reason_start)
        .bind(&event.reason_end)
        .bind(event.shuffle)
        .bind(event.skipped)
        .bind(event.offline)
        .bind(event.incognito_mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_in_window(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WindowEvent>> {
        let events = sqlx::query_as::<_, WindowEvent>(
            r#"
            SELECT ul.song_id, s.artist_id, a.name AS artist_name, ul.ts, ul.ms_played
            FROM usage_logs ul
            JOIN core_songs s ON s.song_id = ul.song_id
            JOIN core_artists a ON a.artist_id = s.artist_id
            WHERE ul.user_id = $1 AND ul.ts >= $2 AND ul.ts <= $3
            ORDER BY ul.ts
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn play_bounds(&self, user_id: i64) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT MIN(ts) AS first, MAX(ts) AS last FROM usage_logs WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let first: Option<DateTime<Utc>> = row.get("first");
        let last: Option<DateTime<Utc>> = row.get("last");
        Ok(first.zip(last))
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> Result<i64> {
        let snapshot_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO snapshots (
                user_id, range_type, range_start, range_end, total_plays,
                top_song_id, top_artist_name,
                binge_song_id, binge_length, binge_start, binge_end,
                snapshot_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING snapshot_id
            "#,
        )
        .bind(snapshot.user_id)
        .bind(&snapshot.range_type)
        .bind(snapshot.range_start)
        .bind(snapshot.range_end)
        .bind(snapshot.total_plays)
        .bind(snapshot.top_song_id)
        .bind(&snapshot.top_artist_name)
        .bind(snapshot.binge_song_id)
        .bind(snapshot.binge_length)
        .bind(snapshot.binge_start)
        .bind(snapshot.binge_end)
        .bind(snapshot.snapshot_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(snapshot_id)
    }

    async fn latest_snapshot(&self, user_id: i64, range_type: &str) -> Result<Option<Snapshot>> {
        let snapshot = sqlx::query_as::<_, Snapshot>(
            r#"
            SELECT snapshot_id, user_id, range_type, range_start, range_end,
                   total_plays, top_song_id, top_artist_name,
                   binge_song_id, binge_length, binge_start, binge_end,
                   snapshot_time
            FROM snapshots
            WHERE user_id = $1 AND range_type = $2
            ORDER BY snapshot_time DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(range_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(snapshot)
    }

    async fn song_display(&self, song_id: i64) -> Result<Option<SongDisplay>> {
        let display = sqlx::query_as::<_, SongDisplay>(
            r#"
            SELECT s.song_id, s.track_name, a.name AS artist_name, s.image_url
            FROM core_songs s
            JOIN core_artists a ON a.artist_id = s.artist_id
            WHERE s.song_id = $1
            "#,
        )
        .bind(song_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(display)
    }

    async fn tokens(&self, user_id: i64) -> Result<Option<SpotifyTokens>> {
        let tokens = sqlx::query_as::<_, SpotifyTokens>(
            "SELECT user_id, access_token, refresh_token, expires_at
             FROM spotify_tokens WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn save_tokens(&self, tokens: &SpotifyTokens) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO spotify_tokens (user_id, access_token, refresh_token, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id)
            DO UPDATE SET access_token = $2, refresh_token = $3, expires_at = $4
            "#,
        )
        .bind(tokens.user_id)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// TTL'd in-progress markers backed by a plain table. A dead marker (past
/// its expiry) can be stolen by the next acquirer, so a crashed computation
/// never wedges its (user, period) slot.
#[derive(Clone)]
pub struct PgMarkerStore {
    pool: PgPool,
}

impl PgMarkerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MarkerStore for PgMarkerStore {
    async fn try_acquire(
        &self,
        user_id: i64,
        range_type: &str,
        ttl: std::time::Duration,
    ) -> Result<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).context("marker ttl out of range")?;

        let result = sqlx::query(
            r#"
            INSERT INTO snapshot_markers (user_id, range_type, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, range_type)
            DO UPDATE SET expires_at = $3
            WHERE snapshot_markers.expires_at <= NOW()
            "#,
        )
        .bind(user_id)
        .bind(range_type)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, user_id: i64, range_type: &str) -> Result<()> {
        sqlx::query("DELETE FROM snapshot_markers WHERE user_id = $1 AND range_type = $2")
            .bind(user_id)
            .bind(range_type)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
