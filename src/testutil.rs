//! In-memory stand-ins for the external collaborators, used by unit tests
//! to exercise the real pipeline and aggregator code without Postgres or
//! the network.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ingest::{ProgressSink, RawPlayRecord};
use crate::models::*;
use crate::spotify::{ApiError, ArtistMetadata, CatalogApi, TokenGrant, TrackMetadata};
use crate::store::{Datastore, MarkerStore};

// ---------------------------------------------------------------------------
// Datastore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    users: Vec<(i64, String)>,
    artists: Vec<(i64, String, String)>, // (artist_id, spotify_uri, name)
    songs: Vec<(i64, String, i64, String)>, // (song_id, spotify_uri, artist_id, track_name)
    plays: Vec<NewPlayEvent>,
    snapshots: Vec<Snapshot>,
    tokens: HashMap<i64, SpotifyTokens>,
    next_id: i64,
}

impl MemInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemStore {
    inner: Mutex<MemInner>,
    fail_events: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner::default()),
            fail_events: AtomicBool::new(false),
        }
    }

    pub fn add_user(&self, auth0_id: &str) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let user_id = inner.next_id();
        inner.users.push((user_id, auth0_id.to_string()));
        user_id
    }

    /// Create a song (and its artist, by name, if unseen) directly in the
    /// catalog, bypassing resolution.
    pub fn add_song(&self, spotify_uri: &str, track_name: &str, artist_name: &str) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let artist_id = match inner.artists.iter().find(|(_, _, name)| name == artist_name) {
            Some((artist_id, _, _)) => *artist_id,
            None => {
                let artist_id = inner.next_id();
                let uri = format!("spotify:artist:{}", artist_id);
                inner.artists.push((artist_id, uri, artist_name.to_string()));
                artist_id
            }
        };
        let song_id = inner.next_id();
        inner
            .songs
            .push((song_id, spotify_uri.to_string(), artist_id, track_name.to_string()));
        song_id
    }

    pub fn add_play(&self, user_id: i64, song_id: i64, ts: DateTime<Utc>) {
        self.add_play_ms(user_id, song_id, ts, 0);
    }

    pub fn add_play_ms(&self, user_id: i64, song_id: i64, ts: DateTime<Utc>, ms_played: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.plays.push(NewPlayEvent {
            user_id,
            song_id,
            ts,
            ms_played: Some(ms_played),
            platform: None,
            conn_country: None,
            ip_addr: None,
            episode_name: None,
            episode_show_name: None,
            reason_start: None,
            reason_end: None,
            shuffle: None,
            skipped: None,
            offline: None,
            incognito_mode: None,
        });
    }

    pub fn set_tokens(
        &self,
        user_id: i64,
        access: &str,
        refresh: &str,
        expires_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.insert(
            user_id,
            SpotifyTokens {
                user_id,
                access_token: access.to_string(),
                refresh_token: refresh.to_string(),
                expires_at,
            },
        );
    }

    pub fn fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn play_count(&self, user_id: i64) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.plays.iter().filter(|p| p.user_id == user_id).count()
    }

    pub fn platform_of_first_play(&self, user_id: i64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .plays
            .iter()
            .find(|p| p.user_id == user_id)
            .and_then(|p| p.platform.clone())
    }

    pub fn song_count(&self) -> usize {
        self.inner.lock().unwrap().songs.len()
    }

    pub fn artist_count(&self) -> usize {
        self.inner.lock().unwrap().artists.len()
    }

    pub fn snapshot_count(&self, user_id: i64) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .snapshots
            .iter()
            .filter(|s| s.user_id == user_id)
            .count()
    }
}

impl Datastore for MemStore {
    async fn user_by_auth0_id(&self, auth0_id: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .iter()
            .find(|(_, stored)| stored == auth0_id)
            .map(|(user_id, stored)| User {
                user_id: *user_id,
                auth0_id: stored.clone(),
                email: format!("{}@example.com", user_id),
                username: None,
                created_at: Utc::now(),
            }))
    }

    async fn user_exists(&self, user_id: i64) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.iter().any(|(stored, _)| *stored == user_id))
    }

    async fn all_user_ids(&self) -> Result<Vec<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.iter().map(|(user_id, _)| *user_id).collect())
    }

    async fn find_artist_by_uri(&self, spotify_uri: &str) -> Result<Option<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .artists
            .iter()
            .find(|(_, uri, _)| uri == spotify_uri)
            .map(|(artist_id, _, _)| *artist_id))
    }

    async fn insert_artist(&self, artist: &NewArtist) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        // Unique-constraint semantics: the first writer wins, later writers
        // get the existing row's id back.
        if let Some((artist_id, _, _)) = inner
            .artists
            .iter()
            .find(|(_, uri, _)| *uri == artist.spotify_uri)
        {
            return Ok(*artist_id);
        }
        let artist_id = inner.next_id();
        inner
            .artists
            .push((artist_id, artist.spotify_uri.clone(), artist.name.clone()));
        Ok(artist_id)
    }

    async fn find_song_by_uri(&self, spotify_uri: &str) -> Result<Option<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .songs
            .iter()
            .find(|(_, uri, _, _)| uri == spotify_uri)
            .map(|(song_id, _, _, _)| *song_id))
    }

    async fn insert_song(&self, song: &NewSong) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((song_id, _, _, _)) = inner
            .songs
            .iter()
            .find(|(_, uri, _, _)| *uri == song.spotify_uri)
        {
            return Ok(*song_id);
        }
        let song_id = inner.next_id();
        inner.songs.push((
            song_id,
            song.spotify_uri.clone(),
            song.artist_id,
            song.track_name.clone(),
        ));
        Ok(song_id)
    }

    async fn play_event_exists(&self, user_id: i64, ts: DateTime<Utc>) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .plays
            .iter()
            .any(|p| p.user_id == user_id && p.ts == ts))
    }

    async fn insert_play_event(&self, event: &NewPlayEvent) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.plays.push(event.clone());
        Ok(())
    }

    async fn events_in_window(
        &self,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WindowEvent>> {
        if self.fail_events.load(Ordering::SeqCst) {
            bail!("events_in_window failed (test)");
        }
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<WindowEvent> = inner
            .plays
            .iter()
            .filter(|p| p.user_id == user_id && p.ts >= start && p.ts <= end)
            .map(|p| {
                let (_, _, artist_id, _) = inner
                    .songs
                    .iter()
                    .find(|(song_id, _, _, _)| *song_id == p.song_id)
                    .cloned()
                    .unwrap_or((p.song_id, String::new(), 0, String::new()));
                let artist_name = inner
                    .artists
                    .iter()
                    .find(|(stored, _, _)| *stored == artist_id)
                    .map(|(_, _, name)| name.clone())
                    .unwrap_or_default();
                WindowEvent {
                    song_id: p.song_id,
                    artist_id,
                    artist_name,
                    ts: p.ts,
                    ms_played: p.ms_played,
                }
            })
            .collect();
        events.sort_by_key(|e| e.ts);
        Ok(events)
    }

    async fn play_bounds(&self, user_id: i64) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let inner = self.inner.lock().unwrap();
        let timestamps: Vec<DateTime<Utc>> = inner
            .plays
            .iter()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.ts)
            .collect();
        Ok(timestamps
            .iter()
            .min()
            .zip(timestamps.iter().max())
            .map(|(min, max)| (*min, *max)))
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let snapshot_id = inner.next_id();
        inner.snapshots.push(Snapshot {
            snapshot_id,
            user_id: snapshot.user_id,
            range_type: snapshot.range_type.clone(),
            range_start: snapshot.range_start,
            range_end: snapshot.range_end,
            total_plays: snapshot.total_plays,
            top_song_id: snapshot.top_song_id,
            top_artist_name: snapshot.top_artist_name.clone(),
            binge_song_id: snapshot.binge_song_id,
            binge_length: snapshot.binge_length,
            binge_start: snapshot.binge_start,
            binge_end: snapshot.binge_end,
            snapshot_time: snapshot.snapshot_time,
        });
        Ok(snapshot_id)
    }

    async fn latest_snapshot(&self, user_id: i64, range_type: &str) -> Result<Option<Snapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .snapshots
            .iter()
            .filter(|s| s.user_id == user_id && s.range_type == range_type)
            .max_by_key(|s| s.snapshot_time)
            .cloned())
    }

    async fn song_display(&self, song_id: i64) -> Result<Option<SongDisplay>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .songs
            .iter()
            .find(|(stored, _, _, _)| *stored == song_id)
            .map(|(song_id, _, artist_id, track_name)| SongDisplay {
                song_id: *song_id,
                track_name: track_name.clone(),
                artist_name: inner
                    .artists
                    .iter()
                    .find(|(stored, _, _)| stored == artist_id)
                    .map(|(_, _, name)| name.clone())
                    .unwrap_or_default(),
                image_url: None,
            }))
    }

    async fn tokens(&self, user_id: i64) -> Result<Option<SpotifyTokens>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tokens.get(&user_id).cloned())
    }

    async fn save_tokens(&self, tokens: &SpotifyTokens) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.insert(tokens.user_id, tokens.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog API
// ---------------------------------------------------------------------------

pub struct FakeCatalog {
    tracks: Mutex<HashMap<String, TrackMetadata>>,
    artists: Mutex<HashMap<String, ArtistMetadata>>,
    track_calls: AtomicUsize,
    artist_calls: AtomicUsize,
    valid_access_token: Mutex<Option<String>>,
    refresh_grant: Mutex<Option<(String, Option<String>)>>,
    recent: Mutex<Vec<RawPlayRecord>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            artists: Mutex::new(HashMap::new()),
            track_calls: AtomicUsize::new(0),
            artist_calls: AtomicUsize::new(0),
            valid_access_token: Mutex::new(None),
            refresh_grant: Mutex::new(None),
            recent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_track(
        self,
        track_uri: &str,
        artist_uri: &str,
        track_name: &str,
        artist_name: &str,
    ) -> Self {
        self.tracks.lock().unwrap().insert(
            track_uri.to_string(),
            TrackMetadata {
                track_name: track_name.to_string(),
                artist_uri: artist_uri.to_string(),
                album_name: None,
                album_id: None,
                album_type: None,
                album_uri: None,
                release_date: None,
                release_date_precision: None,
                duration_ms: Some(200_000),
                is_explicit: Some(false),
                image_url: None,
                preview_url: None,
                popularity: None,
                is_local: Some(false),
            },
        );
        self.artists.lock().unwrap().insert(
            artist_uri.to_string(),
            ArtistMetadata {
                name: artist_name.to_string(),
                followers: None,
                popularity: None,
                genres: Vec::new(),
                image_urls: Vec::new(),
            },
        );
        self
    }

    pub fn track_calls(&self) -> usize {
        self.track_calls.load(Ordering::SeqCst)
    }

    pub fn artist_calls(&self) -> usize {
        self.artist_calls.load(Ordering::SeqCst)
    }

    /// Only this access token is accepted by the poll endpoint; every other
    /// token gets an authorization rejection.
    pub fn set_valid_access_token(&self, token: &str) {
        *self.valid_access_token.lock().unwrap() = Some(token.to_string());
    }

    pub fn set_refresh_grant(&self, access: &str, rotated_refresh: Option<&str>) {
        *self.refresh_grant.lock().unwrap() =
            Some((access.to_string(), rotated_refresh.map(str::to_string)));
    }

    pub fn set_recent(&self, records: Vec<RawPlayRecord>) {
        *self.recent.lock().unwrap() = records;
    }
}

impl CatalogApi for FakeCatalog {
    async fn get_track(&self, spotify_uri: &str) -> Result<TrackMetadata, ApiError> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        self.tracks
            .lock()
            .unwrap()
            .get(spotify_uri)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn get_artist(&self, spotify_uri: &str) -> Result<ArtistMetadata, ApiError> {
        self.artist_calls.fetch_add(1, Ordering::SeqCst);
        self.artists
            .lock()
            .unwrap()
            .get(spotify_uri)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn recently_played(&self, access_token: &str) -> Result<Vec<RawPlayRecord>, ApiError> {
        let valid = self.valid_access_token.lock().unwrap();
        if let Some(expected) = valid.as_deref() {
            if expected != access_token {
                return Err(ApiError::Unauthorized);
            }
        }
        Ok(self.recent.lock().unwrap().clone())
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant, ApiError> {
        match self.refresh_grant.lock().unwrap().clone() {
            Some((access, rotated)) => Ok(TokenGrant {
                access_token: access,
                refresh_token: rotated,
                expires_at: Utc::now() + chrono::Duration::hours(1),
            }),
            None => Err(ApiError::Unauthorized),
        }
    }
}

// ---------------------------------------------------------------------------
// Marker store & progress
// ---------------------------------------------------------------------------

pub struct MemMarkers {
    markers: Mutex<HashMap<(i64, String), Instant>>,
}

impl MemMarkers {
    pub fn new() -> Self {
        Self {
            markers: Mutex::new(HashMap::new()),
        }
    }
}

impl MarkerStore for MemMarkers {
    async fn try_acquire(&self, user_id: i64, range_type: &str, ttl: Duration) -> Result<bool> {
        let mut markers = self.markers.lock().unwrap();
        let key = (user_id, range_type.to_string());
        if let Some(expires_at) = markers.get(&key) {
            if *expires_at > Instant::now() {
                return Ok(false);
            }
        }
        markers.insert(key, Instant::now() + ttl);
        Ok(true)
    }

    async fn release(&self, user_id: i64, range_type: &str) -> Result<()> {
        self.markers
            .lock()
            .unwrap()
            .remove(&(user_id, range_type.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectProgress {
    calls: Mutex<Vec<(usize, usize)>>,
}

impl CollectProgress {
    pub fn calls(&self) -> Vec<(usize, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProgressSink for CollectProgress {
    fn report(&self, processed: usize, total: usize) {
        self.calls.lock().unwrap().push((processed, total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marker_ttl_expires() {
        let markers = MemMarkers::new();

        assert!(markers.try_acquire(1, "day", Duration::from_millis(10)).await.unwrap());
        assert!(!markers.try_acquire(1, "day", Duration::from_millis(10)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(markers.try_acquire(1, "day", Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn markers_are_scoped_per_user_and_period() {
        let markers = MemMarkers::new();

        assert!(markers.try_acquire(1, "day", Duration::from_secs(60)).await.unwrap());
        assert!(markers.try_acquire(1, "week", Duration::from_secs(60)).await.unwrap());
        assert!(markers.try_acquire(2, "day", Duration::from_secs(60)).await.unwrap());

        markers.release(1, "day").await.unwrap();
        assert!(markers.try_acquire(1, "day", Duration::from_secs(60)).await.unwrap());
    }
}
