//! Spotify Web API client: catalog metadata lookups (app-level
//! client-credentials flow), user token refresh, and the recently-played
//! poll. Everything external the core talks to lives behind [`CatalogApi`]
//! so the pipeline and resolver can be exercised without the network.

use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::ingest::RawPlayRecord;

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Failure taxonomy for external-service calls. Transient variants are
/// retried by [`crate::retry::RetryPolicy`]; permanent ones surface
/// immediately.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("unauthorized")]
    Unauthorized,
    #[error("transient error: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. } | ApiError::Transient(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ApiError::Transient(err.to_string())
        } else {
            ApiError::Other(err.to_string())
        }
    }
}

/// Track metadata as returned by the catalog lookup service. Carries the
/// primary artist's URI so the resolver can resolve the artist first.
#[derive(Debug, Clone)]
pub struct TrackMetadata {
    pub track_name: String,
    pub artist_uri: String,
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
pub struct ArtistMetadata {
    pub name: String,
    pub followers: Option<i32>,
    pub popularity: Option<i32>,
    pub genres: Vec<String>,
    pub image_urls: Vec<String>,
}

/// A freshly exchanged user credential. `refresh_token` is None when the
/// service did not rotate it; the caller keeps the old one.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// The external catalog lookup / auth / poll service.
#[allow(async_fn_in_trait)]
pub trait CatalogApi: Send + Sync {
    async fn get_track(&self, spotify_uri: &str) -> Result<TrackMetadata, ApiError>;
    async fn get_artist(&self, spotify_uri: &str) -> Result<ArtistMetadata, ApiError>;
    /// The user's most recent plays, already shaped as raw ingestion records.
    async fn recently_played(&self, access_token: &str) -> Result<Vec<RawPlayRecord>, ApiError>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ApiError>;
}

// ---------------------------------------------------------------------------
// Wire types (private; the Web API nests heavily)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TrackResponse {
    name: String,
    artists: Vec<ArtistRef>,
    album: Option<AlbumResponse>,
    duration_ms: Option<i32>,
    explicit: Option<bool>,
    preview_url: Option<String>,
    popularity: Option<i32>,
    #[serde(default)]
    is_local: bool,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct AlbumResponse {
    name: Option<String>,
    id: Option<String>,
    album_type: Option<String>,
    uri: Option<String>,
    release_date: Option<String>,
    release_date_precision: Option<String>,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct ArtistResponse {
    name: String,
    followers: Option<Followers>,
    popularity: Option<i32>,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct Followers {
    total: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct Image {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    #[serde(default)]
    items: Vec<PlayHistoryItem>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: PlayedTrack,
    played_at: String,
}

#[derive(Debug, Deserialize)]
struct PlayedTrack {
    uri: String,
    duration_ms: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct SpotifyClient {
    http: Client,
    client_id: String,
    client_secret: String,
    // Cached client-credentials token for metadata lookups.
    app_token: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl SpotifyClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            client_id,
            client_secret,
            app_token: Mutex::new(None),
        }
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.client_id, self.client_secret);
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
        format!("Basic {}", encoded)
    }

    async fn app_access_token(&self) -> Result<String, ApiError> {
        let mut cached = self.app_token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if *expires_at > Utc::now() + ChronoDuration::seconds(60) {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .header("Authorization", self.basic_auth())
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let response = check_status(response)?;
        let token: TokenResponse = response.json().await?;
        let expires_at = Utc::now() + ChronoDuration::seconds(token.expires_in);
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }
}

impl CatalogApi for SpotifyClient {
    async fn get_track(&self, spotify_uri: &str) -> Result<TrackMetadata, ApiError> {
        let id = uri_id(spotify_uri)?;
        let token = self.app_access_token().await?;

        let response = self
            .http
            .get(format!("{}/tracks/{}", API_BASE, id))
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?;
        let response = check_status(response)?;
        let track: TrackResponse = response.json().await?;

        let artist_uri = track
            .artists
            .first()
            .map(|a| a.uri.clone())
            .ok_or_else(|| ApiError::Other(format!("track {} has no artists", spotify_uri)))?;

        let album = track.album;
        Ok(TrackMetadata {
            track_name: track.name,
            artist_uri,
            album_name: album.as_ref().and_then(|a| a.name.clone()),
            album_id: album.as_ref().and_then(|a| a.id.clone()),
            album_type: album.as_ref().and_then(|a| a.album_type.clone()),
            album_uri: album.as_ref().and_then(|a| a.uri.clone()),
            release_date: album.as_ref().and_then(|a| a.release_date.clone()),
            release_date_precision: album.as_ref().and_then(|a| a.release_date_precision.clone()),
            duration_ms: track.duration_ms,
            is_explicit: track.explicit,
            image_url: album
                .as_ref()
                .and_then(|a| a.images.first())
                .map(|i| i.url.clone()),
            preview_url: track.preview_url,
            popularity: track.popularity,
            is_local: Some(track.is_local),
        })
    }

    async fn get_artist(&self, spotify_uri: &str) -> Result<ArtistMetadata, ApiError> {
        let id = uri_id(spotify_uri)?;
        let token = self.app_access_token().await?;

        let response = self
            .http
            .get(format!("{}/artists/{}", API_BASE, id))
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?;
        let response = check_status(response)?;
        let artist: ArtistResponse = response.json().await?;

        Ok(ArtistMetadata {
            name: artist.name,
            followers: artist.followers.and_then(|f| f.total),
            popularity: artist.popularity,
            genres: artist.genres,
            image_urls: artist.images.into_iter().map(|i| i.url).collect(),
        })
    }

    async fn recently_played(&self, access_token: &str) -> Result<Vec<RawPlayRecord>, ApiError> {
        let response = self
            .http
            .get(format!("{}/me/player/recently-played", API_BASE))
            .header("Authorization", format!("Bearer {}", access_token))
            .query(&[("limit", "50")])
            .send()
            .await?;
        let response = check_status(response)?;
        let recent: RecentlyPlayedResponse = response.json().await?;

        Ok(recent
            .items
            .into_iter()
            .map(|item| RawPlayRecord {
                ts: Some(item.played_at),
                spotify_track_uri: Some(item.track.uri),
                ms_played: item.track.duration_ms,
                ..RawPlayRecord::default()
            })
            .collect())
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let response = self
            .http
            .post(TOKEN_URL)
            .header("Authorization", self.basic_auth())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        let response = check_status(response)?;
        let token: TokenResponse = response.json().await?;

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
        })
    }
}

/// Extract the bare id from a `spotify:track:...` / `spotify:artist:...` URI.
fn uri_id(uri: &str) -> Result<&str, ApiError> {
    match uri.rsplit(':').next() {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(ApiError::NotFound),
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited {
            retry_after: response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        s if s.is_server_error() => ApiError::Transient(format!("server error: {}", s)),
        s => ApiError::Other(format!("unexpected status: {}", s)),
    })
}
