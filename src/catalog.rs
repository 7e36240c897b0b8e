//! Catalog resolution: external track/artist URI -> internal catalog id,
//! creating rows lazily from the lookup service on first sight.

use anyhow::{bail, Result};

use crate::models::{NewArtist, NewSong};
use crate::retry::RetryPolicy;
use crate::spotify::{ApiError, CatalogApi};
use crate::store::Datastore;

/// Outcome of a resolution attempt. `Skip` means the reference is
/// unresolvable (not found upstream, or lookups kept failing) and the caller
/// must drop the enclosing event rather than fail its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(i64),
    Skip,
}

pub struct CatalogResolver<'a, S, C> {
    store: &'a S,
    api: &'a C,
    retry: RetryPolicy,
}

impl<'a, S: Datastore, C: CatalogApi> CatalogResolver<'a, S, C> {
    pub fn new(store: &'a S, api: &'a C) -> Self {
        Self {
            store,
            api,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(store: &'a S, api: &'a C, retry: RetryPolicy) -> Self {
        Self { store, api, retry }
    }

    /// Resolve an artist URI to its internal id, fetching metadata and
    /// inserting the row on a local miss. Safe under concurrent calls for
    /// the same URI: the store's unique constraint decides the winner and
    /// the loser re-reads.
    pub async fn resolve_artist(&self, spotify_uri: &str) -> Result<Resolution> {
        if spotify_uri.is_empty() {
            return Ok(Resolution::Skip);
        }
        if let Some(artist_id) = self.store.find_artist_by_uri(spotify_uri).await? {
            return Ok(Resolution::Resolved(artist_id));
        }

        let meta = match self
            .retry
            .run("artist lookup", || self.api.get_artist(spotify_uri))
            .await
        {
            Ok(meta) => meta,
            Err(err) => return self.unresolvable("artist", spotify_uri, err),
        };

        let artist_id = self
            .store
            .insert_artist(&NewArtist {
                spotify_uri: spotify_uri.to_string(),
                name: meta.name,
                followers: meta.followers,
                popularity: meta.popularity,
                genres: meta.genres,
                image_urls: meta.image_urls,
            })
            .await?;

        Ok(Resolution::Resolved(artist_id))
    }

    /// Resolve a track URI to its internal song id. The track's primary
    /// artist is resolved first since song rows reference the artist by id.
    pub async fn resolve_track(&self, spotify_uri: &str) -> Result<Resolution> {
        if spotify_uri.is_empty() {
            return Ok(Resolution::Skip);
        }
        if let Some(song_id) = self.store.find_song_by_uri(spotify_uri).await? {
            return Ok(Resolution::Resolved(song_id));
        }

        let meta = match self
            .retry
            .run("track lookup", || self.api.get_track(spotify_uri))
            .await
        {
            Ok(meta) => meta,
            Err(err) => return self.unresolvable("track", spotify_uri, err),
        };

        let artist_id = match self.resolve_artist(&meta.artist_uri).await? {
            Resolution::Resolved(artist_id) => artist_id,
            Resolution::Skip => {
                tracing::warn!(
                    "skipping track {}: primary artist {} unresolvable",
                    spotify_uri,
                    meta.artist_uri
                );
                return Ok(Resolution::Skip);
            }
        };

        let song_id = self
            .store
            .insert_song(&NewSong {
                spotify_uri: spotify_uri.to_string(),
                artist_id,
                track_name: meta.track_name,
                album_name: meta.album_name,
                album_id: meta.album_id,
                album_type: meta.album_type,
                album_uri: meta.album_uri,
                release_date: meta.release_date,
                release_date_precision: meta.release_date_precision,
                duration_ms: meta.duration_ms,
                is_explicit: meta.is_explicit,
                image_url: meta.image_url,
                preview_url: meta.preview_url,
                popularity: meta.popularity,
                is_local: meta.is_local,
            })
            .await?;

        Ok(Resolution::Resolved(song_id))
    }

    fn unresolvable(&self, kind: &str, uri: &str, err: ApiError) -> Result<Resolution> {
        match err {
            // Service credentials are broken; nothing in this run can
            // resolve, so fail the batch rather than silently skip it all.
            ApiError::Unauthorized => bail!("catalog service rejected credentials"),
            err => {
                tracing::warn!("{} {} unresolvable: {}", kind, uri, err);
                Ok(Resolution::Skip)
            }
        }
    }
}
