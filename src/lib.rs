//! Listening-history ingestion and snapshot statistics.
//!
//! Turns raw Spotify play events (bulk export uploads and the periodic
//! recently-played poll) into a canonical deduplicated usage log, resolving
//! catalog entries on demand, and reduces that log into time-windowed
//! snapshots: total plays, most-played track and artist, and the longest
//! binge of a single track.

pub mod binge;
pub mod catalog;
pub mod db;
pub mod ingest;
pub mod models;
pub mod retry;
pub mod snapshot;
pub mod spotify;
pub mod store;
pub mod window;

#[cfg(test)]
pub(crate) mod testutil;
