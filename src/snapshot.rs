//! Snapshot aggregation: reduce a user's play log over a resolved window
//! into one statistics row, guarded against duplicate concurrent
//! computation by a TTL'd in-progress marker.
//!
//! Aggregation is a pure consumer of the event log; it never depends on
//! ingestion having just run. Snapshot rows are append-only and "latest"
//! means greatest snapshot_time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::binge;
use crate::models::{NewSnapshot, Snapshot, SongDisplay, WindowEvent};
use crate::store::{Datastore, MarkerStore};
use crate::window::{self, Period};

/// A snapshot older than this triggers recomputation; it also bounds the
/// in-progress marker's lifetime so a stuck computation self-heals.
pub const STALENESS: Duration = Duration::from_secs(10 * 60);

/// A snapshot enriched with joined display fields for its track references.
/// Hydration is presentation-only and never alters the stored row.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    pub snapshot: Snapshot,
    pub top_song: Option<SongDisplay>,
    pub binge_song: Option<SongDisplay>,
}

#[derive(Debug, Clone)]
pub enum SnapshotOutcome {
    Ready(SnapshotView),
    /// Another computation for this (user, period) is already running.
    InProgress,
    /// Lifetime window with no events; no row is written.
    NoData,
}

pub struct Aggregator<'a, S, M> {
    store: &'a S,
    markers: &'a M,
}

impl<'a, S: Datastore, M: MarkerStore> Aggregator<'a, S, M> {
    pub fn new(store: &'a S, markers: &'a M) -> Self {
        Self { store, markers }
    }

    /// On-demand path: return the latest snapshot if fresh, otherwise
    /// compute a new one unless a computation is already in flight.
    pub async fn get_or_build(
        &self,
        user_id: i64,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<SnapshotOutcome> {
        let range_type = period.range_type();

        if let Some(latest) = self.store.latest_snapshot(user_id, range_type).await? {
            if is_fresh(&latest, now) {
                self.markers.release(user_id, range_type).await?;
                return Ok(SnapshotOutcome::Ready(self.hydrate(latest).await?));
            }
        }

        if !self.markers.try_acquire(user_id, range_type, STALENESS).await? {
            tracing::debug!(
                "snapshot computation already in progress for user {} period {}",
                user_id,
                range_type
            );
            return Ok(SnapshotOutcome::InProgress);
        }

        let built = self.compute(user_id, period, now).await;
        // The marker is cleared on every exit path, success or failure.
        if let Err(err) = self.markers.release(user_id, range_type).await {
            tracing::warn!(
                "failed to release snapshot marker for user {} period {}: {}",
                user_id,
                range_type,
                err
            );
        }

        match built? {
            Some(snapshot) => Ok(SnapshotOutcome::Ready(self.hydrate(snapshot).await?)),
            None => Ok(SnapshotOutcome::NoData),
        }
    }

    /// Scheduled bulk path: recompute one rolling period for every known
    /// user. No marker is taken and a failing user does not stop the sweep.
    pub async fn build_all(&self, period: &Period, now: DateTime<Utc>) -> Result<()> {
        let user_ids = self.store.all_user_ids().await?;
        tracing::info!(
            "bulk snapshot refresh: period {}, {} users",
            period.range_type(),
            user_ids.len()
        );

        for user_id in user_ids {
            match self.compute(user_id, period, now).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!("no data for user {}, skipping snapshot", user_id);
                }
                Err(err) => {
                    tracing::error!(
                        "snapshot failed for user {} period {}: {}",
                        user_id,
                        period.range_type(),
                        err
                    );
                }
            }
        }
        Ok(())
    }

    /// Resolve the window, reduce the ordered event stream, and persist one
    /// new snapshot row. Returns None when a lifetime window has no data.
    async fn compute(
        &self,
        user_id: i64,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<Option<Snapshot>> {
        let Some((start, end)) = window::resolve(self.store, user_id, period, now).await? else {
            return Ok(None);
        };

        let events = self.store.events_in_window(user_id, start, end).await?;
        let total_plays = events.len() as i64;

        let top_song_id = top_by_ms(events.iter().map(|e| (e.song_id, played_ms(e))));
        let top_artist_name = top_by_ms(events.iter().map(|e| (e.artist_id, played_ms(e))))
            .and_then(|artist_id| {
                events
                    .iter()
                    .find(|e| e.artist_id == artist_id)
                    .map(|e| e.artist_name.clone())
            });

        let ordered: Vec<(i64, DateTime<Utc>)> =
            events.iter().map(|e| (e.song_id, e.ts)).collect();
        let run = binge::longest_run(&ordered);

        let new = NewSnapshot {
            user_id,
            range_type: period.range_type().to_string(),
            range_start: start,
            range_end: end,
            total_plays,
            top_song_id,
            top_artist_name,
            binge_song_id: run.as_ref().map(|r| r.song_id),
            binge_length: run.as_ref().map(|r| r.length as i32).unwrap_or(0),
            binge_start: run.as_ref().map(|r| r.start),
            binge_end: run.as_ref().map(|r| r.end),
            snapshot_time: now,
        };
        let snapshot_id = self.store.insert_snapshot(&new).await?;

        Ok(Some(Snapshot {
            snapshot_id,
            user_id: new.user_id,
            range_type: new.range_type,
            range_start: new.range_start,
            range_end: new.range_end,
            total_plays: new.total_plays,
            top_song_id: new.top_song_id,
            top_artist_name: new.top_artist_name,
            binge_song_id: new.binge_song_id,
            binge_length: new.binge_length,
            binge_start: new.binge_start,
            binge_end: new.binge_end,
            snapshot_time: new.snapshot_time,
        }))
    }

    async fn hydrate(&self, snapshot: Snapshot) -> Result<SnapshotView> {
        let top_song = match snapshot.top_song_id {
            Some(song_id) => self.store.song_display(song_id).await?,
            None => None,
        };
        let binge_song = match snapshot.binge_song_id {
            Some(song_id) => self.store.song_display(song_id).await?,
            None => None,
        };
        Ok(SnapshotView {
            snapshot,
            top_song,
            binge_song,
        })
    }
}

fn is_fresh(snapshot: &Snapshot, now: DateTime<Utc>) -> bool {
    let age = now - snapshot.snapshot_time;
    age < chrono::Duration::from_std(STALENESS).unwrap_or(chrono::Duration::zero())
}

fn played_ms(event: &WindowEvent) -> i64 {
    event.ms_played.unwrap_or(0) as i64
}

/// Group by key, sum milliseconds played, take the max. Ties go to the
/// first-seen key so repeated runs over the same log agree.
fn top_by_ms(pairs: impl Iterator<Item = (i64, i64)>) -> Option<i64> {
    let mut sums: HashMap<i64, i64> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();
    for (key, ms) in pairs {
        if !sums.contains_key(&key) {
            order.push(key);
        }
        *sums.entry(key).or_insert(0) += ms;
    }

    let mut best: Option<(i64, i64)> = None;
    for key in order {
        let sum = sums[&key];
        if best.map_or(true, |(_, best_sum)| sum > best_sum) {
            best = Some((key, sum));
        }
    }
    best.map(|(key, _)| key)
}
