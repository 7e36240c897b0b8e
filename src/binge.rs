//! Longest-binge detection: the maximal run of positionally-consecutive
//! plays of one track in a timestamp-ordered sequence.
//!
//! Adjacency is positional, not time-gap-bounded: two plays of the same
//! track with nothing logged between them form one run regardless of how far
//! apart they are, and a single other play breaks the run. Ties keep the
//! first maximal run encountered.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BingeRun {
    pub song_id: i64,
    pub length: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Single linear scan over `(song_id, ts)` pairs sorted ascending by ts.
/// Returns None for empty input.
pub fn longest_run(events: &[(i64, DateTime<Utc>)]) -> Option<BingeRun> {
    let (&(first_song, first_ts), rest) = events.split_first()?;

    let mut best = BingeRun {
        song_id: first_song,
        length: 1,
        start: first_ts,
        end: first_ts,
    };
    let mut current = best.clone();

    for &(song_id, ts) in rest {
        if song_id == current.song_id {
            current.length += 1;
            current.end = ts;
        } else {
            if current.length > best.length {
                best = current.clone();
            }
            current = BingeRun {
                song_id,
                length: 1,
                start: ts,
                end: ts,
            };
        }
    }
    if current.length > best.length {
        best = current;
    }

    Some(best)
}
