//! Time-window normalization shared by every adapter.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::Programme;

/// Look-back tolerance applied by [`normalize`], in hours.
pub const BACKFILL_HOURS: i64 = 6;

/// Default length given to an entry whose end cannot be inferred.
pub const FALLBACK_MINUTES: i64 = 60;

/// Repairs, filters, deduplicates and sorts raw programmes.
///
/// 1. `end <= start` is read as spanning midnight: `end += 24h`.
/// 2. Keeps entries with `end >= now - 6h` and `start <= now + hours_ahead`.
/// 3. Drops later entries sharing a `(title, start)` pair.
/// 4. Sorts by `(start, end, title)`.
pub fn normalize(candidates: Vec<Programme>, hours_ahead: i64, now: DateTime<Utc>) -> Vec<Programme> {
    let low = now - Duration::hours(BACKFILL_HOURS);
    let high = Duration::try_hours(hours_ahead)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let mut seen = HashSet::new();
    let mut out: Vec<Programme> = candidates
        .into_iter()
        .filter_map(|mut p| {
            if p.end <= p.start {
                p.end = p.end.checked_add_signed(Duration::hours(24))?;
            }
            Some(p)
        })
        .filter(|p| p.end >= low && p.start <= high)
        .filter(|p| seen.insert((p.title.clone(), p.start)))
        .collect();

    out.sort_by(|a, b| {
        (a.start, a.end, &a.title).cmp(&(b.start, b.end, &b.title))
    });
    out
}

/// A programme whose end is not known yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub title: String,
    pub start: DateTime<Utc>,
    pub category: Option<String>,
    pub description: Option<String>,
}

impl Slot {
    pub fn new(title: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            start,
            category: None,
            description: None,
        }
    }

    pub fn ending_at(self, end: DateTime<Utc>) -> Programme {
        Programme {
            title: self.title,
            start: self.start,
            end,
            category: self.category,
            description: self.description,
        }
    }
}

/// Sorts slots chronologically and ends each one where the next begins; the
/// last one gets `fallback`, or is dropped if that overflows.
pub fn chain_end_times(mut slots: Vec<Slot>, fallback: Duration) -> Vec<Programme> {
    slots.sort_by_key(|s| s.start);
    let starts: Vec<DateTime<Utc>> = slots.iter().map(|s| s.start).collect();
    slots
        .into_iter()
        .enumerate()
        .filter_map(|(i, slot)| {
            let end = match starts.get(i + 1) {
                Some(next) => *next,
                None => slot.start.checked_add_signed(fallback)?,
            };
            Some(slot.ending_at(end))
        })
        .collect()
}
