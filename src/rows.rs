//! Conversion of normalized programmes into guide-table rows.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::Programme;

/// One row of the guide table, keyed by `(programme_source_link, programme_start_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideRow {
    pub programme_source_link: String,
    pub programme_start_time: String,
    pub programme_end_time: String,
    pub programme_title: String,
}

/// `title [category] - description`, omitting absent parts.
pub fn compose_title(programme: &Programme) -> String {
    let mut title = programme.title.trim().to_string();
    if let Some(category) = programme.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        title.push_str(&format!(" [{category}]"));
    }
    if let Some(desc) = programme.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        title.push_str(&format!(" - {desc}"));
    }
    title
}

pub fn iso(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn to_row(source_url: &str, programme: &Programme) -> GuideRow {
    GuideRow {
        programme_source_link: source_url.to_string(),
        programme_start_time: iso(programme.start),
        programme_end_time: iso(programme.end),
        programme_title: compose_title(programme),
    }
}

/// Rows for every source, sources in URL order.
pub fn to_rows(results: &HashMap<String, Vec<Programme>>) -> Vec<GuideRow> {
    let mut urls: Vec<&String> = results.keys().collect();
    urls.sort_unstable();
    urls.into_iter()
        .flat_map(|url| results[url].iter().map(move |p| to_row(url, p)))
        .collect()
}

/// Drops rows repeating an earlier `(source, start)` key.
pub fn dedupe_rows(rows: Vec<GuideRow>) -> Vec<GuideRow> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|r| seen.insert((r.programme_source_link.clone(), r.programme_start_time.clone())))
        .collect()
}

/// Which sources to clear, and the start-time window to clear them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeDirective {
    pub sources: Vec<String>,
    pub low: DateTime<Utc>,
    pub high: DateTime<Utc>,
}

impl PurgeDirective {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Only sources that yielded at least one programme are listed, so a failed
/// scrape never wipes that source's existing rows.
pub fn purge_directive(
    results: &HashMap<String, Vec<Programme>>,
    hours_back: i64,
    hours_ahead: i64,
    now: DateTime<Utc>,
) -> PurgeDirective {
    let mut sources: Vec<String> = results
        .iter()
        .filter(|(_, progs)| !progs.is_empty())
        .map(|(url, _)| url.clone())
        .collect();
    sources.sort_unstable();
    PurgeDirective {
        sources,
        low: now - Duration::hours(hours_back),
        high: now + Duration::hours(hours_ahead),
    }
}
