//! Source list input: the hosted `manual_tv_input` table or a CSV file.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use chrono_tz::Tz;
use serde::Deserialize;
use tracing::warn;

use crate::Source;
use crate::error::{Error, Result};

const URL_COLUMNS: &[&str] = &["programme_source_link", "url"];

/// A source as listed, before zone validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceEntry {
    #[serde(rename = "programme_source_link")]
    pub url: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl SourceEntry {
    pub fn new(url: impl Into<String>, timezone: Option<&str>) -> Self {
        Self {
            url: Some(url.into()),
            timezone: timezone.map(str::to_string),
        }
    }
}

pub fn read_csv(path: impl AsRef<Path>) -> Result<Vec<SourceEntry>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Configuration(format!("cannot open {}: {e}", path.display())))?;
    read_csv_from(file)
}

/// Reads a CSV with a `programme_source_link` or `url` column and an optional
/// `timezone` column.
pub fn read_csv_from<R: Read>(reader: R) -> Result<Vec<SourceEntry>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| Error::Configuration(format!("unreadable CSV header: {e}")))?
        .clone();
    let find = |name: &str| headers.iter().position(|h| h.trim() == name);
    let Some(url_idx) = URL_COLUMNS.iter().find_map(|c| find(c)) else {
        return Err(Error::Configuration(format!(
            "CSV missing a URL column; fields={:?}",
            headers.iter().collect::<Vec<_>>()
        )));
    };
    let tz_idx = find("timezone");

    let mut entries = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping CSV record {}: {e}", line + 2);
                continue;
            }
        };
        let url = record.get(url_idx).unwrap_or("").trim();
        if url.is_empty() {
            continue;
        }
        let timezone = tz_idx.and_then(|i| record.get(i)).map(str::trim).filter(|t| !t.is_empty());
        entries.push(SourceEntry::new(url, timezone));
    }
    Ok(entries)
}

/// Validates zones and drops repeated URLs, keeping the first occurrence.
///
/// Blank zones use `fallback`; invalid ones do too, with a warning.
pub fn into_sources(entries: Vec<SourceEntry>, fallback: Tz, hours_ahead: i64) -> Vec<Source> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry.url?.trim().to_string();
            if url.is_empty() || !seen.insert(url.clone()) {
                return None;
            }
            let timezone = match entry.timezone.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                None => fallback,
                Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                    warn!("invalid timezone {name:?} for {url}; using {fallback}");
                    fallback
                }),
            };
            Some(Source {
                url,
                timezone,
                hours_ahead,
            })
        })
        .collect()
}
