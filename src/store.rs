//! Guide table persistence: the [`GuideStore`] seam, its PostgREST
//! implementation and the purge-then-upsert publish step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::Programme;
use crate::config::StoreCredentials;
use crate::error::{Error, Result};
use crate::rows::{self, GuideRow, PurgeDirective};
use crate::sources::SourceEntry;

pub const SOURCE_TABLE: &str = "manual_tv_input";
pub const GUIDE_TABLE: &str = "mx_epg_scrape";
pub const GUIDE_CONFLICT_KEY: &str = "programme_source_link,programme_start_time";

const PURGE_CHUNK: usize = 100;
const UPSERT_CHUNK: usize = 500;

#[async_trait::async_trait]
pub trait GuideStore: Send + Sync {
    async fn read_sources(&self) -> Result<Vec<SourceEntry>>;

    /// Deletes rows of the listed sources whose start lies inside the window.
    async fn purge(&self, directive: &PurgeDirective) -> Result<()>;

    /// Inserts or merges rows on the `(source, start)` key; returns rows written.
    async fn upsert_rows(&self, rows: &[GuideRow]) -> Result<usize>;
}

/// A `manual_tv_input` row as needed by the manifest refresher.
#[derive(Debug, Clone, Deserialize)]
pub struct InputRow {
    pub id: Option<i64>,
    pub channel_name: Option<String>,
    pub programme_source_link: Option<String>,
    pub stream_url: Option<String>,
}

/// PostgREST (Supabase REST) client.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    key: String,
}

impl PostgrestStore {
    pub fn new(credentials: StoreCredentials, client: Client) -> Self {
        Self {
            client,
            base_url: credentials.url,
            key: credentials.key,
        }
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{table}", self.base_url))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    async fn send(request: RequestBuilder) -> Result<Response> {
        let resp = request.send().await.map_err(|e| Error::Store(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Store(format!("HTTP {status}: {}", body.trim())))
    }

    pub async fn select(&self, table: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let resp = Self::send(self.request(Method::GET, table).query(query)).await?;
        resp.json().await.map_err(|e| Error::Store(e.to_string()))
    }

    /// POST with merge-duplicates on `on_conflict`.
    pub async fn upsert_json<T: Serialize + Sync>(&self, table: &str, on_conflict: &str, rows: &[T]) -> Result<()> {
        let request = self
            .request(Method::POST, table)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        Self::send(request).await.map(|_| ())
    }

    /// First `manual_tv_input` row by source link, else by channel name.
    pub async fn find_input_row(&self, source_link: Option<&str>, channel_name: Option<&str>) -> Result<Option<InputRow>> {
        let lookups = [("programme_source_link", source_link), ("channel_name", channel_name)];
        for (column, value) in lookups {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            let filter = format!("eq.{value}");
            let rows = self
                .select(SOURCE_TABLE, &[("select", "*"), (column, filter.as_str()), ("limit", "1")])
                .await?;
            if let Some(row) = rows.into_iter().next() {
                return serde_json::from_value(row)
                    .map(Some)
                    .map_err(|e| Error::Store(format!("unexpected {SOURCE_TABLE} row: {e}")));
            }
        }
        Ok(None)
    }

    /// Points a source row at a fresh manifest, stored as `web:<url>`.
    pub async fn update_stream_url(&self, id: i64, url: &str) -> Result<()> {
        let filter = format!("eq.{id}");
        let request = self
            .request(Method::PATCH, SOURCE_TABLE)
            .query(&[("id", filter.as_str())])
            .json(&serde_json::json!({ "stream_url": format!("web:{url}") }));
        Self::send(request).await.map(|_| ())
    }
}

/// `("a","b")` for PostgREST's `in.` operator.
pub fn in_list(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("({})", quoted.join(","))
}

#[async_trait::async_trait]
impl GuideStore for PostgrestStore {
    async fn read_sources(&self) -> Result<Vec<SourceEntry>> {
        let rows = self
            .select(SOURCE_TABLE, &[("select", "programme_source_link,timezone")])
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_value::<SourceEntry>(row).ok())
            .filter(|e| e.url.as_deref().is_some_and(|u| !u.trim().is_empty()))
            .collect())
    }

    async fn purge(&self, directive: &PurgeDirective) -> Result<()> {
        let low = format!("gte.{}", rows::iso(directive.low));
        let high = format!("lte.{}", rows::iso(directive.high));
        for chunk in directive.sources.chunks(PURGE_CHUNK) {
            info!("purging {} sources from {} to {}", chunk.len(), directive.low, directive.high);
            let sources = format!("in.{}", in_list(chunk));
            let request = self.request(Method::DELETE, GUIDE_TABLE).query(&[
                ("programme_source_link", sources.as_str()),
                ("programme_start_time", low.as_str()),
                ("programme_start_time", high.as_str()),
            ]);
            Self::send(request).await?;
        }
        Ok(())
    }

    async fn upsert_rows(&self, rows: &[GuideRow]) -> Result<usize> {
        let mut written = 0;
        let mut failed = 0;
        for chunk in rows.chunks(UPSERT_CHUNK) {
            match self.upsert_json(GUIDE_TABLE, GUIDE_CONFLICT_KEY, chunk).await {
                Ok(()) => written += chunk.len(),
                Err(e) => {
                    error!("upsert of {} rows failed: {e}", chunk.len());
                    failed += chunk.len();
                }
            }
        }
        if failed > 0 {
            return Err(Error::Store(format!("{failed} of {} rows were not written", rows.len())));
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub purge_hours_back: i64,
    pub hours_ahead: i64,
    pub dry_run_purge: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub purged_sources: usize,
    pub upserted: usize,
    /// Sources that produced no rows; kept out of the purge.
    pub empty_sources: Vec<String>,
}

/// Purges the sources that produced rows, then upserts the fresh rows.
pub async fn publish(
    store: &dyn GuideStore,
    results: &HashMap<String, Vec<Programme>>,
    options: PublishOptions,
    now: DateTime<Utc>,
) -> Result<PublishSummary> {
    let directive = rows::purge_directive(results, options.purge_hours_back, options.hours_ahead, now);
    let mut summary = PublishSummary {
        empty_sources: {
            let mut empty: Vec<String> = results
                .iter()
                .filter(|(_, p)| p.is_empty())
                .map(|(u, _)| u.clone())
                .collect();
            empty.sort_unstable();
            empty
        },
        ..PublishSummary::default()
    };

    if options.dry_run_purge {
        info!("dry run: purge step skipped");
    } else if directive.is_empty() {
        warn!("purge skipped: no sources produced rows");
    } else {
        store.purge(&directive).await?;
        summary.purged_sources = directive.sources.len();
    }

    let rows = rows::dedupe_rows(rows::to_rows(results));
    if rows.is_empty() {
        info!("nothing to upsert");
    } else {
        info!("upserting {} rows", rows.len());
        summary.upserted = store.upsert_rows(&rows).await?;
    }

    for url in &summary.empty_sources {
        warn!("0 rows from {url}; existing rows kept");
    }
    Ok(summary)
}
