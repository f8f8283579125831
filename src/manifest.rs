//! Refreshes a short-lived signed HLS manifest URL stored on a source row.
//!
//! Signed stream URLs carry a JWT as one path segment; its `exp` claim says
//! when the URL stops working. When that is close, the landing page is
//! scraped for a fresh manifest and written back as `web:<url>`.

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::markup::absolute_url;
use crate::store::PostgrestStore;

pub const DEFAULT_PAGE: &str = "https://cdn.teleonce.com/en-vivo/";
pub const DEFAULT_THRESHOLD_SECONDS: i64 = 3 * 60 * 60;
const STORED_PREFIX: &str = "web:";

static RE_M3U8: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)https?://[^\s'"]+?\.m3u8[^\s'"]*"#).unwrap());

/// Manifest candidates in priority order: typed HLS `<source>` tags, other
/// `<source>` tags pointing at `.m3u8`, then any absolute `.m3u8` URL in the page.
pub fn extract_manifests(html: &str, base_url: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let typed = Selector::parse(r#"source[type="application/x-mpegURL"][src]"#)?;
    let any = Selector::parse("source[src]")?;

    let resolve = |src: &str| {
        if src.starts_with("http") {
            Some(src.to_string())
        } else {
            absolute_url(base_url, src)
        }
    };

    let mut out = Vec::new();
    for el in document.select(&typed) {
        let src = el.value().attr("src").unwrap_or("").trim();
        if !src.is_empty() {
            out.extend(resolve(src));
        }
    }
    for el in document.select(&any) {
        let src = el.value().attr("src").unwrap_or("").trim();
        if src.to_lowercase().contains(".m3u8") {
            out.extend(resolve(src));
        }
    }
    out.extend(RE_M3U8.find_iter(html).map(|m| m.as_str().to_string()));

    let mut seen = HashSet::new();
    out.retain(|u| seen.insert(u.clone()));
    Ok(out)
}

/// `exp` claim of the first JWT-shaped path segment, if it decodes.
pub fn jwt_exp_from_url(raw: &str) -> Option<i64> {
    let parsed = url::Url::parse(raw).ok()?;
    let segment = parsed.path_segments()?.find(|s| s.matches('.').count() == 2)?;
    let payload = segment.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

pub fn seconds_left(exp: i64, now: DateTime<Utc>) -> i64 {
    exp - now.timestamp()
}

/// Strips the stored `web:` prefix.
pub fn stored_url(stream_url: Option<&str>) -> &str {
    let current = stream_url.unwrap_or("").trim();
    match current.get(..STORED_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(STORED_PREFIX) => &current[STORED_PREFIX.len()..],
        _ => current,
    }
}

/// Seconds left on the current URL, or `None` when it carries no readable expiry.
pub fn current_seconds_left(current: &str, now: DateTime<Utc>) -> Option<i64> {
    if !current.starts_with("http") {
        return None;
    }
    jwt_exp_from_url(current).map(|exp| seconds_left(exp, now))
}

pub fn needs_refresh(seconds_left: Option<i64>, threshold_seconds: i64, force: bool) -> bool {
    force || seconds_left.is_none_or(|left| left < threshold_seconds)
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub page: String,
    pub source_link: Option<String>,
    pub channel_name: Option<String>,
    pub threshold_seconds: i64,
    pub force: bool,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE.to_string(),
            source_link: Some(DEFAULT_PAGE.to_string()),
            channel_name: None,
            threshold_seconds: DEFAULT_THRESHOLD_SECONDS,
            force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    StillFresh { seconds_left: i64 },
    Updated { url: String, expires_at: Option<i64> },
}

/// Headers the landing page expects from a browser arriving at it.
pub fn page_headers(page: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    if let Ok(referer) = HeaderValue::from_str(page) {
        headers.insert(header::REFERER, referer);
    }
    if let Ok(origin) = HeaderValue::from_str(page.trim_end_matches('/')) {
        headers.insert(header::ORIGIN, origin);
    }
    headers
}

pub async fn refresh_manifest(
    store: &PostgrestStore,
    fetcher: &Fetcher,
    options: &RefreshOptions,
    now: DateTime<Utc>,
) -> Result<RefreshOutcome> {
    let row = store
        .find_input_row(options.source_link.as_deref(), options.channel_name.as_deref())
        .await?
        .ok_or_else(|| Error::Store("no matching source row".to_string()))?;

    let current = stored_url(row.stream_url.as_deref());
    let left = current_seconds_left(current, now);
    match left {
        Some(left) => info!("current manifest expires in {left}s"),
        None => info!("current manifest has no readable expiry; treating as expired"),
    }
    if !needs_refresh(left, options.threshold_seconds, options.force) {
        return Ok(RefreshOutcome::StillFresh {
            seconds_left: left.unwrap_or_default(),
        });
    }

    let html = fetcher.get_text_with(&options.page, &page_headers(&options.page)).await?;
    let candidates = extract_manifests(&html, &options.page)?;
    if candidates.is_empty() {
        return Err(Error::parse(&options.page, "no manifest found on page"));
    }
    let Some(url) = candidates.iter().find(|u| u.contains(".m3u8")).cloned() else {
        for candidate in candidates.iter().take(10) {
            warn!("candidate: {candidate}");
        }
        return Err(Error::parse(&options.page, "no candidate looks like an m3u8 manifest"));
    };

    let id = row
        .id
        .ok_or_else(|| Error::Store("matched row has no id".to_string()))?;
    let expires_at = jwt_exp_from_url(&url);
    if let Some(exp) = expires_at {
        info!("new manifest expires in {}s", seconds_left(exp, now));
    }
    store.update_stream_url(id, &url).await?;
    info!("stream_url updated for row {id}");
    Ok(RefreshOutcome::Updated { url, expires_at })
}
