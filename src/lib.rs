pub mod config;
pub mod error;
pub mod fetch;
pub mod live_channels;
pub mod manifest;
pub mod markup;
pub mod orchestrator;
pub mod registry;
pub mod rows;
pub mod sources;
pub mod store;
pub mod timeparse;
pub mod window;

pub mod gatotv;
pub mod generic;
pub mod laocho;
pub mod mvstv;
pub mod ontvtonight;
pub mod tvguia;
pub mod tvtv;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

pub use error::{Error, Result, TimeParseError};
pub use fetch::ScrapeContext;

/// Canonical guide entry every adapter produces, in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Programme {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub category: Option<String>,
    pub description: Option<String>,
}

impl Programme {
    pub fn new(title: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            start,
            end,
            category: None,
            description: None,
        }
    }
}

/// One guide page to scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub url: String,
    pub timezone: Tz,
    pub hours_ahead: i64,
}

/// Trait that all site adapters must implement
#[async_trait::async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Host suffixes this adapter claims.
    fn domains(&self) -> &[String];

    /// Whether the URL's host ends with one of [`SiteAdapter::domains`].
    fn matches(&self, url: &str) -> bool {
        host_matches(url, self.domains())
    }

    /// Fetch the source and extract its programmes, resolved to UTC.
    ///
    /// Window normalization is applied by the orchestrator, not here.
    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>>;
}

/// Lower-cased host suffix test shared by all adapters.
pub fn host_matches(url: &str, domains: &[String]) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    domains
        .iter()
        .any(|d| !d.is_empty() && host.ends_with(&d.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_suffix_matching() {
        let domains = vec!["gatotv.com".to_string()];
        assert!(host_matches("https://www.gatotv.com/canal/5_mexico", &domains));
        assert!(host_matches("https://GATOTV.com/", &domains));
        assert!(!host_matches("https://example.com/gatotv.com", &domains));
        assert!(!host_matches("not a url", &domains));
    }
}
