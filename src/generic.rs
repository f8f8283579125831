use chrono::{Days, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use tracing::debug;

use crate::markup::text_lines;
use crate::timeparse::TimeResolver;
use crate::window::{FALLBACK_MINUTES, Slot, chain_end_times};
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

static RE_TIMED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\d{1,2}[:.]\d{2}(?:\s*[ap]\.?\s?m\.?)?)\s*(?:hrs?\.?|h\b)?\s*[-–|:.]?\s*(.*?\p{L}.*)$").unwrap()
});

/// Best-effort scanner for sites without structural cues, enabled per domain.
pub struct GenericLineScraper {
    domains: Vec<String>,
}

impl GenericLineScraper {
    pub fn new(domains: Vec<String>) -> Self {
        Self { domains }
    }
}

#[async_trait::async_trait]
impl SiteAdapter for GenericLineScraper {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
        let resolver = TimeResolver::new(source.timezone);
        let body = ctx.fetch_html(&source.url).await?;
        Ok(scan_lines(&body, resolver.today(ctx.now), &resolver))
    }
}

/// Lines of the form `<time> <title>`; a time earlier than the previous one
/// starts the next day.
pub fn scan_lines(html: &str, today: NaiveDate, resolver: &TimeResolver) -> Vec<Programme> {
    let document = Html::parse_document(html);
    let mut date = today;
    let mut previous = None;
    let mut slots = Vec::new();

    for line in text_lines(document.root_element()) {
        let Some(caps) = RE_TIMED_LINE.captures(&line) else {
            continue;
        };
        let Ok(time) = crate::timeparse::parse_clock(&caps[1]) else {
            debug!("generic: unreadable time in {line:?}");
            continue;
        };
        if previous.is_some_and(|p| time < p)
            && let Some(next) = date.checked_add_days(Days::new(1))
        {
            date = next;
        }
        previous = Some(time);

        if let Ok(start) = resolver.at(date, time) {
            slots.push(Slot::new(caps[2].trim(), start));
        }
    }
    chain_end_times(slots, Duration::minutes(FALLBACK_MINUTES))
}
