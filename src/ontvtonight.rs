use chrono::{Duration, NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::markup::{text_lines, text_of};
use crate::timeparse::{AlignMode, TimeResolver, looks_like_time};
use crate::window::{FALLBACK_MINUTES, Slot, chain_end_times};
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

/// Attributes that may carry a start timestamp, in priority order.
pub const TIME_ATTRIBUTES: &[&str] = &["datetime", "data-start", "data-time", "data-timestamp", "data-utc"];

/// Selectors tried, in order, for a row's title.
pub const TITLE_SELECTORS: &[&str] = &["[itemprop=name]", ".program-title", ".title", "h3", "h4", "h5", "a"];

const MAX_ROW_DEPTH: usize = 6;
const ROW_ELEMENTS: &[&str] = &["tr", "li", "article"];
const COLUMN_HEADERS: &[&str] = &["time", "tv show", "hora", "programa"];

static RE_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(AM|PM|A\.M\.|P\.M\.|Close|Cerrar|Programación pagada)$").unwrap());
static RE_TIME_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(\d{1,2}):(\d{2})\s*(am|pm)\s*$").unwrap());
static RE_DATE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

/// Scraper for ontvtonight.com guide pages.
pub struct OnTvTonightScraper {
    domains: Vec<String>,
    align: AlignMode,
}

impl OnTvTonightScraper {
    pub fn new(align: AlignMode) -> Self {
        Self {
            domains: vec!["ontvtonight.com".to_string()],
            align,
        }
    }
}

#[async_trait::async_trait]
impl SiteAdapter for OnTvTonightScraper {
    fn name(&self) -> &'static str {
        "ontvtonight"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
        let resolver = TimeResolver::new(source.timezone).with_mode(self.align);
        let today = resolver.today(ctx.now);
        let body = ctx.fetch_html(&source.url).await?;
        parse_listing(&body, today, &resolver)
    }
}

/// Attribute scan first; plain-text scan when the page has no time attributes.
pub fn parse_listing(html: &str, today: NaiveDate, resolver: &TimeResolver) -> Result<Vec<Programme>> {
    let document = Html::parse_document(html);
    let slots = scan_time_elements(&document, today, resolver)?;
    let slots = if slots.is_empty() {
        debug!("ontvtonight: no time attributes, using text scan");
        scan_text(&document, today, resolver)
    } else {
        slots
    };
    Ok(chain_end_times(slots, Duration::minutes(FALLBACK_MINUTES)))
}

fn is_noise(text: &str) -> bool {
    text.is_empty() || RE_NOISE.is_match(text) || looks_like_time(text)
}

fn is_row(el: &ElementRef<'_>) -> bool {
    ROW_ELEMENTS.contains(&el.value().name())
        || el
            .value()
            .attr("class")
            .is_some_and(|c| c.contains("row") || c.contains("item"))
}

/// Nearest row-like ancestor within [`MAX_ROW_DEPTH`] levels, else the parent.
fn containing_row<'a>(node: ElementRef<'a>) -> Option<ElementRef<'a>> {
    let ancestors: Vec<ElementRef<'a>> = node
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take(MAX_ROW_DEPTH)
        .collect();
    ancestors
        .iter()
        .find(|a| is_row(a))
        .or_else(|| ancestors.first())
        .copied()
}

fn row_title(row: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .flat_map(|sel| row.select(sel))
        .map(text_of)
        .find(|t| !is_noise(t))
        .or_else(|| {
            text_lines(row)
                .into_iter()
                .filter(|t| !is_noise(t))
                .max_by_key(|t| t.chars().count())
        })
}

fn scan_time_elements(document: &Html, today: NaiveDate, resolver: &TimeResolver) -> Result<Vec<Slot>> {
    let any_time = Selector::parse(
        &TIME_ATTRIBUTES
            .iter()
            .map(|a| format!("[{a}]"))
            .collect::<Vec<_>>()
            .join(", "),
    )?;
    let title_selectors = TITLE_SELECTORS
        .iter()
        .map(|s| Selector::parse(s))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut slots = Vec::new();
    for node in document.select(&any_time) {
        let Some(raw) = TIME_ATTRIBUTES
            .iter()
            .find_map(|a| node.value().attr(a))
            .map(str::trim)
            .filter(|v| !v.is_empty())
        else {
            continue;
        };
        let start = match resolver.resolve(raw, today) {
            Ok(start) => start,
            Err(e) => {
                debug!("ontvtonight: {e}");
                continue;
            }
        };
        let Some(title) = containing_row(node).and_then(|row| row_title(row, &title_selectors)) else {
            continue;
        };
        slots.push(Slot::new(title, start));
    }
    Ok(slots)
}

fn meridiem_time(caps: &regex::Captures<'_>) -> Option<NaiveTime> {
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    let pm = caps[3].eq_ignore_ascii_case("pm");
    if pm && hour != 12 {
        hour += 12;
    } else if !pm && hour == 12 {
        hour = 0;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Time line followed by the next usable title line; `YYYY-MM-DD` lines move the date.
fn scan_text(document: &Html, today: NaiveDate, resolver: &TimeResolver) -> Vec<Slot> {
    let lines = text_lines(document.root_element());
    let mut date = today;
    let mut slots = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if RE_DATE_LINE.is_match(line) {
            if let Ok(d) = NaiveDate::parse_from_str(line, "%Y-%m-%d") {
                date = d;
            }
            i += 1;
            continue;
        }
        let Some(time) = RE_TIME_LINE.captures(line).and_then(|c| meridiem_time(&c)) else {
            i += 1;
            continue;
        };

        let title_at = (i + 1..lines.len())
            .take_while(|&j| !RE_TIME_LINE.is_match(&lines[j]))
            .find(|&j| {
                let cand = &lines[j];
                !COLUMN_HEADERS.contains(&cand.to_lowercase().as_str()) && !RE_NOISE.is_match(cand)
            });
        match title_at {
            Some(j) => {
                if let Ok(start) = resolver.at(date, time) {
                    slots.push(Slot::new(lines[j].clone(), start));
                }
                i = j + 1;
            }
            None => i += 1,
        }
    }
    slots
}
