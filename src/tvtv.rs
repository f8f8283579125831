//! tvtv.us station pages (`https://www.tvtv.us/pr/<city>/<lineup>/stn/<id>`).
//!
//! The guide is a Next.js app. The schedule is read from the `__NEXT_DATA__`
//! island when present, otherwise from the largest schedule-looking JSON
//! response captured while the page rendered. Neither source has a stable
//! schema, so programme objects are found by a structural search driven by
//! the key lists below.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Error;
use crate::fetch::CapturedResponse;
use crate::timeparse::{NaiveIso, TimeResolver};
use crate::window::FALLBACK_MINUTES;
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

// Candidate key lists, v1. Order is priority.
pub const TITLE_KEYS: &[&str] = &["title", "programTitle", "name"];
pub const START_KEYS: &[&str] = &[
    "start",
    "startTime",
    "startDateTime",
    "airingStartTime",
    "start_minutes",
    "startMinutes",
    "startMin",
    "minutes",
];
pub const END_KEYS: &[&str] = &["end", "endTime", "endDateTime", "airingEndTime"];
pub const DURATION_KEYS: &[&str] = &["duration", "lengthMinutes", "dur"];
pub const DESCRIPTION_KEYS: &[&str] = &["description", "desc", "synopsis"];
pub const SUBTITLE_KEYS: &[&str] = &["subtitle", "episodeTitle"];
/// Nested object some payloads keep the programme metadata in.
pub const PROGRAM_KEY: &str = "program";

/// Lower-cased keys whose presence marks an object as time-bearing.
pub const TIME_MARKER_KEYS: &[&str] = &[
    "start",
    "end",
    "starttime",
    "endtime",
    "startdatetime",
    "enddatetime",
    "airingstarttime",
    "airingendtime",
    "start_minutes",
    "startminutes",
    "minutes",
    "startmin",
    "duration",
    "lengthminutes",
];

/// Substrings of captured response URLs worth considering.
pub const SCHEDULE_URL_KEYWORDS: &[&str] = &["schedule", "listing", "grid", "stn", "lineup", "_next", "data"];

static RE_PAYLOAD_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(20\d{2}-\d{2}-\d{2})\b").unwrap());

pub struct TvtvScraper {
    domains: Vec<String>,
    naive_iso: NaiveIso,
}

impl TvtvScraper {
    pub fn new(naive_iso: NaiveIso) -> Self {
        Self {
            domains: vec!["tvtv.us".to_string()],
            naive_iso,
        }
    }

    async fn load_payload(&self, ctx: &ScrapeContext, url: &str) -> Result<Value> {
        match ctx.fetcher.get_text(url).await {
            Ok(body) => {
                if let Some(data) = extract_next_data(&body)? {
                    return Ok(data);
                }
                debug!("tvtv: no __NEXT_DATA__ in plain HTML for {url}");
            }
            Err(e) => warn!("tvtv: plain fetch failed for {url}: {e}"),
        }

        let page = ctx.render(url).await?;
        if let Some(data) = extract_next_data(&page.html)? {
            return Ok(data);
        }
        largest_schedule_response(&page.json_responses)
            .cloned()
            .ok_or_else(|| Error::parse(url, "no embedded or captured schedule JSON"))
    }
}

#[async_trait::async_trait]
impl SiteAdapter for TvtvScraper {
    fn name(&self) -> &'static str {
        "tvtv"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
        let resolver = TimeResolver::new(source.timezone).with_naive_iso(self.naive_iso);
        let data = self.load_payload(ctx, &source.url).await?;
        Ok(parse_payload(&data, resolver.today(ctx.now), &resolver))
    }
}

/// The framework's `<script id="__NEXT_DATA__">` island, if present and valid.
pub fn extract_next_data(html: &str) -> Result<Option<Value>> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script#__NEXT_DATA__")?;
    Ok(document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>())
        .and_then(|txt| serde_json::from_str::<Value>(&txt).ok()))
}

/// Largest non-empty JSON object among responses from schedule-like URLs.
pub fn largest_schedule_response(responses: &[CapturedResponse]) -> Option<&Value> {
    responses
        .iter()
        .filter(|r| SCHEDULE_URL_KEYWORDS.iter().any(|k| r.url.contains(k)))
        .map(|r| &r.body)
        .filter(|body| body.as_object().is_some_and(|m| !m.is_empty()))
        .max_by_key(|body| body.to_string().len())
}

/// Longest accepted `duration`; anything larger is treated as missing.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// Exact key first, then a case-insensitive match.
fn field<'a>(node: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    node.get(key)
        .or_else(|| node.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v))
}

fn text_field(node: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| field(node, k))
        .filter_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
}

fn nested_program(node: &Map<String, Value>) -> Option<&Map<String, Value>> {
    field(node, PROGRAM_KEY).and_then(Value::as_object)
}

fn title_of(node: &Map<String, Value>) -> Option<String> {
    text_field(node, TITLE_KEYS).or_else(|| nested_program(node).and_then(|p| text_field(p, &["title", "name"])))
}

fn looks_like_programme(node: &Map<String, Value>) -> bool {
    let has_title = TITLE_KEYS.iter().any(|k| field(node, k).is_some())
        || nested_program(node).is_some_and(|p| field(p, "title").is_some() || field(p, "name").is_some());
    has_title
        && node
            .keys()
            .any(|k| TIME_MARKER_KEYS.contains(&k.to_lowercase().as_str()))
}

/// Every object in the tree that has a title-like and a time-like key.
pub fn find_programme_nodes(value: &Value) -> Vec<&Map<String, Value>> {
    fn walk<'a>(value: &'a Value, out: &mut Vec<&'a Map<String, Value>>) {
        match value {
            Value::Object(map) => {
                if looks_like_programme(map) {
                    out.push(map);
                }
                for child in map.values() {
                    walk(child, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, &mut out);
    out
}

fn first_value<'a>(node: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| field(node, k))
        .find(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
}

fn duration_minutes(node: &Map<String, Value>) -> Option<i64> {
    first_value(node, DURATION_KEYS).and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
    .filter(|m| m.is_finite() && *m > 0.0 && *m <= MAX_DURATION_MINUTES as f64)
    .map(|m| m as i64)
}

/// A date sniffed from the serialized payload, used to anchor time-only values.
pub fn payload_date(value: &Value) -> Option<NaiveDate> {
    let text = value.to_string();
    RE_PAYLOAD_DATE
        .captures(&text)
        .and_then(|c| NaiveDate::parse_from_str(&c[1], "%Y-%m-%d").ok())
}

/// Programmes found anywhere in `data`.
///
/// Ends come from an explicit end, else start + duration, else the next
/// start, else the 60-minute fallback.
pub fn parse_payload(data: &Value, today: NaiveDate, resolver: &TimeResolver) -> Vec<Programme> {
    let base = payload_date(data).unwrap_or(today);
    let mut found: Vec<(Programme, bool)> = Vec::new();

    for node in find_programme_nodes(data) {
        let Some(title) = title_of(node) else {
            continue;
        };
        let Some(start) = first_value(node, START_KEYS).and_then(|v| resolver.resolve_json(v, base).ok()) else {
            debug!("tvtv: {title:?} has no readable start");
            continue;
        };
        let end: Option<DateTime<Utc>> = first_value(node, END_KEYS)
            .and_then(|v| resolver.resolve_json(v, base).ok())
            .or_else(|| {
                duration_minutes(node)
                    .and_then(Duration::try_minutes)
                    .and_then(|d| start.checked_add_signed(d))
            });

        let program = nested_program(node);
        let description = text_field(node, DESCRIPTION_KEYS)
            .or_else(|| program.and_then(|p| text_field(p, &["synopsis", "description"])))
            .or_else(|| text_field(node, SUBTITLE_KEYS))
            .or_else(|| program.and_then(|p| text_field(p, &["episodeTitle"])));

        let mut programme = Programme::new(title, start, end.unwrap_or(start));
        programme.description = description;
        found.push((programme, end.is_some()));
    }

    found.sort_by_key(|(p, _)| p.start);
    let starts: Vec<DateTime<Utc>> = found.iter().map(|(p, _)| p.start).collect();
    found
        .into_iter()
        .filter_map(|(mut p, has_end)| {
            if !has_end {
                p.end = match starts.iter().copied().find(|s| *s > p.start) {
                    Some(next) => next,
                    None => p.start.checked_add_signed(Duration::minutes(FALLBACK_MINUTES))?,
                };
            }
            Some(p)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America;
    use serde_json::json;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn payload() -> Value {
        json!({
            "props": {"pageProps": {
                "gridDate": "2024-03-01",
                "station": {"callSign": "WKAQ"},
                "listings": [
                    {"title": "Noticentro", "startTime": "2024-03-01T10:00:00Z", "duration": 60, "subtitle": "Edición matutina"},
                    {"programTitle": "Telenovela", "startTime": "2024-03-01T11:00:00", "endTime": "2024-03-01T12:30:00Z", "description": "Capítulo 12"},
                    {"program": {"title": "Película", "synopsis": "Drama"}, "start": "1:00 PM"},
                    {"name": "Sin horario", "channel": "4"}
                ]
            }}
        })
    }

    #[test]
    fn structural_search_finds_programme_objects() {
        let data = payload();
        assert_eq!(find_programme_nodes(&data).len(), 3);
        assert_eq!(payload_date(&data), NaiveDate::from_ymd_opt(2024, 3, 1));
    }

    #[test]
    fn resolves_mixed_time_encodings() {
        let resolver = TimeResolver::new(America::Puerto_Rico).with_naive_iso(NaiveIso::Utc);
        let today = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let progs = parse_payload(&payload(), today, &resolver);
        assert_eq!(progs.len(), 3);

        assert_eq!(progs[0].title, "Noticentro");
        assert_eq!((progs[0].start, progs[0].end), (utc(10, 0), utc(11, 0)));
        assert_eq!(progs[0].description.as_deref(), Some("Edición matutina"));

        assert_eq!(progs[1].title, "Telenovela");
        assert_eq!((progs[1].start, progs[1].end), (utc(11, 0), utc(12, 30)));

        // time-only, anchored on the sniffed date in UTC-4
        assert_eq!(progs[2].title, "Película");
        assert_eq!((progs[2].start, progs[2].end), (utc(17, 0), utc(18, 0)));
        assert_eq!(progs[2].description.as_deref(), Some("Drama"));
    }

    #[test]
    fn minutes_from_midnight_and_chained_ends() {
        let data = json!({"grid": [
            {"title": "A", "startMinutes": 360},
            {"title": "B", "startMinutes": 420}
        ]});
        let resolver = TimeResolver::new(America::Puerto_Rico);
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let progs = parse_payload(&data, today, &resolver);
        assert_eq!((progs[0].start, progs[0].end), (utc(10, 0), utc(11, 0)));
        assert_eq!(progs[1].end, utc(12, 0));
    }

    #[test]
    fn out_of_range_durations_fall_back_to_the_next_start() {
        let data = json!({"l": [
            {"title": "X", "startTime": "2024-03-01T10:00:00Z", "duration": 1e300},
            {"title": "Y", "startTime": "2024-03-01T11:00:00Z", "duration": -5},
            {"title": "Z", "startTime": "2024-03-01T12:00:00Z", "duration": "90"}
        ]});
        let resolver = TimeResolver::new(America::Puerto_Rico);
        let progs = parse_payload(&data, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), &resolver);
        let spans: Vec<_> = progs.iter().map(|p| (p.title.as_str(), p.start, p.end)).collect();
        assert_eq!(
            spans,
            vec![
                ("X", utc(10, 0), utc(11, 0)),
                ("Y", utc(11, 0), utc(12, 0)),
                ("Z", utc(12, 0), utc(13, 30)),
            ]
        );
    }

    #[test]
    fn key_case_does_not_matter() {
        let data = json!({"items": [
            {"Title": "Noticiario", "StartTime": "2024-03-01T10:00:00Z", "Duration": 30},
            {"Program": {"Name": "Serie"}, "START": "2024-03-01T10:30:00Z"}
        ]});
        let resolver = TimeResolver::new(America::Puerto_Rico);
        let progs = parse_payload(&data, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), &resolver);
        let titles: Vec<&str> = progs.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Noticiario", "Serie"]);
        assert_eq!(progs[0].end, utc(10, 30));
    }

    #[tokio::test]
    async fn payload_sources_are_tried_in_order() {
        use crate::fetch::Renderer;
        use crate::fetch::test_support::{StubRenderer, context, serve};
        use std::sync::Arc;

        let island = r#"<script id="__NEXT_DATA__">{"from": "plain"}</script>"#;
        let rendered_island = r#"<script id="__NEXT_DATA__">{"from": "rendered"}</script>"#;
        let captured = vec![CapturedResponse {
            url: "https://www.tvtv.us/api/v1/lineup/x/grid".into(),
            body: json!({"from": "captured"}),
        }];
        let scraper = TvtvScraper::new(NaiveIso::Utc);

        let (with_island, _) = serve(vec![(200, island)]).await;
        let (without_island, _) = serve(vec![(200, "<html></html>")]).await;

        let stub = StubRenderer::new(rendered_island, captured.clone());
        let ctx = context(1, Some(stub.clone() as Arc<dyn Renderer>), false);
        assert_eq!(scraper.load_payload(&ctx, &with_island).await.unwrap(), json!({"from": "plain"}));
        assert_eq!(stub.calls(), 0);
        assert_eq!(scraper.load_payload(&ctx, &without_island).await.unwrap(), json!({"from": "rendered"}));

        let stub = StubRenderer::new("<html></html>", captured);
        let ctx = context(1, Some(stub as Arc<dyn Renderer>), false);
        assert_eq!(scraper.load_payload(&ctx, &without_island).await.unwrap(), json!({"from": "captured"}));

        let stub = StubRenderer::new("<html></html>", Vec::new());
        let ctx = context(1, Some(stub as Arc<dyn Renderer>), false);
        assert!(matches!(scraper.load_payload(&ctx, &without_island).await, Err(Error::Parse { .. })));
    }

    #[test]
    fn next_data_island_and_captured_responses() {
        let html = r#"<html><body><script id="__NEXT_DATA__" type="application/json">{"props":{"a":1}}</script></body></html>"#;
        assert_eq!(extract_next_data(html).unwrap(), Some(json!({"props": {"a": 1}})));
        assert_eq!(extract_next_data("<html></html>").unwrap(), None);

        let responses = vec![
            CapturedResponse { url: "https://www.tvtv.us/api/v1/lineup/x/grid".into(), body: json!({"items": [1, 2, 3]}) },
            CapturedResponse { url: "https://www.tvtv.us/api/v1/lineup/x".into(), body: json!({"items": [1]}) },
            CapturedResponse { url: "https://cdn.example/analytics".into(), body: json!({"items": [1, 2, 3, 4, 5, 6]}) },
        ];
        assert_eq!(largest_schedule_response(&responses), Some(&json!({"items": [1, 2, 3]})));
    }
}
