use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::markup::{text_lines, text_of};
use crate::timeparse::{NaiveIso, TimeResolver};
use crate::window::FALLBACK_MINUTES;
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

static RE_AGENDAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bAGENDAR\b").unwrap());
static RE_DATE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(Lunes|Martes|Mi[eéí]rcoles|Jueves|Viernes|S[aá]bado|Domingo),?\s+(\d{1,2})\s+de\s+(\p{L}+)\.?$")
        .unwrap()
});
static RE_ONLY_MERIDIEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^([ap])\.?\s?m\.?$").unwrap());
static RE_CLOCK_IN_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2}:\d{2})\b(?:\s*([ap]\.?\s?m\.?))?").unwrap());
static RE_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-zÁÉÍÓÚÜÑáéíóúüñ]").unwrap());

const TITLE_SELECTOR: &str = "h1, h2, h3, h4, strong, .title, .program-title";
const CARD_CLASSES: &[&str] = &["card", "program", "programa", "uk-card", "uk-grid"];
const MAX_CARD_DEPTH: usize = 8;
/// A parsed date this far in the past is taken to belong to next year.
const YEAR_ROLLOVER_DAYS: i64 = 60;

const START_ATTRIBUTES: &[&str] = &["data-start", "data-from", "data-inicio"];
const END_ATTRIBUTES: &[&str] = &["data-end", "data-to", "data-fin"];

pub const MONTHS: &[(&str, u32)] = &[
    ("ene", 1),
    ("enero", 1),
    ("feb", 2),
    ("febrero", 2),
    ("mar", 3),
    ("marzo", 3),
    ("abr", 4),
    ("abril", 4),
    ("may", 5),
    ("mayo", 5),
    ("jun", 6),
    ("junio", 6),
    ("jul", 7),
    ("julio", 7),
    ("ago", 8),
    ("agosto", 8),
    ("sep", 9),
    ("sept", 9),
    ("septiembre", 9),
    ("oct", 10),
    ("octubre", 10),
    ("nov", 11),
    ("noviembre", 11),
    ("dic", 12),
    ("diciembre", 12),
];

/// Scraper for mvstv.com programme pages, driven by their "AGENDAR"
/// (add to calendar) controls.
pub struct MvsTvScraper {
    domains: Vec<String>,
    naive_iso: NaiveIso,
}

impl MvsTvScraper {
    pub fn new(naive_iso: NaiveIso) -> Self {
        Self {
            domains: vec!["mvstv.com".to_string()],
            naive_iso,
        }
    }
}

#[async_trait::async_trait]
impl SiteAdapter for MvsTvScraper {
    fn name(&self) -> &'static str {
        "mvstv"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
        let resolver = TimeResolver::new(source.timezone).with_naive_iso(self.naive_iso);
        // The calendar controls are script-built; prefer the rendered DOM
        let html = ctx.rendered_or_plain(&source.url).await?;
        parse_agenda(&html, resolver.today(ctx.now), &resolver)
    }
}

fn looks_like_title(text: &str) -> bool {
    let text = text.trim();
    !text.is_empty()
        && !RE_ONLY_MERIDIEM.is_match(text)
        && !RE_DATE_LINE.is_match(text)
        && !RE_AGENDAR.is_match(text)
        && RE_LETTER.is_match(text)
}

fn is_card(el: &ElementRef<'_>) -> bool {
    matches!(el.value().name(), "article" | "div")
        || el
            .value()
            .classes()
            .any(|c| CARD_CLASSES.contains(&c))
}

/// Calendar links first; the card's visible text when none carry times.
pub fn parse_agenda(html: &str, today: NaiveDate, resolver: &TimeResolver) -> Result<Vec<Programme>> {
    let document = Html::parse_document(html);
    let programmes = scan_calendar_controls(&document, today, resolver)?;
    if !programmes.is_empty() {
        return Ok(programmes);
    }
    debug!("mvstv: no calendar data, reading card text");
    scan_cards(&document, today, resolver)
}

/// Start and end from a Google-Calendar `dates=START/END` value.
pub fn parse_dates_param(value: &str, base: NaiveDate, resolver: &TimeResolver) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let parts: Vec<&str> = value.split('/').map(str::trim).filter(|p| !p.is_empty()).collect();
    let [start, end] = parts.as_slice() else {
        return None;
    };
    Some((resolver.resolve(start, base).ok()?, resolver.resolve(end, base).ok()?))
}

fn scan_calendar_controls(document: &Html, today: NaiveDate, resolver: &TimeResolver) -> Result<Vec<Programme>> {
    let controls = Selector::parse("a, button")?;
    let title_selector = Selector::parse(TITLE_SELECTOR)?;

    let mut programmes = Vec::new();
    for control in document.select(&controls) {
        if !RE_AGENDAR.is_match(&text_of(control)) {
            continue;
        }
        let attrs = control.value();
        let card = control.ancestors().filter_map(ElementRef::wrap).find(is_card);
        let mut title = attrs
            .attr("data-title")
            .map(str::to_string)
            .or_else(|| {
                card.and_then(|c| c.select(&title_selector).next())
                    .map(text_of)
            })
            .unwrap_or_default();

        let mut window = None;
        if let Some(href) = attrs.attr("href")
            && let Ok(link) = url::Url::parse(href)
        {
            for (key, value) in link.query_pairs() {
                match key.as_ref() {
                    "text" if title.is_empty() => title = value.into_owned(),
                    "dates" => window = parse_dates_param(&value, today, resolver),
                    _ => {}
                }
            }
        }
        if window.is_none() {
            let start = START_ATTRIBUTES.iter().find_map(|a| attrs.attr(a));
            let end = END_ATTRIBUTES.iter().find_map(|a| attrs.attr(a));
            if let (Some(s), Some(e)) = (start, end)
                && let (Ok(s), Ok(e)) = (resolver.resolve(s, today), resolver.resolve(e, today))
            {
                window = Some((s, e));
            }
        }

        if let Some((start, end)) = window
            && looks_like_title(&title)
        {
            programmes.push(Programme::new(title.trim(), start, end));
        }
    }
    Ok(programmes)
}

/// Reads "Lunes, 1 de septiembre" against `today`, rolling stale dates into next year.
pub fn parse_spanish_date(line: &str, today: NaiveDate) -> Option<NaiveDate> {
    let caps = RE_DATE_LINE.captures(line.trim())?;
    let day: u32 = caps[2].parse().ok()?;
    let month_token = caps[3].to_lowercase();
    let month = MONTHS.iter().find(|(name, _)| *name == month_token).map(|(_, m)| *m)?;
    let candidate = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if (today - candidate).num_days() > YEAR_ROLLOVER_DAYS {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    } else {
        Some(candidate)
    }
}

/// First clock on any line, joined with a meridiem on the same or the next line.
fn time_from_lines(lines: &[String]) -> Option<String> {
    lines.iter().enumerate().find_map(|(i, line)| {
        let caps = RE_CLOCK_IN_LINE.captures(line)?;
        let clock = caps[1].to_string();
        match caps.get(2) {
            Some(mer) => Some(format!("{clock} {}", mer.as_str())),
            None => match lines.get(i + 1) {
                Some(next) if RE_ONLY_MERIDIEM.is_match(next) => Some(format!("{clock} {next}")),
                _ => Some(clock),
            },
        }
    })
}

struct CardEntry {
    date: NaiveDate,
    title: String,
    start: DateTime<Utc>,
}

fn scan_cards(document: &Html, today: NaiveDate, resolver: &TimeResolver) -> Result<Vec<Programme>> {
    let title_selector = Selector::parse(TITLE_SELECTOR)?;

    let mut entries = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        if !RE_AGENDAR.is_match(text) {
            continue;
        }
        let card = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .take(MAX_CARD_DEPTH)
            .map(|el| (el, text_lines(el)))
            .find(|(_, lines)| {
                lines.iter().any(|l| RE_CLOCK_IN_LINE.is_match(l)) && lines.iter().any(|l| RE_DATE_LINE.is_match(l))
            });
        let Some((card, lines)) = card else {
            continue;
        };

        let time = time_from_lines(&lines);
        let date = lines.iter().find_map(|l| parse_spanish_date(l, today));
        let title = card
            .select(&title_selector)
            .map(text_of)
            .find(|t| looks_like_title(t))
            .or_else(|| {
                lines
                    .iter()
                    .filter(|l| !RE_CLOCK_IN_LINE.is_match(l))
                    .find(|l| looks_like_title(l))
                    .cloned()
            });

        let (Some(time), Some(date), Some(title)) = (time, date, title) else {
            continue;
        };
        match resolver.resolve(&time, date) {
            Ok(start) => entries.push(CardEntry { date, title, start }),
            Err(e) => debug!("mvstv: {title:?}: {e}"),
        }
    }

    entries.sort_by_key(|e| (e.date, e.start));
    let programmes = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let end = entries[i + 1..]
                .iter()
                .find(|next| next.date == entry.date)
                .map(|next| next.start)
                .unwrap_or(entry.start + Duration::minutes(FALLBACK_MINUTES));
            Programme::new(entry.title.clone(), entry.start, end)
        })
        .collect();
    Ok(programmes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America;

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn reads_calendar_links_and_data_attributes() {
        let html = r#"
            <div class="uk-card">
              <h3>Noticias MVS</h3>
              <a href="https://calendar.google.com/calendar/render?action=TEMPLATE&text=Noticias+MVS&dates=20240301T140000Z/20240301T150000Z">AGENDAR</a>
            </div>
            <div class="uk-card">
              <a href="https://calendar.google.com/calendar/render?action=TEMPLATE&text=Cine+de+la+tarde&dates=20240301T160000/20240301T180000">Agendar</a>
            </div>
            <div class="card"><strong>Deportes</strong>
              <button data-inicio="2024-03-01T20:00:00-06:00" data-fin="2024-03-01T21:00:00-06:00">AGENDAR</button>
            </div>
            <div><span>AM</span><a data-title="PM">AGENDAR</a></div>"#;
        let resolver = TimeResolver::new(America::Mexico_City);
        let progs = parse_agenda(html, today(), &resolver).unwrap();
        assert_eq!(progs.len(), 3);
        assert_eq!(progs[0].title, "Noticias MVS");
        assert_eq!((progs[0].start, progs[0].end), (utc(1, 14, 0), utc(1, 15, 0)));
        // compact local time in UTC-6
        assert_eq!(progs[1].title, "Cine de la tarde");
        assert_eq!((progs[1].start, progs[1].end), (utc(1, 22, 0), utc(2, 0, 0)));
        assert_eq!(progs[2].title, "Deportes");
        assert_eq!(progs[2].start, utc(2, 2, 0));
    }

    #[test]
    fn falls_back_to_card_text() {
        let html = r#"
            <div class="programa">
              <p>Lunes, 4 de marzo</p>
              <p>10:30</p><p>PM</p>
              <h4>Mesa de análisis</h4>
              <span>AGENDAR</span>
            </div>
            <div class="programa">
              <p>Lunes, 4 de marzo</p>
              <p>11:30 PM</p>
              <p>Cierre de emisión</p>
              <span>AGENDAR</span>
            </div>"#;
        let resolver = TimeResolver::new(America::Mexico_City);
        let progs = parse_agenda(html, today(), &resolver).unwrap();
        assert_eq!(progs.len(), 2);
        assert_eq!(progs[0].title, "Mesa de análisis");
        assert_eq!(progs[0].start, utc(5, 4, 30));
        assert_eq!(progs[0].end, utc(5, 5, 30));
        assert_eq!(progs[1].title, "Cierre de emisión");
        assert_eq!(progs[1].end, utc(5, 6, 30));
    }

    #[test]
    fn spanish_dates_roll_into_next_year() {
        let today = NaiveDate::from_ymd_opt(2024, 12, 20).unwrap();
        assert_eq!(
            parse_spanish_date("Jueves, 2 de enero", today),
            NaiveDate::from_ymd_opt(2025, 1, 2)
        );
        assert_eq!(
            parse_spanish_date("Sábado 21 de dic.", today),
            NaiveDate::from_ymd_opt(2024, 12, 21)
        );
        assert_eq!(parse_spanish_date("Lunes, 1 de brumario", today), None);
    }
}
