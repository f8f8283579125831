use chrono::{Days, NaiveDate};
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::markup::{absolute_url, text_lines, text_of};
use crate::timeparse::{TimeResolver, looks_like_time};
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

const HEADER_PHRASES: &[&str] = &["Horarios de Programación", "Hora Inicio"];
const NEXT_LINK_TEXTS: &[&str] = &["›", "+", "Siguiente"];

/// Scraper for gatotv.com channel pages (e.g. `https://www.gatotv.com/canal/5_mexico`).
///
/// The schedule is a table whose cells flatten into start, end and title
/// lines; the "›" navigation link leads to the following day.
pub struct GatoTvScraper {
    domains: Vec<String>,
}

impl GatoTvScraper {
    pub fn new() -> Self {
        Self {
            domains: vec!["gatotv.com".to_string()],
        }
    }
}

impl Default for GatoTvScraper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SiteAdapter for GatoTvScraper {
    fn name(&self) -> &'static str {
        "gatotv"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
        let resolver = TimeResolver::new(source.timezone);
        let today = resolver.today(ctx.now);

        let body = ctx.fetch_html(&source.url).await?;
        // Parse in a block so the document is dropped before the next await
        let (mut programmes, next_href) = {
            let document = Html::parse_document(&body);
            (
                parse_day(&document, today, &resolver)?,
                next_day_link(&document, &source.url)?,
            )
        };

        if let Some(next) = next_href {
            debug!("gatotv: following next-day link {next}");
            match ctx.fetch_html(&next).await {
                Ok(body) => {
                    let document = Html::parse_document(&body);
                    if let Some(tomorrow) = today.checked_add_days(Days::new(1)) {
                        programmes.extend(parse_day(&document, tomorrow, &resolver)?);
                    }
                }
                Err(e) => warn!("gatotv: next-day page {next} skipped: {e}"),
            }
        }
        Ok(programmes)
    }
}

/// Scans the schedule block for consecutive (start, end, title) lines.
pub fn parse_day(document: &Html, base: NaiveDate, resolver: &TimeResolver) -> Result<Vec<Programme>> {
    let block_selector = Selector::parse("table, div, section")?;

    // The largest block mentioning a header phrase holds the whole table
    let Some(block) = document
        .select(&block_selector)
        .map(|el| (text_of(el), el))
        .filter(|(text, _)| HEADER_PHRASES.iter().any(|h| text.contains(h)))
        .max_by_key(|(text, _)| text.len())
        .map(|(_, el)| el)
    else {
        return Ok(Vec::new());
    };

    let lines = text_lines(block);
    let mut programmes = Vec::new();
    let mut i = 0;
    while i + 2 < lines.len() {
        let (s, e, t) = (&lines[i], &lines[i + 1], &lines[i + 2]);
        if looks_like_time(s) && looks_like_time(e) && !looks_like_time(t) {
            match (resolver.resolve(s, base), resolver.resolve(e, base)) {
                (Ok(start), Ok(end)) => programmes.push(Programme::new(t.as_str(), start, end)),
                _ => debug!("gatotv: dropping unreadable slot {s:?}-{e:?} {t:?}"),
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(programmes)
}

/// The last navigation link that points to the following day.
pub fn next_day_link(document: &Html, page_url: &str) -> Result<Option<String>> {
    let anchor = Selector::parse("a[href]")?;
    Ok(document
        .select(&anchor)
        .filter(|a| {
            let text = a.text().collect::<String>();
            NEXT_LINK_TEXTS.contains(&text.trim()) || text.contains('›')
        })
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| absolute_url(page_url, href))
        .last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use chrono_tz::America;

    const PAGE: &str = r#"
        <html><body>
          <div class="nav"><a href="/canal/5_mexico/2024-03-02">Sábado 2 ›</a></div>
          <div class="tbl_EPG">
            <table>
              <tr><th>Horarios de Programación</th></tr>
              <tr><th>Hora Inicio</th><th>Hora Fin</th><th>Programa</th></tr>
              <tr><td><time>06:00</time></td><td><time>07:30</time></td><td><a>Caricaturas</a></td></tr>
              <tr><td><time>07:30</time></td><td><time>08:00</time></td><td><a>Noticiero</a></td></tr>
              <tr><td>Publicidad</td></tr>
              <tr><td><time>23:30</time></td><td><time>00:30</time></td><td><a>Película de media noche</a></td></tr>
            </table>
          </div>
        </body></html>"#;

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn scans_time_time_title_triplets() {
        let document = Html::parse_document(PAGE);
        let resolver = TimeResolver::new(America::Mexico_City);
        let base = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let progs = parse_day(&document, base, &resolver).unwrap();

        let titles: Vec<&str> = progs.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Caricaturas", "Noticiero", "Película de media noche"]);
        assert_eq!(progs[0].start, utc(1, 12, 0));
        assert_eq!(progs[0].end, utc(1, 13, 30));
        // end before start is left for window normalization to repair
        assert!(progs[2].end < progs[2].start);
    }

    #[test]
    fn page_without_header_yields_nothing() {
        let document = Html::parse_document("<div><p>06:00</p><p>07:00</p><p>Algo</p></div>");
        let resolver = TimeResolver::new(America::Mexico_City);
        let base = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert!(parse_day(&document, base, &resolver).unwrap().is_empty());
    }

    #[test]
    fn finds_next_day_link() {
        let document = Html::parse_document(PAGE);
        assert_eq!(
            next_day_link(&document, "https://www.gatotv.com/canal/5_mexico").unwrap().as_deref(),
            Some("https://www.gatotv.com/canal/5_mexico/2024-03-02")
        );
        let bare = Html::parse_document("<a href='/x'>Inicio</a>");
        assert_eq!(next_day_link(&bare, "https://www.gatotv.com/").unwrap(), None);
    }
}
