use chrono::{Days, Duration, NaiveDate};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::markup::text_of;
use crate::timeparse::TimeResolver;
use crate::window::{FALLBACK_MINUTES, Slot, chain_end_times};
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

/// Scraper for tvguia.es channel pages and their `/manana` (tomorrow) sibling.
pub struct TvGuiaScraper {
    domains: Vec<String>,
}

impl TvGuiaScraper {
    pub fn new() -> Self {
        Self {
            domains: vec!["tvguia.es".to_string()],
        }
    }
}

impl Default for TvGuiaScraper {
    fn default() -> Self {
        Self::new()
    }
}

/// URL of the following day's listing.
pub fn tomorrow_url(url: &str) -> String {
    format!("{}/manana", url.trim_end_matches('/'))
}

#[async_trait::async_trait]
impl SiteAdapter for TvGuiaScraper {
    fn name(&self) -> &'static str {
        "tvguia"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
        let resolver = TimeResolver::new(source.timezone);
        let today = resolver.today(ctx.now);

        let body = ctx.fetch_html(&source.url).await?;
        let mut slots = parse_cards(&body, today, &resolver)?;

        let next = tomorrow_url(&source.url);
        match ctx.fetch_html(&next).await {
            Ok(body) => {
                if let Some(tomorrow) = today.checked_add_days(Days::new(1)) {
                    slots.extend(parse_cards(&body, tomorrow, &resolver)?);
                }
            }
            Err(e) => warn!("tvguia: secondary page {next} skipped: {e}"),
        }

        Ok(chain_end_times(slots, Duration::minutes(FALLBACK_MINUTES)))
    }
}

fn child_text(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
}

/// Reads every `article.programacion-item` card on one day's page.
pub fn parse_cards(html: &str, base: NaiveDate, resolver: &TimeResolver) -> Result<Vec<Slot>> {
    let document = Html::parse_document(html);
    let card_selector = Selector::parse("article.programacion-item")?;
    let hour_selector = Selector::parse("span.programacion-item-hour")?;
    let title_selector = Selector::parse("h3.programacion-item-title")?;
    let category_selector = Selector::parse("span.programacion-item-category")?;
    let synopsis_selector = Selector::parse("div.programacion-item-sinopsis")?;

    let mut slots = Vec::new();
    for card in document.select(&card_selector) {
        let (Some(hour), Some(title)) = (
            child_text(card, &hour_selector),
            child_text(card, &title_selector),
        ) else {
            continue;
        };
        let start = match resolver.resolve(&hour, base) {
            Ok(start) => start,
            Err(e) => {
                debug!("tvguia: {title:?}: {e}");
                continue;
            }
        };
        let mut slot = Slot::new(title, start);
        slot.category = child_text(card, &category_selector);
        slot.description = child_text(card, &synopsis_selector);
        slots.push(slot);
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Europe;

    fn card(hour: &str, title: &str, extra: &str) -> String {
        format!(
            r#"<article class="programacion-item">
                 <span class="programacion-item-hour">{hour}</span>
                 <h3 class="programacion-item-title">{title}</h3>{extra}
               </article>"#
        )
    }

    #[test]
    fn reads_cards_and_chains_ends() {
        let html = format!(
            "<main>{}{}{}</main>",
            card(
                "21:00",
                "Telediario 2",
                r#"<span class="programacion-item-category">Informativo</span>
                   <div class="programacion-item-sinopsis"> Noticias de la noche. </div>"#
            ),
            card("21:45", "El tiempo", ""),
            card("sin hora", "Roto", ""),
        );
        let resolver = TimeResolver::new(Europe::Madrid);
        let base = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let slots = parse_cards(&html, base, &resolver).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].category.as_deref(), Some("Informativo"));
        assert_eq!(slots[0].description.as_deref(), Some("Noticias de la noche."));

        let progs = chain_end_times(slots, Duration::minutes(FALLBACK_MINUTES));
        // Madrid is UTC+1 in March before the switch
        assert_eq!(progs[0].start, Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap());
        assert_eq!(progs[0].end, progs[1].start);
        assert_eq!(progs[1].end - progs[1].start, Duration::minutes(60));
    }

    #[test]
    fn tomorrow_url_appends_path_segment() {
        assert_eq!(tomorrow_url("https://www.tvguia.es/canal/la-1/"), "https://www.tvguia.es/canal/la-1/manana");
        assert_eq!(tomorrow_url("https://www.tvguia.es/canal/la-1"), "https://www.tvguia.es/canal/la-1/manana");
    }
}
