use chrono::{Duration, NaiveDate, NaiveTime};
use chrono_tz::Europe;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::debug;

use crate::config::DescPolicy;
use crate::markup::text_of;
use crate::timeparse::TimeResolver;
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

static RE_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{2}):(\d{2})\s*[-–]\s*(\d{2}):(\d{2})\b").unwrap());
static RE_SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.\s+[A-ZÁÉÍÓÚÜÑ]").unwrap());

const HEADINGS: &[&str] = &["h2", "h3", "h4"];
const TIME_HOLDERS: &[&str] = &["h5", "h6", "p", "div", "span"];
const DESCRIPTION_HOLDERS: &[&str] = &["p", "div", "span"];

/// Tokens kept upper-case when a shouted title is re-cased.
pub const PRESERVE_UPPERCASE: &[&str] = &["TV", "UHD", "HD", "4K", "3D", "TP", "PR", "MX", "ES", "USA", "RTVE"];

const LEADING_LABELS: &[&str] = &["SINOPSIS:", "SINOPSI:", "SYNOPSIS:", "DESCRIPCIÓN:", "DESCRIPCION:"];

/// Upper-cased leading label -> category.
pub const CATEGORIES: &[(&str, &str)] = &[
    ("CINE", "Cine"),
    ("SERIE", "Serie"),
    ("PELÍCULA", "Película"),
    ("PELICULA", "Película"),
    ("DEPORTE", "Deporte"),
    ("DEPORTES", "Deportes"),
    ("NOTICIAS", "Noticias"),
    ("INFORMATIVO", "Informativo"),
    ("REPORTAJE", "Reportaje"),
    ("ENTREVISTA", "Entrevista"),
    ("DOCUMENTAL", "Documental"),
    ("INFANTIL", "Infantil"),
    ("MAGAZINE", "Magazine"),
];

const SHORT_DESCRIPTION_CHARS: usize = 160;

/// Scraper for https://laocho.tv/tv-programacion/
///
/// Times on the page are Europe/Madrid wall clock regardless of the
/// source's declared zone.
pub struct LaOchoScraper {
    domains: Vec<String>,
    desc_policy: DescPolicy,
}

impl LaOchoScraper {
    pub fn new(desc_policy: DescPolicy) -> Self {
        Self {
            domains: vec!["laocho.tv".to_string()],
            desc_policy,
        }
    }
}

#[async_trait::async_trait]
impl SiteAdapter for LaOchoScraper {
    fn name(&self) -> &'static str {
        "laocho"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
        let today = TimeResolver::new(Europe::Madrid).today(ctx.now);
        let body = ctx.fetch_html(&source.url).await?;
        Ok(parse_schedule(&body, today, self.desc_policy))
    }
}

fn is_heading(el: &ElementRef<'_>) -> bool {
    HEADINGS.contains(&el.value().name())
}

fn local_range(caps: &regex::Captures<'_>) -> Option<(NaiveTime, NaiveTime)> {
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let start = NaiveTime::from_hms_opt(num(1)?, num(2)?, 0)?;
    let end = NaiveTime::from_hms_opt(num(3)?, num(4)?, 0)?;
    Some((start, end))
}

/// Pairs every heading with the first following node holding `HH:MM - HH:MM`.
pub fn parse_schedule(html: &str, today: NaiveDate, policy: DescPolicy) -> Vec<Programme> {
    let resolver = TimeResolver::new(Europe::Madrid);
    let document = Html::parse_document(html);
    let elements: Vec<ElementRef<'_>> = document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .collect();
    let texts: Vec<String> = elements.iter().map(|el| text_of(*el)).collect();

    let mut programmes = Vec::new();
    for (i, heading) in elements.iter().enumerate() {
        if !is_heading(heading) || texts[i].is_empty() {
            continue;
        }
        let Some((j, caps)) = (i + 1..elements.len())
            .filter(|&j| TIME_HOLDERS.contains(&elements[j].value().name()))
            .find_map(|j| RE_RANGE.captures(&texts[j]).map(|c| (j, c)))
        else {
            continue;
        };
        let Some((start_time, end_time)) = local_range(&caps) else {
            debug!("laocho: invalid range {:?}", &caps[0]);
            continue;
        };
        let (Ok(start), Ok(mut end)) = (resolver.at(today, start_time), resolver.at(today, end_time)) else {
            continue;
        };
        if end <= start {
            end += Duration::hours(24);
        }

        let (title, category) = split_title(&texts[i]);
        let description = extract_description(elements[j], policy).map(|d| normalize_sentence(&d));

        let mut programme = Programme::new(title, start, end);
        programme.category = category;
        programme.description = description.filter(|d| !d.is_empty());
        programmes.push(programme);
    }
    programmes
}

fn is_stop(el: &ElementRef<'_>, text: &str) -> bool {
    !text.is_empty() && (is_heading(el) || RE_RANGE.is_match(text))
}

fn is_promo(text: &str) -> bool {
    let up = text.to_uppercase();
    up.starts_with("PRESENTAN ") || up.contains(" PRESENTAN ") || up.starts_with("CONDUCEN ") || up.starts_with("CON ")
}

/// Description from the sibling right after the time node, per `policy`.
pub fn extract_description(time_node: ElementRef<'_>, policy: DescPolicy) -> Option<String> {
    if policy == DescPolicy::None {
        return None;
    }
    let siblings: Vec<(ElementRef<'_>, String)> = time_node
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .map(|el| (el, text_of(el)))
        .take_while(|(el, text)| !is_stop(el, text))
        .collect();

    let first = siblings
        .iter()
        .find(|(el, text)| !text.is_empty() && DESCRIPTION_HOLDERS.contains(&el.value().name()))
        .map(|(_, text)| text.as_str())?;
    if is_promo(first) {
        return None;
    }

    match policy {
        DescPolicy::Full => {
            let joined = siblings
                .iter()
                .map(|(_, text)| text.as_str())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            Some(joined).filter(|t| !t.is_empty())
        }
        _ => Some(first_sentence(first)).filter(|t| !t.is_empty()),
    }
}

/// First sentence, capped at 160 characters.
pub fn first_sentence(text: &str) -> String {
    let sentence = match RE_SENTENCE_END.find(text) {
        Some(m) => text[..m.start() + 1].trim(),
        None => text.trim(),
    };
    if sentence.chars().count() > SHORT_DESCRIPTION_CHARS {
        let cut: String = sentence.chars().take(SHORT_DESCRIPTION_CHARS - 3).collect();
        format!("{}…", cut.trim_end())
    } else {
        sentence.to_string()
    }
}

fn looks_all_caps(text: &str) -> bool {
    text.chars().any(char::is_alphabetic) && !text.chars().any(char::is_lowercase)
}

fn strip_leading_label(text: &str) -> &str {
    for label in LEADING_LABELS {
        let n = label.chars().count();
        let head: String = text.chars().take(n).collect();
        if head.to_uppercase() == *label {
            return text[head.len()..].trim_start();
        }
    }
    text
}

/// Collapses whitespace, drops a leading "SINOPSIS:"-style label and re-cases
/// shouted text to sentence case, keeping [`PRESERVE_UPPERCASE`] tokens.
pub fn normalize_sentence(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let stripped = strip_leading_label(&collapsed);
    if !looks_all_caps(stripped) {
        return stripped.to_string();
    }

    let lowered = stripped.to_lowercase();
    let mut chars = lowered.chars();
    let capitalized: String = match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };

    capitalized
        .split(' ')
        .map(|word| {
            let core_start = word.len() - word.trim_start_matches(|c: char| !c.is_alphanumeric()).len();
            let core_end = word.trim_end_matches(|c: char| !c.is_alphanumeric()).len().max(core_start);
            let core = &word[core_start..core_end];
            let upper = core.to_uppercase();
            if PRESERVE_UPPERCASE.contains(&upper.as_str()) {
                format!("{}{}{}", &word[..core_start], upper, &word[core_end..])
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a known leading category label off the title.
///
/// `"SERIE: LOS ÁNGELES"` becomes `("Los ángeles", Some("Serie"))`; an
/// unknown label stays in the title.
pub fn split_title(raw: &str) -> (String, Option<String>) {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let Some((left, right)) = text.split_once(':') else {
        return (de_shout(&text), None);
    };
    let (left, right) = (left.trim(), right.trim());
    if right.is_empty() {
        return (de_shout(&text), None);
    }
    let right = de_shout(right);
    let left_key = left.to_uppercase();
    match CATEGORIES.iter().find(|(key, _)| *key == left_key) {
        Some((_, category)) => (right, Some(category.to_string())),
        None => (format!("{left}: {right}"), None),
    }
}

fn de_shout(text: &str) -> String {
    if looks_all_caps(text) {
        normalize_sentence(text)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const PAGE: &str = r#"
        <div class="programa">
          <h3>SERIE: LOS ÁNGELES DE CHARLIE</h3>
          <p class="hora">10:00 - 11:30</p>
          <p>UNA SERIE DE ACCIÓN EN HD. Segunda frase aquí.</p>
          <p>Otro bloque con más datos.</p>
        </div>
        <div class="programa">
          <h3>Cine: El Padrino</h3>
          <span>23:30 - 01:15</span>
          <p>Presentan Ana y Luis.</p>
        </div>
        <h2>   </h2>
        <h3>Sin horario</h3>"#;

    fn base() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn pairs_headings_with_following_ranges() {
        let progs = parse_schedule(PAGE, base(), DescPolicy::None);
        assert_eq!(progs.len(), 2);

        assert_eq!(progs[0].title, "Los ángeles de charlie");
        assert_eq!(progs[0].category.as_deref(), Some("Serie"));
        // Madrid is UTC+1 on this date
        assert_eq!(progs[0].start, Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        assert_eq!(progs[0].end, Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap());
        assert_eq!(progs[0].description, None);

        assert_eq!(progs[1].title, "El Padrino");
        assert_eq!(progs[1].category.as_deref(), Some("Cine"));
        assert_eq!(progs[1].end, Utc.with_ymd_and_hms(2024, 3, 2, 0, 15, 0).unwrap());
    }

    #[test]
    fn short_policy_keeps_first_sentence_and_skips_promos() {
        let progs = parse_schedule(PAGE, base(), DescPolicy::Short);
        assert_eq!(progs[0].description.as_deref(), Some("Una serie de acción en HD."));
        assert_eq!(progs[1].description, None);
    }

    #[test]
    fn full_policy_concatenates_until_next_block() {
        let progs = parse_schedule(PAGE, base(), DescPolicy::Full);
        assert_eq!(
            progs[0].description.as_deref(),
            Some("UNA SERIE DE ACCIÓN EN HD. Segunda frase aquí. Otro bloque con más datos.")
        );
    }

    #[test]
    fn short_descriptions_are_capped() {
        let long = "a".repeat(200);
        let capped = first_sentence(&long);
        assert_eq!(capped.chars().count(), 158);
        assert!(capped.ends_with('…'));
    }

    #[test]
    fn recasing_preserves_allow_listed_tokens() {
        assert_eq!(normalize_sentence("SINOPSIS: ESTRENO EN 4K, USA Y (HD)"), "Estreno en 4K, USA y (HD)");
        assert_eq!(normalize_sentence("Ya en minúsculas"), "Ya en minúsculas");
        assert_eq!(split_title("ESPECIAL: GALA"), ("ESPECIAL: Gala".to_string(), None));
        assert_eq!(split_title("TELEDIARIO"), ("Telediario".to_string(), None));
    }
}
