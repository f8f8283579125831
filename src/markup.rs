//! Small text helpers over `scraper` trees, shared by the HTML adapters.

use scraper::ElementRef;

const INVISIBLE: &[&str] = &["script", "style", "noscript", "template"];

/// Trimmed, non-empty text nodes under `el`, in document order.
pub fn text_lines(el: ElementRef<'_>) -> Vec<String> {
    el.descendants()
        .filter(|n| {
            n.ancestors()
                .filter_map(ElementRef::wrap)
                .all(|a| !INVISIBLE.contains(&a.value().name()))
        })
        .filter_map(|n| n.value().as_text().map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Text of `el` with fragments joined by single spaces.
pub fn text_of(el: ElementRef<'_>) -> String {
    text_lines(el)
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolves `href` against `base`, accepting absolute links as-is.
pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    if href.starts_with("http") {
        return Some(href.to_string());
    }
    url::Url::parse(base)
        .ok()?
        .join(href)
        .ok()
        .map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn text_skips_scripts_and_blank_nodes() {
        let doc = Html::parse_document(
            "<body><p> Hola </p><script>var x = 1;</script>\n<div>  <b>Mundo</b> feliz</div></body>",
        );
        let root = doc.root_element();
        assert_eq!(text_lines(root), vec!["Hola", "Mundo", "feliz"]);
        assert_eq!(text_of(root), "Hola Mundo feliz");
    }

    #[test]
    fn joins_relative_links() {
        assert_eq!(
            absolute_url("https://www.gatotv.com/canal/5_mexico", "/canal/5_mexico/2024-03-02").as_deref(),
            Some("https://www.gatotv.com/canal/5_mexico/2024-03-02")
        );
        assert_eq!(absolute_url("https://a.com/", "#top"), None);
        assert_eq!(
            absolute_url("https://a.com/", "https://b.com/x").as_deref(),
            Some("https://b.com/x")
        );
    }
}
