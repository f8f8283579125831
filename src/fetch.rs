//! HTTP fetching with retry, and the optional JS-rendering capability.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use reqwest::header::{self, HeaderMap};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{AdapterOptions, AppConfig};
use crate::error::{Error, Result};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "es-ES,es;q=0.9,en-US;q=0.8,en;q=0.7";
const MAX_JITTER_MS: u64 = 250;

/// Plain HTTP(S) GET with exponential backoff plus jitter.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    attempts: u32,
    backoff: Duration,
}

impl Fetcher {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            attempts: config.http_retries.max(1),
            backoff: config.http_backoff()?,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Delay before retrying after `attempt` (0-based) failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
        self.backoff * 2u32.saturating_pow(attempt) + Duration::from_millis(jitter)
    }

    async fn get_once(&self, url: &str, attempt: u32, headers: &HeaderMap) -> Result<String> {
        let mut request = self
            .client
            .get(cache_busted(url, attempt))
            .header(header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
            .headers(headers.clone());
        if attempt > 0 {
            request = request.header(header::CACHE_CONTROL, "no-cache");
        }
        let resp = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::fetch(url, e))?;
        resp.text().await.map_err(|e| Error::fetch(url, e))
    }

    /// Body of `url` as text, retried up to the configured attempt count.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        self.get_text_with(url, &HeaderMap::new()).await
    }

    /// [`Fetcher::get_text`] with extra request headers on every attempt.
    pub async fn get_text_with(&self, url: &str, headers: &HeaderMap) -> Result<String> {
        let mut last_err = Error::fetch(url, "no attempt made");
        for attempt in 0..self.attempts {
            match self.get_once(url, attempt, headers).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    if attempt + 1 < self.attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            "fetch attempt {}/{} for {url} failed: {e}; retrying in {delay:?}",
                            attempt + 1,
                            self.attempts
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!("fetch attempt {}/{} for {url} failed: {e}", attempt + 1, self.attempts);
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| Error::parse(url, e))
    }
}

/// Appends a `cb=<millis>` query parameter on retries to dodge intermediary caches.
fn cache_busted(url: &str, attempt: u32) -> String {
    if attempt == 0 {
        return url.to_string();
    }
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed
                .query_pairs_mut()
                .append_pair("cb", &Utc::now().timestamp_millis().to_string());
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// A JSON response observed while a page was rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedResponse {
    pub url: String,
    pub body: Value,
}

/// Fully rendered page after its scripts ran.
#[derive(Debug, Clone, Default)]
pub struct RenderedPage {
    pub html: String,
    pub json_responses: Vec<CapturedResponse>,
}

/// Capability that returns the HTML of a page after executing its scripts.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<RenderedPage>;
}

/// Runs an external headless browser (e.g. `chromium --headless --dump-dom`)
/// and reads its stdout with [`parse_render_output`].
///
/// The child is killed when the future is dropped, so a timeout or an early
/// return always tears the browser down.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRenderer {
    /// Splits `command_line` on whitespace; the URL is appended at render time.
    pub fn new(command_line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config
            .render_command
            .as_deref()
            .and_then(|cmd| Self::new(cmd, config.render_timeout()))
    }
}

#[async_trait::async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("rendering {url} with {}", self.program);
        let out = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::render(url, format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::render(url, format!("spawn {}: {e}", self.program)))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::render(
                url,
                format!(
                    "{} exited with status {}: {}",
                    self.program,
                    out.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }
        Ok(parse_render_output(&String::from_utf8_lossy(&out.stdout)))
    }
}

#[derive(Deserialize)]
struct RenderEnvelope {
    html: String,
    #[serde(default)]
    responses: Vec<EnvelopeResponse>,
}

#[derive(Deserialize)]
struct EnvelopeResponse {
    url: String,
    body: Value,
}

/// Render command output: either the bare DOM, or an envelope
/// `{"html": "...", "responses": [{"url": "...", "body": ...}]}` carrying the
/// JSON responses the page fetched. String bodies are parsed as JSON; bodies
/// that are not JSON are dropped.
pub fn parse_render_output(stdout: &str) -> RenderedPage {
    let trimmed = stdout.trim_start();
    let envelope = trimmed
        .starts_with('{')
        .then(|| serde_json::from_str::<RenderEnvelope>(trimmed).ok())
        .flatten();
    let Some(envelope) = envelope else {
        return RenderedPage {
            html: stdout.to_string(),
            json_responses: Vec::new(),
        };
    };

    let json_responses = envelope
        .responses
        .into_iter()
        .filter_map(|r| {
            let body = match r.body {
                Value::String(text) => serde_json::from_str(&text).ok()?,
                Value::Null => return None,
                other => other,
            };
            Some(CapturedResponse { url: r.url, body })
        })
        .collect::<Vec<_>>();
    debug!("render envelope with {} JSON responses", json_responses.len());
    RenderedPage {
        html: envelope.html,
        json_responses,
    }
}

/// Everything an adapter needs for one batch: fetch capabilities, its
/// options, and the instant the batch treats as "now".
pub struct ScrapeContext {
    pub fetcher: Fetcher,
    pub renderer: Option<Arc<dyn Renderer>>,
    pub options: AdapterOptions,
    pub render_fallback: bool,
    pub now: DateTime<Utc>,
}

impl ScrapeContext {
    pub fn new(config: &AppConfig, now: DateTime<Utc>) -> Result<Self> {
        let renderer = CommandRenderer::from_config(config).map(|r| Arc::new(r) as Arc<dyn Renderer>);
        Ok(Self {
            fetcher: Fetcher::new(config)?,
            renderer,
            options: config.adapter_options(),
            render_fallback: config.render_fallback,
            now,
        })
    }

    /// HTML over plain HTTP; rendered as a last resort when enabled. A blank
    /// body counts as a failure for the fallback.
    pub async fn fetch_html(&self, url: &str) -> Result<String> {
        let plain = match self.fetcher.get_text(url).await {
            Ok(body) if body.trim().is_empty() => Err(Error::fetch(url, "empty body")),
            other => other,
        };
        match plain {
            Ok(body) => Ok(body),
            Err(e) => match (&self.renderer, self.render_fallback) {
                (Some(renderer), true) => {
                    warn!("HTTP exhausted for {url} ({e}); falling back to rendering");
                    renderer.render(url).await.map(|page| page.html)
                }
                _ => Err(e),
            },
        }
    }

    /// Renders `url`; fails when no renderer is configured.
    pub async fn render(&self, url: &str) -> Result<RenderedPage> {
        match &self.renderer {
            Some(renderer) => renderer.render(url).await,
            None => Err(Error::render(url, "no renderer configured (set RENDER_COMMAND)")),
        }
    }

    /// Rendered HTML when a renderer exists, plain HTTP otherwise.
    pub async fn rendered_or_plain(&self, url: &str) -> Result<String> {
        match &self.renderer {
            Some(renderer) => match renderer.render(url).await {
                Ok(page) => Ok(page.html),
                Err(e) => {
                    warn!("render failed for {url}: {e}; trying plain HTTP");
                    self.fetcher.get_text(url).await
                }
            },
            None => self.fetcher.get_text(url).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{StubRenderer, context, serve};
    use super::*;

    #[test]
    fn first_attempt_is_not_cache_busted() {
        assert_eq!(cache_busted("https://laocho.tv/tv-programacion/", 0), "https://laocho.tv/tv-programacion/");
        let busted = cache_busted("https://laocho.tv/tv-programacion/?a=1", 2);
        assert!(busted.starts_with("https://laocho.tv/tv-programacion/?a=1&cb="));
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let config = AppConfig {
            http_backoff_secs: 0.5,
            ..AppConfig::default()
        };
        let fetcher = Fetcher::new(&config).unwrap();
        for attempt in 0..4 {
            let base = Duration::from_millis(500) * 2u32.pow(attempt);
            let delay = fetcher.backoff_delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(MAX_JITTER_MS));
        }
    }

    #[test]
    fn renderer_command_line_is_split() {
        let r = CommandRenderer::new("chromium --headless --dump-dom", Duration::from_secs(5)).unwrap();
        assert_eq!(r.program, "chromium");
        assert_eq!(r.args, vec!["--headless", "--dump-dom"]);
        assert!(CommandRenderer::new("   ", Duration::from_secs(5)).is_none());
    }

    #[tokio::test]
    async fn retries_until_success_with_cache_buster() {
        let (url, seen) = serve(vec![(500, ""), (503, ""), (200, "<html>ok</html>")]).await;
        let ctx = context(3, None, false);
        assert_eq!(ctx.fetcher.get_text(&url).await.unwrap(), "<html>ok</html>");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], "GET /guide HTTP/1.1");
        assert!(seen[1].starts_with("GET /guide?cb="));
        assert!(seen[2].starts_with("GET /guide?cb="));
    }

    #[tokio::test]
    async fn exhausted_attempts_are_a_fetch_error() {
        let (url, seen) = serve(vec![(500, "")]).await;
        let ctx = context(2, None, false);
        assert!(matches!(ctx.fetcher.get_text(&url).await, Err(Error::Fetch { .. })));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn render_fallback_covers_failed_and_blank_pages() {
        let (failing, _) = serve(vec![(500, "")]).await;
        let (blank, _) = serve(vec![(200, "  ")]).await;
        let stub = StubRenderer::new("<html>rendered</html>", Vec::new());

        let ctx = context(1, Some(stub.clone() as Arc<dyn Renderer>), true);
        assert_eq!(ctx.fetch_html(&failing).await.unwrap(), "<html>rendered</html>");
        assert_eq!(ctx.fetch_html(&blank).await.unwrap(), "<html>rendered</html>");
        assert_eq!(stub.calls(), 2);

        let ctx = context(1, Some(stub.clone() as Arc<dyn Renderer>), false);
        assert!(matches!(ctx.fetch_html(&failing).await, Err(Error::Fetch { .. })));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn rendered_or_plain_prefers_the_renderer() {
        let (url, seen) = serve(vec![(200, "<html>plain</html>")]).await;
        let ctx = context(1, None, false);
        assert_eq!(ctx.rendered_or_plain(&url).await.unwrap(), "<html>plain</html>");

        let stub = StubRenderer::new("<html>rendered</html>", Vec::new());
        let ctx = context(1, Some(stub.clone() as Arc<dyn Renderer>), false);
        assert_eq!(ctx.rendered_or_plain(&url).await.unwrap(), "<html>rendered</html>");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn render_output_envelope_carries_json_responses() {
        let bare = parse_render_output("<html><body>x</body></html>");
        assert_eq!(bare.html, "<html><body>x</body></html>");
        assert!(bare.json_responses.is_empty());

        let out = r#"{"html": "<html>dom</html>", "responses": [
            {"url": "https://www.tvtv.us/api/v1/lineup/x/grid", "body": {"items": [1]}},
            {"url": "https://www.tvtv.us/api/v1/stn", "body": "{\"items\": [2]}"},
            {"url": "https://www.tvtv.us/pixel", "body": "not json"}
        ]}"#;
        let page = parse_render_output(out);
        assert_eq!(page.html, "<html>dom</html>");
        let urls: Vec<&str> = page.json_responses.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://www.tvtv.us/api/v1/lineup/x/grid", "https://www.tvtv.us/api/v1/stn"]);
        assert_eq!(page.json_responses[1].body, serde_json::json!({"items": [2]}));

        // a DOM that happens to start with a brace is kept as-is
        assert_eq!(parse_render_output("{not json").html, "{not json");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_renderer_reads_stdout() {
        let renderer = CommandRenderer::new("echo <html>", Duration::from_secs(5)).unwrap();
        let page = renderer.render("https://www.mvstv.com/").await.unwrap();
        assert_eq!(page.html.trim(), "<html> https://www.mvstv.com/");

        let failing = CommandRenderer::new("false", Duration::from_secs(5)).unwrap();
        assert!(matches!(failing.render("https://www.mvstv.com/").await, Err(Error::Render { .. })));
    }

    #[tokio::test]
    async fn render_without_renderer_is_an_error() {
        let ctx = ScrapeContext::new(&AppConfig::default(), Utc::now()).unwrap();
        assert!(matches!(ctx.render("https://www.tvtv.us/").await, Err(Error::Render { .. })));
    }
}
