use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::timeparse::{AlignMode, NaiveIso};

/// Application configuration, loaded once from environment variables / .env.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Base URL of the PostgREST endpoint (e.g. `https://<id>.supabase.co`).
    #[serde(default)]
    pub supabase_url: Option<String>,

    #[serde(default)]
    pub supabase_service_role_key: Option<String>,

    /// Where the source list comes from.
    #[serde(default)]
    pub input_mode: InputMode,

    #[serde(default = "default_csv_path")]
    pub csv_path: String,

    /// Fallback zone for sources that do not declare one.
    #[serde(default = "default_local_tz")]
    pub local_tz: String,

    #[serde(default = "default_hours_ahead")]
    pub hours_ahead: i64,

    /// Maximum number of sources fetched and parsed at the same time.
    #[serde(default = "default_scrape_concurrency")]
    pub scrape_concurrency: usize,

    #[serde(default = "default_purge_hours_back")]
    pub purge_hours_back: i64,

    #[serde(default, deserialize_with = "flag")]
    pub dry_run_purge: bool,

    /// Attempts per HTTP fetch, including the first one.
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,

    /// Base of the exponential backoff between attempts, in seconds.
    #[serde(default = "default_http_backoff_secs")]
    pub http_backoff_secs: f64,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Headless-browser command line; the page URL is appended as the last argument.
    #[serde(default)]
    pub render_command: Option<String>,

    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,

    /// Render the page when plain HTTP keeps failing.
    #[serde(default, deserialize_with = "flag")]
    pub render_fallback: bool,

    #[serde(default)]
    pub desc_policy: DescPolicy,

    #[serde(default)]
    pub ontvtonight_align_mode: AlignMode,

    #[serde(default = "default_tvtv_naive_iso")]
    pub tvtv_naive_iso: NaiveIso,

    #[serde(default = "default_mvstv_naive_iso")]
    pub mvstv_naive_iso: NaiveIso,

    /// Domains routed to the best-effort line scanner.
    #[serde(default)]
    pub generic_domains: Vec<String>,

    #[serde(default = "default_live_countries")]
    pub live_countries: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    #[default]
    Supabase,
    Csv,
}

/// How much programme description an adapter keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescPolicy {
    #[default]
    None,
    Short,
    Full,
}

/// Boolean switch written as `1`/`0`, `true`/`false`, `yes`/`no` or `on`/`off`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(serde::de::Error::custom(format!("expected 1/0 or true/false, got {other:?}"))),
    }
}

fn default_csv_path() -> String {
    "manual_tv_input.csv".to_string()
}
fn default_local_tz() -> String {
    "America/Mexico_City".to_string()
}
fn default_hours_ahead() -> i64 {
    36
}
fn default_scrape_concurrency() -> usize {
    4
}
fn default_purge_hours_back() -> i64 {
    24
}
fn default_http_retries() -> u32 {
    4
}
fn default_http_backoff_secs() -> f64 {
    0.75
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_render_timeout_secs() -> u64 {
    45
}
fn default_tvtv_naive_iso() -> NaiveIso {
    NaiveIso::Utc
}
fn default_mvstv_naive_iso() -> NaiveIso {
    NaiveIso::Local
}
fn default_live_countries() -> Vec<String> {
    ["PR", "DE", "US", "ES", "MX", "IT", "IE", "CA", "AU", "UK"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_service_role_key: None,
            input_mode: InputMode::default(),
            csv_path: default_csv_path(),
            local_tz: default_local_tz(),
            hours_ahead: default_hours_ahead(),
            scrape_concurrency: default_scrape_concurrency(),
            purge_hours_back: default_purge_hours_back(),
            dry_run_purge: false,
            http_retries: default_http_retries(),
            http_backoff_secs: default_http_backoff_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            render_command: None,
            render_timeout_secs: default_render_timeout_secs(),
            render_fallback: false,
            desc_policy: DescPolicy::default(),
            ontvtonight_align_mode: AlignMode::default(),
            tvtv_naive_iso: default_tvtv_naive_iso(),
            mvstv_naive_iso: default_mvstv_naive_iso(),
            generic_domains: Vec::new(),
            live_countries: default_live_countries(),
        }
    }
}

/// Credentials for the hosted table store.
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    pub url: String,
    pub key: String,
}

/// Per-adapter knobs, split out of [`AppConfig`] so adapters never see the rest.
#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    pub desc_policy: DescPolicy,
    pub ontvtonight_align_mode: AlignMode,
    pub tvtv_naive_iso: NaiveIso,
    pub mvstv_naive_iso: NaiveIso,
    pub generic_domains: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        // .env is optional
        let _ = dotenvy::dotenv();

        envy::from_env::<AppConfig>()
            .map_err(|e| Error::Configuration(format!("failed to load config from environment: {e}")))
    }

    /// The fallback zone, validated.
    pub fn local_tz(&self) -> Result<Tz> {
        self.local_tz
            .parse::<Tz>()
            .map_err(|_| Error::Configuration(format!("LOCAL_TZ is not an IANA zone: {}", self.local_tz)))
    }

    /// Store endpoint and key; both are required before any store access.
    pub fn store_credentials(&self) -> Result<StoreCredentials> {
        let url = self
            .supabase_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let key = self
            .supabase_service_role_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        match (url, key) {
            (Some(url), Some(key)) => Ok(StoreCredentials {
                url: url.trim_end_matches('/').to_string(),
                key: key.to_string(),
            }),
            _ => Err(Error::Configuration(
                "SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY are required".to_string(),
            )),
        }
    }

    pub fn http_backoff(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.http_backoff_secs).map_err(|_| {
            Error::Configuration(format!(
                "HTTP_BACKOFF_SECS must be a non-negative number of seconds, got {}",
                self.http_backoff_secs
            ))
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            desc_policy: self.desc_policy,
            ontvtonight_align_mode: self.ontvtonight_align_mode,
            tvtv_naive_iso: self.tvtv_naive_iso,
            mvstv_naive_iso: self.mvstv_naive_iso,
            generic_domains: self
                .generic_domains
                .iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.hours_ahead, 36);
        assert_eq!(cfg.scrape_concurrency, 4);
        assert_eq!(cfg.purge_hours_back, 24);
        assert_eq!(cfg.http_retries, 4);
        assert_eq!(cfg.desc_policy, DescPolicy::None);
        assert_eq!(cfg.tvtv_naive_iso, NaiveIso::Utc);
        assert_eq!(cfg.mvstv_naive_iso, NaiveIso::Local);
        assert_eq!(cfg.local_tz().unwrap(), chrono_tz::America::Mexico_City);
    }

    #[test]
    fn missing_credentials_is_a_configuration_error() {
        let cfg = AppConfig {
            supabase_url: Some("https://abc.supabase.co/".into()),
            ..AppConfig::default()
        };
        assert!(matches!(cfg.store_credentials(), Err(Error::Configuration(_))));

        let cfg = AppConfig {
            supabase_url: Some("https://abc.supabase.co/".into()),
            supabase_service_role_key: Some("secret".into()),
            ..AppConfig::default()
        };
        let creds = cfg.store_credentials().unwrap();
        assert_eq!(creds.url, "https://abc.supabase.co");
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, envy::Error> {
        envy::from_iter(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn switches_accept_numeric_and_word_forms() {
        assert!(from_pairs(&[("DRY_RUN_PURGE", "1")]).unwrap().dry_run_purge);
        assert!(from_pairs(&[("DRY_RUN_PURGE", "true")]).unwrap().dry_run_purge);
        assert!(!from_pairs(&[("DRY_RUN_PURGE", "0")]).unwrap().dry_run_purge);
        assert!(!from_pairs(&[]).unwrap().dry_run_purge);
        assert!(from_pairs(&[("RENDER_FALLBACK", "yes")]).unwrap().render_fallback);
        assert!(from_pairs(&[("DRY_RUN_PURGE", "maybe")]).is_err());
    }

    #[test]
    fn unusable_backoff_is_a_configuration_error() {
        for secs in [-1.0, f64::NAN, f64::INFINITY] {
            let cfg = AppConfig {
                http_backoff_secs: secs,
                ..AppConfig::default()
            };
            assert!(matches!(cfg.http_backoff(), Err(Error::Configuration(_))));
        }
        assert_eq!(AppConfig::default().http_backoff().unwrap(), Duration::from_millis(750));
    }

    #[test]
    fn invalid_local_tz_is_rejected() {
        let cfg = AppConfig {
            local_tz: "Mars/Olympus".into(),
            ..AppConfig::default()
        };
        assert!(cfg.local_tz().is_err());
    }
}
