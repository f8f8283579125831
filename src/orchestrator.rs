//! Bounded fan-out of per-source fetch+parse tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::registry::Registry;
use crate::window;
use crate::{Programme, Result, ScrapeContext, SiteAdapter, Source};

/// Outcome of one batch, keyed by source URL.
///
/// Every matched source has an entry in `results`; a failed source maps to
/// an empty sequence and is also listed in `failed`.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub results: HashMap<String, Vec<Programme>>,
    pub unmatched: Vec<String>,
    pub failed: Vec<String>,
}

impl ScrapeReport {
    /// Sources that produced no programmes, failed or not, sorted.
    pub fn empty_sources(&self) -> Vec<&str> {
        let mut empty: Vec<&str> = self
            .results
            .iter()
            .filter(|(_, progs)| progs.is_empty())
            .map(|(url, _)| url.as_str())
            .collect();
        empty.sort_unstable();
        empty
    }

    pub fn total_programmes(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }
}

pub struct Orchestrator {
    registry: Registry,
    ctx: Arc<ScrapeContext>,
    concurrency: usize,
}

impl Orchestrator {
    pub fn new(registry: Registry, ctx: Arc<ScrapeContext>, concurrency: usize) -> Self {
        Self {
            registry,
            ctx,
            concurrency: concurrency.max(1),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Scrapes every source with at most `concurrency` tasks in flight.
    ///
    /// A source that errors or panics yields an empty result; nothing from
    /// one source reaches another.
    pub async fn scrape_all(&self, sources: Vec<Source>) -> ScrapeReport {
        let mut report = ScrapeReport::default();
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut dispatched = HashSet::new();

        for source in sources {
            if !dispatched.insert(source.url.clone()) {
                debug!("skipping duplicate source {}", source.url);
                continue;
            }
            let Some(adapter) = self.registry.select(&source.url) else {
                warn!("no adapter for {}", source.url);
                report.unmatched.push(source.url);
                continue;
            };
            debug!("{} -> {}", source.url, adapter.name());

            let sem = Arc::clone(&sem);
            let ctx = Arc::clone(&self.ctx);
            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = sem.acquire_owned().await.ok();
                let outcome = scrape_one(adapter.as_ref(), &ctx, &source).await;
                (source.url, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((url, Ok(progs))) => {
                    info!("parsed {:>3} programmes from {url}", progs.len());
                    report.results.insert(url, progs);
                }
                Ok((url, Err(e))) => {
                    error!("failed to scrape {url}: {e}");
                    report.failed.push(url.clone());
                    report.results.insert(url, Vec::new());
                }
                Err(e) => error!("scrape task aborted: {e}"),
            }
        }

        // a panicked task never reported its URL; recover it from the dispatch set
        let unmatched: HashSet<&String> = report.unmatched.iter().collect();
        let mut lost: Vec<String> = dispatched
            .into_iter()
            .filter(|url| !report.results.contains_key(url) && !unmatched.contains(url))
            .collect();
        lost.sort_unstable();
        for url in lost {
            report.failed.push(url.clone());
            report.results.insert(url, Vec::new());
        }
        report.failed.sort_unstable();
        report
    }
}

/// Runs one adapter against one source and applies window normalization.
pub async fn scrape_one(adapter: &dyn SiteAdapter, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
    let raw = adapter.fetch_and_parse(ctx, source).await?;
    debug!("{}: {} raw candidates from {}", adapter.name(), raw.len(), source.url);
    Ok(window::normalize(raw, source.hours_ahead, ctx.now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::config::AppConfig;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    enum Behaviour {
        Ok,
        Fail,
        Panic,
    }

    struct Stub {
        domains: Vec<String>,
        behaviour: Behaviour,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Stub {
        fn new(domain: &str, behaviour: Behaviour) -> Self {
            Self {
                domains: vec![domain.to_string()],
                behaviour,
                in_flight: Arc::default(),
                peak: Arc::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl SiteAdapter for Stub {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn domains(&self) -> &[String] {
            &self.domains
        }

        async fn fetch_and_parse(&self, ctx: &ScrapeContext, source: &Source) -> Result<Vec<Programme>> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.behaviour {
                Behaviour::Ok => {
                    let start = ctx.now + Duration::hours(1);
                    Ok(vec![
                        // out of window, dropped by normalization
                        Programme::new("Far future", ctx.now + Duration::hours(100), ctx.now + Duration::hours(101)),
                        Programme::new(source.url.clone(), start, start + Duration::minutes(30)),
                        Programme::new(source.url.clone(), start, start + Duration::minutes(45)),
                    ])
                }
                Behaviour::Fail => Err(Error::parse(&source.url, "no schedule block")),
                Behaviour::Panic => panic!("adapter bug"),
            }
        }
    }

    fn source(url: &str) -> Source {
        Source {
            url: url.to_string(),
            timezone: chrono_tz::America::Mexico_City,
            hours_ahead: 36,
        }
    }

    fn orchestrator(adapters: Vec<Arc<dyn SiteAdapter>>, concurrency: usize) -> Orchestrator {
        let mut registry = Registry::new();
        for a in adapters {
            registry.register(a);
        }
        let ctx = ScrapeContext::new(&AppConfig::default(), now()).unwrap();
        Orchestrator::new(registry, Arc::new(ctx), concurrency)
    }

    #[tokio::test]
    async fn failures_are_isolated_per_source() {
        let orch = orchestrator(
            vec![
                Arc::new(Stub::new("good.example", Behaviour::Ok)),
                Arc::new(Stub::new("bad.example", Behaviour::Fail)),
                Arc::new(Stub::new("crash.example", Behaviour::Panic)),
            ],
            4,
        );
        let report = orch
            .scrape_all(vec![
                source("https://good.example/a"),
                source("https://bad.example/b"),
                source("https://crash.example/c"),
                source("https://nobody.example/d"),
            ])
            .await;

        let good = &report.results["https://good.example/a"];
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].end - good[0].start, Duration::minutes(30));
        assert!(report.results["https://bad.example/b"].is_empty());
        assert!(report.results["https://crash.example/c"].is_empty());
        assert_eq!(report.failed, vec!["https://bad.example/b", "https://crash.example/c"]);
        assert_eq!(report.unmatched, vec!["https://nobody.example/d"]);
        assert!(!report.results.contains_key("https://nobody.example/d"));
        assert_eq!(report.total_programmes(), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let stub = Arc::new(Stub::new("good.example", Behaviour::Ok));
        let peak = Arc::clone(&stub.peak);
        let orch = orchestrator(vec![stub], 2);
        let sources = (0..8).map(|i| source(&format!("https://good.example/{i}"))).collect();
        let report = orch.scrape_all(sources).await;
        assert_eq!(report.results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
