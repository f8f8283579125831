use std::sync::Arc;

use crate::SiteAdapter;
use crate::config::AdapterOptions;
use crate::gatotv::GatoTvScraper;
use crate::generic::GenericLineScraper;
use crate::laocho::LaOchoScraper;
use crate::mvstv::MvsTvScraper;
use crate::ontvtonight::OnTvTonightScraper;
use crate::tvguia::TvGuiaScraper;
use crate::tvtv::TvtvScraper;

/// Ordered adapter list. Selection is first-match-wins, so registration
/// order is the tie-break between adapters claiming overlapping domains.
#[derive(Default, Clone)]
pub struct Registry {
    adapters: Vec<Arc<dyn SiteAdapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SiteAdapter>) -> &mut Self {
        self.adapters.push(adapter);
        self
    }

    /// First registered adapter whose domain test passes for `url`.
    pub fn select(&self, url: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.adapters.iter().find(|a| a.matches(url)).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// All shipped site adapters, in their fixed registration order.
pub fn default_registry(options: &AdapterOptions) -> Registry {
    let mut registry = Registry::new();
    registry
        .register(Arc::new(GatoTvScraper::new()))
        .register(Arc::new(TvGuiaScraper::new()))
        .register(Arc::new(LaOchoScraper::new(options.desc_policy)))
        .register(Arc::new(OnTvTonightScraper::new(options.ontvtonight_align_mode)))
        .register(Arc::new(TvtvScraper::new(options.tvtv_naive_iso)))
        .register(Arc::new(MvsTvScraper::new(options.mvstv_naive_iso)))
        .register(Arc::new(GenericLineScraper::new(options.generic_domains.clone())));
    registry
}
