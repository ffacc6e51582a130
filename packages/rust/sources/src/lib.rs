//! Source adapters: fetch recent papers from bibliographic catalogs.
//!
//! Each adapter is built from a name via [`SourceRegistry`], configured from
//! the [`EffectiveConfig`], and then asked for the papers inside a
//! [`FetchRequest`] window. Adapters never retry; a failed fetch is reported
//! to the caller as a [`PaperMonitorError::Fetch`].

mod arxiv;
mod biorxiv;
mod medrxiv;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use papermonitor_shared::{EffectiveConfig, FetchRequest, Paper, PaperMonitorError, Result};
use reqwest::Client;
use tracing::Span;

pub use arxiv::ArxivAdapter;
pub use biorxiv::{BioRxivAdapter, RxivServer};
pub use medrxiv::MedRxivAdapter;

/// User-Agent string for catalog requests.
const USER_AGENT: &str = concat!("papermonitor/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One upstream catalog.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Configured source name; stamped on every produced [`Paper`].
    fn name(&self) -> &str;

    /// Validate and store this source's settings.
    fn configure(&mut self, config: &EffectiveConfig) -> Result<()>;

    /// Lookback window resolved during `configure`.
    fn fetch_window_days(&self) -> u32;

    /// Per-run cap on raw upstream records resolved during `configure`.
    fn max_total_results(&self) -> usize;

    /// Papers whose timestamp falls inside `request.window`, in upstream order.
    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Paper>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type AdapterFactory = Box<dyn Fn(Span) -> Box<dyn SourceAdapter> + Send + Sync>;

/// Maps source names to adapter constructors.
///
/// Constructors receive the run span; adapters log inside a child of it.
pub struct SourceRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl SourceRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the built-in catalogs (`arxiv`, `biorxiv`, `medrxiv`).
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("arxiv", |span| Box::new(ArxivAdapter::new(span)));
        registry.register("biorxiv", |span| Box::new(BioRxivAdapter::new(span)));
        registry.register("medrxiv", |span| Box::new(MedRxivAdapter::new(span)));
        registry
    }

    /// Add or replace the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Span) -> Box<dyn SourceAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Construct an unconfigured adapter for `name`.
    pub fn build(&self, name: &str, run_span: Span) -> Result<Box<dyn SourceAdapter>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            PaperMonitorError::config(format!(
                "unknown source `{name}` (available: {})",
                self.names().join(", ")
            ))
        })?;
        Ok(factory(run_span))
    }

    /// Registered source names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build the HTTP client shared by one adapter's requests.
fn build_client(source: &str, timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PaperMonitorError::fetch(source, format!("failed to build HTTP client: {e}")))
}

/// Validate a configured API root and strip any trailing slash.
fn normalize_base_url(source: &str, raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw).map_err(|e| {
        PaperMonitorError::config(format!("invalid `sources.{source}.base_url` {raw:?}: {e}"))
    })?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Collapse runs of whitespace (including newlines) into single spaces.
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sleep for a politeness delay given in (possibly fractional) seconds.
async fn pause(seconds: f64) {
    if let Ok(delay) = Duration::try_from_secs_f64(seconds) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
