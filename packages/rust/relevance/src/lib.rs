//! Relevance strategies: decide which fetched papers match the research interest.
//!
//! Every strategy implements [`RelevanceEngine`]. `assess` never fails: a
//! paper that cannot be judged gets an "unknown" [`Assessment`] (not relevant,
//! confidence 0, error recorded) so one bad batch never loses the rest of a run.

mod chat;
mod embedding;
mod keyword;
mod llm;
mod none;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use papermonitor_shared::{Assessment, EffectiveConfig, Paper, PaperMonitorError, Result};
use tracing::Span;

pub use chat::{ChatClient, ChatError, ProviderPreset};
pub use embedding::{EmbeddingClient, EmbeddingStrategy, cosine_similarity};
pub use keyword::KeywordStrategy;
pub use llm::{LlmStrategy, parse_reply};
pub use none::NoneStrategy;

/// User-Agent string for model API requests.
const USER_AGENT: &str = concat!("papermonitor/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A pluggable relevance strategy.
#[async_trait]
pub trait RelevanceEngine: Send + Sync {
    /// Method name as used in `relevance.method`.
    fn name(&self) -> &str;

    /// Read and validate strategy settings.
    fn configure(&mut self, config: &EffectiveConfig) -> Result<()>;

    /// One assessment per input paper, in input order.
    async fn assess(&self, papers: &[Paper]) -> Vec<Assessment>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type StrategyFactory = Box<dyn Fn(Span) -> Box<dyn RelevanceEngine> + Send + Sync>;

/// Maps `relevance.method` names to strategy constructors.
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with `keyword`, `llm`, `embedding` and `none`.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("keyword", |span| Box::new(KeywordStrategy::new(span)));
        registry.register("llm", |span| Box::new(LlmStrategy::new(span)));
        registry.register("embedding", |span| Box::new(EmbeddingStrategy::new(span)));
        registry.register("none", |span| Box::new(NoneStrategy::new(span)));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Span) -> Box<dyn RelevanceEngine> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Construct an unconfigured strategy for `method`.
    pub fn build(&self, method: &str, run_span: Span) -> Result<Box<dyn RelevanceEngine>> {
        let method = method.trim().to_lowercase();
        let factory = self.factories.get(&method).ok_or_else(|| {
            PaperMonitorError::config(format!(
                "unknown relevance method `{method}` (available: {})",
                self.names().join(", ")
            ))
        })?;
        Ok(factory(run_span))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Unknown assessments for a whole slice, sharing one reason.
fn all_unknown(papers: &[Paper], reason: &str) -> Vec<Assessment> {
    papers
        .iter()
        .map(|p| Assessment::unknown(p, reason))
        .collect()
}

async fn pause(seconds: f64) {
    if let Ok(delay) = Duration::try_from_secs_f64(seconds) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{TimeZone, Utc};
    use papermonitor_shared::Paper;

    pub fn paper(id: &str, title: &str, abstract_text: &str) -> Paper {
        Paper {
            id: id.into(),
            title: title.into(),
            abstract_text: abstract_text.into(),
            authors: vec!["Grace Hopper".into()],
            categories: vec!["cs.LG".into()],
            link: format!("https://arxiv.org/abs/{id}"),
            published: Utc.with_ymd_and_hms(2024, 5, 9, 8, 0, 0).unwrap(),
            source: "arxiv".into(),
        }
    }
}
