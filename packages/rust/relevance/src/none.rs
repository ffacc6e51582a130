//! Accept-all strategy.

use async_trait::async_trait;
use papermonitor_shared::{Assessment, EffectiveConfig, Paper, Result};
use tracing::{Span, debug, info_span};

use crate::RelevanceEngine;

/// Marks every paper relevant.
pub struct NoneStrategy {
    span: Span,
}

impl NoneStrategy {
    pub fn new(run_span: Span) -> Self {
        Self {
            span: info_span!(parent: &run_span, "relevance", method = "none"),
        }
    }
}

#[async_trait]
impl RelevanceEngine for NoneStrategy {
    fn name(&self) -> &str {
        "none"
    }

    fn configure(&mut self, _config: &EffectiveConfig) -> Result<()> {
        Ok(())
    }

    async fn assess(&self, papers: &[Paper]) -> Vec<Assessment> {
        debug!(parent: &self.span, papers = papers.len(), "accepting all papers");
        papers
            .iter()
            .map(|p| Assessment::verdict(p, true))
            .collect()
    }
}
