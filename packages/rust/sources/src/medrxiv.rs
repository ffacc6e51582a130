//! medRxiv adapter: the bioRxiv client with the server fixed to `medrxiv`.

use async_trait::async_trait;
use papermonitor_shared::{EffectiveConfig, FetchRequest, Paper, Result};
use tracing::Span;

use crate::SourceAdapter;
use crate::biorxiv::{BioRxivAdapter, RxivServer};

pub struct MedRxivAdapter(BioRxivAdapter);

impl MedRxivAdapter {
    pub fn new(run_span: Span) -> Self {
        Self(BioRxivAdapter::with_name(
            "medrxiv",
            Some(RxivServer::MedRxiv),
            run_span,
        ))
    }
}

#[async_trait]
impl SourceAdapter for MedRxivAdapter {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn configure(&mut self, config: &EffectiveConfig) -> Result<()> {
        self.0.configure(config)
    }

    fn fetch_window_days(&self) -> u32 {
        self.0.fetch_window_days()
    }

    fn max_total_results(&self) -> usize {
        self.0.max_total_results()
    }

    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Paper>> {
        self.0.fetch(request).await
    }
}
