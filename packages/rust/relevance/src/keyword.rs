//! Case-insensitive keyword matching.

use std::collections::HashMap;

use async_trait::async_trait;
use papermonitor_shared::{Assessment, EffectiveConfig, Paper, Result};
use tracing::{Instrument, Span, info, info_span, warn};

use crate::RelevanceEngine;

const NAME: &str = "keyword";

/// Relevant when any configured keyword occurs in the title or abstract.
///
/// The keyword set for a paper is `relevance.keywords` plus the keywords of the
/// paper's own source (`sources.<name>.keywords`).
pub struct KeywordStrategy {
    span: Span,
    global: Vec<String>,
    per_source: HashMap<String, Vec<String>>,
}

impl KeywordStrategy {
    pub fn new(run_span: Span) -> Self {
        Self {
            span: info_span!(parent: &run_span, "relevance", method = NAME),
            global: Vec::new(),
            per_source: HashMap::new(),
        }
    }

    /// Keyword set for `source`, in configuration order, without duplicates.
    fn keywords_for(&self, source: &str) -> Vec<&str> {
        let mut keywords: Vec<&str> = Vec::new();
        let extra = self.per_source.get(source).into_iter().flatten();
        for keyword in self.global.iter().chain(extra) {
            if !keywords.contains(&keyword.as_str()) {
                keywords.push(keyword);
            }
        }
        keywords
    }

    fn assess_one(&self, paper: &Paper) -> Assessment {
        let title = paper.title.to_lowercase();
        let abstract_text = paper.abstract_text.to_lowercase();

        let matched: Vec<String> = self
            .keywords_for(&paper.source)
            .into_iter()
            .filter(|k| title.contains(k) || abstract_text.contains(k))
            .map(String::from)
            .collect();

        Assessment {
            paper_id: paper.id.clone(),
            relevant: !matched.is_empty(),
            confidence: None,
            explanation: None,
            matched_keywords: Some(matched),
            error: None,
        }
    }
}

fn normalize(keywords: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for keyword in keywords {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() && !out.contains(&keyword) {
            out.push(keyword);
        }
    }
    out
}

#[async_trait]
impl RelevanceEngine for KeywordStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &EffectiveConfig) -> Result<()> {
        self.global = normalize(&config.relevance()?.keywords);
        self.per_source.clear();

        for source in config.active_sources().unwrap_or_default() {
            let keywords = normalize(&config.source(&source)?.keywords);
            if !keywords.is_empty() {
                self.per_source.insert(source, keywords);
            }
        }

        if self.global.is_empty() && self.per_source.is_empty() {
            warn!(parent: &self.span, "no keywords configured; every paper will be marked irrelevant");
        }
        Ok(())
    }

    async fn assess(&self, papers: &[Paper]) -> Vec<Assessment> {
        let span = self.span.clone();
        async move {
            let assessments: Vec<Assessment> = papers.iter().map(|p| self.assess_one(p)).collect();
            let relevant = assessments.iter().filter(|a| a.relevant).count();
            info!(papers = papers.len(), relevant, "keyword assessment complete");
            assessments
        }
        .instrument(span)
        .await
    }
}
