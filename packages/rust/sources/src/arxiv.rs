//! arXiv adapter (Atom export API).

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use feed_rs::model::Entry;
use papermonitor_shared::{
    DEFAULT_FETCH_WINDOW_DAYS, EffectiveConfig, FetchRequest, Paper, PaperMonitorError, Result,
};
use reqwest::Client;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::{SourceAdapter, build_client, normalize_base_url, normalize_whitespace, pause};

const NAME: &str = "arxiv";
const DEFAULT_BASE_URL: &str = "https://export.arxiv.org";
const DEFAULT_PAGE_SIZE: usize = 100;
/// arXiv asks API clients to wait three seconds between calls.
const DEFAULT_PAGE_DELAY_SECS: f64 = 3.0;

struct ArxivState {
    client: Client,
    base_url: String,
    categories: Vec<String>,
    window_days: u32,
    max_total_results: usize,
    page_size: usize,
    page_delay_secs: f64,
}

/// Fetches papers from arXiv for the configured categories.
pub struct ArxivAdapter {
    span: Span,
    state: Option<ArxivState>,
}

impl ArxivAdapter {
    pub fn new(run_span: Span) -> Self {
        Self {
            span: info_span!(parent: &run_span, "source", name = NAME),
            state: None,
        }
    }

    fn state(&self) -> Result<&ArxivState> {
        self.state
            .as_ref()
            .ok_or_else(|| PaperMonitorError::config("arxiv adapter used before configure"))
    }

    async fn fetch_inner(&self, request: FetchRequest) -> Result<Vec<Paper>> {
        let state = self.state()?;
        let query = search_query(&state.categories);
        let endpoint = format!("{}/api/query", state.base_url);

        info!(
            %query,
            start = %request.window.start,
            end = %request.window.end,
            max_results = request.max_results,
            "querying arXiv"
        );

        let mut papers = Vec::new();
        let mut seen = HashSet::new();
        let mut raw = 0usize;
        let mut offset = 0usize;

        while raw < request.max_results {
            if offset > 0 {
                pause(state.page_delay_secs).await;
            }

            let page_len = state.page_size.min(request.max_results - raw);
            let entries = fetch_page(&state.client, &endpoint, &query, offset, page_len).await?;
            let received = entries.len().min(page_len);
            raw += received;

            for entry in entries.into_iter().take(page_len) {
                let Some(paper) = to_paper(entry) else {
                    continue;
                };
                if !request.window.contains(paper.published) {
                    continue;
                }
                if !seen.insert(paper.id.clone()) {
                    debug!(id = %paper.id, "skipping duplicate entry");
                    continue;
                }
                papers.push(paper);
            }

            if received < page_len {
                break;
            }
            offset += received;
        }

        info!(raw, kept = papers.len(), "arXiv fetch complete");
        Ok(papers)
    }
}

#[async_trait]
impl SourceAdapter for ArxivAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &EffectiveConfig) -> Result<()> {
        let settings = config.source(NAME)?;

        let categories: Vec<String> = settings
            .categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if categories.is_empty() {
            return Err(PaperMonitorError::config(
                "`sources.arxiv.categories` must list at least one category",
            ));
        }

        let base_url = normalize_base_url(
            NAME,
            settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
        )?;
        let page_size = settings.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(PaperMonitorError::config(
                "`sources.arxiv.page_size` must be at least 1",
            ));
        }

        self.state = Some(ArxivState {
            client: build_client(NAME, settings.timeout_secs)?,
            base_url,
            categories,
            window_days: settings.window_days(),
            max_total_results: settings.max_total_results,
            page_size,
            page_delay_secs: settings.page_delay_seconds.unwrap_or(DEFAULT_PAGE_DELAY_SECS),
        });
        Ok(())
    }

    fn fetch_window_days(&self) -> u32 {
        self.state
            .as_ref()
            .map_or(DEFAULT_FETCH_WINDOW_DAYS, |s| s.window_days)
    }

    fn max_total_results(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.max_total_results)
    }

    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Paper>> {
        self.fetch_inner(request).instrument(self.span.clone()).await
    }
}

/// `(cat:A OR cat:B)` over the configured categories.
fn search_query(categories: &[String]) -> String {
    let terms: Vec<String> = categories.iter().map(|c| format!("cat:{c}")).collect();
    format!("({})", terms.join(" OR "))
}

async fn fetch_page(
    client: &Client,
    endpoint: &str,
    query: &str,
    offset: usize,
    page_len: usize,
) -> Result<Vec<Entry>> {
    let start = offset.to_string();
    let max_results = page_len.to_string();

    let response = client
        .get(endpoint)
        .query(&[
            ("search_query", query),
            ("sortBy", "submittedDate"),
            ("sortOrder", "descending"),
            ("start", start.as_str()),
            ("max_results", max_results.as_str()),
        ])
        .send()
        .await
        .map_err(|e| PaperMonitorError::fetch(NAME, format!("request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(PaperMonitorError::fetch(NAME, format!("HTTP {status}")));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| PaperMonitorError::fetch(NAME, format!("failed to read body: {e}")))?;

    let feed = feed_rs::parser::parse(body.as_ref())
        .map_err(|e| PaperMonitorError::fetch(NAME, format!("invalid Atom feed: {e}")))?;

    debug!(offset, entries = feed.entries.len(), "received arXiv page");
    Ok(feed.entries)
}

/// Map an Atom entry to a [`Paper`]. Returns `None` for API error entries
/// and entries without a usable id or timestamp.
fn to_paper(entry: Entry) -> Option<Paper> {
    if entry.id.contains("/api/errors") {
        let message = entry.summary.map(|s| s.content).unwrap_or_default();
        warn!(message = %normalize_whitespace(&message), "arXiv returned an error entry");
        return None;
    }

    let id = short_id(&entry.id)?;
    let Some(published) = entry.updated.or(entry.published) else {
        debug!(%id, "skipping entry without timestamp");
        return None;
    };

    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.clone())
        .unwrap_or_else(|| entry.id.clone());

    let mut categories: Vec<String> = Vec::new();
    for category in entry.categories {
        if !categories.contains(&category.term) {
            categories.push(category.term);
        }
    }

    Some(Paper {
        id,
        title: entry
            .title
            .map(|t| normalize_whitespace(&t.content))
            .unwrap_or_default(),
        abstract_text: entry
            .summary
            .map(|s| normalize_whitespace(&s.content))
            .unwrap_or_default(),
        authors: entry.authors.into_iter().map(|a| a.name).collect(),
        categories,
        link,
        published: published.with_timezone(&Utc),
        source: NAME.to_string(),
    })
}

/// `http://arxiv.org/abs/2401.01234v2` becomes `2401.01234v2`.
fn short_id(entry_id: &str) -> Option<String> {
    let id = match entry_id.split_once("/abs/") {
        Some((_, rest)) => rest,
        None => entry_id.rsplit('/').next()?,
    };
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}
