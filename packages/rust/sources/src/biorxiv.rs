//! bioRxiv / medRxiv adapter (`api.biorxiv.org` details endpoint).
//!
//! Both preprint servers share one API: `details/<server>/<from>/<to>/<cursor>/json`,
//! paged through the `messages[0]` block of each response. Posting dates carry
//! no time of day, so the window check is day-granular.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use papermonitor_shared::{
    DEFAULT_FETCH_WINDOW_DAYS, EffectiveConfig, FetchRequest, FetchWindow, Paper,
    PaperMonitorError, Result,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{Instrument, Span, debug, info, info_span};

use crate::{SourceAdapter, build_client, normalize_base_url, normalize_whitespace, pause};

const DEFAULT_BASE_URL: &str = "https://api.biorxiv.org";
const DEFAULT_PAGE_DELAY_SECS: f64 = 0.5;

/// Which preprint server the details endpoint is queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxivServer {
    BioRxiv,
    MedRxiv,
}

impl RxivServer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BioRxiv => "biorxiv",
            Self::MedRxiv => "medrxiv",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "biorxiv" => Some(Self::BioRxiv),
            "medrxiv" => Some(Self::MedRxiv),
            _ => None,
        }
    }
}

impl fmt::Display for RxivServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DetailsPage {
    #[serde(default)]
    messages: Vec<PageMessage>,
    #[serde(default)]
    collection: Vec<Record>,
}

#[derive(Debug, Default, Deserialize)]
struct PageMessage {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    count: Option<Value>,
    #[serde(default)]
    total: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Record {
    #[serde(default)]
    doi: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    authors: String,
    #[serde(default)]
    date: String,
    #[serde(default)]
    category: String,
    #[serde(default, rename = "abstract")]
    abstract_text: String,
}

/// The API reports counts either as numbers or as numeric strings.
fn as_count(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

struct RxivState {
    client: Client,
    base_url: String,
    server: RxivServer,
    categories: Vec<String>,
    window_days: u32,
    max_total_results: usize,
    page_delay_secs: f64,
}

/// Fetches preprints from bioRxiv (or medRxiv when `server: medrxiv`).
pub struct BioRxivAdapter {
    name: &'static str,
    locked_server: Option<RxivServer>,
    span: Span,
    state: Option<RxivState>,
}

impl BioRxivAdapter {
    pub fn new(run_span: Span) -> Self {
        Self::with_name("biorxiv", None, run_span)
    }

    /// An adapter whose server is fixed regardless of configuration.
    pub(crate) fn with_name(
        name: &'static str,
        locked_server: Option<RxivServer>,
        run_span: Span,
    ) -> Self {
        Self {
            name,
            locked_server,
            span: info_span!(parent: &run_span, "source", name),
            state: None,
        }
    }

    /// Server selected during `configure`.
    pub fn server(&self) -> Option<RxivServer> {
        self.state.as_ref().map(|s| s.server)
    }

    fn state(&self) -> Result<&RxivState> {
        self.state.as_ref().ok_or_else(|| {
            PaperMonitorError::config(format!("{} adapter used before configure", self.name))
        })
    }

    async fn fetch_inner(&self, request: FetchRequest) -> Result<Vec<Paper>> {
        let state = self.state()?;
        info!(
            server = %state.server,
            categories = state.categories.len(),
            start = %request.window.start.date_naive(),
            end = %request.window.end.date_naive(),
            max_results = request.max_results,
            "querying preprint server"
        );

        let scopes: Vec<Option<&str>> = if state.categories.is_empty() {
            vec![None]
        } else {
            state.categories.iter().map(|c| Some(c.as_str())).collect()
        };

        let mut papers = Vec::new();
        let mut seen = HashSet::new();
        let mut raw = 0usize;
        let mut requests = 0usize;

        'scopes: for category in scopes {
            let mut cursor = 0usize;
            loop {
                if raw >= request.max_results {
                    break 'scopes;
                }
                if requests > 0 {
                    pause(state.page_delay_secs).await;
                }
                requests += 1;

                let page = self
                    .fetch_page(state, &request.window, cursor, category)
                    .await?;
                let message = page.messages.into_iter().next().unwrap_or_default();
                let received = page.collection.len();

                for record in page.collection.into_iter().take(request.max_results - raw) {
                    raw += 1;
                    let Some(paper) = self.to_paper(state.server, record) else {
                        continue;
                    };
                    let day = paper.published.date_naive();
                    if !request.window.contains_day(day) {
                        continue;
                    }
                    if !seen.insert(paper.id.clone()) {
                        debug!(doi = %paper.id, "skipping duplicate record");
                        continue;
                    }
                    papers.push(paper);
                }

                let count = as_count(message.count.as_ref()).unwrap_or(received);
                let total = as_count(message.total.as_ref()).unwrap_or(0);
                debug!(
                    category = category.unwrap_or("all"),
                    cursor,
                    count,
                    total,
                    status = message.status.as_deref().unwrap_or(""),
                    "received page"
                );

                if count == 0 || received == 0 {
                    break;
                }
                cursor += count;
                if cursor >= total {
                    break;
                }
            }
        }

        info!(raw, kept = papers.len(), "preprint fetch complete");
        Ok(papers)
    }

    async fn fetch_page(
        &self,
        state: &RxivState,
        window: &FetchWindow,
        cursor: usize,
        category: Option<&str>,
    ) -> Result<DetailsPage> {
        let url = format!(
            "{}/details/{}/{}/{}/{}/json",
            state.base_url,
            state.server,
            window.start.format("%Y-%m-%d"),
            window.end.format("%Y-%m-%d"),
            cursor
        );

        let mut builder = state.client.get(&url);
        if let Some(category) = category {
            builder = builder.query(&[("category", category)]);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PaperMonitorError::fetch(self.name, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PaperMonitorError::fetch(self.name, format!("HTTP {status}")));
        }

        response
            .json::<DetailsPage>()
            .await
            .map_err(|e| PaperMonitorError::fetch(self.name, format!("invalid JSON response: {e}")))
    }

    fn to_paper(&self, server: RxivServer, record: Record) -> Option<Paper> {
        let doi = record.doi.trim().to_string();
        if doi.is_empty() {
            debug!("skipping record without DOI");
            return None;
        }
        let Ok(date) = NaiveDate::parse_from_str(record.date.trim(), "%Y-%m-%d") else {
            debug!(%doi, date = %record.date, "skipping record with unparsable date");
            return None;
        };
        let published = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);

        let authors = record
            .authors
            .split(';')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();

        let category = record.category.trim();
        let categories = if category.is_empty() {
            Vec::new()
        } else {
            vec![category.to_string()]
        };

        Some(Paper {
            link: format!("https://www.{server}.org/content/{doi}"),
            id: doi,
            title: normalize_whitespace(&record.title),
            abstract_text: normalize_whitespace(&record.abstract_text),
            authors,
            categories,
            published,
            source: self.name.to_string(),
        })
    }
}

#[async_trait]
impl SourceAdapter for BioRxivAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn configure(&mut self, config: &EffectiveConfig) -> Result<()> {
        let settings = config.source(self.name)?;

        let server = match (self.locked_server, settings.server.as_deref()) {
            (Some(locked), _) => locked,
            (None, None) => RxivServer::BioRxiv,
            (None, Some(raw)) => RxivServer::parse(raw).ok_or_else(|| {
                PaperMonitorError::config(format!(
                    "`sources.{}.server` must be `biorxiv` or `medrxiv`, got {raw:?}",
                    self.name
                ))
            })?,
        };

        // The API expects lower-case categories with underscores for spaces.
        let categories = settings
            .categories
            .iter()
            .map(|c| c.trim().to_lowercase().replace(' ', "_"))
            .filter(|c| !c.is_empty())
            .collect();

        let base_url = normalize_base_url(
            self.name,
            settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
        )?;

        self.state = Some(RxivState {
            client: build_client(self.name, settings.timeout_secs)?,
            base_url,
            server,
            categories,
            window_days: settings.window_days(),
            max_total_results: settings.max_total_results,
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
