//! Core domain types: papers, assessments, fetch windows and run statistics.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one orchestrator run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Paper
// ---------------------------------------------------------------------------

/// A paper normalized from any upstream catalog.
///
/// Created once by a source adapter and only ever shared by reference afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    /// Source-scoped identifier (arXiv short id, or DOI for bioRxiv/medRxiv).
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    /// Authors in upstream order.
    pub authors: Vec<String>,
    /// Categories, de-duplicated, in upstream order.
    pub categories: Vec<String>,
    pub link: String,
    /// Timestamp used for windowing (arXiv `updated`, bioRxiv posting date).
    pub published: DateTime<Utc>,
    /// Configured name of the source that produced this paper.
    pub source: String,
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// Relevance verdict for exactly one paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub paper_id: String,
    pub relevant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_keywords: Option<Vec<String>>,
    /// Set when this is a degraded "unknown" verdict produced from a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Assessment {
    /// A plain verdict with no confidence, explanation or matches.
    pub fn verdict(paper: &Paper, relevant: bool) -> Self {
        Self {
            paper_id: paper.id.clone(),
            relevant,
            confidence: None,
            explanation: None,
            matched_keywords: None,
            error: None,
        }
    }

    /// The degraded verdict used whenever a paper could not be assessed:
    /// not relevant, confidence 0, explanation carrying the reason.
    pub fn unknown(paper: &Paper, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            paper_id: paper.id.clone(),
            relevant: false,
            confidence: Some(0.0),
            explanation: Some(format!("assessment unavailable: {reason}")),
            matched_keywords: None,
            error: Some(reason),
        }
    }

    /// Whether this verdict was degraded by a failure.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// A paper paired with its assessment, as handed to output collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessedPaper {
    pub paper: Paper,
    pub assessment: Assessment,
}

// ---------------------------------------------------------------------------
// Fetch window
// ---------------------------------------------------------------------------

/// The trailing interval `[start, end]` a source must fetch from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: u32,
}

impl FetchWindow {
    /// Window covering the `days` days up to and including `now`.
    ///
    /// A start before the earliest representable instant is clamped to it.
    pub fn trailing_days(now: DateTime<Utc>, days: u32) -> Self {
        let start = ChronoDuration::try_days(i64::from(days))
            .and_then(|span| now.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            start,
            end: now,
            days,
        }
    }

    /// Inclusive on both ends.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Day-granular membership for catalogs that only publish a posting date.
    pub fn contains_day(&self, date: NaiveDate) -> bool {
        date >= self.start.date_naive() && date <= self.end.date_naive()
    }
}

/// Parameters of a single `fetch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub window: FetchWindow,
    /// Cap on raw upstream records, applied before the window filter.
    pub max_results: usize,
}

// ---------------------------------------------------------------------------
// Run statistics
// ---------------------------------------------------------------------------

/// Per-source outcome of the fetching phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStats {
    pub name: String,
    pub fetched: usize,
    pub window: FetchWindow,
    pub duration: Duration,
    /// Present when the fetch failed (the source then contributed zero papers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceStats {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Statistics accumulated over one run and handed to output collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: RunId,
    pub method: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub sources: Vec<SourceStats>,
    pub total_fetched: usize,
    pub total_relevant: usize,
    /// Assessments that degraded to "unknown".
    pub degraded_assessments: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

impl RunStats {
    /// Fresh statistics for a run starting at `started_at`.
    pub fn start(run_id: RunId, method: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            method: method.into(),
            started_at,
            completed_at: None,
            sources: Vec::new(),
            total_fetched: 0,
            total_relevant: 0,
            degraded_assessments: 0,
            output_path: None,
        }
    }

    /// Record a source outcome and keep the fetched total in sync.
    pub fn record_source(&mut self, stats: SourceStats) {
        self.total_fetched += stats.fetched;
        self.sources.push(stats);
    }

    pub fn source(&self, name: &str) -> Option<&SourceStats> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceStats> {
        self.sources.iter().filter(|s| s.failed())
    }

    /// Whether any part of this run was degraded by a non-fatal error.
    pub fn is_degraded(&self) -> bool {
        self.degraded_assessments > 0 || self.sources.iter().any(SourceStats::failed)
    }

    /// Wall-clock duration once the run is finalized.
    pub fn elapsed(&self) -> Option<Duration> {
        self.completed_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}
