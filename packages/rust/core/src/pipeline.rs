//! One monitoring run: config → fetch → assess → report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{Instrument, Span, info, info_span, warn};

use papermonitor_relevance::{RelevanceEngine, StrategyRegistry};
use papermonitor_shared::{
    AssessedPaper, Assessment, ConfigResolver, EffectiveConfig, FetchRequest, FetchWindow, Paper,
    PaperMonitorError, Result, RunId, RunStats, SourceStats,
};
use papermonitor_sources::{SourceAdapter, SourceRegistry};

use crate::notify::{EmailNotifier, Notifier};
use crate::output::{FileWriter, OutputWriter};

/// Where the orchestrator currently is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Fetching,
    Assessing,
    Reporting,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Assessing => "assessing",
            Self::Reporting => "reporting",
        };
        f.write_str(s)
    }
}

/// Outcome of [`Orchestrator::run_once`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: RunStats,
    /// Relevant papers in fetch order.
    pub relevant: Vec<AssessedPaper>,
    /// Output or notification failures; the run still counts as completed.
    pub delivery_errors: Vec<String>,
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, phase: RunPhase);
    /// Called after each source has been fetched (or has failed).
    fn source_fetched(&self, stats: &SourceStats);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _phase: RunPhase) {}
    fn source_fetched(&self, _stats: &SourceStats) {}
    fn done(&self, _report: &RunReport) {}
}

/// Everything built from the effective config before fetching starts.
struct RunPlan {
    adapters: Vec<Box<dyn SourceAdapter>>,
    strategy: Box<dyn RelevanceEngine>,
    method: String,
    run_budget: Option<usize>,
    writer: Arc<dyn OutputWriter>,
    notifier: Option<Arc<dyn Notifier>>,
}

/// Drives monitoring runs against a primary config file.
///
/// Each call to [`run_once`](Self::run_once) re-resolves the configuration and
/// builds fresh adapters and a fresh strategy, so edits to the config files
/// take effect on the next run.
pub struct Orchestrator {
    config_path: PathBuf,
    resolver: ConfigResolver,
    sources: SourceRegistry,
    strategies: StrategyRegistry,
    output: Option<Arc<dyn OutputWriter>>,
    notifier: Option<Arc<dyn Notifier>>,
    fixed_now: Option<DateTime<Utc>>,
    phase: RunPhase,
}

impl Orchestrator {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            resolver: ConfigResolver::from_process_env(),
            sources: SourceRegistry::new(),
            strategies: StrategyRegistry::new(),
            output: None,
            notifier: None,
            fixed_now: None,
            phase: RunPhase::Idle,
        }
    }

    pub fn with_resolver(mut self, resolver: ConfigResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    /// Replace the file writer built from `output`.
    pub fn with_output(mut self, output: Box<dyn OutputWriter>) -> Self {
        self.output = Some(Arc::from(output));
        self
    }

    /// Replace the email notifier. It is still only used when
    /// `notifications.send_email_summary` is true.
    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(Arc::from(notifier));
        self
    }

    /// Pin the run-start instant instead of reading the clock.
    pub fn with_fixed_now(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Resolve the configuration and build every collaborator without
    /// fetching anything. Returns the effective config on success.
    pub fn check(&self) -> Result<EffectiveConfig> {
        let config = self.resolver.resolve(&self.config_path)?;
        self.plan(&config, &Span::none())?;
        Ok(config)
    }

    /// Execute one full run.
    ///
    /// Only configuration errors are returned; fetch, assessment and delivery
    /// failures are recorded in the [`RunReport`].
    pub async fn run_once(&mut self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let run_id = RunId::new();
        let span = info_span!("run", run_id = %run_id);
        let result = self
            .execute(run_id, span.clone(), progress)
            .instrument(span)
            .await;
        self.set_phase(RunPhase::Idle, progress);
        result
    }

    async fn execute(
        &mut self,
        run_id: RunId,
        run_span: Span,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        let start = Instant::now();

        // --- Phase 1: Configuration ---
        let config = self.resolver.resolve(&self.config_path)?;
        let plan = self.plan(&config, &run_span)?;
        info!(
            sources = plan.adapters.len(),
            method = %plan.method,
            config = %self.config_path.display(),
            "starting run"
        );

        // --- Phase 2: Fetch ---
        self.set_phase(RunPhase::Fetching, progress);
        let now = self.fixed_now.unwrap_or_else(Utc::now);
        let mut stats = RunStats::start(run_id, plan.method.clone(), now);
        let papers = fetch_all(&plan.adapters, now, plan.run_budget, &mut stats, progress).await;

        // --- Phase 3: Assess ---
        self.set_phase(RunPhase::Assessing, progress);
        let assessments = if papers.is_empty() {
            Vec::new()
        } else {
            align(&papers, plan.strategy.assess(&papers).await)
        };
        stats.degraded_assessments = assessments.iter().filter(|a| a.is_degraded()).count();
        if stats.degraded_assessments > 0 {
            warn!(
                degraded = stats.degraded_assessments,
                "some papers could not be assessed"
            );
        }

        let relevant: Vec<AssessedPaper> = papers
            .into_iter()
            .zip(assessments)
            .filter(|(_, a)| a.relevant)
            .map(|(paper, assessment)| AssessedPaper { paper, assessment })
            .collect();
        stats.total_relevant = relevant.len();

        // --- Phase 4: Report ---
        self.set_phase(RunPhase::Reporting, progress);
        stats.completed_at = Some(Utc::now().max(now));
        let mut delivery_errors = Vec::new();

        if !relevant.is_empty() {
            match plan.writer.write(&relevant, &stats) {
                Ok(path) => stats.output_path = Some(path),
                Err(e) => {
                    warn!(error = %e, "failed to write output");
                    delivery_errors.push(format!("output: {e}"));
                }
            }
        }

        if let Some(notifier) = &plan.notifier {
            if let Err(e) = notifier.notify(&relevant, &stats).await {
                warn!(notifier = notifier.name(), error = %e, "notification failed");
                delivery_errors.push(format!("{}: {e}", notifier.name()));
            }
        }

        info!(
            fetched = stats.total_fetched,
            relevant = stats.total_relevant,
            failed_sources = stats.failed_sources().count(),
            degraded = stats.degraded_assessments,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "run complete"
        );

        let report = RunReport {
            stats,
            relevant,
            delivery_errors,
        };
        progress.done(&report);
        Ok(report)
    }

    /// Build and configure every collaborator. Any error aborts the run.
    fn plan(&self, config: &EffectiveConfig, run_span: &Span) -> Result<RunPlan> {
        let mut adapters = Vec::new();
        for name in config.active_sources()? {
            let mut adapter = self.sources.build(&name, run_span.clone())?;
            adapter.configure(config)?;
            adapters.push(adapter);
        }

        let method = config.relevance()?.method.trim().to_lowercase();
        let mut strategy = self.strategies.build(&method, run_span.clone())?;
        strategy.configure(config)?;

        let writer: Arc<dyn OutputWriter> = match &self.output {
            Some(writer) => Arc::clone(writer),
            None => Arc::new(FileWriter::from_settings(&config.output()?)),
        };

        let notifications = config.notifications()?;
        let notifier: Option<Arc<dyn Notifier>> = if notifications.send_email_summary {
            match &self.notifier {
                Some(notifier) => Some(Arc::clone(notifier)),
                None => Some(Arc::new(EmailNotifier::from_settings(&notifications.email)?)),
            }
        } else {
            None
        };

        Ok(RunPlan {
            adapters,
            strategy,
            method,
            run_budget: config.max_total_results_per_run()?,
            writer,
            notifier,
        })
    }

    fn set_phase(&mut self, phase: RunPhase, progress: &dyn ProgressReporter) {
        self.phase = phase;
        progress.phase(phase);
    }
}

/// Fetch every source in order, recording one [`SourceStats`] per source.
async fn fetch_all(
    adapters: &[Box<dyn SourceAdapter>],
    now: DateTime<Utc>,
    run_budget: Option<usize>,
    stats: &mut RunStats,
    progress: &dyn ProgressReporter,
) -> Vec<Paper> {
    let mut papers = Vec::new();
    let mut remaining = run_budget;

    for adapter in adapters {
        let window = FetchWindow::trailing_days(now, adapter.fetch_window_days());
        let cap = match remaining {
            Some(left) => adapter.max_total_results().min(left),
            None => adapter.max_total_results(),
        };

        let started = Instant::now();
        let (fetched, error) = if cap == 0 {
            info!(source = adapter.name(), "run budget exhausted; skipping source");
            (Vec::new(), None)
        } else {
            let request = FetchRequest {
                window,
                max_results: cap,
            };
            match adapter.fetch(request).await {
                Ok(found) => (found, None),
                Err(e) => {
                    warn!(source = adapter.name(), error = %e, "source fetch failed");
                    (Vec::new(), Some(fetch_message(e)))
                }
            }
        };

        if let Some(left) = remaining.as_mut() {
            *left = left.saturating_sub(fetched.len());
        }

        let source_stats = SourceStats {
            name: adapter.name().to_string(),
            fetched: fetched.len(),
            window,
            duration: started.elapsed(),
            error,
        };
        progress.source_fetched(&source_stats);
        stats.record_source(source_stats);
        papers.extend(fetched);
    }
    papers
}

fn fetch_message(error: PaperMonitorError) -> String {
    match error {
        PaperMonitorError::Fetch { message, .. } => message,
        other => other.to_string(),
    }
}

/// Pair each paper with exactly one assessment, padding with unknowns.
fn align(papers: &[Paper], mut assessments: Vec<Assessment>) -> Vec<Assessment> {
    if assessments.len() != papers.len() {
        warn!(
            expected = papers.len(),
            got = assessments.len(),
            "strategy returned a mismatched number of assessments"
        );
        assessments.truncate(papers.len());
        for paper in &papers[assessments.len()..] {
            assessments.push(Assessment::unknown(paper, "no assessment returned"));
        }
    }
    assessments
}
