//! Appends each run's relevant papers to a local file.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use papermonitor_shared::{
    AssessedPaper, OutputFormat, OutputSettings, PaperMonitorError, Result, RunStats,
};
use tracing::info;

/// Destination for the relevant papers of a run.
pub trait OutputWriter: Send + Sync {
    /// Persist `relevant` and return where it went.
    fn write(&self, relevant: &[AssessedPaper], stats: &RunStats) -> Result<PathBuf>;
}

/// Appends one timestamped section per run to `output.file`.
#[derive(Debug, Clone)]
pub struct FileWriter {
    path: PathBuf,
    format: OutputFormat,
}

impl FileWriter {
    pub fn new(path: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn from_settings(settings: &OutputSettings) -> Self {
        Self::new(settings.resolved_path(), settings.format)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render the section appended for one run.
    pub fn render(&self, relevant: &[AssessedPaper], stats: &RunStats) -> String {
        match self.format {
            OutputFormat::Markdown => render_markdown(relevant, stats),
            OutputFormat::Plain => render_plain(relevant, stats),
        }
    }
}

impl OutputWriter for FileWriter {
    fn write(&self, relevant: &[AssessedPaper], stats: &RunStats) -> Result<PathBuf> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PaperMonitorError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PaperMonitorError::io(&self.path, e))?;
        file.write_all(self.render(relevant, stats).as_bytes())
            .map_err(|e| PaperMonitorError::io(&self.path, e))?;

        info!(path = %self.path.display(), papers = relevant.len(), "wrote relevant papers");
        Ok(self.path.clone())
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn run_timestamp(stats: &RunStats) -> String {
    stats
        .completed_at
        .unwrap_or(stats.started_at)
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string()
}

/// One-line description of what went wrong in a degraded run.
fn degraded_note(stats: &RunStats) -> Option<String> {
    if !stats.is_degraded() {
        return None;
    }
    let mut parts = Vec::new();
    let failed: Vec<&str> = stats.failed_sources().map(|s| s.name.as_str()).collect();
    if !failed.is_empty() {
        parts.push(format!("failed sources: {}", failed.join(", ")));
    }
    if stats.degraded_assessments > 0 {
        parts.push(format!(
            "{} paper(s) could not be assessed",
            stats.degraded_assessments
        ));
    }
    Some(parts.join("; "))
}

fn render_markdown(relevant: &[AssessedPaper], stats: &RunStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Relevant papers, {}\n", run_timestamp(stats));
    let _ = writeln!(
        out,
        "_Run `{}` · method `{}` · {} fetched · {} relevant_\n",
        stats.run_id,
        stats.method,
        stats.total_fetched,
        relevant.len()
    );
    if let Some(warning) = degraded_note(stats) {
        let _ = writeln!(out, "> **Partial run:** {warning}\n");
    }

    for item in relevant {
        let paper = &item.paper;
        let a = &item.assessment;
        let _ = writeln!(out, "### [{}]({})\n", paper.title, paper.link);
        let _ = writeln!(out, "- **ID:** {}", paper.id);
        let _ = writeln!(out, "- **Source:** {}", paper.source);
        let _ = writeln!(out, "- **Authors:** {}", paper.authors.join(", "));
        let _ = writeln!(
            out,
            "- **Published:** {}",
            paper.published.format("%Y-%m-%d %H:%M UTC")
        );
        if !paper.categories.is_empty() {
            let _ = writeln!(out, "- **Categories:** {}", paper.categories.join(", "));
        }
        if let Some(confidence) = a.confidence {
            let _ = writeln!(out, "- **Confidence:** {confidence:.2}");
        }
        if let Some(keywords) = a.matched_keywords.as_ref().filter(|k| !k.is_empty()) {
            let _ = writeln!(out, "- **Matched keywords:** {}", keywords.join(", "));
        }
        if let Some(explanation) = &a.explanation {
            let _ = writeln!(out, "- **Assessment:** {explanation}");
        }
        let _ = writeln!(out, "\n> {}\n", paper.abstract_text);
    }
    out
}

fn render_plain(relevant: &[AssessedPaper], stats: &RunStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "=".repeat(72));
    let _ = writeln!(
        out,
        "Relevant papers, {} (run {}, method {})",
        run_timestamp(stats),
        stats.run_id,
        stats.method
    );
    if let Some(warning) = degraded_note(stats) {
        let _ = writeln!(out, "Partial run: {warning}");
    }
    let _ = writeln!(out, "{}\n", "=".repeat(72));

    for item in relevant {
        let paper = &item.paper;
        let _ = writeln!(out, "ID: {}", paper.id);
        let _ = writeln!(out, "Source: {}", paper.source);
        let _ = writeln!(out, "Title: {}", paper.title);
        let _ = writeln!(out, "Authors: {}", paper.authors.join(", "));
        let _ = writeln!(
            out,
            "Published: {}",
            paper.published.format("%Y-%m-%d %H:%M UTC")
        );
        let _ = writeln!(out, "URL: {}", paper.link);
        if let Some(confidence) = item.assessment.confidence {
            let _ = writeln!(out, "Confidence: {confidence:.2}");
        }
        let _ = writeln!(out, "Abstract: {}", paper.abstract_text);
        let _ = writeln!(out, "{}\n", "-".repeat(72));
    }
    out
}
