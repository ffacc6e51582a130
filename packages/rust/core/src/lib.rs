//! Run orchestration and delivery for papermonitor.
//!
//! [`Orchestrator::run_once`] ties configuration, source adapters and the
//! relevance strategy into one monitoring run, then hands the relevant papers
//! to the output writer and notifier. The schedule module computes when the
//! next daily run is due.

pub mod notify;
pub mod output;
pub mod pipeline;
pub mod schedule;

pub use notify::{EmailNotifier, Notifier};
pub use output::{FileWriter, OutputWriter};
pub use pipeline::{Orchestrator, ProgressReporter, RunPhase, RunReport, SilentProgress};
pub use schedule::DailySchedule;
