//! Shared types, error model, and configuration for papermonitor.
//!
//! This crate is the foundation depended on by all other papermonitor crates.
//! It provides:
//! - [`PaperMonitorError`], the unified error type
//! - Domain types ([`Paper`], [`Assessment`], [`FetchWindow`], [`RunStats`])
//! - Layered YAML configuration ([`ConfigResolver`], [`EffectiveConfig`])

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ConfigResolver, DEFAULT_CONFIG_FILE, DEFAULT_FETCH_WINDOW_DAYS, EffectiveConfig,
    MAX_FETCH_WINDOW_DAYS,
    EmailSettings, EmbeddingSettings, LlmSelection, LlmSettings, NotificationSettings,
    OutputFormat, OutputSettings, RelevanceSettings, ScheduleSettings, SourceSettings,
    init_config, merge_values,
};
pub use error::{PaperMonitorError, Result};
pub use types::{
    AssessedPaper, Assessment, FetchRequest, FetchWindow, Paper, RunId, RunStats, SourceStats,
};
