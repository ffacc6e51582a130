//! Layered YAML configuration.
//!
//! A run is driven by one primary document (default `./config.yaml`) plus
//! secondary fragments that are only read when the feature they configure is
//! enabled:
//!
//! | Fragment                         | Merged under                   | Loaded when                         |
//! |----------------------------------|--------------------------------|-------------------------------------|
//! | `<fragments_dir>/sources/<n>.yaml` | `sources.<n>`                 | `<n>` is listed in `sources.active` |
//! | `<fragments_dir>/llm/<p>.yaml`     | `relevance.llm.<p>`           | `relevance.method == "llm"`         |
//! | `<fragments_dir>/embedding.yaml`   | `relevance.embedding`         | `relevance.method == "embedding"`   |
//! | `<fragments_dir>/notifications.yaml` | `notifications`             | `notifications.send_email_summary`  |
//!
//! Precedence, lowest first: built-in defaults, primary, fragments,
//! environment. Layers are combined with [`merge_values`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use crate::error::{PaperMonitorError, Result};

/// Default primary configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Fetch window used when neither the source nor `sources` sets one.
pub const DEFAULT_FETCH_WINDOW_DAYS: u32 = 1;

/// Largest accepted fetch window (about a century).
pub const MAX_FETCH_WINDOW_DAYS: u32 = 36_500;

/// Built-in defaults, the lowest-precedence layer.
const DEFAULTS_YAML: &str = r#"
sources:
  active: []
  fetch_window_days: 1
  max_total_results_per_run: null
relevance:
  method: keyword
  keywords: []
  llm:
    provider: groq
output:
  file: relevant_papers.md
  format: markdown
notifications:
  send_email_summary: false
schedule:
  run_time: "08:00"
  timezone: local
"#;

/// Starter primary config written by `config init`.
const STARTER_PRIMARY: &str = r#"# papermonitor primary configuration.
# Source, LLM, embedding and notification settings live in fragments next to
# this file (see `fragments_dir`); only fragments for enabled features are read.
fragments_dir: "."

sources:
  active: [arxiv]
  fetch_window_days: 1

relevance:
  # keyword | llm | embedding | none
  method: keyword
  keywords: ["diffusion model", "protein folding"]
  llm:
    provider: groq

output:
  file: relevant_papers.md
  format: markdown

notifications:
  send_email_summary: false

schedule:
  run_time: "08:00"
  timezone: local
"#;

/// Starter arXiv fragment written by `config init`.
const STARTER_ARXIV: &str = r#"# Merged under `sources.arxiv`.
categories: [cs.LG, q-bio.BM]
keywords: []
max_total_results: 500
"#;

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Recursively merge `overlay` into `base`.
///
/// Mappings are merged key by key, so a partial overlay keeps sibling keys of
/// `base`. Any other overlay value (scalar, sequence) replaces the base value.
/// A null overlay value means "unset" and leaves the base untouched.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Wrap `value` in nested single-key mappings following `path`.
fn nest(path: &[&str], value: Value) -> Value {
    path.iter().rev().fold(value, |inner, key| {
        let mut map = Mapping::new();
        map.insert(Value::String((*key).to_string()), inner);
        Value::Mapping(map)
    })
}

fn defaults() -> Value {
    serde_yaml::from_str(DEFAULTS_YAML).unwrap_or_else(|_| Value::Mapping(Mapping::new()))
}

// ---------------------------------------------------------------------------
// EffectiveConfig
// ---------------------------------------------------------------------------

/// The merged, read-only configuration tree for one run.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    root: Value,
    primary_path: Option<PathBuf>,
}

impl EffectiveConfig {
    /// Build from an already-merged tree, layered over the built-in defaults.
    pub fn from_value(value: Value) -> Self {
        let mut root = defaults();
        merge_values(&mut root, value);
        Self {
            root,
            primary_path: None,
        }
    }

    /// Parse a YAML document and layer it over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)
            .map_err(|e| PaperMonitorError::config(format!("invalid YAML: {e}")))?;
        Ok(Self::from_value(value))
    }

    /// The full tree.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Path of the primary file this config was resolved from, if any.
    pub fn primary_path(&self) -> Option<&Path> {
        self.primary_path.as_deref()
    }

    /// Look up a dotted key path such as `relevance.llm.provider`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.root, |node, key| node.get(key))
    }

    /// Deserialize the section at `path`. A missing or null section
    /// deserializes from an empty mapping so field defaults apply.
    pub fn extract<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = match self.get(path) {
            Some(v) if !v.is_null() => v.clone(),
            _ => Value::Mapping(Mapping::new()),
        };
        serde_yaml::from_value(value)
            .map_err(|e| PaperMonitorError::config(format!("invalid `{path}` section: {e}")))
    }

    /// Names listed in `sources.active`, in configured order, de-duplicated.
    pub fn active_sources(&self) -> Result<Vec<String>> {
        let names = active_source_names(&self.root)?;
        if names.is_empty() {
            return Err(PaperMonitorError::config(
                "no active sources configured (`sources.active` is empty)",
            ));
        }
        Ok(names)
    }

    /// Settings for source `name`, with the fetch window resolved
    /// (source value, then `sources.fetch_window_days`, then the default).
    pub fn source(&self, name: &str) -> Result<SourceSettings> {
        let mut settings: SourceSettings = self.extract(&format!("sources.{name}"))?;

        if settings.fetch_window_days.is_none() {
            settings.fetch_window_days = match self.get("sources.fetch_window_days") {
                Some(v) if !v.is_null() => Some(v.as_u64().and_then(|d| u32::try_from(d).ok()).ok_or_else(
                    || PaperMonitorError::config("`sources.fetch_window_days` must be a positive integer"),
                )?),
                _ => None,
            };
        }

        match settings.fetch_window_days {
            Some(0) => {
                return Err(PaperMonitorError::config(format!(
                    "`sources.{name}.fetch_window_days` must be at least 1"
                )));
            }
            Some(days) if days > MAX_FETCH_WINDOW_DAYS => {
                return Err(PaperMonitorError::config(format!(
                    "`sources.{name}.fetch_window_days` is {days}; the maximum is {MAX_FETCH_WINDOW_DAYS}"
                )));
            }
            _ => {}
        }

        Ok(settings)
    }

    /// Optional cap on raw records summed over every source of one run.
    pub fn max_total_results_per_run(&self) -> Result<Option<usize>> {
        match self.get("sources.max_total_results_per_run") {
            None => Ok(None),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| {
                    PaperMonitorError::config(
                        "`sources.max_total_results_per_run` must be a non-negative integer",
                    )
                }),
        }
    }

    pub fn relevance(&self) -> Result<RelevanceSettings> {
        self.extract("relevance")
    }

    /// Settings of the selected LLM provider (`relevance.llm.<provider>`).
    pub fn llm(&self) -> Result<LlmSettings> {
        let provider = self.relevance()?.llm.provider;
        let mut settings: LlmSettings = self.extract(&format!("relevance.llm.{provider}"))?;
        settings.provider = provider;
        Ok(settings)
    }

    pub fn embedding(&self) -> Result<EmbeddingSettings> {
        self.extract("relevance.embedding")
    }

    pub fn output(&self) -> Result<OutputSettings> {
        self.extract("output")
    }

    pub fn notifications(&self) -> Result<NotificationSettings> {
        self.extract("notifications")
    }

    pub fn schedule(&self) -> Result<ScheduleSettings> {
        self.extract("schedule")
    }

    /// Render the tree as YAML with secrets masked.
    pub fn to_redacted_yaml(&self) -> Result<String> {
        let mut root = self.root.clone();
        redact(&mut root);
        serde_yaml::to_string(&root).map_err(|e| PaperMonitorError::config(e.to_string()))
    }
}

fn redact(value: &mut Value) {
    if let Value::Mapping(map) = value {
        for (key, inner) in map.iter_mut() {
            let secret = matches!(key.as_str(), Some("api_key" | "password"));
            if secret && !inner.is_null() {
                *inner = Value::String("***".into());
            } else {
                redact(inner);
            }
        }
    }
}

fn active_source_names(root: &Value) -> Result<Vec<String>> {
    let Some(active) = root.get("sources").and_then(|s| s.get("active")) else {
        return Ok(Vec::new());
    };
    let Some(items) = active.as_sequence() else {
        return Err(PaperMonitorError::config(
            "`sources.active` must be a list of source names",
        ));
    };

    let mut names: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let name = item
            .as_str()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PaperMonitorError::config("`sources.active` entries must be non-empty strings")
            })?;
        if names.contains(&name) {
            warn!(source = %name, "source listed twice in `sources.active`, ignoring duplicate");
            continue;
        }
        names.push(name);
    }
    Ok(names)
}

// ---------------------------------------------------------------------------
// ConfigResolver
// ---------------------------------------------------------------------------

/// Loads the primary document, the enabled fragments and environment
/// overrides, and merges them into an [`EffectiveConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    env: HashMap<String, String>,
}

impl ConfigResolver {
    /// Resolver with no environment overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver that takes overrides from the process environment.
    pub fn from_process_env() -> Self {
        Self {
            env: std::env::vars().collect(),
        }
    }

    /// Add a single environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Resolve the effective configuration rooted at `primary_path`.
    pub fn resolve(&self, primary_path: &Path) -> Result<EffectiveConfig> {
        let primary = read_yaml_mapping(primary_path)?;
        info!(path = %primary_path.display(), "loaded primary configuration");

        let mut root = defaults();
        merge_values(&mut root, primary);

        let base_dir = primary_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let fragments_dir = match root.get("fragments_dir").and_then(Value::as_str) {
            Some(dir) => base_dir.join(dir),
            None => base_dir,
        };

        for name in active_source_names(&root)? {
            let path = fragments_dir.join("sources").join(format!("{name}.yaml"));
            let fragment = read_fragment(&path, &format!("active source `{name}`"))?;
            merge_values(&mut root, nest(&["sources", &name], fragment));
        }

        let method = root
            .get("relevance")
            .and_then(|r| r.get("method"))
            .and_then(Value::as_str)
            .unwrap_or("keyword")
            .to_lowercase();

        match method.as_str() {
            "llm" => {
                let provider = llm_provider(&root)?;
                let path = fragments_dir.join("llm").join(format!("{provider}.yaml"));
                let fragment = read_fragment(&path, &format!("LLM provider `{provider}`"))?;
                merge_values(&mut root, nest(&["relevance", "llm", &provider], fragment));
            }
            "embedding" => {
                let path = fragments_dir.join("embedding.yaml");
                let fragment = read_fragment(&path, "embedding relevance")?;
                merge_values(&mut root, nest(&["relevance", "embedding"], fragment));
            }
            _ => {}
        }

        let email_enabled = root
            .get("notifications")
            .and_then(|n| n.get("send_email_summary"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if email_enabled {
            let path = fragments_dir.join("notifications.yaml");
            let fragment = read_fragment(&path, "email notifications")?;
            merge_values(&mut root, nest(&["notifications"], fragment));
        }

        self.apply_env(&mut root)?;

        Ok(EffectiveConfig {
            root,
            primary_path: Some(primary_path.to_path_buf()),
        })
    }

    /// Secrets from the environment take precedence over any file value.
    fn apply_env(&self, root: &mut Value) -> Result<()> {
        let provider = llm_provider(root)?;
        let key_var = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));

        let overrides: [(&str, Vec<&str>); 4] = [
            (key_var.as_str(), vec!["relevance", "llm", provider.as_str(), "api_key"]),
            ("EMBEDDING_API_KEY", vec!["relevance", "embedding", "api_key"]),
            ("SMTP_USERNAME", vec!["notifications", "email", "username"]),
            ("SMTP_PASSWORD", vec!["notifications", "email", "password"]),
        ];

        for (var, path) in overrides {
            if let Some(value) = self.env.get(var).filter(|v| !v.is_empty()) {
                debug!(var, "applying environment override");
                merge_values(root, nest(&path, Value::String(value.clone())));
            }
        }
        Ok(())
    }
}

fn llm_provider(root: &Value) -> Result<String> {
    let provider = root
        .get("relevance")
        .and_then(|r| r.get("llm"))
        .and_then(|l| l.get("provider"))
        .and_then(Value::as_str)
        .map(|p| p.trim().to_lowercase())
        .unwrap_or_default();
    if provider.is_empty() {
        return Err(PaperMonitorError::config(
            "`relevance.llm.provider` must name an LLM provider",
        ));
    }
    Ok(provider)
}

fn read_yaml_mapping(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PaperMonitorError::config(format!("cannot read {}: {e}", path.display()))
    })?;
    let value: Value = serde_yaml::from_str(&content).map_err(|e| {
        PaperMonitorError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    match value {
        Value::Mapping(_) => Ok(value),
        Value::Null => Err(PaperMonitorError::config(format!(
            "{} is empty",
            path.display()
        ))),
        _ => Err(PaperMonitorError::config(format!(
            "{} must contain a YAML mapping",
            path.display()
        ))),
    }
}

/// Read a required fragment. An empty fragment file counts as an empty mapping.
fn read_fragment(path: &Path, purpose: &str) -> Result<Value> {
    if !path.exists() {
        return Err(PaperMonitorError::config(format!(
            "missing config fragment {} (required by {purpose})",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        PaperMonitorError::config(format!("cannot read {}: {e}", path.display()))
    })?;
    let value: Value = serde_yaml::from_str(&content).map_err(|e| {
        PaperMonitorError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), purpose, "loaded config fragment");
    match value {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        _ => Err(PaperMonitorError::config(format!(
            "{} must contain a YAML mapping",
            path.display()
        ))),
    }
}

/// Write a starter primary config and arXiv fragment into `dir`.
/// Existing files are left alone. Returns the paths actually written.
pub fn init_config(dir: &Path) -> Result<Vec<PathBuf>> {
    let files = [
        (dir.join(DEFAULT_CONFIG_FILE), STARTER_PRIMARY),
        (dir.join("sources").join("arxiv.yaml"), STARTER_ARXIV),
    ];

    let mut written = Vec::new();
    for (path, content) in files {
        if path.exists() {
            warn!(path = %path.display(), "config file already exists, not overwriting");
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PaperMonitorError::io(parent, e))?;
        }
        std::fs::write(&path, content).map_err(|e| PaperMonitorError::io(&path, e))?;
        info!(path = %path.display(), "created config file");
        written.push(path);
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

/// `sources.<name>` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Catalog categories to query.
    #[serde(default, deserialize_with = "string_or_list")]
    pub categories: Vec<String>,

    /// Keywords used by the keyword strategy for papers of this source.
    #[serde(default, deserialize_with = "string_or_list")]
    pub keywords: Vec<String>,

    /// Lookback window in days; resolved by [`EffectiveConfig::source`].
    #[serde(default)]
    pub fetch_window_days: Option<u32>,

    /// Cap on raw records requested per run, applied before window filtering.
    #[serde(default = "default_max_total_results")]
    pub max_total_results: usize,

    /// bioRxiv server selector (`biorxiv` or `medrxiv`).
    #[serde(default)]
    pub server: Option<String>,

    /// Override of the upstream API root.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub page_size: Option<usize>,

    /// Politeness delay between page requests.
    #[serde(default)]
    pub page_delay_seconds: Option<f64>,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl SourceSettings {
    pub fn window_days(&self) -> u32 {
        self.fetch_window_days.unwrap_or(DEFAULT_FETCH_WINDOW_DAYS)
    }
}

fn default_max_total_results() -> usize {
    500
}
fn default_request_timeout() -> u64 {
    60
}

/// `relevance` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceSettings {
    /// Strategy name: `keyword`, `llm`, `embedding` or `none`.
    #[serde(default = "default_method")]
    pub method: String,

    /// Keywords applied to papers of every source.
    #[serde(default, deserialize_with = "string_or_list")]
    pub keywords: Vec<String>,

    #[serde(default)]
    pub llm: LlmSelection,
}

fn default_method() -> String {
    "keyword".into()
}

/// `relevance.llm` provider selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSelection {
    #[serde(default = "default_provider")]
    pub provider: String,
}

impl Default for LlmSelection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
        }
    }
}

fn default_provider() -> String {
    "groq".into()
}

/// `relevance.llm.<provider>` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Filled from `relevance.llm.provider`.
    #[serde(skip)]
    pub provider: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Model id; the provider preset is used when absent.
    #[serde(default)]
    pub model: Option<String>,

    /// API root; the provider preset is used when absent.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Research interest posed to the model for every paper.
    #[serde(default = "default_prompt")]
    pub prompt: String,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_llm_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_delay")]
    pub batch_delay_seconds: f64,

    /// Retries after the first attempt of a batch call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff between retries.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: f64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_prompt() -> String {
    "Is this paper relevant to my research interests?".into()
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_llm_batch_size() -> usize {
    10
}
fn default_batch_delay() -> f64 {
    2.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> f64 {
    2.0
}
fn default_temperature() -> f32 {
    0.2
}

/// `relevance.embedding` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Texts describing the research interest; a paper matches any of them.
    #[serde(default = "default_target_texts", deserialize_with = "string_or_list")]
    pub target_texts: Vec<String>,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Texts per embedding request.
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_target_texts() -> Vec<String> {
    vec!["scientific research papers".into()]
}
fn default_similarity_threshold() -> f64 {
    0.65
}
fn default_embedding_batch_size() -> usize {
    32
}

/// Rendering used by the output writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Plain,
}

/// `output` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default = "default_output_file")]
    pub file: String,

    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
}

impl OutputSettings {
    /// Output path with a leading `~` expanded to the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        match self.file.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.file)),
            None => PathBuf::from(&self.file),
        }
    }
}

fn default_output_file() -> String {
    "relevant_papers.md".into()
}
fn default_output_format() -> OutputFormat {
    OutputFormat::Markdown
}

/// `notifications` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub send_email_summary: bool,

    #[serde(default)]
    pub email: EmailSettings,
}

/// `notifications.email` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub smtp_server: Option<String>,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub sender: Option<String>,

    #[serde(default, deserialize_with = "string_or_list")]
    pub recipients: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// STARTTLS when true; plain SMTP otherwise.
    #[serde(default = "default_true")]
    pub use_tls: bool,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            smtp_server: None,
            smtp_port: default_smtp_port(),
            sender: None,
            recipients: Vec::new(),
            username: None,
            password: None,
            use_tls: true,
            subject_prefix: default_subject_prefix(),
        }
    }
}

fn default_smtp_port() -> u16 {
    587
}
fn default_true() -> bool {
    true
}
fn default_subject_prefix() -> String {
    "[papermonitor]".into()
}

/// `schedule` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    /// Daily run time, `HH:MM`.
    #[serde(default = "default_run_time")]
    pub run_time: String,

    /// `local`, `UTC`, or a fixed offset such as `+02:00`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_run_time() -> String {
    "08:00".into()
}
fn default_timezone() -> String {
    "local".into()
}

/// Accept either a single string or a list of strings.
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).expect("valid yaml")
    }

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    // -----------------------------------------------------------------------
    // merge_values
    // -----------------------------------------------------------------------

    #[test]
    fn merge_overrides_by_key() {
        let mut base = yaml("{a: 0, b: 2}");
        merge_values(&mut base, yaml("{a: 1}"));
        assert_eq!(base, yaml("{a: 1, b: 2}"));
    }

    #[test]
    fn merge_is_recursive_not_section_replace() {
        let mut base = yaml("relevance: {method: keyword, llm: {provider: groq, model: a}}");
        merge_values(&mut base, yaml("relevance: {llm: {model: b}}"));
        assert_eq!(
            base,
            yaml("relevance: {method: keyword, llm: {provider: groq, model: b}}")
        );
    }

    #[test]
    fn merge_replaces_sequences_and_ignores_null() {
        let mut base = yaml("{keywords: [a, b], file: out.md}");
        merge_values(&mut base, yaml("{keywords: [c], file: null}"));
        assert_eq!(base, yaml("{keywords: [c], file: out.md}"));
    }

    #[test]
    fn nest_builds_path() {
        let nested = nest(&["sources", "arxiv"], yaml("{categories: [cs.AI]}"));
        assert_eq!(nested, yaml("sources: {arxiv: {categories: [cs.AI]}}"));
    }

    // -----------------------------------------------------------------------
    // EffectiveConfig
    // -----------------------------------------------------------------------

    #[test]
    fn defaults_fill_missing_sections() {
        let config = EffectiveConfig::from_yaml("sources: {active: [arxiv]}").unwrap();
        assert_eq!(config.relevance().unwrap().method, "keyword");
        assert_eq!(config.output().unwrap().format, OutputFormat::Markdown);
        assert_eq!(config.schedule().unwrap().run_time, "08:00");
        assert!(!config.notifications().unwrap().send_email_summary);
        assert_eq!(config.max_total_results_per_run().unwrap(), None);
    }

    #[test]
    fn source_window_falls_back_to_global() {
        let config = EffectiveConfig::from_yaml(
            r#"
sources:
  active: [arxiv, biorxiv]
  fetch_window_days: 3
  arxiv: {categories: [cs.AI]}
  biorxiv: {fetch_window_days: 7}
"#,
        )
        .unwrap();

        assert_eq!(config.source("arxiv").unwrap().window_days(), 3);
        assert_eq!(config.source("biorxiv").unwrap().window_days(), 7);
        assert_eq!(config.source("arxiv").unwrap().max_total_results, 500);
    }

    #[test]
    fn zero_window_is_config_error() {
        let config =
            EffectiveConfig::from_yaml("sources: {active: [arxiv], arxiv: {fetch_window_days: 0}}")
                .unwrap();
        assert!(config.source("arxiv").unwrap_err().is_fatal());
    }

    #[test]
    fn oversized_window_is_config_error() {
        let config = EffectiveConfig::from_yaml(
            "sources: {active: [arxiv], arxiv: {categories: [cs.AI], fetch_window_days: 100000000}}",
        )
        .unwrap();
        let err = config.source("arxiv").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("maximum is 36500"));

        let config = EffectiveConfig::from_yaml(
            "sources: {active: [arxiv], fetch_window_days: 40000, arxiv: {categories: [cs.AI]}}",
        )
        .unwrap();
        assert!(config.source("arxiv").unwrap_err().is_fatal());

        let config = EffectiveConfig::from_yaml(
            "sources: {active: [arxiv], arxiv: {fetch_window_days: 36500}}",
        )
        .unwrap();
        assert_eq!(config.source("arxiv").unwrap().window_days(), 36_500);
    }

    #[test]
    fn empty_active_sources_is_config_error() {
        let config = EffectiveConfig::from_yaml("relevance: {method: none}").unwrap();
        let err = config.active_sources().unwrap_err();
        assert!(err.to_string().contains("no active sources"));
    }

    #[test]
    fn active_sources_are_normalized_and_deduplicated() {
        let config =
            EffectiveConfig::from_yaml("sources: {active: [ArXiv, biorxiv, arxiv]}").unwrap();
        assert_eq!(config.active_sources().unwrap(), vec!["arxiv", "biorxiv"]);
    }

    #[test]
    fn target_texts_accepts_single_string() {
        let config = EffectiveConfig::from_yaml(
            "relevance: {embedding: {target_texts: single-cell sequencing}}",
        )
        .unwrap();
        let emb = config.embedding().unwrap();
        assert_eq!(emb.target_texts, vec!["single-cell sequencing"]);
        assert_eq!(emb.batch_size, 32);
    }

    #[test]
    fn llm_settings_carry_provider() {
        let config = EffectiveConfig::from_yaml(
            "relevance: {method: llm, llm: {provider: groq, groq: {batch_size: 4}}}",
        )
        .unwrap();
        let llm = config.llm().unwrap();
        assert_eq!(llm.provider, "groq");
        assert_eq!(llm.batch_size, 4);
        assert_eq!(llm.confidence_threshold, 0.7);
    }

    #[test]
    fn invalid_section_is_config_error() {
        let config =
            EffectiveConfig::from_yaml("relevance: {llm: {provider: groq, groq: {batch_size: many}}}")
                .unwrap();
        let err = config.llm().unwrap_err();
        assert!(err.to_string().contains("relevance.llm.groq"));
    }

    #[test]
    fn redaction_masks_secrets() {
        let config = EffectiveConfig::from_yaml(
            "relevance: {llm: {groq: {api_key: sk-secret}}}\nnotifications: {email: {password: hunter2}}",
        )
        .unwrap();
        let shown = config.to_redacted_yaml().unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("***"));
    }

    // -----------------------------------------------------------------------
    // ConfigResolver
    // -----------------------------------------------------------------------

    #[test]
    fn missing_primary_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigResolver::new()
            .resolve(&dir.path().join("nope.yaml"))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn non_mapping_primary_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let list = write(dir.path(), "config.yaml", "- a\n- b\n");
        assert!(ConfigResolver::new().resolve(&list).unwrap_err().is_fatal());

        let empty = write(dir.path(), "empty.yaml", "");
        let err = ConfigResolver::new().resolve(&empty).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn fragments_override_primary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(
            dir.path(),
            "config.yaml",
            r#"
sources:
  active: [arxiv]
  arxiv:
    categories: [cs.AI]
    max_total_results: 100
"#,
        );
        write(dir.path(), "sources/arxiv.yaml", "categories: [cs.LG]\n");

        let config = ConfigResolver::new().resolve(&primary).unwrap();
        let arxiv = config.source("arxiv").unwrap();
        assert_eq!(arxiv.categories, vec!["cs.LG"]);
        // sibling key from the primary survives the partial fragment
        assert_eq!(arxiv.max_total_results, 100);
        assert_eq!(config.primary_path(), Some(primary.as_path()));
    }

    #[test]
    fn missing_active_source_fragment_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(dir.path(), "config.yaml", "sources: {active: [arxiv]}\n");
        let err = ConfigResolver::new().resolve(&primary).unwrap_err();
        assert!(err.to_string().contains("arxiv.yaml"));
    }

    #[test]
    fn disabled_features_do_not_require_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(
            dir.path(),
            "config.yaml",
            "sources: {active: [arxiv]}\nrelevance: {method: keyword}\nnotifications: {send_email_summary: false}\n",
        );
        write(dir.path(), "sources/arxiv.yaml", "categories: [cs.AI]\n");
        // no llm/, embedding.yaml or notifications.yaml on disk
        assert!(ConfigResolver::new().resolve(&primary).is_ok());
    }

    #[test]
    fn enabled_llm_requires_provider_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(
            dir.path(),
            "config.yaml",
            "sources: {active: []}\nrelevance: {method: llm, llm: {provider: groq}}\n",
        );
        let err = ConfigResolver::new().resolve(&primary).unwrap_err();
        assert!(err.to_string().contains("groq.yaml"));

        write(dir.path(), "llm/groq.yaml", "model: llama-3.1-8b-instant\nbatch_size: 5\n");
        let config = ConfigResolver::new().resolve(&primary).unwrap();
        let llm = config.llm().unwrap();
        assert_eq!(llm.model.as_deref(), Some("llama-3.1-8b-instant"));
        assert_eq!(llm.batch_size, 5);
    }

    #[test]
    fn enabled_embedding_and_email_require_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(
            dir.path(),
            "config.yaml",
            "relevance: {method: embedding}\nnotifications: {send_email_summary: true}\n",
        );
        let err = ConfigResolver::new().resolve(&primary).unwrap_err();
        assert!(err.to_string().contains("embedding.yaml"));

        write(dir.path(), "embedding.yaml", "similarity_threshold: 0.5\n");
        let err = ConfigResolver::new().resolve(&primary).unwrap_err();
        assert!(err.to_string().contains("notifications.yaml"));

        write(
            dir.path(),
            "notifications.yaml",
            "email: {smtp_server: smtp.example.com, recipients: me@example.com}\n",
        );
        let config = ConfigResolver::new().resolve(&primary).unwrap();
        assert_eq!(config.embedding().unwrap().similarity_threshold, 0.5);
        let notifications = config.notifications().unwrap();
        assert!(notifications.send_email_summary);
        assert_eq!(notifications.email.recipients, vec!["me@example.com"]);
    }

    #[test]
    fn fragments_dir_is_relative_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(
            dir.path(),
            "config.yaml",
            "fragments_dir: conf.d\nsources: {active: [medrxiv]}\n",
        );
        write(dir.path(), "conf.d/sources/medrxiv.yaml", "categories: [epidemiology]\n");

        let config = ConfigResolver::new().resolve(&primary).unwrap();
        assert_eq!(config.source("medrxiv").unwrap().categories, vec!["epidemiology"]);
    }

    #[test]
    fn environment_beats_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(
            dir.path(),
            "config.yaml",
            "relevance: {method: llm, llm: {provider: groq}}\nnotifications: {send_email_summary: true}\n",
        );
        write(dir.path(), "llm/groq.yaml", "api_key: from-file\n");
        write(dir.path(), "notifications.yaml", "email: {password: file-pass}\n");

        let config = ConfigResolver::new()
            .with_env("GROQ_API_KEY", "from-env")
            .with_env("SMTP_PASSWORD", "env-pass")
            .resolve(&primary)
            .unwrap();

        assert_eq!(config.llm().unwrap().api_key.as_deref(), Some("from-env"));
        assert_eq!(
            config.notifications().unwrap().email.password.as_deref(),
            Some("env-pass")
        );
    }

    #[test]
    fn empty_environment_value_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let primary = write(
            dir.path(),
            "config.yaml",
            "relevance: {method: llm, llm: {provider: groq}}\n",
        );
        write(dir.path(), "llm/groq.yaml", "api_key: from-file\n");

        let config = ConfigResolver::new()
            .with_env("GROQ_API_KEY", "")
            .resolve(&primary)
            .unwrap();
        assert_eq!(config.llm().unwrap().api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn init_config_writes_starter_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let written = init_config(dir.path()).unwrap();
        assert_eq!(written.len(), 2);

        let config = ConfigResolver::new()
            .resolve(&dir.path().join(DEFAULT_CONFIG_FILE))
            .unwrap();
        assert_eq!(config.active_sources().unwrap(), vec!["arxiv"]);
        assert_eq!(config.source("arxiv").unwrap().categories, vec!["cs.LG", "q-bio.BM"]);

        assert!(init_config(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn output_path_expands_home() {
        let settings = OutputSettings {
            file: "~/papers.md".into(),
            format: OutputFormat::Plain,
        };
        let path = settings.resolved_path();
        assert!(path.ends_with("papers.md"));
        if dirs::home_dir().is_some() {
            assert!(!path.starts_with("~"));
        }
    }
}
