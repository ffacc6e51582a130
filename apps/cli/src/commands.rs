//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use papermonitor_core::{
    DailySchedule, Orchestrator, ProgressReporter, RunPhase, RunReport,
};
use papermonitor_shared::{
    ConfigResolver, DEFAULT_CONFIG_FILE, SourceStats, init_config,
};
use tracing::{error, info};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// papermonitor: watch preprint catalogs for papers you care about.
#[derive(Parser)]
#[command(
    name = "papermonitor",
    version,
    about = "Fetch recent arXiv/bioRxiv/medRxiv papers and keep the relevant ones.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Primary configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "PAPERMONITOR_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the monitor once and exit.
    Run,

    /// Run now, then once a day at `schedule.run_time` until interrupted.
    Watch,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a starter config and arXiv fragment.
    Init {
        /// Directory to write into (defaults to the current directory).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show the effective configuration with secrets masked.
    Show,
    /// Validate the configuration without fetching anything.
    Check,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "papermonitor=info",
        1 => "papermonitor=debug",
        _ => "papermonitor=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run => cmd_run(&cli.config).await,
        Command::Watch => cmd_watch(&cli.config).await,
        Command::Config { action } => match action {
            ConfigAction::Init { dir } => cmd_config_init(dir),
            ConfigAction::Show => cmd_config_show(&cli.config),
            ConfigAction::Check => cmd_config_check(&cli.config),
        },
    }
}

async fn cmd_run(config: &Path) -> Result<()> {
    let mut orchestrator = Orchestrator::new(config);
    let reporter = CliProgress::new();
    let report = match orchestrator.run_once(&reporter).await {
        Ok(report) => report,
        Err(e) => {
            reporter.abandon();
            return Err(e.into());
        }
    };
    print_report(&report);
    Ok(())
}

async fn cmd_watch(config: &Path) -> Result<()> {
    let effective = ConfigResolver::from_process_env().resolve(config)?;
    let schedule = DailySchedule::from_settings(&effective.schedule()?)?;
    let mut orchestrator = Orchestrator::new(config);

    info!(config = %config.display(), "watch mode started; press Ctrl-C to stop");

    loop {
        let reporter = CliProgress::new();
        match orchestrator.run_once(&reporter).await {
            Ok(report) => print_report(&report),
            Err(e) => {
                reporter.abandon();
                error!(error = %e, "run aborted");
            }
        }

        let next = schedule.next_run_after(chrono::Utc::now());
        info!(next_run = %next.with_timezone(&chrono::Local), "waiting for next run");

        tokio::select! {
            _ = tokio::time::sleep(schedule.until_next()) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping watch mode");
                return Ok(());
            }
        }
    }
}

fn cmd_config_init(dir: Option<PathBuf>) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()
            .map_err(|e| eyre!("cannot determine working directory: {e}"))?,
    };
    let written = init_config(&dir)?;
    if written.is_empty() {
        println!("Config already present in {}; nothing written.", dir.display());
    }
    for path in written {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

fn cmd_config_show(config: &Path) -> Result<()> {
    let effective = ConfigResolver::from_process_env().resolve(config)?;
    print!("{}", effective.to_redacted_yaml()?);
    Ok(())
}

fn cmd_config_check(config: &Path) -> Result<()> {
    let effective = Orchestrator::new(config).check()?;
    DailySchedule::from_settings(&effective.schedule()?)?;
    println!(
        "Configuration OK: sources [{}], relevance method `{}`",
        effective.active_sources()?.join(", "),
        effective.relevance()?.method
    );
    Ok(())
}

fn print_report(report: &RunReport) {
    let stats = &report.stats;
    println!();
    println!("  Run complete.");
    println!("  Run ID:    {}", stats.run_id);
    println!("  Method:    {}", stats.method);
    for source in &stats.sources {
        match &source.error {
            Some(error) => println!("  {:<10} failed: {error}", format!("{}:", source.name)),
            None => println!(
                "  {:<10} {} papers ({} day window)",
                format!("{}:", source.name),
                source.fetched,
                source.window.days
            ),
        }
    }
    println!("  Fetched:   {}", stats.total_fetched);
    println!("  Relevant:  {}", stats.total_relevant);
    if stats.degraded_assessments > 0 {
        println!("  Unassessed: {}", stats.degraded_assessments);
    }
    if let Some(path) = &stats.output_path {
        println!("  Output:    {}", path.display());
    }
    if let Some(elapsed) = stats.elapsed() {
        println!("  Time:      {:.1}s", elapsed.as_secs_f64());
    }
    for problem in &report.delivery_errors {
        println!("  Warning:   {problem}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn abandon(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, phase: RunPhase) {
        let message = match phase {
            RunPhase::Fetching => "Fetching papers",
            RunPhase::Assessing => "Assessing relevance",
            RunPhase::Reporting => "Writing results",
            RunPhase::Idle => return,
        };
        self.spinner.set_message(message);
    }

    fn source_fetched(&self, stats: &SourceStats) {
        let line = match &stats.error {
            Some(error) => format!("{}: failed ({error})", stats.name),
            None => format!("{}: {} papers", stats.name, stats.fetched),
        };
        self.spinner.println(line);
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
