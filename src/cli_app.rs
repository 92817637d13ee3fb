//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use disk_sentinel::core::config::Config;
use disk_sentinel::core::errors::DsnError;
use disk_sentinel::core::paths::resolve_absolute_path;
use disk_sentinel::daemon::cycle::{PassReport, Sentinel, watch};
use disk_sentinel::daemon::signals::SignalHandler;
use disk_sentinel::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use disk_sentinel::monitor::hysteresis::Decision;
use disk_sentinel::monitor::sampler::UsageSampler;
use disk_sentinel::notify::message::format_bytes;
use disk_sentinel::platform::pal::{Platform, detect_platform};
use disk_sentinel::state::flags::{FileFlagStore, FlagLocation, FlagStore};

/// Disk Sentinel: disk-usage alerts with hysteresis and ghost-usage attribution.
#[derive(Debug, Parser)]
#[command(
    name = "dsn",
    author,
    version,
    about = "Disk Sentinel - disk usage alerting",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Show per-mount detail, including skipped mounts.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one alerting pass over the configured mounts.
    Run(RunArgs),
    /// Repeat alerting passes until interrupted.
    Watch(WatchArgs),
    /// Show usage and alert state per mount without notifying.
    Status(StatusArgs),
    /// Delete the alert flag for a mount.
    Clear(ClearArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct RunArgs {
    /// Check only these mounts instead of the configured list.
    #[arg(long = "mount", value_name = "PATH")]
    mounts: Vec<PathBuf>,
    /// Print notifications instead of sending them; flags are not written.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args)]
struct WatchArgs {
    /// Seconds between passes.
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    interval_secs: u64,
    /// Print notifications instead of sending them; flags are not written.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct StatusArgs {
    /// Show only these mounts.
    #[arg(long = "mount", value_name = "PATH")]
    mounts: Vec<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ClearArgs {
    /// Mount whose flag should be removed.
    mount: PathBuf,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path in use.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration and print its hash.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid configuration or user input.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<DsnError> for CliError {
    fn from(error: DsnError) -> Self {
        if error.is_config_error() {
            Self::User(error.to_string())
        } else {
            Self::Runtime(error.to_string())
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_pass(cli, args),
        Command::Watch(args) => run_watch(cli, args),
        Command::Status(args) => run_status(cli, args),
        Command::Clear(args) => run_clear(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn selected_mounts(config: &Config, overrides: &[PathBuf]) -> Vec<PathBuf> {
    if overrides.is_empty() {
        config.mount_points.clone()
    } else {
        overrides.iter().map(|path| normalize_mount(path)).collect()
    }
}

/// Same shape as configured mounts: absolute, no trailing slash, symlinks kept.
fn normalize_mount(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        resolve_absolute_path(path)
    };
    let text = absolute.to_string_lossy();
    match text.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => PathBuf::from(stripped),
        _ => absolute.clone(),
    }
}

fn platform() -> Result<Arc<dyn Platform>, CliError> {
    Ok(detect_platform()?)
}

// ──────────────────── run / watch ────────────────────

fn run_pass(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let mounts = selected_mounts(&config, &args.mounts);
    let mut sentinel = Sentinel::from_config(&config, platform()?, args.dry_run)?;

    match sentinel.run_locked(&mounts, &config.paths.lock_file, Utc::now()) {
        Some(report) => print_report(cli, &report),
        None => match output_mode(cli) {
            OutputMode::Human => {
                println!("Skipped: another dsn pass holds {}", config.paths.lock_file.display());
                Ok(())
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "run",
                "locked": true,
                "lock_file": config.paths.lock_file.to_string_lossy(),
            })),
        },
    }
}

fn run_watch(cli: &Cli, args: &WatchArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let platform = platform()?;
    let signals = SignalHandler::new();
    eprintln!(
        "[DSN-RUN] watching {} mount(s) every {}s",
        config.mount_points.len(),
        args.interval_secs
    );

    let mut print_error = None;
    watch(
        cli.config.as_deref(),
        config,
        &platform,
        Duration::from_secs(args.interval_secs),
        args.dry_run,
        &signals,
        |report| {
            if let Err(error) = print_report(cli, report) {
                print_error.get_or_insert(error);
                signals.request_shutdown();
            }
        },
    )?;
    print_error.map_or(Ok(()), Err)
}

fn print_report(cli: &Cli, report: &PassReport) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Json => {
            let mut payload = serde_json::to_value(report)?;
            payload["command"] = Value::from("run");
            write_json_line(&payload)
        }
        OutputMode::Human => {
            println!(
                "Pass at {}: {} mount(s), {} notification(s), {} skipped",
                report.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                report.mounts.len(),
                report.notifications_sent(),
                report.skipped()
            );
            for outcome in &report.mounts {
                let percent = outcome
                    .percent_used
                    .map_or_else(|| "n/a".to_string(), |p| format!("{p:.2}%"));
                let label = outcome
                    .decision
                    .map_or_else(|| "skipped".red().to_string(), decision_label);
                let mut line = format!(
                    "  {:<24}  {:>8}  {label}",
                    outcome.mount.display().to_string(),
                    percent
                );
                if let Some(error) = &outcome.delivery_error {
                    line.push_str(&format!("  (delivery failed: {error})"));
                }
                if let Some(error) = &outcome.persistence_error {
                    line.push_str(&format!("  (flag not saved: {error})"));
                }
                if outcome.flag_location == Some(FlagLocation::Fallback) {
                    line.push_str("  (flag in volatile fallback)");
                }
                println!("{line}");
                if cli.verbose
                    && let Some(reason) = &outcome.skipped
                {
                    println!("      {reason}");
                }
            }
            Ok(())
        }
    }
}

fn decision_label(decision: Decision) -> String {
    let text = decision.as_str();
    match decision {
        Decision::New | Decision::Reminder => text.red().bold().to_string(),
        Decision::Suppressed => text.yellow().to_string(),
        Decision::Resolved => text.green().bold().to_string(),
        Decision::Hold => text.green().to_string(),
        Decision::Unmeasurable => text.dimmed().to_string(),
    }
}

// ──────────────────── status / clear ────────────────────

fn run_status(cli: &Cli, args: &StatusArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let thresholds = config.thresholds()?;
    let platform = platform()?;
    let sampler = UsageSampler::new(Arc::clone(&platform));
    let flags = FileFlagStore::new(&config.paths.flag_dir, &config.paths.fallback_flag_dir);
    let mounts = selected_mounts(&config, &args.mounts);

    let mut rows = Vec::with_capacity(mounts.len());
    for mount in &mounts {
        let alert = flags.exists(mount);
        let location = flags.locate(mount);
        let row = match sampler.sample(mount) {
            Ok(sample) => {
                let stats = platform.fs_stats(mount).ok();
                json!({
                    "mount": mount.to_string_lossy(),
                    "total_bytes": sample.total_bytes,
                    "used_bytes": sample.used_bytes,
                    "visible_bytes": sample.visible_bytes,
                    "hidden_bytes": sample.hidden_bytes,
                    "percent_used": sample.percent_used,
                    "available_bytes": stats.as_ref().map(|s| s.available_bytes),
                    "fs_type": stats.as_ref().map(|s| s.fs_type.clone()),
                    "read_only": stats.as_ref().is_some_and(|s| s.is_readonly),
                    "alert": alert,
                    "flag_location": location,
                })
            }
            Err(error) => json!({
                "mount": mount.to_string_lossy(),
                "error": error.to_string(),
                "alert": alert,
                "flag_location": location,
            }),
        };
        rows.push(row);
    }

    match output_mode(cli) {
        OutputMode::Json => write_json_line(&json!({
            "command": "status",
            "high_percent": thresholds.high_percent,
            "recovery_percent": thresholds.recovery_percent(),
            "nag_interval_minutes": thresholds.nag_interval_minutes,
            "mounts": rows,
        })),
        OutputMode::Human => {
            println!("Disk Sentinel v{}", env!("CARGO_PKG_VERSION"));
            println!("  Config: {}", config.paths.config_file.display());
            println!(
                "  Alert at {}%, resolve below {:.2}%, remind every {}m",
                thresholds.high_percent,
                thresholds.recovery_percent(),
                thresholds.nag_interval_minutes
            );
            println!(
                "\n  {:<24}  {:>10}  {:>10}  {:>10}  {:>10}  {:>8}  {:<10}",
                "Mount", "Total", "Used", "Available", "Hidden", "Used %", "Alert"
            );
            println!("  {}", "-".repeat(94));
            for row in &rows {
                print_status_row(row);
            }
            Ok(())
        }
    }
}

fn print_status_row(row: &Value) {
    let mount = row["mount"].as_str().unwrap_or("?");
    let alert = row.get("alert").filter(|value| !value.is_null()).map_or_else(
        || "-".green().to_string(),
        |state| {
            let since = state["first_alerted_at"].as_str().unwrap_or("?");
            let fallback = if row["flag_location"] == "fallback" {
                " [fallback]"
            } else {
                ""
            };
            format!("{} since {since}{fallback}", "ACTIVE".red().bold())
        },
    );

    if let Some(error) = row.get("error").and_then(Value::as_str) {
        println!("  {mount:<24}  {}  {alert}", error.red());
        return;
    }
    let bytes = |key: &str| format_bytes(row[key].as_u64().unwrap_or(0));
    let percent = row["percent_used"]
        .as_f64()
        .map_or_else(|| "n/a".to_string(), |p| format!("{p:.2}%"));
    let read_only = if row["read_only"] == true {
        format!("  {}", "[read-only]".yellow())
    } else {
        String::new()
    };
    println!(
        "  {mount:<24}  {:>10}  {:>10}  {:>10}  {:>10}  {percent:>8}  {alert}{read_only}",
        bytes("total_bytes"),
        bytes("used_bytes"),
        bytes("available_bytes"),
        bytes("hidden_bytes"),
    );
}

fn run_clear(cli: &Cli, args: &ClearArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let mount = normalize_mount(&args.mount);
    let flags = FileFlagStore::new(&config.paths.flag_dir, &config.paths.fallback_flag_dir);
    let existed = flags.exists(&mount).is_some();
    flags.delete(&mount)?;

    let mut activity = JsonlWriter::open(JsonlConfig::new(
        &config.paths.activity_log,
        Some(&config.paths.activity_log_fallback),
    ));
    let mut entry = LogEntry::new(EventType::FlagCleared, Severity::Info).mount(&mount);
    entry.ok = Some(existed);
    activity.write_entry(&entry);

    match output_mode(cli) {
        OutputMode::Human => {
            if existed {
                println!("Cleared alert flag for {}", mount.display());
            } else {
                println!("No alert flag for {}", mount.display());
            }
            Ok(())
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "clear",
            "mount": mount.to_string_lossy(),
            "cleared": existed,
        })),
    }
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults and DSN_* variables apply)");
                    }
                    Ok(())
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config path",
                    "path": path.to_string_lossy(),
                    "exists": exists,
                })),
            }
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                    Ok(())
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config show",
                    "config": serde_json::to_value(&config)?,
                })),
            }
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                        Ok(())
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                    })),
                }
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "error": e.to_string(),
                    }))?,
                }
                Err(e.into())
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("DSN_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
