use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, Duration, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use pruneguard::config::{Settings, default_config_path, default_config_yaml, load_settings};
use pruneguard::daemon::{self, DaemonError, StartOutcome, StopOutcome};
use pruneguard::graph::dependency_chain;
use pruneguard::ingest::{IngestError, LogProcessor};
use pruneguard::inventory::{BrewCli, InventoryFile, PackageManager, PackageManagerError};
use pruneguard::logging::init_tracing;
use pruneguard::score::{ConfidenceScore, RECENT_DEPENDENT_WINDOW_DAYS, ScoreError, Scorer, Tier};
use pruneguard::shim::{SHIM_NAME, refresh_links};
use pruneguard::store::{SqliteStore, UsageStore};
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<rusqlite::Error> for CliError {
    fn from(value: rusqlite::Error) -> Self {
        Self::new("sqlite_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

impl From<IngestError> for CliError {
    fn from(value: IngestError) -> Self {
        Self::new("ingest_error", value.to_string())
    }
}

impl From<PackageManagerError> for CliError {
    fn from(value: PackageManagerError) -> Self {
        Self::new("package_manager_error", value.to_string())
    }
}

impl From<ScoreError> for CliError {
    fn from(value: ScoreError) -> Self {
        let code = match value {
            ScoreError::UnknownPackage(_) => "unknown_package",
            ScoreError::Store(_) => "sqlite_error",
        };
        Self::new(code, value.to_string())
    }
}

impl From<DaemonError> for CliError {
    fn from(value: DaemonError) -> Self {
        let code = match value {
            DaemonError::AlreadyRunning(_) => "daemon_running",
            DaemonError::ExitedEarly { .. } | DaemonError::StartTimeout { .. } => {
                "daemon_start_failed"
            }
            DaemonError::StopTimeout { .. } | DaemonError::Signal { .. } => "daemon_stop_failed",
            _ => "daemon_error",
        };
        Self::new(code, value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "pruneguard")]
#[command(about = "Tracks which installed packages are actually used and scores their removal")]
struct Cli {
    /// Alternate config file (default: ~/.pruneguard/config.yml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Scan(ScanArgs),
    Ingest,
    Watch(WatchArgs),
    Score(PackageArgs),
    Unused(UnusedArgs),
    Stats(StatsArgs),
    Deps(PackageArgs),
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Read the inventory from a JSON snapshot instead of `brew`.
    #[arg(long)]
    from: Option<PathBuf>,
    #[arg(long)]
    no_shims: bool,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["daemon", "stop", "status", "foreground"])
))]
struct WatchArgs {
    #[arg(long)]
    daemon: bool,
    #[arg(long)]
    stop: bool,
    #[arg(long)]
    status: bool,
    #[arg(long)]
    foreground: bool,
}

#[derive(Args, Debug)]
struct PackageArgs {
    package: String,
}

#[derive(Args, Debug)]
struct UnusedArgs {
    #[arg(long, default_value = "safe")]
    tier: Tier,
}

#[derive(Args, Debug)]
struct StatsArgs {
    package: Option<String>,
}

#[derive(Args, Debug)]
struct RemoveArgs {
    package: String,
    /// Allow removing a package in the risky tier.
    #[arg(long)]
    force: bool,
    /// Run every safety check but do not uninstall.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let foreground = matches!(&cli.command, Command::Watch(args) if args.foreground);
    init_tracing(if foreground { "info" } else { "warn" });

    let home = home_dir()?;
    let settings = settings_for(&home, cli.config.as_deref())?;
    match cli.command {
        Command::Init => cmd_init(&home, cli.config.as_deref(), &settings),
        Command::Scan(args) => cmd_scan(&settings, args),
        Command::Ingest => cmd_ingest(&settings),
        Command::Watch(args) => cmd_watch(&settings, cli.config.as_deref(), args),
        Command::Score(args) => cmd_score(&settings, &args.package),
        Command::Unused(args) => cmd_unused(&settings, args.tier),
        Command::Stats(args) => cmd_stats(&settings, args.package.as_deref()),
        Command::Deps(args) => cmd_deps(&settings, &args.package),
        Command::Remove(args) => cmd_remove(&settings, args),
    }
}

fn cmd_init(home: &Path, config: Option<&Path>, settings: &Settings) -> Result<(), CliError> {
    fs::create_dir_all(&settings.root).map_err(|err| CliError::io("mkdir_error", err))?;
    fs::create_dir_all(&settings.shim_dir).map_err(|err| CliError::io("mkdir_error", err))?;
    let _ = open_store(settings)?;

    let config_path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_config_path(home));
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
        }
        fs::write(&config_path, default_config_yaml())
            .map_err(|err| CliError::io("write_error", err))?;
    }

    print_json(&json!({
        "status": "ok",
        "root": settings.root,
        "database": settings.database,
        "config": config_path,
        "shim_dir": settings.shim_dir,
        "usage_log": settings.usage_log,
    }))
}

fn cmd_scan(settings: &Settings, args: ScanArgs) -> Result<(), CliError> {
    require_initialized(settings)?;
    let manager: Box<dyn PackageManager> = match &args.from {
        Some(path) => Box::new(InventoryFile::load(path)?),
        None => Box::new(BrewCli::detect(&settings.prefixes)?),
    };
    let packages = manager.list_installed()?;
    let edges = manager.dependency_edges()?;

    let store = open_store(settings)?;
    let summary = store.replace_inventory(&packages, &edges)?;
    info!(
        packages = summary.upserted,
        removed = summary.removed,
        edges = summary.edges,
        "inventory replaced"
    );

    let shims = if args.no_shims {
        Value::Null
    } else {
        let names: BTreeSet<String> = packages
            .iter()
            .flat_map(|package| package.binaries.iter())
            .filter_map(|binary| {
                Path::new(binary)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(ToOwned::to_owned)
            })
            .collect();
        let target = shim_executable()?;
        let links = refresh_links(&settings.shim_dir, &target, &names)
            .map_err(|err| CliError::io("shim_error", err))?;
        json!({
            "dir": settings.shim_dir,
            "target": target,
            "created": links.created,
            "kept": links.kept,
            "removed": links.removed,
            "skipped": links.skipped,
        })
    };

    print_json(&json!({
        "status": "ok",
        "packages": summary.upserted,
        "removed": summary.removed,
        "edges": summary.edges,
        "skipped_edges": summary.skipped_edges,
        "shims": shims,
    }))
}

fn cmd_ingest(settings: &Settings) -> Result<(), CliError> {
    require_initialized(settings)?;
    if let Some(pid) = daemon::status(settings)?.pid {
        return Err(CliError::new(
            "daemon_running",
            format!("the watch daemon (pid {pid}) owns ingestion; stop it first"),
        ));
    }
    let store = open_store(settings)?;
    let report = LogProcessor::from_settings(settings).process(&store)?;
    print_json(&serde_json::to_value(&report)?)
}

fn cmd_watch(settings: &Settings, config: Option<&Path>, args: WatchArgs) -> Result<(), CliError> {
    if args.status {
        return print_json(&serde_json::to_value(daemon::status(settings)?)?);
    }
    if args.stop {
        return match daemon::stop(settings)? {
            StopOutcome::Stopped(pid) => print_json(&json!({ "status": "stopped", "pid": pid })),
            StopOutcome::NotRunning => print_json(&json!({ "status": "not_running" })),
        };
    }

    require_initialized(settings)?;
    if args.foreground {
        let ticks = daemon::run_foreground(settings)?;
        return print_json(&json!({ "status": "stopped", "ticks": ticks }));
    }

    let exe = std::env::current_exe().map_err(|err| CliError::io("exe_error", err))?;
    let mut child_args = vec![OsString::from("watch"), OsString::from("--foreground")];
    if let Some(config) = config {
        child_args.push(OsString::from("--config"));
        child_args.push(config.as_os_str().to_os_string());
    }
    match daemon::start(settings, &exe, &child_args)? {
        StartOutcome::Started(pid) => print_json(&json!({
            "status": "started",
            "pid": pid,
            "log": settings.daemon_log,
        })),
        StartOutcome::AlreadyRunning(pid) => {
            print_json(&json!({ "status": "already_running", "pid": pid }))
        }
    }
}

fn cmd_score(settings: &Settings, package: &str) -> Result<(), CliError> {
    require_initialized(settings)?;
    let store = open_store(settings)?;
    let score = Scorer::new(&store, Utc::now()).score(package)?;
    print_json(&serde_json::to_value(&score)?)
}

fn cmd_unused(settings: &Settings, tier: Tier) -> Result<(), CliError> {
    require_initialized(settings)?;
    let store = open_store(settings)?;
    let scores = Scorer::new(&store, Utc::now()).by_tier(tier)?;
    let reclaimable: u64 = scores.iter().map(|score| score.size_bytes).sum();
    print_json(&json!({
        "tier": tier,
        "count": scores.len(),
        "reclaimable_bytes": reclaimable,
        "packages": scores,
    }))
}

fn cmd_stats(settings: &Settings, package: Option<&str>) -> Result<(), CliError> {
    require_initialized(settings)?;
    let store = open_store(settings)?;
    let now = Utc::now();
    match package {
        Some(name) => {
            let package = store
                .get_package(name)?
                .ok_or_else(|| unknown_package(name))?;
            print_json(&package_stats(&store, &package.name, now)?)
        }
        None => {
            let scores = Scorer::new(&store, now).score_all()?;
            let mut packages = Vec::with_capacity(scores.len());
            for score in &scores {
                packages.push(package_stats(&store, &score.package, now)?);
            }
            let processor = LogProcessor::from_settings(settings);
            let log_bytes = fs::metadata(processor.usage_log())
                .map(|meta| meta.len())
                .unwrap_or(0);
            print_json(&json!({
                "packages": packages.len(),
                "tiers": tier_counts(&scores),
                "usage_log": processor.usage_log(),
                "usage_log_bytes": log_bytes,
                "checkpoint": processor.checkpoint().load(),
                "daemon": daemon::status(settings)?,
                "usage": packages,
            }))
        }
    }
}

fn package_stats(store: &SqliteStore, name: &str, now: DateTime<Utc>) -> Result<Value, CliError> {
    let window_start = now - Duration::days(RECENT_DEPENDENT_WINDOW_DAYS);
    Ok(json!({
        "package": name,
        "last_used": store.get_last_usage(name)?,
        "uses_30d": store.get_usage_event_count_since(name, window_start)?,
        "uses_total": store.get_usage_event_count_since(name, DateTime::<Utc>::default())?,
        "probes": store.probe_count(name)?,
    }))
}

fn tier_counts(scores: &[ConfidenceScore]) -> Value {
    let count = |tier: Tier| scores.iter().filter(|score| score.tier == tier).count();
    json!({
        "safe": count(Tier::Safe),
        "medium": count(Tier::Medium),
        "risky": count(Tier::Risky),
    })
}

fn cmd_deps(settings: &Settings, package: &str) -> Result<(), CliError> {
    require_initialized(settings)?;
    let store = open_store(settings)?;
    if store.get_package(package)?.is_none() {
        return Err(unknown_package(package));
    }
    print_json(&serde_json::to_value(dependency_chain(&store, package)?)?)
}

fn cmd_remove(settings: &Settings, args: RemoveArgs) -> Result<(), CliError> {
    require_initialized(settings)?;
    let store = open_store(settings)?;
    let score = Scorer::new(&store, Utc::now()).score(&args.package)?;

    if score.critical {
        return Err(CliError::new(
            "critical_package",
            format!("`{}` is a core dependency and is never removed", score.package),
        ));
    }
    if !score.dependents.is_empty() {
        return Err(CliError::new(
            "has_dependents",
            format!(
                "`{}` is required by: {}",
                score.package,
                score.dependents.join(", ")
            ),
        ));
    }
    if score.tier == Tier::Risky && !args.force {
        return Err(CliError::new(
            "risky_package",
            format!(
                "`{}` scores {} (risky); pass --force to remove it anyway",
                score.package, score.total
            ),
        ));
    }

    if args.dry_run {
        return print_json(&json!({
            "status": "would_remove",
            "package": score.package,
            "total": score.total,
            "tier": score.tier,
            "size_bytes": score.size_bytes,
        }));
    }

    BrewCli::detect(&settings.prefixes)?.uninstall(&score.package)?;
    store.remove_package(&score.package)?;
    info!(package = %score.package, total = score.total, "package removed");
    print_json(&json!({
        "status": "removed",
        "package": score.package,
        "total": score.total,
        "tier": score.tier,
        "freed_bytes": score.size_bytes,
    }))
}

fn settings_for(home: &Path, config: Option<&Path>) -> Result<Settings, CliError> {
    let mut settings =
        load_settings(home, config).map_err(|err| CliError::new("config_error", err.to_string()))?;
    settings.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(settings)
}

fn require_initialized(settings: &Settings) -> Result<(), CliError> {
    if !settings.root.exists() || !settings.database.exists() {
        return Err(CliError::new(
            "not_initialized",
            "pruneguard is not initialized; run `pruneguard init`",
        ));
    }
    Ok(())
}

fn open_store(settings: &Settings) -> Result<SqliteStore, CliError> {
    if let Some(parent) = settings.database.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    Ok(SqliteStore::open(&path_string(&settings.database))?)
}

/// The interceptor ships next to this binary.
fn shim_executable() -> Result<PathBuf, CliError> {
    let exe = std::env::current_exe().map_err(|err| CliError::io("exe_error", err))?;
    let shim = exe.with_file_name(SHIM_NAME);
    if !shim.is_file() {
        return Err(CliError::new(
            "shim_missing",
            format!("{} not found next to {}", SHIM_NAME, exe.display()),
        ));
    }
    Ok(shim)
}

fn unknown_package(name: &str) -> CliError {
    CliError::new("unknown_package", format!("package `{name}` is not installed"))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
