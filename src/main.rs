use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use xferq::adapters::Location;
use xferq::config::AppConfig;
use xferq::context::AppContext;
use xferq::core::endpoint::join_path;
use xferq::core::{
    ChannelSink, ConflictAction, ConflictDecision, ConflictPolicy, ConflictRequest, FileEntry,
    FileOutcome, JobHandle, JobSnapshot, TransferEvent,
};
use xferq::logging::{self, LogConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "xferq")]
#[command(about = "Queued multi-file transfers with resume and retry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./xferq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON logs, and JSON lines for progress output
    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy files or directory trees into a destination directory
    Copy(CopyArgs),
    /// Print the effective configuration
    Config(OptionArgs),
}

#[derive(Args)]
struct CopyArgs {
    #[arg(required = true)]
    sources: Vec<String>,

    destination: String,

    #[command(flatten)]
    options: OptionArgs,
}

#[derive(Args, Serialize, Default)]
struct OptionArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    conflict_policy: Option<ConflictPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    preserve_permissions: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    preserve_time: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    trans_blksize: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    stop_on_error: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    sync_files: Option<bool>,
}

#[derive(Serialize, Default)]
struct LogOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
}

/// Everything given on the command line, shaped like `AppConfig`.
#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    options: &'a OptionArgs,
    log: LogOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let options = match &cli.command {
        Commands::Copy(args) => &args.options,
        Commands::Config(args) => args,
    };
    let overrides = Overrides {
        options,
        log: LogOverrides {
            json: cli.json.then_some(true),
            verbose: cli.verbose.then_some(true),
        },
    };
    let config = AppConfig::load(cli.config.as_deref(), Some(&overrides))?;

    match &cli.command {
        Commands::Config(_) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Copy(args) => {
            logging::init(LogConfig::from(&config.log));
            run_copy(config, args, cli.json)
                .await
                .context("Transfer did not complete")
        }
    }
}

async fn run_copy(config: AppConfig, args: &CopyArgs, json: bool) -> Result<()> {
    let (sink, events, conflicts) = ChannelSink::new();
    let ctx = AppContext::new(config, Arc::new(sink));

    tokio::spawn(answer_conflicts(conflicts));
    tokio::spawn(report_events(events));

    let sources = args.sources.clone();
    let destination = args.destination.clone();
    let enqueue_ctx = ctx.clone();
    let jobs = tokio::task::spawn_blocking(move || enqueue_all(&enqueue_ctx, &sources, &destination))
        .await
        .context("Enqueue task failed")??;

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, canceling transfers");
                ctx.orchestrator.cancel_all();
            }
        }

        ctx.orchestrator.schedule();
        for job in &jobs {
            print_snapshot(&job.snapshot(), json)?;
        }
        if jobs.iter().all(JobHandle::is_done) {
            break;
        }
    }

    let failed: u64 = jobs.iter().map(JobHandle::failed_count).sum();
    ctx.orchestrator.acknowledge_finished();
    ctx.orchestrator.shutdown();

    if failed > 0 {
        bail!("{} file(s) could not be transferred", failed);
    }
    info!("All transfers complete");
    Ok(())
}

/// One enqueue per source. Sources sharing endpoints merge into one job.
fn enqueue_all(ctx: &AppContext, sources: &[String], destination: &str) -> Result<Vec<JobHandle>> {
    let target = Location::parse(destination);
    let mut jobs: Vec<JobHandle> = Vec::new();
    let mut seen = HashSet::new();

    for source in sources {
        let location = Location::parse(source);
        let mut endpoint = ctx.endpoint_for(&location)?;
        endpoint
            .connect()
            .with_context(|| format!("Cannot connect to {}", endpoint.id()))?;
        let meta = endpoint
            .stat(&location.path)?
            .with_context(|| format!("{} does not exist", source))?;
        let name = Path::new(&location.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(meta.name.clone());
        let entry = FileEntry::from_meta(&meta, join_path(&target.path, &name));

        let job = ctx
            .orchestrator
            .enqueue(vec![entry], endpoint, ctx.endpoint_for(&target)?)
            .with_context(|| format!("Cannot queue {}", source))?;
        if seen.insert(job.id()) {
            jobs.push(job);
        }
    }
    Ok(jobs)
}

fn print_snapshot(snapshot: &JobSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }

    let rate = if snapshot.stalled {
        "stalled".to_string()
    } else {
        format!("{}/s", human_bytes(snapshot.rate_bps as u64))
    };
    let eta = snapshot
        .eta_secs
        .map(|s| format!("{}s", s))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {:?} {:>3}% {}/{} files {} of {} {} eta {}{}",
        snapshot.id,
        snapshot.state,
        snapshot.percentage(),
        snapshot.current_file_number,
        snapshot.totals.total_files + snapshot.totals.total_dirs,
        human_bytes(snapshot.bytes_done),
        human_bytes(snapshot.totals.total_bytes),
        rate,
        eta,
        snapshot
            .current_file
            .as_deref()
            .map(|f| format!(" [{}]", f))
            .unwrap_or_default(),
    );
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Ask on the terminal for each conflict the engine raises.
async fn answer_conflicts(mut requests: UnboundedReceiver<ConflictRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(request) = requests.recv().await {
        let query = &request.query;
        eprint!(
            "{} exists ({} of {} bytes). [o]verwrite{} [s]kip, capital for all, enter for {:?}: ",
            query.file.dest_path,
            query.dest_size,
            query.file.size,
            if query.can_resume { " [r]esume" } else { "" },
            query.suggested,
        );
        let _ = std::io::stderr().flush();

        let answer = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => String::new(),
        };
        let decision = parse_answer(answer.trim(), query.suggested);
        request.answer(decision);
    }
}

fn parse_answer(answer: &str, suggested: ConflictAction) -> ConflictDecision {
    let apply_to_all = answer.chars().next().is_some_and(char::is_uppercase);
    let action = match answer.to_ascii_lowercase().as_str() {
        "o" => ConflictAction::Overwrite,
        "r" => ConflictAction::Resume,
        "s" => ConflictAction::Skip,
        _ => suggested,
    };
    ConflictDecision {
        action,
        apply_to_all,
    }
}

async fn report_events(mut events: UnboundedReceiver<TransferEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::FileFinished {
                path,
                outcome: FileOutcome::Failed(reason),
                ..
            } => eprintln!("failed: {}: {}", path, reason),
            TransferEvent::JobFinished(summary) => info!(
                job_id = %summary.id,
                state = ?summary.state,
                files_done = summary.files_done,
                files_failed = summary.files_failed,
                "Job finished"
            ),
            _ => {}
        }
    }
}
