mod claim;
mod config;
mod error;
mod events;
mod logging;
mod runtime;
mod warden_io;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use fs2::FileExt;
use tracing::info;

use crate::claim::intent::{IntentContext, IntentScorer};
use crate::claim::lease::{FileLeaseBackend, LeaseBackend, LeaseLock, MemoryLeaseBackend};
use crate::claim::machine::ClaimEngine;
use crate::claim::model::ClaimId;
use crate::claim::store::ClaimStore;
use crate::config::{load_config, write_default_config, Config, LockBackendKind};
use crate::events::{InboundEvent, JsonlNotifier, ManualReleaseEvent};
use crate::runtime::inbox::Inbox;
use crate::runtime::worker::Warden;

#[derive(Debug, Parser)]
#[command(name = "claimwarden")]
#[command(about = "Tracks who claimed which work item and frees the ones nobody is working on")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the claim engine from a TOML config")]
    Run(RunArgs),
    #[command(about = "Score one statement for claim intent and print the result as JSON")]
    Score(ScoreArgs),
    #[command(about = "Write a starter TOML config template")]
    Init(InitArgs),
    #[command(about = "Inspect or control a state dir")]
    Ctl(CtlArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, help = "Path to claimwarden TOML config")]
    config: PathBuf,
    #[arg(long, help = "Also log to stderr")]
    verbose: bool,
}

#[derive(Debug, Args)]
struct ScoreArgs {
    #[arg(long, help = "Statement text")]
    text: String,
    #[arg(long, help = "Statement replies to a maintainer")]
    reply_to_maintainer: bool,
    #[arg(long, help = "Actor is already assigned to the work item")]
    assigned: bool,
    #[arg(long, help = "Config to take the detection threshold from")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Output path for starter TOML config")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct CtlArgs {
    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Debug, Subcommand)]
enum CtlCommand {
    #[command(about = "Print the persisted claim store JSON")]
    Snapshot {
        #[arg(long, help = "State directory path (default ~/.claimwarden/state)")]
        state_dir: Option<PathBuf>,
    },
    #[command(about = "List dead-lettered actions awaiting manual review")]
    DeadLetters {
        #[arg(long, help = "State directory path (default ~/.claimwarden/state)")]
        state_dir: Option<PathBuf>,
    },
    #[command(about = "Queue a manual release for a running engine")]
    Release {
        #[arg(long, help = "State directory path (default ~/.claimwarden/state)")]
        state_dir: Option<PathBuf>,
        #[arg(long, help = "Claim id to release")]
        claim: String,
        #[arg(long, help = "Reason shown to the claimant")]
        reason: String,
    },
}

/// One engine per state dir. Held for the lifetime of `run`; the OS drops it if the process dies.
struct RunLock {
    _file: File,
}

impl RunLock {
    fn acquire(state_dir: &Path) -> Result<Self> {
        warden_io::ensure_dir(state_dir)?;
        let lock_path = state_dir.join("run.lock");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "could not acquire lock {} (another claimwarden run may be active)",
                lock_path.display()
            )
        })?;
        file.set_len(0)?;
        writeln!(file, "pid={}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

fn lease_backend(cfg: &Config) -> Arc<dyn LeaseBackend> {
    match cfg.lock.backend {
        LockBackendKind::Memory => Arc::new(MemoryLeaseBackend::new()),
        LockBackendKind::File => Arc::new(FileLeaseBackend::new(warden_io::leases_dir(&cfg.state_dir))),
    }
}

fn build_warden(cfg: Config) -> Result<Warden> {
    let store = ClaimStore::open(warden_io::snapshot_path(&cfg.state_dir))
        .map_err(|err| anyhow!("failed to open claim store: {err}"))?;
    let lock = LeaseLock::from_config(lease_backend(&cfg), &cfg.lock);
    let notifier = JsonlNotifier::open(warden_io::outbox_path(&cfg.state_dir))?;
    let runtime = cfg.runtime.clone();
    let engine = ClaimEngine::new(Arc::new(store), lock, Arc::new(cfg))
        .map_err(|err| anyhow!("failed to build claim engine: {err}"))?;
    Ok(Warden::new(Arc::new(engine), Arc::new(notifier), runtime))
}

async fn run_warden(cfg: Config, verbose: bool) -> Result<()> {
    warden_io::ensure_dir(&cfg.state_dir)?;
    let log_path = logging::init(&cfg.state_dir, verbose)?;
    let _lock = RunLock::acquire(&cfg.state_dir)?;

    let inbox = Inbox::new(&cfg.state_dir);
    let state_dir = cfg.state_dir.clone();
    let warden = Arc::new(build_warden(cfg)?);
    let live = warden.engine().store().claims()?.iter().filter(|c| c.is_live()).count();
    info!(
        state_dir = %state_dir.display(),
        log = %log_path.display(),
        live_claims = live,
        "claimwarden starting"
    );
    warden.run(inbox).await
}

fn score_statement(args: &ScoreArgs) -> Result<String> {
    let settings = match &args.config {
        Some(path) => load_config(path)?.defaults,
        None => Config::with_state_dir(".").defaults,
    };
    let scorer = IntentScorer::new()?;
    let context = IntentContext {
        is_reply_to_maintainer: args.reply_to_maintainer,
        actor_already_assigned: args.assigned,
    };
    let scoring = settings.scoring();
    let score = scorer.score(&args.text, &context, &scoring);
    let out = serde_json::json!({
        "category": score.category.as_str(),
        "confidence": score.confidence,
        "is_progress_signal": score.is_progress_signal,
        "threshold": scoring.threshold,
        "creates_claim": score.is_actionable(scoring.threshold),
    });
    Ok(serde_json::to_string_pretty(&out)?)
}

fn resolve_state_dir(state_dir: Option<PathBuf>) -> Result<PathBuf> {
    match state_dir {
        Some(dir) => Ok(dir),
        None => warden_io::default_state_dir(),
    }
}

fn ctl_snapshot(state_dir: &Path) -> Result<()> {
    let path = warden_io::snapshot_path(state_dir);
    let raw = warden_io::read_to_string(&path)
        .with_context(|| format!("failed to read state under {}", state_dir.display()))?;
    let state: serde_json::Value = serde_json::from_str(&raw)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn ctl_dead_letters(state_dir: &Path) -> Result<()> {
    let store = ClaimStore::open(warden_io::snapshot_path(state_dir))
        .map_err(|err| anyhow!("failed to open claim store: {err}"))?;
    let dead = store
        .dead_letters()
        .map_err(|err| anyhow!("failed to read dead letters: {err}"))?;
    println!("{}", serde_json::to_string_pretty(&dead)?);
    Ok(())
}

fn ctl_release(state_dir: &Path, claim: &str, reason: &str) -> Result<PathBuf> {
    let claim_id = ClaimId::parse(claim).ok_or_else(|| anyhow!("not a claim id: {claim}"))?;
    let event = InboundEvent::ManualRelease(ManualReleaseEvent {
        claim_id,
        reason: reason.to_string(),
    });
    Inbox::new(state_dir).submit(&event)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let cfg = load_config(&args.config)?;
            run_warden(cfg, args.verbose).await
        }
        Commands::Score(args) => {
            println!("{}", score_statement(&args)?);
            Ok(())
        }
        Commands::Init(args) => {
            write_default_config(&args.output)?;
            println!("wrote {}", args.output.display());
            Ok(())
        }
        Commands::Ctl(args) => {
            logging::init_stderr();
            match args.command {
                CtlCommand::Snapshot { state_dir } => ctl_snapshot(&resolve_state_dir(state_dir)?),
                CtlCommand::DeadLetters { state_dir } => {
                    ctl_dead_letters(&resolve_state_dir(state_dir)?)
                }
                CtlCommand::Release {
                    state_dir,
                    claim,
                    reason,
                } => {
                    let path = ctl_release(&resolve_state_dir(state_dir)?, &claim, &reason)?;
                    println!("queued {}", path.display());
                    Ok(())
                }
            }
        }
    }
}
