//! KopioRapido - command-line interface.
//!
//! Thin presenter over the engine: parses verbs and flags, wires the
//! cancellation signal, and renders progress either as plain text or as one
//! JSON value per record.

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use kopiorapido::operation::{CopyOperation, OperationStatus, OperationType};
use kopiorapido::strategy::{TransferMode, TransferStrategy};
use kopiorapido::transfer::{FileTransferProgress, ProgressSink};
use kopiorapido::utils::format::{format_bytes, format_duration, format_speed};
use kopiorapido::{Config, Engine};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Exit code when the user interrupts an operation.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable high-throughput file transfers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose per-file output
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit machine-readable JSON records instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Force plain output (no colors)
    #[arg(long, global = true)]
    plain: bool,

    /// Force colored output
    #[arg(long, global = true)]
    color: bool,

    /// Override the state directory
    #[arg(long, global = true, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LVL")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a tree to the destination
    Copy(OperationArgs),
    /// Copy, then delete the sources
    Move(OperationArgs),
    /// Copy new and newer files only
    Sync(OperationArgs),
    /// Sync and delete destination-only files
    Mirror(OperationArgs),
    /// Sync in both directions
    #[command(name = "bidirectional-sync")]
    BidirectionalSync(OperationArgs),
    /// Resume a previously interrupted operation
    Resume {
        /// Operation id from `list`
        id: Uuid,
    },
    /// List resumable operations
    List,
}

#[derive(Args, Debug)]
struct OperationArgs {
    /// Source directory
    source: PathBuf,

    /// Destination directory
    destination: PathBuf,

    /// Analyse and print the plan without transferring anything
    #[arg(long)]
    analyze: bool,

    /// Force a transfer strategy instead of auto-selection
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Cap on concurrent file transfers (1-32)
    #[arg(long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Per-file buffer size in KiB
    #[arg(long, value_name = "KB")]
    buffer_size: Option<usize>,

    /// Disable on-the-wire compression
    #[arg(long)]
    no_compression: bool,

    /// Disable delta-sync against existing destination files
    #[arg(long)]
    no_delta_sync: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StrategyArg {
    Sequential,
    Conservative,
    Moderate,
    Aggressive,
}

impl StrategyArg {
    fn mode(self) -> TransferMode {
        match self {
            StrategyArg::Sequential => TransferMode::Sequential,
            StrategyArg::Conservative => TransferMode::ParallelConservative,
            StrategyArg::Moderate => TransferMode::ParallelModerate,
            StrategyArg::Aggressive => TransferMode::ParallelAggressive,
        }
    }
}

/// Output rendering for one run.
#[derive(Clone, Copy)]
struct Presenter {
    json: bool,
    verbose: bool,
    color: bool,
}

impl Presenter {
    fn record(&self, value: &impl serde::Serialize) {
        if self.json {
            if let Ok(line) = serde_json::to_string(value) {
                println!("{line}");
            }
        }
    }

    fn message(&self, level: &str, message: &str) {
        if self.json {
            println!(
                "{}",
                serde_json::json!({ "level": level, "message": message })
            );
        } else {
            println!("{message}");
        }
    }

    fn error(&self, message: &str) {
        if self.json {
            println!("{}", serde_json::json!({ "error": message }));
        } else if self.color {
            eprintln!("\x1b[31merror:\x1b[0m {message}");
        } else {
            eprintln!("error: {message}");
        }
    }

    fn banner(&self, operation: &CopyOperation) {
        if self.json {
            self.record(operation);
            return;
        }

        let status = match operation.status {
            OperationStatus::Completed if self.color => "\x1b[32mCompleted\x1b[0m".to_string(),
            OperationStatus::Failed if self.color => "\x1b[31mFailed\x1b[0m".to_string(),
            OperationStatus::Paused if self.color => "\x1b[33mPaused\x1b[0m".to_string(),
            status => format!("{status:?}"),
        };

        println!(
            "{} {}: {} files, {} in {}",
            operation.operation_type.as_str(),
            status,
            operation.files_transferred,
            format_bytes(operation.bytes_transferred),
            format_duration(operation.duration_secs().max(0) as u64)
        );
        if operation.files_skipped > 0 {
            println!("  skipped (identical): {}", operation.files_skipped);
        }
        if operation.files_deleted > 0 {
            println!("  deleted: {}", operation.files_deleted);
        }
        if operation.files_failed > 0 {
            println!("  failed: {}", operation.files_failed);
        }
        if operation.files_compressed > 0 {
            println!(
                "  compressed: {} files, {} on the wire for {}",
                operation.files_compressed,
                format_bytes(operation.total_compressed_bytes),
                format_bytes(operation.total_uncompressed_bytes)
            );
        }
        if let Some(error) = &operation.error_message {
            println!("  error: {error}");
        }
        println!("  resume id: {}", operation.id);
    }

    /// Progress sink for a run. JSON mode suppresses intermediate events;
    /// text mode drives a spinner, with per-file lines when verbose.
    fn sink(&self) -> (ProgressSink, Option<ProgressBar>) {
        if self.json {
            return (Arc::new(|_| {}), None);
        }

        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(120));

        let verbose = self.verbose;
        let sink_bar = bar.clone();
        let sink: ProgressSink = Arc::new(move |progress: FileTransferProgress| {
            if progress.is_retrying {
                sink_bar.println(format!(
                    "retry {}/{} for {}: {}",
                    progress.retry_attempt,
                    progress.max_retry_attempts,
                    progress.file_name,
                    progress.last_error.as_deref().unwrap_or("unknown error")
                ));
                return;
            }
            if progress.file_name.is_empty() {
                return;
            }
            if progress.bytes_transferred >= progress.file_size {
                if verbose {
                    sink_bar.println(format!(
                        "  {} ({}){}",
                        progress.file_name,
                        format_bytes(progress.file_size),
                        if progress.is_compressed {
                            format!(", wire ratio {:.2}", progress.compression_ratio)
                        } else {
                            String::new()
                        }
                    ));
                }
            } else {
                sink_bar.set_message(format!(
                    "{} {:.1}% at {}",
                    progress.file_name,
                    progress.percent_complete(),
                    format_speed(progress.current_speed_bytes_per_second)
                ));
            }
        });

        (sink, Some(bar))
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(state_dir) = &cli.state_dir {
        config.engine.state_dir = state_dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

fn forced_strategy(args: &OperationArgs) -> Option<TransferStrategy> {
    let mode = match (args.strategy, args.max_concurrent) {
        (Some(strategy), _) => strategy.mode(),
        (None, Some(n)) => match n {
            0 | 1 => TransferMode::Sequential,
            2..=4 => TransferMode::ParallelConservative,
            5..=8 => TransferMode::ParallelModerate,
            _ => TransferMode::ParallelAggressive,
        },
        (None, None) => return None,
    };

    let mut strategy = TransferStrategy::with_mode(mode, "forced by command line");
    if let Some(n) = args.max_concurrent {
        strategy.max_concurrent_files = n.clamp(1, 32);
    }
    Some(strategy)
}

async fn run_transfer(
    engine: &Engine,
    operation_type: OperationType,
    args: &OperationArgs,
    presenter: Presenter,
    cancel: CancellationToken,
) -> Result<u8> {
    if args.analyze {
        let (source_profile, destination_profile, file_set, strategy) = engine
            .analyse_and_select_strategy(&args.source, &args.destination)
            .await?;
        let summary = engine
            .analyse_sync(&args.source, &args.destination, operation_type)
            .await?;

        if presenter.json {
            presenter.record(&serde_json::json!({
                "source_profile": source_profile,
                "destination_profile": destination_profile,
                "file_set": file_set,
                "strategy": strategy,
            }));
            presenter.record(&summary);
        } else {
            presenter.message(
                "info",
                &format!(
                    "strategy: {:?} x{} ({})",
                    strategy.mode, strategy.max_concurrent_files, strategy.reasoning
                ),
            );
            presenter.message(
                "info",
                &format!(
                    "would copy {} files ({}), delete {}, skip {} identical",
                    summary.files_to_copy,
                    format_bytes(summary.total_bytes_to_copy),
                    summary.files_to_delete,
                    summary.identical
                ),
            );
            if summary.conflicts > 0 {
                presenter.message("warning", &format!("{} conflicts", summary.conflicts));
            }
        }
        return Ok(0);
    }

    let (sink, bar) = presenter.sink();
    let result = engine
        .start_operation(
            &args.source,
            &args.destination,
            operation_type,
            sink,
            cancel.clone(),
            forced_strategy(args),
        )
        .await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    let operation = result?;

    presenter.banner(&operation);
    Ok(exit_code_for(&operation, &cancel))
}

fn exit_code_for(operation: &CopyOperation, cancel: &CancellationToken) -> u8 {
    match operation.status {
        OperationStatus::Completed => 0,
        OperationStatus::Paused if cancel.is_cancelled() => EXIT_CANCELLED,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = load_config(&cli)?;

    // Per-operation flags fold into the engine configuration
    if let Command::Copy(args)
    | Command::Move(args)
    | Command::Sync(args)
    | Command::Mirror(args)
    | Command::BidirectionalSync(args) = &cli.command
    {
        if args.no_compression {
            config.sync.compression = false;
        }
        if args.no_delta_sync {
            config.sync.delta_sync = false;
        }
        if let Some(buffer) = args.buffer_size {
            config.sync.buffer_size_kib = Some(buffer);
        }
    }

    if cli.verbose && cli.log_level.is_none() {
        config.log.level = "debug".to_string();
    }
    kopiorapido::utils::logger::init(&config.log.level)?;

    let presenter = Presenter {
        json: cli.json,
        verbose: cli.verbose,
        color: cli.color && !cli.plain && !cli.json,
    };

    let engine = Engine::new(config)?;

    // Ctrl-C requests cooperative cancellation; state stays resumable
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match &cli.command {
        Command::Copy(args) => {
            run_transfer(&engine, OperationType::Copy, args, presenter, cancel).await
        }
        Command::Move(args) => {
            run_transfer(&engine, OperationType::Move, args, presenter, cancel).await
        }
        Command::Sync(args) => {
            run_transfer(&engine, OperationType::Sync, args, presenter, cancel).await
        }
        Command::Mirror(args) => {
            run_transfer(&engine, OperationType::Mirror, args, presenter, cancel).await
        }
        Command::BidirectionalSync(args) => {
            run_transfer(
                &engine,
                OperationType::BiDirectionalSync,
                args,
                presenter,
                cancel,
            )
            .await
        }
        Command::Resume { id } => {
            let (sink, bar) = presenter.sink();
            let result = engine.resume_operation(*id, sink, cancel.clone()).await;
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            let operation = result?;
            presenter.banner(&operation);
            Ok(exit_code_for(&operation, &cancel))
        }
        Command::List => {
            let resumable = engine.list_resumable()?;
            if presenter.json {
                presenter.record(&resumable);
            } else if resumable.is_empty() {
                presenter.message("info", "no resumable operations");
            } else {
                for op in &resumable {
                    println!(
                        "{}  {}  {} -> {}  {}/{} files",
                        op.id,
                        op.operation_type.as_str(),
                        op.source_path.display(),
                        op.destination_path.display(),
                        op.files_transferred,
                        op.total_files
                    );
                }
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;
    let color = cli.color && !cli.plain;

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            let presenter = Presenter {
                json,
                verbose: false,
                color,
            };
            presenter.error(&format!("{error:#}"));
            ExitCode::from(1)
        }
    }
}
