use anyhow::{Context, Result};
use clap::Parser;
use live_index::background::LoopEvent;
use live_index::config::Config;
use live_index::index::{FileSearchResult, IndexFacade, MemoryIndexEngine};
use live_index::telemetry;
use live_index::utils::format_bytes;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn, Level};

/// Live Index - keeps a full-text index in sync with watched files
#[derive(Parser, Debug)]
#[command(name = "live_index")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Additional paths to watch (can be repeated, adds to config file paths)
    #[arg(short, long = "watch", value_name = "PATH")]
    watch_paths: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print search results as JSON
    #[arg(long)]
    json: bool,

    /// Generate a template configuration file and exit
    #[arg(long, value_name = "FILE")]
    init: Option<PathBuf>,
}

#[derive(Serialize)]
struct Stats {
    documents: u64,
    terms: usize,
    postings: u64,
    mirrored_entries: usize,
    delayed: usize,
    adding: usize,
    removing: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_logging(log_level);

    // Handle --init flag: generate template config and exit
    if let Some(init_path) = args.init {
        let path = if init_path.as_os_str().is_empty() {
            PathBuf::from("live_index.toml")
        } else {
            init_path
        };

        if path.exists() {
            eprintln!("Error: Config file already exists: {}", path.display());
            eprintln!("Remove it first or choose a different path.");
            std::process::exit(1);
        }

        Config::write_template(&path)?;
        println!("✓ Generated config file: {}", path.display());
        println!("\nEdit the file to add the paths to watch, then start with:");
        println!("  live_index --config {}", path.display());
        return Ok(());
    }

    let config = load_config(&args)?;
    config.validate()?;

    let targets = config.watch.targets()?;
    info!(
        targets = targets.len(),
        scheduling = ?config.indexer.scheduling,
        max_file_length = %format_bytes(config.indexer.max_file_length),
        "Configuration loaded"
    );
    if targets.is_empty() {
        warn!("No paths configured to watch; use --watch PATH or a config file");
    }
    if args.verbose {
        info!(targets = ?targets, "Watch targets");
        info!(exclude_patterns = ?config.watch.exclude_patterns, "Exclude patterns");
    }

    let facade = IndexFacade::new(
        Arc::new(MemoryIndexEngine::new()),
        config.mirror.options(),
        config.indexer.options(),
        config.watch.filter()?,
    )?;
    for target in targets {
        facade.watch(target);
    }

    let mut mirror_loop = facade.mirror().subscribe_loop();
    let mut index_loop = facade.subscribe_loop();
    facade.run()?;
    info!("Ready for queries (:tree, :stats, :quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&facade, line.trim(), args.json)? {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to read from stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            message = next_failure(&mut mirror_loop) => {
                error!(%message, "Mirror stopped");
                break;
            }
            message = next_failure(&mut index_loop) => {
                error!(%message, "Indexer stopped");
                break;
            }
        }
    }

    facade.dispose().context("Background worker failed")?;
    info!("Shut down");
    Ok(())
}

/// Execute one line of input. Returns `false` when the user asked to quit.
fn handle_line(facade: &IndexFacade, line: &str, json: bool) -> Result<bool> {
    match line {
        "" => {}
        ":quit" | ":q" => return Ok(false),
        ":tree" => print!("{}", facade.mirror().render()),
        ":stats" => {
            let engine = facade.engine().stats();
            let pending = facade.pending();
            let stats = Stats {
                documents: engine.documents,
                terms: engine.terms,
                postings: engine.postings,
                mirrored_entries: facade.mirror().tree().len(),
                delayed: pending.delayed,
                adding: pending.adding,
                removing: pending.removing,
            };
            if json {
                println!("{}", serde_json::to_string(&stats)?);
            } else {
                println!(
                    "documents: {}, terms: {}, postings: {}, entries: {}, pending: {} delayed / {} adding / {} removing",
                    stats.documents,
                    stats.terms,
                    stats.postings,
                    stats.mirrored_entries,
                    stats.delayed,
                    stats.adding,
                    stats.removing
                );
            }
        }
        query => print_result(&facade.search_text(query), json)?,
    }
    Ok(true)
}

fn print_result(result: &FileSearchResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    for error in &result.syntax_errors {
        println!("syntax error: {}", error);
    }
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for path in &result.file_names {
        println!("{}", path.display());
    }
    if result.syntax_errors.is_empty() {
        println!("({} files)", result.file_names.len());
    }
    Ok(())
}

/// Wait for a loop failure. Never completes if the loop shuts down cleanly.
async fn next_failure(events: &mut broadcast::Receiver<LoopEvent>) -> String {
    loop {
        match events.recv().await {
            Ok(LoopEvent::Failed(message)) => return message,
            Ok(LoopEvent::Idle(_)) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let base_config = if let Some(ref config_path) = args.config {
        // Explicit config file specified
        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found: {}\nUse --init {} to generate a template.",
                config_path.display(),
                config_path.display()
            );
        }
        info!(path = %config_path.display(), "Loading config from file");
        Config::from_file(config_path)?
    } else {
        // Try default locations
        match Config::from_default_locations()? {
            Some((config, path)) => {
                info!(path = %path.display(), "Loading config from default location");
                config
            }
            None => {
                info!("No config file found, using defaults");
                Config::default()
            }
        }
    };

    // Apply CLI overrides
    Ok(base_config.with_overrides(args.watch_paths.clone()))
}
