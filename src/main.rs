//! Botsbox main entry point
//!
//! This is the command-line interface for the Botsbox crawling engine.

use anyhow::Context;
use botsbox::config::{load_config_with_hash, Config};
use botsbox::crawler::{Fetchers, Job, FINISHED};
use botsbox::storage::{SqliteStore, Store};
use botsbox::{Hub, Rule};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Botsbox: a rule-driven web crawler
///
/// Crawl jobs are described by JSON rules: seed entries, target templates and
/// extraction pipelines. Jobs run on a recurring schedule and store what they
/// extract in SQLite.
#[derive(Parser, Debug)]
#[command(name = "botsbox")]
#[command(version)]
#[command(about = "A rule-driven web crawler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler with the jobs of a config file until interrupted
    Serve {
        /// Path to TOML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Crawl a rule once and print the extracted records as JSON lines
    Run {
        /// Path to the JSON rule
        #[arg(value_name = "RULE")]
        rule: PathBuf,

        /// Configuration for fetch settings
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,
    },

    /// Crawl a rule once, printing every step without storing anything
    Testrun {
        /// Path to the JSON rule
        #[arg(value_name = "RULE")]
        rule: PathBuf,

        /// Configuration for fetch settings
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,
    },

    /// Compile a rule and show what it would crawl
    Check {
        /// Path to the JSON rule
        #[arg(value_name = "RULE")]
        rule: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    match cli.command {
        Command::Serve { config } => handle_serve(&config).await,
        Command::Run { rule, config } => handle_run(&rule, config.as_deref()).await,
        Command::Testrun { rule, config } => handle_testrun(&rule, config.as_deref()).await,
        Command::Check { rule } => handle_check(&rule),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("botsbox=info,warn"),
            1 => EnvFilter::new("botsbox=debug,info"),
            2 => EnvFilter::new("botsbox=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Loads a config file, or the defaults when none is given
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

fn load_job(rule: &Path, config: &Config) -> anyhow::Result<Job> {
    let title = rule
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rule".to_string());
    let fetchers = Fetchers::from_config(&config.fetch)?;
    Job::from_file(0, title, rule, fetchers)
        .with_context(|| format!("Failed to load rule {}", rule.display()))
}

/// Handles `serve`: opens the hub, registers the configured jobs and runs until Ctrl-C
async fn handle_serve(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    let hub = Hub::open(&config)?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let added = hub.import_jobs(&config.jobs, base_dir)?;
    if added > 0 {
        tracing::info!("Imported {} jobs from configuration", added);
    }
    hub.load_jobs()?;

    for task in hub.all_tasks() {
        tracing::info!(
            "Task {} \"{}\" every {:?}, next run in {:?}",
            task.id,
            task.title,
            task.interval,
            task.due_in.unwrap_or_default()
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    let persisted = hub.close().await;
    tracing::info!("{} records persisted", persisted);
    Ok(())
}

/// Handles `run`: one production crawl with records printed to stdout
async fn handle_run(rule: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new_in_memory()?);
    let mut job = load_job(rule, &config)?.with_store(store);

    let (tx, mut rx) = mpsc::channel(config.sink.buffer.max(1));
    job.connect_sink(tx);

    let printer = tokio::spawn(async move {
        let mut count = 0u64;
        while let Some(pack) = rx.recv().await {
            let line = serde_json::json!({
                "name": pack.name,
                "id": pack.id,
                "url": pack.url,
                "data": pack.data,
                "file": pack.file.as_ref().map(|f| f.bytes.len()),
            });
            println!("{}", line);
            count += 1;
        }
        count
    });

    let outcome = job.run().await;
    let crawled = job.crawled_targets_count();
    drop(job);

    let records = printer.await?;
    tracing::info!(
        "Run {}: {} targets crawled, {} records",
        outcome,
        crawled,
        records
    );
    Ok(())
}

/// Handles `testrun`: prints progress lines until the run finishes or Ctrl-C
async fn handle_testrun(rule: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let job = load_job(rule, &config)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = Arc::new(AtomicBool::new(false));

    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let run = tokio::spawn(async move { job.testrun(tx, cancel).await });
    while let Some(line) = rx.recv().await {
        if line == FINISHED {
            break;
        }
        println!("{}", line);
    }

    let outcome = run.await?;
    println!("=> {}", outcome);
    Ok(())
}

/// Handles `check`: compiles a rule and prints its summary
fn handle_check(path: &Path) -> anyhow::Result<()> {
    let rule = Rule::from_file(path)
        .with_context(|| format!("Failed to compile rule {}", path.display()))?;

    println!("=== Botsbox Rule Check ===\n");

    println!("Timing:");
    match rule.timeout {
        Some(timeout) => println!("  Timeout: {:?}", timeout),
        None => println!("  Timeout: none"),
    }
    println!("  Every: {:?}", rule.interval);
    println!("  First run in: {:?}", rule.delay);
    match rule.concurrency {
        Some(limit) => println!("  Concurrency: {}", limit),
        None => println!("  Concurrency: unlimited"),
    }

    println!("\nEntries ({}):", rule.entries.len());
    for entry in &rule.entries {
        println!(
            "  - {} {} [{}] ({} targets)",
            entry.method,
            entry.url,
            entry.name,
            entry.var_bindings().len()
        );
    }

    let mut names: Vec<&String> = rule.templates.keys().collect();
    names.sort();
    println!("\nTemplates ({}):", names.len());
    for name in names {
        if let Some(template) = rule.template(name) {
            println!(
                "  - {}: priority {}, retry {}, {} dives, {} outputs",
                name,
                template.priority,
                template.retry,
                template.dive.len(),
                template.object_outputs.len() + template.list_outputs.len()
            );
        }
    }

    println!("\n✓ Rule is valid");
    Ok(())
}
