use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use neural_limiter::config::NeuralConfig;
use neural_limiter::limiter::{CallContext, ConfigWatcher, LimiterRegistry, RuleSet};
use neural_limiter::LimiterError;

#[derive(Debug, Parser)]
#[command(name = "neural-limiter", version, about = "Distributed admission control")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a rule file and print the limiters it defines
    Validate {
        /// Rule file (YAML)
        rules: PathBuf,
    },
    /// Drive synthetic calls through the configured limiters
    Soak {
        /// Settings file (YAML); defaults plus NEURAL_* overrides when absent
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Rule file, overriding `rules_path` from the settings
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Total number of calls
        #[arg(long, default_value_t = 1000)]
        calls: usize,
        /// Calls in flight at once
        #[arg(long, default_value_t = 16)]
        parallelism: usize,
        /// Upper bound of the simulated work per call
        #[arg(long, default_value_t = 10)]
        work_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Validate { rules } => validate(rules),
        Command::Soak {
            settings,
            rules,
            calls,
            parallelism,
            work_ms,
        } => soak(settings, rules, calls, parallelism.max(1), work_ms).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let rules = RuleSet::from_file(&path).with_context(|| format!("reading {}", path.display()))?;
    let configs = rules.configs()?;

    for config in &configs {
        println!(
            "{} mode={} enabled={} concurrent={} rate={} request={}/{}ms",
            config.identity(),
            config.mode,
            config.enabled,
            config.max_permit_concurrent,
            config.max_permit_rate,
            config.max_permit_request,
            config.request_interval_ms,
        );
    }
    info!(limiters = configs.len(), "Rule file is valid");
    Ok(())
}

async fn soak(
    settings: Option<PathBuf>,
    rules: Option<PathBuf>,
    calls: usize,
    parallelism: usize,
    work_ms: u64,
) -> anyhow::Result<()> {
    info!("Starting Neural Limiter soak run");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match settings {
        Some(path) => NeuralConfig::from_file(path)?,
        None => NeuralConfig::from_env()?,
    };
    let rules_path = rules
        .or_else(|| config.rules_path.clone())
        .context("no rule file given (--rules or rules_path)")?;

    let store = config.store.connect().await?;
    info!(backend = ?config.store.backend, "Store connected");

    let registry = Arc::new(LimiterRegistry::with_store(store.clone()));
    registry.load_rules(&RuleSet::from_file(&rules_path)?)?;
    let identities = registry.identities();
    if identities.is_empty() {
        anyhow::bail!("rule file {} defines no limiters", rules_path.display());
    }

    let watcher = if config.reload.enabled {
        Some(ConfigWatcher::spawn(registry.clone(), store.clone(), &config.reload.channel).await?)
    } else {
        None
    };

    let started = Instant::now();
    let run = stream::iter(0..calls)
        .map(|i| {
            let registry = registry.clone();
            let identity = identities[i % identities.len()].clone();
            async move {
                let work = Duration::from_millis(rand::thread_rng().gen_range(0..=work_ms));
                let outcome = registry
                    .original_call(Some(identity.as_str()), CallContext::new(), |_| async move {
                        tokio::time::sleep(work).await;
                        Ok::<_, LimiterError>(())
                    })
                    .await;
                match outcome {
                    Ok(()) => "admitted",
                    Err(e) if e.is_rejected() => "rejected",
                    Err(_) => "failed",
                }
            }
        })
        .buffer_unordered(parallelism)
        .fold(BTreeMap::<&'static str, u64>::new(), |mut tally, outcome| async move {
            *tally.entry(outcome).or_default() += 1;
            tally
        });

    let tally = tokio::select! {
        tally = run => Some(tally),
        _ = shutdown_signal() => None,
    };

    if let Some(watcher) = watcher {
        if let Err(e) = watcher.shutdown().await {
            warn!(error = %e, "Config watcher did not shut down cleanly");
        }
    }

    match tally {
        Some(tally) => info!(elapsed_ms = started.elapsed().as_millis() as u64, outcomes = ?tally, "Soak run finished"),
        None => warn!("Soak run interrupted"),
    }

    let statistics: BTreeMap<String, BTreeMap<String, u64>> = registry.statistics().into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&statistics)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
