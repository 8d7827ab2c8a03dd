use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rate_admission::config::{AdmissionConfig, LoggingConfig, StoreConfig};
use rate_admission::ratelimit::{
    store_backend, AdmissionBackend, FixedWindowCounter, KeyedFixedWindow, SlidingWindowLimiter,
};

/// Request admission control demos and simulations.
#[derive(Debug, Parser)]
#[command(name = "rate-admission", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print decisions as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one of the built-in scenarios
    Demo {
        #[arg(value_enum)]
        scenario: Scenario,

        /// Redis URL for the store scenario, overriding the config
        #[arg(long)]
        redis_url: Option<String>,
    },
    /// Fire requests for one key and print each decision
    Simulate {
        /// Key the requests are charged to
        #[arg(short, long, default_value = "127.0.0.1")]
        key: String,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 20)]
        requests: usize,

        /// Pause between requests in milliseconds
        #[arg(short, long, default_value_t = 50)]
        interval_ms: u64,

        /// Algorithm to drive
        #[arg(short, long, value_enum, default_value_t = Algorithm::SlidingWindow)]
        algorithm: Algorithm,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    SlidingWindow,
    FixedWindow,
    Store,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Algorithm {
    SlidingWindow,
    FixedWindow,
    Store,
}

#[derive(Serialize)]
struct DecisionLine<'a> {
    request: usize,
    key: &'a str,
    admitted: bool,
}

struct Output {
    json: bool,
}

impl Output {
    fn decision(&self, request: usize, key: &str, admitted: bool) -> anyhow::Result<()> {
        if self.json {
            let line = DecisionLine {
                request,
                key,
                admitted,
            };
            println!("{}", serde_json::to_string(&line)?);
        } else {
            println!("#{:<4} {:<16} {}", request, key, if admitted { "admitted" } else { "denied" });
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AdmissionConfig::from_file(path)?,
        None => AdmissionConfig::default(),
    };

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting rate-admission");
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Configuration loaded");
    }

    let output = Output { json: cli.json };

    match cli.command {
        Command::Demo {
            scenario,
            redis_url,
        } => match scenario {
            Scenario::SlidingWindow => sliding_window_demo(&config, &output).await?,
            Scenario::FixedWindow => fixed_window_demo(&config).await?,
            Scenario::Store => {
                let mut store_config = config.store.clone();
                if let Some(url) = redis_url {
                    store_config.url = url;
                }
                store_demo(&store_config, &output).await?
            }
        },
        Command::Simulate {
            key,
            requests,
            interval_ms,
            algorithm,
        } => {
            let backend = build_backend(&config, algorithm).await?;
            for i in 1..=requests {
                let admitted = config.store.fail_mode.resolve(backend.allow(&key).await);
                output.decision(i, &key, admitted)?;
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_backend(
    config: &AdmissionConfig,
    algorithm: Algorithm,
) -> anyhow::Result<Arc<dyn AdmissionBackend>> {
    let backend: Arc<dyn AdmissionBackend> = match algorithm {
        Algorithm::SlidingWindow => {
            let limiter = Arc::new(SlidingWindowLimiter::new(config.sliding_window.clone())?);
            if let Some(interval_ms) = config.sliding_window.sweep_interval_ms {
                Arc::clone(&limiter).spawn_sweeper(Duration::from_millis(interval_ms));
            }
            limiter
        }
        Algorithm::FixedWindow => Arc::new(KeyedFixedWindow::new(config.fixed_window.clone())),
        Algorithm::Store => store_backend(&config.store).await,
    };
    Ok(backend)
}

/// Five requests, a slot later five more, one over budget, then a fresh window.
async fn sliding_window_demo(config: &AdmissionConfig, output: &Output) -> anyhow::Result<()> {
    let limiter = SlidingWindowLimiter::new(config.sliding_window.clone())?;
    let key = "127.0.0.1";
    let slot = config.sliding_window.slot_duration();
    let mut request = 0;

    let mut fire = |n: usize| -> anyhow::Result<()> {
        for _ in 0..n {
            request += 1;
            output.decision(request, key, limiter.allow(key))?;
        }
        Ok(())
    };

    fire(5)?;
    tokio::time::sleep(slot).await;
    fire(5)?;
    fire(1)?;
    print_slots(&limiter, key);

    info!("Waiting for the window to pass");
    tokio::time::sleep(config.sliding_window.window_duration()).await;
    fire(7)?;
    print_slots(&limiter, key);
    Ok(())
}

fn print_slots(limiter: &SlidingWindowLimiter, key: &str) {
    let slots = limiter.slots(key);
    let Some(first) = slots.first().map(|s| s.start()) else {
        return;
    };
    for slot in &slots {
        info!(
            offset_ms = slot.start().duration_since(first).as_millis() as u64,
            count = slot.count(),
            "Slot"
        );
    }
}

/// Ten callers spawned 200ms apart against one shared counter.
async fn fixed_window_demo(config: &AdmissionConfig) -> anyhow::Result<()> {
    let counter = Arc::new(FixedWindowCounter::from_config(&config.fixed_window));
    let mut handles = Vec::with_capacity(10);

    for i in 0..10 {
        let counter = Arc::clone(&counter);
        handles.push(tokio::spawn(async move {
            if counter.allow() {
                info!(caller = i, "ok");
            } else {
                info!(caller = i, "fail");
            }
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for result in futures::future::join_all(handles).await {
        result?;
    }
    Ok(())
}

/// A hundred requests against the store counter, pausing every fifth.
async fn store_demo(config: &StoreConfig, output: &Output) -> anyhow::Result<()> {
    let backend = store_backend(config).await;

    let key = "test";
    for i in 0..100 {
        let admitted = config.fail_mode.resolve(backend.allow(key).await);
        output.decision(i + 1, key, admitted)?;

        if i % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
    Ok(())
}
