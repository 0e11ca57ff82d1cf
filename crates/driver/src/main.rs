use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use jetstream_core::engine::WarmupConfig;
use jetstream_core::{Engine, JetStreamEngine, ReferenceEngine};
use tracing::info;

use jetstream_driver::config::{DriverConfig, Overrides};
use jetstream_driver::logging::{self, LogFormat};
use jetstream_driver::scheduler::{synthetic_requests, SlotScheduler};
use jetstream_driver::shutdown::stop_flag;

#[derive(Parser)]
#[command(name = "jetstream-driver", about = "Drive a jetstream executor through the slot lifecycle")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a synthetic workload on the reference executor
    Run {
        /// TOML file with [engine] and [driver] tables
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of synthetic requests
        #[arg(long)]
        num_requests: Option<usize>,

        /// Tokens generated per request, counting the prefill token
        #[arg(long)]
        max_new_tokens: Option<usize>,

        /// Prompt length of every request
        #[arg(long)]
        prompt_len: Option<usize>,

        /// Slots in the decode state
        #[arg(long)]
        max_concurrent_decodes: Option<usize>,

        /// Samples decoded per slot
        #[arg(long)]
        samples_per_slot: Option<usize>,

        /// Split long prompts into prefill chunks
        #[arg(long)]
        chunked_prefill: bool,

        /// Skip warm-up
        #[arg(long)]
        no_warmup: bool,

        /// Seed for parameters, prompts and sampling
        #[arg(long)]
        seed: Option<u64>,

        /// Write the run report as JSON to this file instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,

        /// Log level when RUST_LOG is unset
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Write a default config file
    InitConfig {
        /// Destination path
        #[arg(long, default_value = "jetstream-driver.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            num_requests,
            max_new_tokens,
            prompt_len,
            max_concurrent_decodes,
            samples_per_slot,
            chunked_prefill,
            no_warmup,
            seed,
            report,
            log_level,
        } => {
            logging::init(&log_level, LogFormat::from_env())?;

            let mut cfg = match &config {
                Some(path) => {
                    let cfg = DriverConfig::load_from(path)?;
                    info!(path = %path.display(), "loaded config");
                    cfg
                }
                None => DriverConfig::default(),
            };
            cfg.merge(&Overrides {
                num_requests,
                max_new_tokens,
                prompt_len,
                no_warmup,
                max_concurrent_decodes,
                samples_per_slot,
                chunked_prefill,
                seed,
            });
            cfg.validate()?;
            run(cfg, report).await
        }
        Command::InitConfig { output } => {
            DriverConfig::default().save_to(&output)?;
            eprintln!("Wrote default config to {}", output.display());
            Ok(())
        }
    }
}

async fn run(cfg: DriverConfig, report_path: Option<PathBuf>) -> anyhow::Result<()> {
    let seed = cfg.engine.seed;
    let vocab_size = cfg.engine.vocab_size;
    let engine = Arc::new(JetStreamEngine::new(ReferenceEngine::new(cfg.engine)?));
    let params = Arc::new(engine.load_params()?);
    info!(
        slots = engine.max_concurrent_decodes(),
        samples_per_slot = engine.samples_per_slot(),
        max_prefill_length = engine.max_prefill_length(),
        "engine ready"
    );

    if cfg.driver.warmup {
        let stats = engine.warmup(&params, &WarmupConfig::default());
        if !stats.is_success() {
            anyhow::bail!("warm-up failed: {}", stats.errors.join("; "));
        }
    }

    let scheduler = SlotScheduler::new(Arc::clone(&engine), params, cfg.driver.pad_id).with_seed(seed);
    let requests = synthetic_requests(&cfg.driver, vocab_size, seed);
    let stop = stop_flag();
    let report = scheduler.run(requests, &stop).await?;

    let json = serde_json::to_string_pretty(&report)?;
    match report_path {
        Some(path) => {
            std::fs::write(&path, json)?;
            info!(path = %path.display(), "wrote run report");
        }
        None => println!("{json}"),
    }
    Ok(())
}
