//! Seqline CLI
//!
//! Runs an ordered packet pipeline from a configuration file.
//!
//! # Usage
//!
//! ```bash
//! seqline run -c config/pipeline.toml
//! seqline run -c config/pipeline.toml --input corpus.txt --duration 30
//! seqline compile-rules --rules rules.txt --output rules.json
//! seqline check -c config/pipeline.toml
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use seqline_dataplane::config::{AcceleratorConfig, InputMode};
use seqline_dataplane::{Accelerator, Orchestrator, PipelineConfig, StageRegistry, TopologyBuilder};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "seqline")]
#[command(version)]
#[command(about = "Ordered multi-core packet pipeline", long_about = None)]
struct Cli {
    /// Pipeline configuration (TOML or JSON)
    #[arg(long, short, global = true, env = "SEQLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run(RunArgs),
    /// Compile a raw rules file
    CompileRules {
        /// Raw rules, one `[id,][group,]pattern` per line
        #[arg(long, short)]
        rules: PathBuf,
        /// Compiled database to write
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Validate the configuration without running
    Check,
    /// List registered stage types
    Stages,
}

#[derive(Args)]
struct RunArgs {
    /// Cores to use, ingress core included
    #[arg(long)]
    cores: Option<usize>,

    /// Stop after this many seconds
    #[arg(long, short)]
    duration: Option<u64>,

    /// Text file input (switches to text_file mode)
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Synthetic packets to generate (0 = unbounded)
    #[arg(long, short)]
    packets: Option<u64>,

    /// Check egress contiguity
    #[arg(long)]
    verify_order: bool,

    /// Report per-packet latency from ingress to egress
    #[arg(long)]
    latency: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            cli.log_level
                .clone()
                .or_else(|| std::env::var("RUST_LOG").ok())
                .unwrap_or_else(|| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Run(args) => run(cli.config.as_deref(), args).await,
        Commands::CompileRules { rules, output } => compile_rules(rules, output),
        Commands::Check => check(cli.config.as_deref()),
        Commands::Stages => {
            for name in StageRegistry::with_builtins().names() {
                println!("{}", name);
            }
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            tracing::warn!("No config given, using defaults");
            Ok(PipelineConfig::default())
        }
    }
}

async fn run(path: Option<&Path>, args: RunArgs) -> Result<()> {
    let mut config = load_config(path)?;
    if let Some(cores) = args.cores {
        config.cores = cores;
    }
    if let Some(secs) = args.duration {
        config.duration_secs = Some(secs);
    }
    if let Some(file) = args.input {
        config.input.mode = InputMode::TextFile;
        config.input.file = Some(file);
    }
    if let Some(packets) = args.packets {
        config.input.packets = packets;
    }
    config.verify_order |= args.verify_order;
    config.latency_mode |= args.latency;

    tracing::info!("Seqline v{}", env!("CARGO_PKG_VERSION"));

    let mut orchestrator = Orchestrator::new(config).context("invalid configuration")?;
    let stop = orchestrator.stop_handle();
    let mut pipeline = tokio::task::spawn_blocking(move || orchestrator.run());

    let report = tokio::select! {
        res = &mut pipeline => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Signal received, stopping pipeline");
            stop.store(true, Ordering::Release);
            pipeline.await
        }
    }
    .context("pipeline thread failed")?
    .context("pipeline run failed")?;

    println!("{}", report);
    Ok(())
}

fn compile_rules(rules: PathBuf, output: PathBuf) -> Result<()> {
    let config = AcceleratorConfig {
        rules_file: Some(rules.clone()),
        compiled_rules_file: Some(output.clone()),
        ..Default::default()
    };
    let db = Accelerator::compile_rules(&config)
        .with_context(|| format!("failed to compile {}", rules.display()))?;
    println!("Compiled {} rules into {}", db.len(), output.display());
    Ok(())
}

fn check(path: Option<&Path>) -> Result<()> {
    let mut config = load_config(path)?;
    let warnings = config.validate().context("invalid configuration")?;

    TopologyBuilder::from_config(&config)
        .validate(&StageRegistry::with_builtins())
        .context("invalid topology")?;

    println!(
        "OK: {} layers, {} stage instances on {} cores",
        config.layers.len(),
        config.total_instances(),
        config.cores
    );
    for warning in warnings.iter() {
        println!("  warning: {}", warning);
    }
    Ok(())
}
