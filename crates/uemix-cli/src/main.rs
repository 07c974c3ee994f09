//! uemix - IQ mixer between one eNB and several UE modems

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use uemix_core::observe::{init_logging, LogLevel};
use uemix_core::{FlowGraph, IqFormat, MixerConfig};

#[derive(Parser)]
#[command(name = "uemix")]
#[command(version)]
#[command(about = "Weighted IQ mixing between one eNB and several UEs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the flow graph until interrupted
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Do not stop when Enter is pressed or stdin closes
        #[arg(long)]
        no_stdin: bool,
    },

    /// Validate the configuration and print the mix plan
    Check {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the default configuration as YAML
    ExampleConfig,
}

#[derive(clap::Args)]
struct Overrides {
    /// Configuration file (default: UEMIX_CONFIG, ./uemix.yaml, user and system config dirs)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nominal sample rate in samples/s
    #[arg(long)]
    sample_rate: Option<f64>,

    /// Slow-down divisor applied to the sample rate
    #[arg(long)]
    slow_down: Option<f64>,

    /// Per-exchange endpoint timeout
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Wire sample format (cf32, cf64, ci16)
    #[arg(long)]
    format: Option<IqFormat>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<LogLevel>,
}

impl Overrides {
    fn load(&self) -> Result<MixerConfig> {
        let mut config = match &self.config {
            Some(path) => MixerConfig::load_from(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => MixerConfig::load().context("loading configuration")?,
        };

        if let Some(rate) = self.sample_rate {
            config.graph.sample_rate = rate;
        }
        if let Some(divisor) = self.slow_down {
            config.graph.slow_down_divisor = divisor;
        }
        if let Some(ms) = self.timeout_ms {
            config.transport.timeout_ms = ms;
        }
        if let Some(format) = self.format {
            config.transport.format = format;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            overrides,
            no_stdin,
        } => run(&overrides, no_stdin),
        Commands::Check { overrides } => check(&overrides),
        Commands::ExampleConfig => {
            print!("{}", MixerConfig::example_yaml());
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn check(overrides: &Overrides) -> Result<ExitCode> {
    let config = overrides.load()?;
    config.validate().context("invalid configuration")?;
    let plan = config.topology.validate()?;

    println!("{}", plan);
    for source in &config.topology.sources {
        let endpoint = config.source_endpoint(source)?;
        println!(
            "source {} <- {} (timeout {:?}, hwm {}{})",
            source.name,
            endpoint.address,
            endpoint.timeout,
            endpoint.high_water_mark,
            if source.throttle { ", throttled" } else { "" },
        );
    }
    for sink in &config.topology.sinks {
        let endpoint = config.sink_endpoint(sink)?;
        println!("sink {} -> {} (from {})", sink.name, endpoint.address, sink.from);
    }
    println!(
        "effective rate {} samples/s",
        config.graph.sample_rate / config.graph.slow_down_divisor
    );
    Ok(ExitCode::SUCCESS)
}

fn run(overrides: &Overrides, no_stdin: bool) -> Result<ExitCode> {
    let config = overrides.load()?;
    init_logging(&config.logging);
    config.validate().context("invalid configuration")?;

    let graph = Arc::new(FlowGraph::from_config(&config).context("building flow graph")?);
    graph.start().context("starting flow graph")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(wait_for_shutdown(graph.clone(), no_stdin));
    // A pending stdin read would otherwise hold the runtime open
    runtime.shutdown_background();

    graph.stop();
    let stats = graph.stats().snapshot();
    info!(%stats, "final statistics");

    match graph.fault() {
        Some(fault) => {
            error!(error = %fault, "graph stopped on a fault");
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Resolve when a signal arrives, stdin says so, or the tick loop ends.
async fn wait_for_shutdown(graph: Arc<FlowGraph>, no_stdin: bool) {
    let ended = tokio::task::spawn_blocking(move || graph.wait());

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("interrupt received"),
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        },
        _ = terminate() => info!("terminate received"),
        _ = enter_pressed(), if !no_stdin => info!("stdin closed or Enter pressed"),
        _ = ended => info!("tick loop ended"),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

async fn enter_pressed() {
    println!("Press Enter to quit...");
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    if let Err(e) = stdin.read_line(&mut line).await {
        warn!(error = %e, "stdin unreadable, ignoring it");
        std::future::pending::<()>().await;
    }
}
