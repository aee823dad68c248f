//! CoreLoop - Main Entry Point
//!
//! `coreloop compile` turns a graph definition into an artifact;
//! `coreloop run` starts the dispatcher over the configured cores and pushes
//! synthetic traffic through it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coreloop_common::{CoreLoopConfig, WeightDType, METRICS};
use coreloop_dispatcher::artifact::ArtifactBuffer;
use coreloop_dispatcher::{
    compile, CompileOptions, CpuLoader, DataParallel, Dispatcher, DispatcherOptions, ModelGraph,
    Tensor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "coreloop")]
#[command(about = "Data-parallel inference across CPU cores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a graph definition into an artifact
    Compile {
        /// Graph definition (YAML or JSON)
        graph: PathBuf,
        /// Output artifact path
        output: PathBuf,
        /// Store weights in half precision
        #[arg(long)]
        f16: bool,
        /// Rows in the synthetic example input used for tracing
        #[arg(long, default_value_t = 4)]
        example_batch: usize,
    },
    /// Start the dispatcher and run synthetic requests through it
    Run {
        /// Configuration file (falls back to $CORELOOP_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of input rows to push through the dispatcher
        #[arg(long, default_value_t = 256)]
        requests: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            graph,
            output,
            f16,
            example_batch,
        } => {
            init_tracing("info", false);
            run_compile(&graph, &output, f16, example_batch)
        }
        Commands::Run { config, requests } => {
            let config_path = config
                .or_else(|| std::env::var_os("CORELOOP_CONFIG").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("configs/coreloop.yaml"));
            let config = CoreLoopConfig::load(&config_path)
                .with_context(|| format!("loading config {}", config_path.display()))?;
            init_tracing(
                &config.observability.log_level,
                config.observability.structured_logging,
            );
            run_dispatcher(config, requests).await
        }
    }
}

fn init_tracing(level: &str, structured: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("coreloop={level},coreloop_dispatcher={level}").into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if structured {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn run_compile(graph_path: &Path, output: &Path, f16: bool, example_batch: usize) -> Result<()> {
    let weight_dtype = if f16 { WeightDType::F16 } else { WeightDType::F32 };
    compile_graph(graph_path, output, weight_dtype, example_batch)?;
    Ok(())
}

fn compile_graph(
    graph_path: &Path,
    output: &Path,
    weight_dtype: WeightDType,
    example_batch: usize,
) -> Result<()> {
    if example_batch == 0 {
        bail!("--example-batch must be at least 1");
    }

    let graph = ModelGraph::from_file(graph_path)
        .with_context(|| format!("reading graph {}", graph_path.display()))?;
    let example = synthetic_input(example_batch, graph.input_width)?;

    let summary = compile(&graph, &[example], &CompileOptions { weight_dtype }, output)
        .with_context(|| format!("compiling {}", graph_path.display()))?;

    info!(
        artifact_id = %summary.artifact_id,
        path = %summary.path.display(),
        size_bytes = summary.size_bytes,
        input_width = summary.input_width,
        output_width = summary.output_width,
        layers = summary.num_layers,
        "Artifact written"
    );
    Ok(())
}

async fn run_dispatcher(config: CoreLoopConfig, requests: usize) -> Result<()> {
    info!("Starting CoreLoop");

    if !config.model.artifact_path.exists() {
        let graph_path = config.model.graph_path.as_deref().with_context(|| {
            format!(
                "artifact {} does not exist and no model.graph_path is configured",
                config.model.artifact_path.display()
            )
        })?;
        info!(graph = %graph_path.display(), "Artifact missing, compiling from graph");
        compile_graph(
            graph_path,
            &config.model.artifact_path,
            config.model.weight_dtype,
            config.model.batch_size,
        )?;
    }

    let options = DispatcherOptions::from_config(&config)?;
    let input_width = ArtifactBuffer::open(&options.artifact_path)
        .context("reading artifact header")?
        .header()
        .input_width;

    let dispatcher = Arc::new(Dispatcher::start(Arc::new(CpuLoader), options)?);
    info!(cores = ?dispatcher.active_cores(), "Dispatcher ready");

    let input = synthetic_input(requests, input_width)?;
    let batch_size = config.model.batch_size;

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let output = DataParallel::new().run(&dispatcher, &input, batch_size);
            (output, start.elapsed())
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal, draining in-flight requests");
        }
        joined = runner => {
            let (output, elapsed) = joined.context("data-parallel task panicked")?;
            let output = output?;

            let rows_per_sec = requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            let mean_latency = output
                .batches
                .iter()
                .map(|b| b.timings.total().as_secs_f64())
                .sum::<f64>()
                / output.batches.len().max(1) as f64;
            info!(
                rows = requests,
                batches = output.batches.len(),
                elapsed = ?elapsed,
                rows_per_sec = %format!("{:.1}", rows_per_sec),
                mean_batch_latency_ms = %format!("{:.3}", mean_latency * 1000.0),
                "Run complete"
            );
        }
    }

    dispatcher.stop();
    info!("CoreLoop stopped");

    if config.observability.enable_metrics {
        println!("{}", METRICS.gather());
    }

    Ok(())
}

/// Deterministic `[rows, width]` input in [-0.5, 0.5)
fn synthetic_input(rows: usize, width: usize) -> Result<Tensor> {
    let data = (0..rows * width)
        .map(|i| ((i * 31 + 7) % 97) as f32 / 97.0 - 0.5)
        .collect();
    Ok(Tensor::new(data, vec![rows, width])?)
}
