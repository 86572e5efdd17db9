use std::sync::Arc;

use clap::Parser;
use error::AppError;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tsp_core::{
    Pipeline, PipelineConfig, PipelineReport, PluginRegistry, ProgressEvent, RunningPipeline,
    StageKind,
};

mod chain;
mod cli;
mod error;
mod utils;

use chain::{ChainSpec, parse_chain};
use cli::CliArgs;
use utils::parse_time;

fn main() {
    match bootstrap() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            error!(error = ?e, "Application failed");
            std::process::exit(1);
        }
    }
}

/// Returns whether the pipeline ended normally.
#[tokio::main]
async fn bootstrap() -> Result<bool, AppError> {
    let args = CliArgs::parse();
    init_logging(&args)?;

    let registry = PluginRegistry::with_builtins();
    if args.list_plugins {
        list_plugins(&registry);
        return Ok(true);
    }

    let config = pipeline_config(&args)?;
    info!("{config}");

    let chain = parse_chain(&args.chain)?;
    let pipeline = build_pipeline(&registry, config, &chain)?;

    let running = pipeline.start()?;
    let report = wait_for_pipeline(running, tokio::signal::ctrl_c()).await?;

    log_report(&report);
    Ok(report.is_success())
}

/// Join the pipeline, aborting it when `interrupt` fires. If `interrupt`
/// fails the pipeline keeps running to its own end.
async fn wait_for_pipeline<F>(running: RunningPipeline, interrupt: F) -> Result<PipelineReport, AppError>
where
    F: Future<Output = std::io::Result<()>>,
{
    let abort = running.abort_handle();
    let mut join = tokio::task::spawn_blocking(move || running.join());

    tokio::select! {
        joined = &mut join => return Ok(joined??),
        signal = interrupt => match signal {
            Ok(()) => {
                warn!("Interrupted, aborting pipeline");
                abort.abort();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, running without it"),
        },
    }
    Ok(join.await??)
}

/// Logs go to stderr so that stdout stays free for the packet stream.
fn init_logging(args: &CliArgs) -> Result<(), AppError> {
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(args.log_file.is_none());

    let result = match &args.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            let multi_writer = MakeWriterExt::and(std::io::stderr, Arc::new(log_file));
            tracing::subscriber::set_global_default(builder.with_writer(multi_writer).finish())
        }
        None => tracing::subscriber::set_global_default(
            builder.with_writer(std::io::stderr).finish(),
        ),
    };
    result.map_err(|e| AppError::Initialization(e.to_string()))
}

fn pipeline_config(args: &CliArgs) -> Result<PipelineConfig, AppError> {
    let mut builder = PipelineConfig::builder();
    if let Some(buffer_packets) = args.buffer_packets {
        builder = builder.buffer_packets(buffer_packets);
    }
    if let Some(timeout) = &args.timeout {
        builder = builder.stage_timeout_s(parse_time(timeout)?);
    }
    if let Some(max_input_packets) = args.max_input_packets {
        builder = builder.max_input_packets(max_input_packets);
    }
    if let Some(max_flushed_packets) = args.max_flushed_packets {
        builder = builder.max_flushed_packets(max_flushed_packets);
    }
    if let Some(max_output_packets) = args.max_output_packets {
        builder = builder.max_output_packets(max_output_packets);
    }
    Ok(builder.build())
}

fn build_pipeline(
    registry: &PluginRegistry,
    config: PipelineConfig,
    chain: &ChainSpec,
) -> Result<Pipeline, AppError> {
    let mut builder = Pipeline::builder(config)
        .name("tsp")
        .on_progress(Arc::new(log_progress))
        .input_stage(registry.input_stage(&chain.input.name, chain.input.options.clone())?);
    for stage in &chain.processors {
        builder = builder.processor_stage(registry.processor_stage(&stage.name, stage.options.clone())?);
    }
    let pipeline = builder
        .output_stage(registry.output_stage(&chain.output.name, chain.output.options.clone())?)
        .build()?;
    Ok(pipeline)
}

fn log_progress(event: ProgressEvent) {
    match event {
        ProgressEvent::StageStarted { index, kind, name } => {
            debug!(stage = index, %kind, plugin = name, "stage started");
        }
        ProgressEvent::StageRestarted { index, name } => {
            info!(stage = index, plugin = name, "stage restarted");
        }
        ProgressEvent::JointTerminationFrozen { limit } => {
            info!(limit, "joint termination limit set");
        }
        ProgressEvent::BitRateChanged { bitrate } => {
            debug!(%bitrate, "input bitrate changed");
        }
        ProgressEvent::StageTerminated(report) => {
            debug!("{report}");
        }
    }
}

fn log_report(report: &PipelineReport) {
    if report.is_success() {
        info!("{report}");
    } else {
        error!("{report}");
    }
}

fn list_plugins(registry: &PluginRegistry) {
    for kind in [StageKind::Input, StageKind::Processor, StageKind::Output] {
        println!("{kind} plugins:");
        for name in registry.names(kind) {
            println!("  {name}");
        }
    }
}
