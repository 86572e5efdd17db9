//! # tsp-core
//!
//! A threaded transport stream packet pipeline. One input stage, any number of
//! processor stages and one output stage each run on their own thread and
//! share a single fixed-size ring of 188-byte packets.
//!
//! ## Features
//!
//! - Zero-copy handoff: stages exchange ownership of ring ranges, never packet
//!   payloads
//! - Backpressure and end-of-stream propagation along the chain
//! - Joint termination: stages vote on a common stop point
//! - Live restart of a stage with new options, suspend and abort
//! - Built-in file, null, filter, skip, until and drop plugins
//!
//! ## Example
//!
//! ```no_run
//! use tsp_core::{Pipeline, PipelineConfig, PluginOptions, PluginRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PluginRegistry::with_builtins();
//! let input = registry.input_stage("null", PluginOptions::new().with("count", "1000"))?;
//! let output = registry.output_stage("drop", PluginOptions::new())?;
//!
//! let report = Pipeline::builder(PipelineConfig::default())
//!     .input_stage(input)
//!     .output_stage(output)
//!     .run()?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! MIT OR Apache-2.0
//!
//! ## Authors
//!
//! - hua0512
//!

use thiserror::Error;

mod bitrate;
pub mod config;
pub mod context;
mod executor;
pub mod joint;
mod link;
pub mod metadata;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod progress;
pub mod ring;

#[cfg(test)]
mod test_utils;

/// Re-export key traits and types
pub use bitrate::BitRate;
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use context::StageContext;
pub use joint::JointTermination;
pub use metadata::PacketMetadata;
pub use pipeline::{AbortHandle, Pipeline, PipelineBuilder, PipelineReport, RunningPipeline};
pub use plugin::{
    Factory, InputAborter, InputPlugin, OutputPlugin, Plugin, PluginError, PluginOptions, ProcessStatus,
    ProcessorPlugin, StageDef,
};
pub use plugins::PluginRegistry;
pub use progress::{
    OnProgress, ProgressEvent, StageKind, StageReport, StageStats, TerminationReason,
};
pub use ring::{PacketRing, RangeGrant};
pub use ts::TsPacket;

/// Common error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Stage {stage} ({plugin}) failed to start: {source}")]
    StartFailed {
        stage: usize,
        plugin: &'static str,
        #[source]
        source: PluginError,
    },

    #[error("No stage at index {0}")]
    UnknownStage(usize),

    #[error("Stage {0} is not running")]
    StageNotRunning(usize),

    #[error("Stage {0} does not support restart")]
    RestartUnsupported(usize),

    #[error("Restart of stage {stage} failed: {source}")]
    RestartFailed {
        stage: usize,
        #[source]
        source: PluginError,
    },

    #[error("Failed to spawn stage thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Stage {0} panicked")]
    StagePanicked(usize),
}
