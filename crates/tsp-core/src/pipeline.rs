//! # Pipeline Controller
//!
//! This module assembles a chain of stages, starts their plugins, spawns one
//! thread per stage and supervises the run.
//!
//! ## Usage
//!
//! Create a [`PipelineBuilder`] with [`Pipeline::builder`], add one input, any
//! number of processors and one output, then either [`run`](PipelineBuilder::run)
//! to completion or [`start`](PipelineBuilder::start) to get a
//! [`RunningPipeline`] that accepts restart, suspend and abort requests while
//! packets flow.
//!

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::{PipelineContext, RestartRequest, StageControl};
use crate::executor::{InputRole, OutputRole, ProcessorRole, StageCore, run_stage};
use crate::link::StageLink;
use crate::plugin::{InputPlugin, OutputPlugin, PluginError, PluginOptions, ProcessorPlugin};
use crate::progress::{
    OnProgress, ProgressEvent, StageKind, StageReport, StageStats, TerminationReason,
};
use crate::{BitRate, PacketRing, PipelineConfig, PipelineError, StageContext, StageDef};

/// A fully described chain, ready to start.
pub struct Pipeline {
    config: PipelineConfig,
    name: String,
    stages: Vec<PendingStage>,
    on_progress: Option<OnProgress>,
}

enum PendingStage {
    Input(StageDef<dyn InputPlugin>),
    Processor(StageDef<dyn ProcessorPlugin>),
    Output(StageDef<dyn OutputPlugin>),
}

impl PendingStage {
    fn kind(&self) -> StageKind {
        match self {
            PendingStage::Input(_) => StageKind::Input,
            PendingStage::Processor(_) => StageKind::Processor,
            PendingStage::Output(_) => StageKind::Output,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PendingStage::Input(def) => def.name(),
            PendingStage::Processor(def) => def.name(),
            PendingStage::Output(def) => def.name(),
        }
    }

    fn is_restartable(&self) -> bool {
        match self {
            PendingStage::Input(def) => def.is_restartable(),
            PendingStage::Processor(def) => def.is_restartable(),
            PendingStage::Output(def) => def.is_restartable(),
        }
    }

    fn start(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        match self {
            PendingStage::Input(def) => def.start(ctx),
            PendingStage::Processor(def) => def.start(ctx),
            PendingStage::Output(def) => def.start(ctx),
        }
    }

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        match self {
            PendingStage::Input(def) => def.stop(ctx),
            PendingStage::Processor(def) => def.stop(ctx),
            PendingStage::Output(def) => def.stop(ctx),
        }
    }

    fn spawn(self, core: StageCore, thread_name: String) -> std::io::Result<JoinHandle<StageReport>> {
        let builder = thread::Builder::new().name(thread_name);
        match self {
            PendingStage::Input(def) => builder.spawn(move || run_stage(core, InputRole::new(def))),
            PendingStage::Processor(def) => {
                builder.spawn(move || run_stage(core, ProcessorRole::new(def)))
            }
            PendingStage::Output(def) => {
                builder.spawn(move || run_stage(core, OutputRole::new(def)))
            }
        }
    }
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Start every plugin in chain order, then spawn the stage threads.
    ///
    /// If a plugin fails to start, the plugins already started are stopped
    /// in reverse order and no thread is spawned.
    pub fn start(self) -> Result<RunningPipeline, PipelineError> {
        self.config.validate()?;
        let Pipeline {
            config,
            name,
            mut stages,
            on_progress,
        } = self;

        let stage_count = stages.len();
        info!(pipeline = %name, stages = stage_count, %config, "starting pipeline");

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..stage_count).map(|_| unbounded()).unzip();
        let context = Arc::new(PipelineContext::new(name, senders.clone(), on_progress));
        let ring = Arc::new(PacketRing::new(config.buffer_packets));

        let controls: Vec<Arc<StageControl>> = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                Arc::new(StageControl::new(
                    index,
                    stage.kind(),
                    stage.name(),
                    stage.is_restartable(),
                ))
            })
            .collect();
        let contexts: Vec<StageContext> = controls
            .iter()
            .map(|control| StageContext::new(context.clone(), control.clone()))
            .collect();

        for index in 0..stage_count {
            if let Err(source) = stages[index].start(&contexts[index]) {
                let plugin = stages[index].name();
                error!(stage = index, plugin, error = %source, "plugin failed to start");
                for started in (0..index).rev() {
                    if let Err(e) = stages[started].stop(&contexts[started]) {
                        warn!(stage = started, plugin = stages[started].name(), error = %e, "plugin stop failed");
                    }
                }
                return Err(PipelineError::StartFailed {
                    stage: index,
                    plugin,
                    source,
                });
            }
            debug!(stage = index, plugin = stages[index].name(), "plugin started");
        }

        if let Some(PendingStage::Input(input)) = stages.first() {
            context.set_bitrate(input.plugin.bitrate());
            context.set_input_aborter(input.plugin.input_aborter());
        }
        if let Some(limit) = context.joint.arm() {
            context.emit(ProgressEvent::JointTerminationFrozen { limit });
        }

        let capacity = ring.capacity();
        let mut handles = Vec::with_capacity(stage_count);
        let chain = stages.into_iter().zip(contexts).zip(receivers).enumerate();
        for (index, ((stage, ctx), inbound)) in chain {
            let kind = stage.kind();
            let plugin = stage.name();
            let link = StageLink::new(
                capacity,
                if index == 0 { capacity } else { 0 },
                inbound,
                senders[(index + 1) % stage_count].clone(),
                index.checked_sub(1).map(|up| senders[up].clone()),
                kind != StageKind::Output,
                config.stage_timeout,
            );
            let core = StageCore::new(link, ring.clone(), ctx, config.clone());

            match stage.spawn(core, format!("tsp-{index}-{plugin}")) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(stage = index, plugin, error = %e, "failed to spawn stage thread");
                    context.raise_abort();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PipelineError::Spawn(e));
                }
            }
            context.emit(ProgressEvent::StageStarted {
                index,
                kind,
                name: plugin,
            });
        }

        Ok(RunningPipeline {
            context,
            controls,
            handles,
            restart_lock: Mutex::new(()),
        })
    }

    /// Start the pipeline and wait for it to terminate.
    pub fn run(self) -> Result<PipelineReport, PipelineError> {
        self.start()?.join()
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    name: String,
    input: Option<StageDef<dyn InputPlugin>>,
    processors: Vec<StageDef<dyn ProcessorPlugin>>,
    output: Option<StageDef<dyn OutputPlugin>>,
    on_progress: Option<OnProgress>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            name: "tsp".to_string(),
            input: None,
            processors: Vec::new(),
            output: None,
            on_progress: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn input<P: InputPlugin + 'static>(self, plugin: P) -> Self {
        let plugin: Box<dyn InputPlugin> = Box::new(plugin);
        self.input_stage(StageDef::new(plugin))
    }

    pub fn input_stage(mut self, stage: StageDef<dyn InputPlugin>) -> Self {
        self.input = Some(stage);
        self
    }

    pub fn processor<P: ProcessorPlugin + 'static>(self, plugin: P) -> Self {
        let plugin: Box<dyn ProcessorPlugin> = Box::new(plugin);
        self.processor_stage(StageDef::new(plugin))
    }

    pub fn processor_stage(mut self, stage: StageDef<dyn ProcessorPlugin>) -> Self {
        self.processors.push(stage);
        self
    }

    pub fn output<P: OutputPlugin + 'static>(self, plugin: P) -> Self {
        let plugin: Box<dyn OutputPlugin> = Box::new(plugin);
        self.output_stage(StageDef::new(plugin))
    }

    pub fn output_stage(mut self, stage: StageDef<dyn OutputPlugin>) -> Self {
        self.output = Some(stage);
        self
    }

    pub fn on_progress(mut self, on_progress: OnProgress) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let input = self
            .input
            .ok_or_else(|| PipelineError::InvalidConfig("pipeline has no input stage".into()))?;
        let output = self
            .output
            .ok_or_else(|| PipelineError::InvalidConfig("pipeline has no output stage".into()))?;

        let mut stages = Vec::with_capacity(self.processors.len() + 2);
        stages.push(PendingStage::Input(input));
        stages.extend(self.processors.into_iter().map(PendingStage::Processor));
        stages.push(PendingStage::Output(output));

        Ok(Pipeline {
            config: self.config,
            name: self.name,
            stages,
            on_progress: self.on_progress,
        })
    }

    pub fn start(self) -> Result<RunningPipeline, PipelineError> {
        self.build()?.start()
    }

    pub fn run(self) -> Result<PipelineReport, PipelineError> {
        self.build()?.run()
    }
}

/// Aborts a running pipeline from any thread.
#[derive(Clone)]
pub struct AbortHandle {
    context: Arc<PipelineContext>,
}

impl AbortHandle {
    pub fn abort(&self) {
        info!(pipeline = %self.context.name, "abort requested");
        self.context.interrupt();
    }

    pub fn is_aborting(&self) -> bool {
        self.context.is_aborting()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("pipeline", &self.context.name)
            .finish()
    }
}

/// Handle on a pipeline whose stage threads are running.
pub struct RunningPipeline {
    context: Arc<PipelineContext>,
    controls: Vec<Arc<StageControl>>,
    handles: Vec<JoinHandle<StageReport>>,
    restart_lock: Mutex<()>,
}

impl RunningPipeline {
    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn stage_count(&self) -> usize {
        self.controls.len()
    }

    pub fn abort(&self) {
        self.abort_handle().abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            context: self.context.clone(),
        }
    }

    pub fn bitrate(&self) -> BitRate {
        self.context.bitrate()
    }

    pub fn joint_limit(&self) -> Option<u64> {
        self.context.joint.limit()
    }

    /// Live counters of every stage, in chain order.
    pub fn stage_stats(&self) -> Vec<StageStats> {
        self.controls.iter().map(|control| control.stats()).collect()
    }

    /// Whether every stage thread exited.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_finished())
    }

    fn control(&self, stage: usize) -> Result<&StageControl, PipelineError> {
        self.controls
            .get(stage)
            .map(Arc::as_ref)
            .ok_or(PipelineError::UnknownStage(stage))
    }

    /// Suspend a stage. Its packets keep flowing but bypass the plugin: an
    /// input emits drop markers, a processor passes packets unchanged, an
    /// output discards them.
    pub fn suspend(&self, stage: usize) -> Result<(), PipelineError> {
        let control = self.control(stage)?;
        control.set_suspended(true);
        info!(stage, plugin = control.name(), "stage suspended");
        Ok(())
    }

    pub fn resume(&self, stage: usize) -> Result<(), PipelineError> {
        let control = self.control(stage)?;
        control.set_suspended(false);
        info!(stage, plugin = control.name(), "stage resumed");
        Ok(())
    }

    /// Replace the plugin of `stage` with a new instance built from `options`.
    ///
    /// Blocks until the stage applied the request at the top of its loop.
    /// Concurrent restarts are serialized. A failed restart aborts the
    /// pipeline.
    pub fn restart(&self, stage: usize, options: PluginOptions) -> Result<(), PipelineError> {
        let control = self.control(stage)?;
        if !control.restartable {
            return Err(PipelineError::RestartUnsupported(stage));
        }

        let _serialized = self.restart_lock.lock();
        info!(stage, plugin = control.name(), %options, "restarting stage");
        let (reply, response) = crossbeam_channel::bounded(1);
        control
            .request_restart(RestartRequest { options, reply })
            .map_err(|_| PipelineError::StageNotRunning(stage))?;
        self.context.wake(stage);

        match response.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(PipelineError::RestartFailed { stage, source }),
            Err(_) => Err(PipelineError::StageNotRunning(stage)),
        }
    }

    /// Wait for every stage thread and build the final report.
    pub fn join(self) -> Result<PipelineReport, PipelineError> {
        let mut stages = Vec::with_capacity(self.handles.len());
        let mut panicked = None;
        for (index, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(report) => stages.push(report),
                Err(_) => {
                    error!(stage = index, "stage thread panicked");
                    panicked.get_or_insert(index);
                }
            }
        }
        if let Some(index) = panicked {
            return Err(PipelineError::StagePanicked(index));
        }

        let termination = self.context.termination();
        let report = PipelineReport {
            name: self.context.name.clone(),
            stages,
            bitrate: self.context.bitrate(),
            reason: termination.map_or(TerminationReason::EndOfStream, |t| t.reason),
            initiator: termination.and_then(|t| t.stage),
            joint_limit: self.context.joint.limit(),
        };
        info!(
            pipeline = %report.name,
            reason = %report.reason,
            initiator = ?report.initiator,
            output_packets = report.output().map_or(0, |s| s.stats.plugin_packets),
            "pipeline terminated"
        );
        Ok(report)
    }
}

/// Final report of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub name: String,
    /// One report per stage, in chain order
    pub stages: Vec<StageReport>,
    pub bitrate: BitRate,
    pub reason: TerminationReason,
    /// Stage that initiated the termination, `None` for an external abort
    pub initiator: Option<usize>,
    pub joint_limit: Option<u64>,
}

impl PipelineReport {
    /// Normal end of stream or joint termination.
    pub fn is_success(&self) -> bool {
        self.reason.is_clean()
    }

    pub fn input(&self) -> Option<&StageReport> {
        self.stages.first()
    }

    pub fn output(&self) -> Option<&StageReport> {
        self.stages.last()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline {}: {}", self.name, self.reason)?;
        if let Some(stage) = self.initiator {
            write!(f, " (initiated by stage {stage})")?;
        }
        if let Some(limit) = self.joint_limit {
            write!(f, ", joint termination at {limit} packets")?;
        }
        write!(f, ", bitrate {}", self.bitrate)?;
        for stage in &self.stages {
            write!(f, "\n  {stage}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::plugins::{FileOutput, FilterPlugin, SkipPlugin, UntilPlugin};
    use crate::test_utils::{
        CollectingOutput, MemoryInput, TEST_PID, init_test_tracing, make_packet_on,
    };
    use crate::{Plugin, PluginRegistry};

    fn config(buffer_packets: usize) -> PipelineConfig {
        PipelineConfig::builder()
            .buffer_packets(buffer_packets)
            .build()
    }

    #[test]
    fn test_small_ring_delivers_every_packet() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();

        let report = Pipeline::builder(config(4))
            .input(MemoryInput::new(10).bitrate(BitRate::new(1_000_000)))
            .output(output)
            .run()
            .unwrap();

        assert_eq!(report.reason, TerminationReason::EndOfStream);
        assert!(report.is_success());
        assert_eq!(sink.sequences(), (0..10).collect::<Vec<_>>());
        let output = report.output().unwrap();
        assert_eq!(output.stats.plugin_packets, 10);
        assert_eq!(output.reason, TerminationReason::EndOfStream);
        assert_eq!(report.input().unwrap().stats.total_packets(), 10);
        assert_eq!(report.bitrate, BitRate::new(1_000_000));
        assert_eq!(sink.last_bitrate(), Some(BitRate::new(1_000_000)));
    }

    #[test]
    fn test_dropped_packets_split_sends() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();

        let report = Pipeline::builder(config(8))
            .input(MemoryInput::with_dropped(5, &[1, 3]))
            .output(output)
            .run()
            .unwrap();

        assert_eq!(sink.batches(), vec![1, 1, 1]);
        assert_eq!(sink.sequences(), vec![0, 2, 4]);
        let output = &report.output().unwrap().stats;
        assert_eq!(output.plugin_packets, 3);
        assert_eq!(output.passthrough_packets, 2);
    }

    #[test]
    fn test_max_output_packets_splits_sends() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();
        let config = PipelineConfig::builder()
            .buffer_packets(16)
            .max_input_packets(16)
            .max_output_packets(4)
            .build();

        Pipeline::builder(config)
            .input(MemoryInput::new(10))
            .output(output)
            .run()
            .unwrap();

        assert!(sink.batches().iter().all(|&n| n <= 4));
        assert_eq!(sink.sequences(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_send_failure_aborts_pipeline() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();
        let config = PipelineConfig::builder()
            .buffer_packets(32)
            .max_input_packets(8)
            .build();

        let report = Pipeline::builder(config)
            .input(MemoryInput::new(10_000))
            .output(output.fail_on_call(2))
            .run()
            .unwrap();

        assert_eq!(report.reason, TerminationReason::PluginFailure);
        assert_eq!(report.initiator, Some(1));
        assert!(!report.is_success());
        assert_eq!(sink.batches().len(), 1);

        let input = report.input().unwrap();
        assert_eq!(input.reason, TerminationReason::NeighborAborted);
        assert!(input.stats.total_packets() < 10_000);
        assert_eq!(
            report.output().unwrap().stats.plugin_packets,
            sink.packets().len() as u64
        );
    }

    #[test]
    fn test_joint_termination_uses_lowest_vote() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();

        let report = Pipeline::builder(config(64))
            .input(MemoryInput::new(1_000))
            .processor(UntilPlugin::new(120, true))
            .processor(UntilPlugin::new(100, true))
            .output(output)
            .run()
            .unwrap();

        assert_eq!(report.joint_limit, Some(100));
        assert_eq!(report.reason, TerminationReason::JointTermination);
        assert!(report.is_success());
        assert_eq!(sink.sequences(), (0..100).collect::<Vec<_>>());
        assert_eq!(report.output().unwrap().stats.total_packets(), 100);
    }

    #[test]
    fn test_joint_limit_counts_dropped_packets() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();

        let report = Pipeline::builder(config(64))
            .input(MemoryInput::with_dropped(20, &[2, 5]))
            .processor(UntilPlugin::new(10, true))
            .output(output)
            .run()
            .unwrap();

        assert_eq!(report.joint_limit, Some(10));
        assert_eq!(sink.sequences(), vec![0, 1, 3, 4, 6, 7, 8, 9]);
        let output = &report.output().unwrap().stats;
        assert_eq!(output.plugin_packets, 8);
        assert_eq!(output.passthrough_packets, 2);
    }

    #[test]
    fn test_processor_end_stops_pipeline() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();

        let report = Pipeline::builder(config(16))
            .input(MemoryInput::new(500))
            .processor(SkipPlugin::new(5))
            .processor(UntilPlugin::new(50, false))
            .output(output)
            .run()
            .unwrap();

        assert_eq!(report.reason, TerminationReason::EndOfStream);
        assert_eq!(report.initiator, Some(2));
        assert_eq!(sink.sequences(), (5..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_filter_preserves_order_across_wraps() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();
        let packets = (0..1_000)
            .map(|seq| make_packet_on(if seq % 3 == 0 { 0x200 } else { TEST_PID }, seq))
            .collect();
        let config = PipelineConfig::builder()
            .buffer_packets(16)
            .max_input_packets(5)
            .max_flushed_packets(7)
            .max_output_packets(3)
            .build();

        let report = Pipeline::builder(config)
            .input(MemoryInput::from_packets(packets))
            .processor(FilterPlugin::new([0x200], false))
            .output(output)
            .run()
            .unwrap();

        let expected: Vec<u32> = (0..1_000).filter(|seq| seq % 3 == 0).collect();
        assert_eq!(sink.sequences(), expected);
        assert!(sink.packets().iter().all(|p| p.pid() == 0x200));
        let filter = &report.stages[1].stats;
        assert_eq!(filter.plugin_packets, 1_000);
        let output = &report.output().unwrap().stats;
        assert_eq!(output.plugin_packets, expected.len() as u64);
        assert_eq!(output.total_packets(), 1_000);
    }

    #[test]
    fn test_restart_replaces_plugin() {
        init_test_tracing!();
        let registry = PluginRegistry::with_builtins();
        let (output, sink) = CollectingOutput::new();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);

        let running = Pipeline::builder(config(64))
            .input(MemoryInput::new(100).gate(gate_rx))
            .processor_stage(
                registry
                    .processor_stage("filter", PluginOptions::new().with("pid", "0x200"))
                    .unwrap(),
            )
            .output(output)
            .start()
            .unwrap();

        // Nothing flows until the gate opens, so the new filter sees every packet.
        running
            .restart(1, PluginOptions::new().with("pid", "0x100"))
            .unwrap();
        assert!(matches!(
            running.restart(0, PluginOptions::new()),
            Err(PipelineError::RestartUnsupported(0))
        ));
        assert!(matches!(
            running.restart(7, PluginOptions::new()),
            Err(PipelineError::UnknownStage(7))
        ));
        gate_tx.send(()).unwrap();

        let report = running.join().unwrap();
        assert_eq!(report.reason, TerminationReason::EndOfStream);
        assert_eq!(sink.sequences(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_restart_failure_aborts_pipeline() {
        init_test_tracing!();
        let registry = PluginRegistry::with_builtins();
        let (output, _sink) = CollectingOutput::new();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        let input = MemoryInput::new(100).gate(gate_rx);
        let probe = input.probe();

        let running = Pipeline::builder(config(64))
            .input(input)
            .processor_stage(
                registry
                    .processor_stage("filter", PluginOptions::new().with("pid", "0x200"))
                    .unwrap(),
            )
            .output(output)
            .start()
            .unwrap();

        let err = running
            .restart(1, PluginOptions::new().with("pid", "bogus"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::RestartFailed { stage: 1, .. }));

        // The input is still parked on its gate; the abort releases it.
        let report = running.join().unwrap();
        assert_eq!(report.reason, TerminationReason::RestartFailure);
        assert_eq!(report.initiator, Some(1));
        assert!(probe.stopped());
        drop(gate_tx);
    }

    #[test]
    fn test_restart_after_exit_is_rejected() {
        init_test_tracing!();
        let registry = PluginRegistry::with_builtins();
        let (output, _sink) = CollectingOutput::new();

        let running = Pipeline::builder(config(8))
            .input(MemoryInput::new(3))
            .processor_stage(
                registry
                    .processor_stage("skip", PluginOptions::new().with("packets", "1"))
                    .unwrap(),
            )
            .output(output)
            .start()
            .unwrap();

        while !running.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            running.restart(1, PluginOptions::new().with("packets", "2")),
            Err(PipelineError::StageNotRunning(1))
        ));
        assert!(running.join().unwrap().is_success());
    }

    #[test]
    fn test_suspended_output_discards_packets() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);

        let running = Pipeline::builder(config(16))
            .input(MemoryInput::new(40).gate(gate_rx))
            .output(output)
            .start()
            .unwrap();
        running.suspend(1).unwrap();
        assert!(running.stage_stats()[1].suspended);
        gate_tx.send(()).unwrap();

        let report = running.join().unwrap();
        assert!(report.is_success());
        assert!(sink.packets().is_empty());
        let output = &report.output().unwrap().stats;
        assert_eq!(output.plugin_packets, 0);
        assert_eq!(output.passthrough_packets, 40);
    }

    #[test]
    fn test_suspended_processor_is_bypassed() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);

        let running = Pipeline::builder(config(16))
            .input(MemoryInput::new(20).gate(gate_rx))
            .processor(FilterPlugin::new([0x200], false))
            .output(output)
            .start()
            .unwrap();
        running.suspend(1).unwrap();
        gate_tx.send(()).unwrap();

        let report = running.join().unwrap();
        assert_eq!(sink.sequences(), (0..20).collect::<Vec<_>>());
        assert_eq!(report.stages[1].stats.passthrough_packets, 20);
    }

    #[test]
    fn test_stage_timeout_aborts_pipeline() {
        init_test_tracing!();
        let (output, _sink) = CollectingOutput::new();
        let config = PipelineConfig::builder()
            .buffer_packets(16)
            .stage_timeout(Duration::from_millis(50))
            .build();

        let report = Pipeline::builder(config)
            .input(MemoryInput::new(10).delay(Duration::from_millis(400)))
            .output(output)
            .run()
            .unwrap();

        assert_eq!(report.reason, TerminationReason::Timeout);
        assert_eq!(report.initiator, Some(1));
        assert_eq!(report.output().unwrap().reason, TerminationReason::Timeout);
        assert!(!report.is_success());
    }

    #[test]
    fn test_external_abort_stops_every_stage() {
        init_test_tracing!();
        let registry = PluginRegistry::with_builtins();

        let running = Pipeline::builder(config(256))
            .input_stage(registry.input_stage("null", PluginOptions::new()).unwrap())
            .processor(FilterPlugin::new([0x1FFF], false))
            .output_stage(registry.output_stage("drop", PluginOptions::new()).unwrap())
            .start()
            .unwrap();
        let handle = running.abort_handle();

        std::thread::sleep(Duration::from_millis(20));
        handle.abort();
        assert!(handle.is_aborting());

        let report = running.join().unwrap();
        assert_eq!(report.reason, TerminationReason::Interrupted);
        assert_eq!(report.initiator, None);
        assert!(
            report
                .stages
                .iter()
                .all(|stage| stage.reason == TerminationReason::Interrupted)
        );
    }

    #[test]
    fn test_abort_releases_blocked_input() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        let input = MemoryInput::new(100).gate(gate_rx);
        let probe = input.probe();

        let running = Pipeline::builder(config(16))
            .input(input)
            .output(output)
            .start()
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        running.abort();

        let report = running.join().unwrap();
        assert_eq!(report.reason, TerminationReason::Interrupted);
        assert_eq!(report.input().unwrap().reason, TerminationReason::Interrupted);
        assert_eq!(report.input().unwrap().stats.total_packets(), 0);
        assert!(sink.packets().is_empty());
        assert!(probe.stopped());
        drop(gate_tx);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_final_flush_fails_pipeline() {
        init_test_tracing!();

        // Ten packets fit in the write buffer; only the flush on stop hits
        // the full device.
        let report = Pipeline::builder(config(16))
            .input(MemoryInput::new(10))
            .output(FileOutput::new("/dev/full"))
            .run()
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.reason, TerminationReason::PluginFailure);
        assert_eq!(report.initiator, Some(1));
        let output = report.output().unwrap();
        assert_eq!(output.reason, TerminationReason::PluginFailure);
        assert_eq!(output.stats.plugin_packets, 10);
    }

    /// Votes for joint termination at the first slice starting at or past
    /// `at`, then drops everything.
    struct VoteAt {
        at: u64,
        voted: bool,
    }

    impl Plugin for VoteAt {
        fn name(&self) -> &'static str {
            "vote"
        }

        fn start(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
            ctx.use_joint_termination();
            Ok(())
        }
    }

    impl ProcessorPlugin for VoteAt {
        fn process(
            &mut self,
            ctx: &StageContext,
            packets: &mut [ts::TsPacket],
            _metadata: &mut [crate::PacketMetadata],
        ) -> Result<crate::ProcessStatus, PluginError> {
            if !self.voted && ctx.total_packets() >= self.at {
                ctx.joint_terminate();
                self.voted = true;
            }
            let kept = if self.voted { 0 } else { packets.len() };
            Ok(crate::ProcessStatus::Kept(kept))
        }
    }

    #[test]
    fn test_mid_stream_joint_vote_stops_stages_past_the_limit() {
        init_test_tracing!();
        let (output, sink) = CollectingOutput::new();
        let config = PipelineConfig::builder()
            .buffer_packets(256)
            .max_input_packets(10)
            .max_flushed_packets(10)
            .build();

        let report = Pipeline::builder(config)
            .input(MemoryInput::new(1_000))
            .processor(VoteAt { at: 30, voted: false })
            .output(output)
            .run()
            .unwrap();

        // Batches of ten from the start of the ring put a slice at 30.
        assert_eq!(report.joint_limit, Some(30));
        assert_eq!(report.reason, TerminationReason::JointTermination);
        assert!(report.is_success());
        assert_eq!(sink.sequences(), (0..30).collect::<Vec<_>>());

        let output = report.output().unwrap();
        assert_eq!(output.reason, TerminationReason::JointTermination);
        assert_eq!(output.stats.total_packets(), 30);
        assert_eq!(output.stats.plugin_packets, 30);

        // The voting batch was already granted, so the processor ends past the
        // limit and its last step emits nothing.
        let processor = &report.stages[1];
        assert!(processor.stats.total_packets() > 30);
        assert!(report.input().unwrap().stats.total_packets() < 1_000);
    }

    struct FailingStart;

    impl Plugin for FailingStart {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn start(&mut self, _ctx: &StageContext) -> Result<(), PluginError> {
            Err(PluginError::Other("no such device".into()))
        }
    }

    impl ProcessorPlugin for FailingStart {
        fn process(
            &mut self,
            _ctx: &StageContext,
            packets: &mut [ts::TsPacket],
            _metadata: &mut [crate::PacketMetadata],
        ) -> Result<crate::ProcessStatus, PluginError> {
            Ok(crate::ProcessStatus::Kept(packets.len()))
        }
    }

    #[test]
    fn test_start_failure_stops_started_plugins() {
        init_test_tracing!();
        let (output, _sink) = CollectingOutput::new();
        let input = MemoryInput::new(10);
        let probe = input.probe();

        let result = Pipeline::builder(config(8))
            .input(input)
            .processor(FailingStart)
            .output(output)
            .start();

        assert!(matches!(
            result,
            Err(PipelineError::StartFailed {
                stage: 1,
                plugin: "failing",
                ..
            })
        ));
        assert!(probe.stopped());
    }

    #[test]
    fn test_missing_output_is_rejected() {
        let result = Pipeline::builder(PipelineConfig::default())
            .input(MemoryInput::new(1))
            .build();
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_progress_events() {
        init_test_tracing!();
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let (output, _sink) = CollectingOutput::new();

        Pipeline::builder(config(8))
            .input(MemoryInput::new(5))
            .processor(UntilPlugin::new(3, true))
            .output(output)
            .on_progress(Arc::new(move |event| recorded.lock().push(event)))
            .run()
            .unwrap();

        let events = events.lock();
        let started = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::StageStarted { .. }))
            .count();
        let terminated: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::StageTerminated(report) => Some(report.stats.index),
                _ => None,
            })
            .collect();
        assert_eq!(started, 3);
        assert_eq!(terminated.len(), 3);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ProgressEvent::JointTerminationFrozen { limit: 3 }))
        );
    }
}
