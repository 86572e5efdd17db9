use tracing::{debug, error};

use super::{StageCore, StageRole, Work, runs};
use crate::context::StageContext;
use crate::plugin::{PluginError, PluginOptions, ProcessStatus, ProcessorPlugin, StageDef};
use crate::progress::{StageKind, TerminationReason};
use crate::{BitRate, PipelineConfig};

pub(crate) struct ProcessorRole {
    stage: StageDef<dyn ProcessorPlugin>,
}

impl ProcessorRole {
    pub(crate) fn new(stage: StageDef<dyn ProcessorPlugin>) -> Self {
        Self { stage }
    }
}

enum Outcome {
    Continue,
    /// The plugin ended the stream after this many packets of the batch
    End(usize),
    Failed,
}

impl StageRole for ProcessorRole {
    const KIND: StageKind = StageKind::Processor;

    fn batch_limit(config: &PipelineConfig) -> usize {
        config.max_flushed_packets
    }

    fn name(&self) -> &'static str {
        self.stage.name()
    }

    fn restart(&mut self, options: PluginOptions, ctx: &StageContext) -> Result<(), PluginError> {
        self.stage.apply_restart(options, ctx)
    }

    fn run_batch(&mut self, core: &mut StageCore, work: Work) -> Option<TerminationReason> {
        let mut grant = work.grant;
        let len = grant.len();
        let suspended = core.ctx.is_suspended();
        core.ctx.set_batch_bitrate(work.bitrate);
        let base = core.total();
        let mut outcome = Outcome::Continue;

        {
            let (packets, metadata) = core.ring.slices(&mut grant);
            for (range, dropped) in runs(packets) {
                let run_len = range.len();
                if dropped || suspended {
                    core.ctx.control().add_passthrough_packets(run_len);
                    continue;
                }

                core.ctx.set_position(base + range.start as u64);
                let status = self.stage.plugin.process(
                    &core.ctx,
                    &mut packets[range.clone()],
                    &mut metadata[range.clone()],
                );
                core.ctx.control().add_plugin_packets(run_len);

                let (kept, end) = match status {
                    Ok(ProcessStatus::Kept(kept)) => (kept.min(run_len), false),
                    Ok(ProcessStatus::End(kept)) => (kept.min(run_len), true),
                    Err(e) => {
                        error!(stage = core.index(), plugin = self.stage.name(), error = %e, "processing failed");
                        outcome = Outcome::Failed;
                        break;
                    }
                };
                for packet in &mut packets[range.start + kept..range.end] {
                    packet.mark_dropped();
                }
                if end {
                    outcome = Outcome::End(range.start + kept);
                    break;
                }
            }
        }

        match outcome {
            Outcome::Failed => {
                core.link
                    .pass_packets(grant, 0, BitRate::UNKNOWN, false, true);
                core.ctx
                    .pipeline()
                    .fail(core.index(), TerminationReason::PluginFailure);
                Some(TerminationReason::PluginFailure)
            }
            Outcome::End(count) => {
                debug!(stage = core.index(), total = base + count as u64, "plugin ended the stream");
                let reason = core.conclude(TerminationReason::EndOfStream);
                core.link.pass_packets(grant, count, work.bitrate, true, false);
                core.link.notify_upstream();
                Some(reason)
            }
            Outcome::Continue if work.joint_stop => {
                debug!(stage = core.index(), total = core.total(), "processor reached joint termination limit");
                let reason = core.conclude(TerminationReason::JointTermination);
                core.link.pass_packets(grant, len, work.bitrate, true, false);
                core.link.notify_upstream();
                Some(reason)
            }
            Outcome::Continue => {
                if !core
                    .link
                    .pass_packets(grant, len, work.bitrate, work.input_end, false)
                {
                    core.link.notify_upstream();
                    return Some(TerminationReason::NeighborAborted);
                }
                work.input_end.then_some(TerminationReason::EndOfStream)
            }
        }
    }

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        self.stage.stop(ctx)
    }
}
