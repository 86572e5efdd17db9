use tracing::{debug, error};

use super::{StageCore, StageRole, Work, runs};
use crate::context::StageContext;
use crate::plugin::{OutputPlugin, PluginError, PluginOptions, StageDef};
use crate::progress::{StageKind, TerminationReason};
use crate::{BitRate, PipelineConfig};

pub(crate) struct OutputRole {
    stage: StageDef<dyn OutputPlugin>,
}

impl OutputRole {
    pub(crate) fn new(stage: StageDef<dyn OutputPlugin>) -> Self {
        Self { stage }
    }
}

impl StageRole for OutputRole {
    const KIND: StageKind = StageKind::Output;

    /// The output drains whatever it owns; sends are split by
    /// `max_output_packets` instead.
    fn batch_limit(_config: &PipelineConfig) -> usize {
        usize::MAX
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
        let chunk = match core.config.max_output_packets {
            0 => usize::MAX,
            max => max,
        };
        let mut failed = false;

        {
            let (packets, metadata) = core.ring.slices(&mut grant);
            'runs: for (range, dropped) in runs(packets) {
                if dropped || suspended {
                    core.ctx.control().add_passthrough_packets(range.len());
                    continue;
                }

                let mut start = range.start;
                while start < range.end {
                    let end = range.end.min(start.saturating_add(chunk));
                    core.ctx.set_position(base + start as u64);
                    if let Err(e) =
                        self.stage
                            .plugin
                            .send(&core.ctx, &packets[start..end], &metadata[start..end])
                    {
                        error!(stage = core.index(), plugin = self.stage.name(), error = %e, "output failed");
                        failed = true;
                        break 'runs;
                    }
                    core.ctx.control().add_plugin_packets(end - start);
                    start = end;
                }
            }
        }

        if work.joint_stop && !failed {
            core.conclude(TerminationReason::JointTermination);
        }
        // Emptied slots go back to the input.
        core.link
            .pass_packets(grant, len, BitRate::UNKNOWN, false, failed || work.joint_stop);

        if failed {
            core.ctx
                .pipeline()
                .fail(core.index(), TerminationReason::PluginFailure);
            return Some(TerminationReason::PluginFailure);
        }
        if work.joint_stop {
            debug!(stage = core.index(), total = core.total(), "output reached joint termination limit");
            return Some(TerminationReason::JointTermination);
        }
        work.input_end.then_some(TerminationReason::EndOfStream)
    }

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        self.stage.stop(ctx)
    }
}
