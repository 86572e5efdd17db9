use tracing::{debug, error};

use super::{StageCore, StageRole, Work};
use crate::context::StageContext;
use crate::plugin::{InputPlugin, PluginError, PluginOptions, StageDef};
use crate::progress::{StageKind, TerminationReason};
use crate::{BitRate, PacketMetadata, PipelineConfig};

pub(crate) struct InputRole {
    stage: StageDef<dyn InputPlugin>,
}

impl InputRole {
    pub(crate) fn new(stage: StageDef<dyn InputPlugin>) -> Self {
        Self { stage }
    }

    /// Refresh the pipeline bitrate from the plugin estimate.
    fn update_bitrate(&self, ctx: &StageContext) -> BitRate {
        let estimate = self.stage.plugin.bitrate();
        if estimate.is_known() {
            ctx.pipeline().set_bitrate(estimate);
        }
        ctx.pipeline().bitrate()
    }
}

impl StageRole for InputRole {
    const KIND: StageKind = StageKind::Input;

    fn batch_limit(config: &PipelineConfig) -> usize {
        config.max_input_packets
    }

    fn name(&self) -> &'static str {
        self.stage.name()
    }

    fn restart(&mut self, options: PluginOptions, ctx: &StageContext) -> Result<(), PluginError> {
        let result = self.stage.apply_restart(options, ctx);
        ctx.pipeline()
            .set_input_aborter(self.stage.plugin.input_aborter());
        result
    }

    fn run_batch(&mut self, core: &mut StageCore, work: Work) -> Option<TerminationReason> {
        let mut grant = work.grant;
        let len = grant.len();
        let suspended = core.ctx.is_suspended();

        let received = if len == 0 {
            Ok(0)
        } else {
            let (packets, metadata) = core.ring.slices(&mut grant);
            metadata.iter_mut().for_each(PacketMetadata::reset);
            core.ctx.set_position(core.total());

            match self.stage.plugin.receive(&core.ctx, packets, metadata) {
                Ok(count) => {
                    let count = count.min(len);
                    if suspended {
                        packets[..count].iter_mut().for_each(|p| p.mark_dropped());
                    }
                    Ok(count)
                }
                Err(e) => Err(e),
            }
        };

        // An abort may have interrupted `receive`.
        if core.ctx.is_aborting() {
            return Some(core.abort_reason());
        }

        let count = match received {
            Ok(count) => count,
            Err(e) => {
                error!(stage = core.index(), plugin = self.name(), error = %e, "input failed");
                core.link
                    .pass_packets(grant, 0, BitRate::UNKNOWN, false, true);
                core.ctx
                    .pipeline()
                    .fail(core.index(), TerminationReason::PluginFailure);
                return Some(TerminationReason::PluginFailure);
            }
        };

        if suspended {
            core.ctx.control().add_passthrough_packets(count);
        } else {
            core.ctx.control().add_plugin_packets(count);
        }
        let bitrate = self.update_bitrate(&core.ctx);

        if work.joint_stop && count == len {
            debug!(stage = core.index(), total = core.total(), "input reached joint termination limit");
            let reason = core.conclude(TerminationReason::JointTermination);
            core.link.pass_packets(grant, count, bitrate, true, false);
            return Some(reason);
        }

        if count == 0 {
            debug!(stage = core.index(), total = core.total(), "end of input");
            let reason = core.conclude(TerminationReason::EndOfStream);
            core.link.pass_packets(grant, 0, bitrate, true, false);
            return Some(reason);
        }

        if !core.link.pass_packets(grant, count, bitrate, false, false) {
            return Some(TerminationReason::NeighborAborted);
        }
        None
    }

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        self.stage.stop(ctx)
    }
}
