use tracing::debug;
use ts::TsPacket;

use crate::plugin::{Plugin, PluginError, PluginOptions, ProcessStatus, ProcessorPlugin};
use crate::{PacketMetadata, StageContext};

/// Ends the stream once the stage has seen `packets` packets.
///
/// With `joint`, the plugin does not end the stream on its own but votes for
/// joint termination at that position; the pipeline stops at the lowest
/// position agreed on by every joint termination user.
#[derive(Debug, Clone)]
pub struct UntilPlugin {
    packets: u64,
    joint: bool,
}

impl UntilPlugin {
    pub fn new(packets: u64, joint: bool) -> Self {
        Self { packets, joint }
    }

    pub fn from_options(options: &PluginOptions) -> Result<Self, PluginError> {
        options.expect_only(&["packets", "joint"])?;
        Ok(Self::new(
            options.require("packets")?,
            options.contains("joint"),
        ))
    }
}

impl Plugin for UntilPlugin {
    fn name(&self) -> &'static str {
        "until"
    }

    fn start(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        if self.joint {
            ctx.use_joint_termination();
            // The stop position is known upfront.
            ctx.joint_terminate_at(self.packets);
            debug!(stage = ctx.index(), packets = self.packets, "joint termination vote");
        }
        Ok(())
    }
}

impl ProcessorPlugin for UntilPlugin {
    fn process(
        &mut self,
        ctx: &StageContext,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> Result<ProcessStatus, PluginError> {
        if self.joint {
            return Ok(ProcessStatus::Kept(packets.len()));
        }
        let remaining = self.packets.saturating_sub(ctx.total_packets());
        match usize::try_from(remaining) {
            Ok(remaining) if remaining <= packets.len() => Ok(ProcessStatus::End(remaining)),
            _ => Ok(ProcessStatus::Kept(packets.len())),
        }
    }
}
