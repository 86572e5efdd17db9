use ts::TsPacket;

use crate::plugin::{OutputPlugin, Plugin, PluginError, PluginOptions};
use crate::{PacketMetadata, StageContext};

/// Discards every packet.
#[derive(Debug, Clone, Default)]
pub struct DropOutput;

impl DropOutput {
    pub fn from_options(options: &PluginOptions) -> Result<Self, PluginError> {
        options.expect_only(&[])?;
        Ok(Self)
    }
}

impl Plugin for DropOutput {
    fn name(&self) -> &'static str {
        "drop"
    }
}

impl OutputPlugin for DropOutput {
    fn send(
        &mut self,
        _ctx: &StageContext,
        _packets: &[TsPacket],
        _metadata: &[PacketMetadata],
    ) -> Result<(), PluginError> {
        Ok(())
    }
}
