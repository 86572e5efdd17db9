use ts::TsPacket;

use crate::plugin::{Plugin, PluginError, PluginOptions, ProcessStatus, ProcessorPlugin};
use crate::{PacketMetadata, StageContext};

/// Removes the first `packets` packets it is given.
#[derive(Debug, Clone)]
pub struct SkipPlugin {
    packets: u64,
    remaining: u64,
}

impl SkipPlugin {
    pub fn new(packets: u64) -> Self {
        Self {
            packets,
            remaining: packets,
        }
    }

    pub fn from_options(options: &PluginOptions) -> Result<Self, PluginError> {
        options.expect_only(&["packets"])?;
        Ok(Self::new(options.require("packets")?))
    }
}

impl Plugin for SkipPlugin {
    fn name(&self) -> &'static str {
        "skip"
    }

    fn start(&mut self, _ctx: &StageContext) -> Result<(), PluginError> {
        self.remaining = self.packets;
        Ok(())
    }
}

impl ProcessorPlugin for SkipPlugin {
    fn process(
        &mut self,
        _ctx: &StageContext,
        packets: &mut [TsPacket],
        metadata: &mut [PacketMetadata],
    ) -> Result<ProcessStatus, PluginError> {
        let skip = packets.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if skip > 0 {
            self.remaining -= skip as u64;
            packets.copy_within(skip.., 0);
            metadata.copy_within(skip.., 0);
        }
        Ok(ProcessStatus::Kept(packets.len() - skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::StageKind;
    use crate::test_utils::{create_test_context, make_packet, sequence};

    #[test]
    fn test_skips_across_calls() {
        let ctx = create_test_context(StageKind::Processor);
        let mut skip = SkipPlugin::new(5);
        skip.start(&ctx).unwrap();

        let mut packets: Vec<_> = (0..3).map(make_packet).collect();
        let mut metadata = vec![PacketMetadata::default(); 3];
        assert_eq!(
            skip.process(&ctx, &mut packets, &mut metadata).unwrap(),
            ProcessStatus::Kept(0)
        );

        let mut packets: Vec<_> = (3..7).map(make_packet).collect();
        let mut metadata = vec![PacketMetadata::default(); 4];
        assert_eq!(
            skip.process(&ctx, &mut packets, &mut metadata).unwrap(),
            ProcessStatus::Kept(2)
        );
        assert_eq!(sequence(&packets[0]), 5);
        assert_eq!(sequence(&packets[1]), 6);
    }
}
