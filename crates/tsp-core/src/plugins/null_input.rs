use ts::TsPacket;

use super::bitrate_option;
use crate::plugin::{InputPlugin, Plugin, PluginError, PluginOptions};
use crate::{BitRate, PacketMetadata, StageContext};

/// Generates null packets, `count` of them or endlessly when `count` is 0.
#[derive(Debug, Clone)]
pub struct NullInput {
    count: u64,
    generated: u64,
    bitrate: BitRate,
}

impl NullInput {
    pub fn new(count: u64) -> Self {
        Self {
            count,
            generated: 0,
            bitrate: BitRate::UNKNOWN,
        }
    }

    pub fn from_options(options: &PluginOptions) -> Result<Self, PluginError> {
        options.expect_only(&["count", "bitrate"])?;
        let mut input = Self::new(options.get_parsed("count")?.unwrap_or(0));
        input.bitrate = bitrate_option(options)?;
        Ok(input)
    }
}

impl Plugin for NullInput {
    fn name(&self) -> &'static str {
        "null"
    }

    fn start(&mut self, _ctx: &StageContext) -> Result<(), PluginError> {
        self.generated = 0;
        Ok(())
    }
}

impl InputPlugin for NullInput {
    fn receive(
        &mut self,
        _ctx: &StageContext,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> Result<usize, PluginError> {
        let count = match self.count {
            0 => packets.len(),
            limit => packets
                .len()
                .min(usize::try_from(limit - self.generated).unwrap_or(usize::MAX)),
        };
        packets[..count].fill(TsPacket::null());
        self.generated += count as u64;
        Ok(count)
    }

    fn bitrate(&self) -> BitRate {
        self.bitrate
    }
}
