use ts::{PID_MAX, TsPacket};

use crate::plugin::{Plugin, PluginError, PluginOptions, ProcessStatus, ProcessorPlugin};
use crate::{PacketMetadata, StageContext};

/// Keeps the packets of selected PIDs, or removes them with `negate`.
#[derive(Debug, Clone)]
pub struct FilterPlugin {
    selected: Box<[bool]>,
    negate: bool,
}

impl FilterPlugin {
    pub fn new(pids: impl IntoIterator<Item = u16>, negate: bool) -> Self {
        let mut selected = vec![false; PID_MAX as usize + 1].into_boxed_slice();
        for pid in pids {
            if let Some(slot) = selected.get_mut(pid as usize) {
                *slot = true;
            }
        }
        Self { selected, negate }
    }

    pub fn from_options(options: &PluginOptions) -> Result<Self, PluginError> {
        options.expect_only(&["pid", "negate"])?;
        let pids = options
            .get_all("pid")
            .map(parse_pid_option)
            .collect::<Result<Vec<_>, _>>()?;
        if pids.is_empty() {
            return Err(PluginError::MissingOption("pid".to_string()));
        }
        Ok(Self::new(pids, options.contains("negate")))
    }

    fn keeps(&self, packet: &TsPacket) -> bool {
        self.selected[packet.pid() as usize] != self.negate
    }
}

/// Decimal or `0x` hexadecimal PID.
fn parse_pid_option(value: &str) -> Result<u16, PluginError> {
    let invalid = |reason: &str| PluginError::InvalidOption {
        key: "pid".to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    }
    .map_err(|_| invalid("not a number"))?;
    if parsed > PID_MAX {
        return Err(invalid("PID out of range"));
    }
    Ok(parsed)
}

impl Plugin for FilterPlugin {
    fn name(&self) -> &'static str {
        "filter"
    }
}

impl ProcessorPlugin for FilterPlugin {
    fn process(
        &mut self,
        _ctx: &StageContext,
        packets: &mut [TsPacket],
        metadata: &mut [PacketMetadata],
    ) -> Result<ProcessStatus, PluginError> {
        let mut kept = 0;
        for i in 0..packets.len() {
            if self.keeps(&packets[i]) {
                if kept != i {
                    packets[kept] = packets[i];
                    metadata[kept] = metadata[i];
                }
                kept += 1;
            }
        }
        Ok(ProcessStatus::Kept(kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::StageKind;
    use crate::test_utils::{create_test_context, make_packet_on, sequence};

    #[test]
    fn test_compacts_kept_packets_with_metadata() {
        let ctx = create_test_context(StageKind::Processor);
        let mut filter = FilterPlugin::from_options(
            &PluginOptions::parse_args(["pid=0x100", "pid=17"]),
        )
        .unwrap();

        let mut packets = vec![
            make_packet_on(0x100, 0),
            make_packet_on(0x200, 1),
            make_packet_on(17, 2),
            make_packet_on(0x200, 3),
            make_packet_on(0x100, 4),
        ];
        let mut metadata = vec![PacketMetadata::default(); 5];
        metadata[2].set_label(5);

        let status = filter.process(&ctx, &mut packets, &mut metadata).unwrap();
        assert_eq!(status, ProcessStatus::Kept(3));
        assert_eq!(
            packets[..3].iter().map(sequence).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
        assert!(metadata[1].has_label(5));
    }

    #[test]
    fn test_negate() {
        let ctx = create_test_context(StageKind::Processor);
        let mut filter = FilterPlugin::new([0x100], true);
        let mut packets = vec![make_packet_on(0x100, 0), make_packet_on(0x101, 1)];
        let mut metadata = vec![PacketMetadata::default(); 2];

        let status = filter.process(&ctx, &mut packets, &mut metadata).unwrap();
        assert_eq!(status, ProcessStatus::Kept(1));
        assert_eq!(sequence(&packets[0]), 1);
    }

    #[test]
    fn test_pid_options() {
        assert_eq!(parse_pid_option("0x1FFF").unwrap(), 0x1FFF);
        assert_eq!(parse_pid_option("256").unwrap(), 256);
        assert!(parse_pid_option("0x2000").is_err());
        assert!(parse_pid_option("abc").is_err());
        assert!(matches!(
            FilterPlugin::from_options(&PluginOptions::new().with("negate", "")),
            Err(PluginError::MissingOption(_))
        ));
    }
}
