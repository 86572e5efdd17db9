use std::collections::BTreeMap;
use std::sync::Arc;

use tsp_core::{
    PacketMetadata, Pipeline, PipelineConfig, Plugin, PluginError, PluginOptions, PluginRegistry,
    ProcessStatus, ProcessorPlugin, ProgressEvent, StageContext, TsPacket,
};

// A processor counting packets per PID, then rewriting them to a new PID
struct PidCounter {
    counts: BTreeMap<u16, u64>,
    remap: u16,
}

impl PidCounter {
    fn new(remap: u16) -> Self {
        Self {
            counts: BTreeMap::new(),
            remap,
        }
    }
}

impl Plugin for PidCounter {
    fn name(&self) -> &'static str {
        "pid-counter"
    }

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        for (pid, count) in &self.counts {
            println!("stage {}: PID {pid:#06x} -> {count} packets", ctx.index());
        }
        Ok(())
    }
}

impl ProcessorPlugin for PidCounter {
    fn process(
        &mut self,
        _ctx: &StageContext,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> Result<ProcessStatus, PluginError> {
        for packet in packets.iter_mut() {
            *self.counts.entry(packet.pid()).or_default() += 1;
            packet.set_pid(self.remap)?;
        }
        Ok(ProcessStatus::Kept(packets.len()))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = PluginRegistry::with_builtins();
    let config = PipelineConfig::builder()
        .buffer_packets(1024)
        .max_output_packets(128)
        .build();

    let report = Pipeline::builder(config)
        .name("example")
        .input_stage(registry.input_stage(
            "null",
            PluginOptions::parse_args(["count=10000", "bitrate=1000000"]),
        )?)
        .processor(PidCounter::new(0x100))
        // Stop after 2500 packets, agreed through joint termination.
        .processor_stage(registry.processor_stage(
            "until",
            PluginOptions::parse_args(["packets=2500", "joint"]),
        )?)
        .output_stage(registry.output_stage("drop", PluginOptions::new())?)
        .on_progress(Arc::new(|event| {
            if let ProgressEvent::StageTerminated(report) = event {
                println!("{report}");
            }
        }))
        .run()?;

    println!("{report}");
    Ok(())
}
