use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use ts::TsPacket;

use crate::context::{PipelineContext, StageControl};
use crate::progress::StageKind;
use crate::{
    BitRate, InputAborter, InputPlugin, OutputPlugin, PacketMetadata, Plugin, PluginError, StageContext,
};

/// Macro to initialize tracing for tests
///
/// Usage:
/// - `init_test_tracing!()` - uses DEBUG level (default)
/// - `init_test_tracing!(INFO)` - uses specified level
macro_rules! init_test_tracing {
    () => {
        init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

pub(crate) use init_test_tracing;

pub(crate) const TEST_PID: u16 = 0x100;

/// A stage context outside of any running pipeline, for plugin unit tests.
pub(crate) fn create_test_context(kind: StageKind) -> StageContext {
    let pipeline = Arc::new(PipelineContext::new("test".into(), Vec::new(), None));
    let control = Arc::new(StageControl::new(1, kind, "test", false));
    StageContext::new(pipeline, control)
}

/// A packet on `pid` carrying `seq` in its first payload bytes.
pub(crate) fn make_packet_on(pid: u16, seq: u32) -> TsPacket {
    let mut packet = TsPacket::null();
    packet
        .set_pid(pid)
        .expect("test pid in range");
    packet.as_bytes_mut()[4..8].copy_from_slice(&seq.to_be_bytes());
    packet
}

pub(crate) fn make_packet(seq: u32) -> TsPacket {
    make_packet_on(TEST_PID, seq)
}

pub(crate) fn sequence(packet: &TsPacket) -> u32 {
    let bytes = packet.as_bytes();
    u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
}

/// Records whether a plugin was stopped.
#[derive(Debug, Clone, Default)]
pub(crate) struct StopProbe(Arc<AtomicBool>);

impl StopProbe {
    pub(crate) fn stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Input replaying a fixed list of packets.
pub(crate) struct MemoryInput {
    packets: Vec<TsPacket>,
    next: usize,
    bitrate: BitRate,
    delay: Option<Duration>,
    gate: Option<Receiver<()>>,
    abort: (Sender<()>, Receiver<()>),
    probe: StopProbe,
}

impl MemoryInput {
    /// `count` sequence-numbered packets.
    pub(crate) fn new(count: u32) -> Self {
        Self::from_packets((0..count).map(make_packet).collect())
    }

    /// Sequence-numbered packets, the ones at `dropped` being drop markers.
    pub(crate) fn with_dropped(count: u32, dropped: &[u32]) -> Self {
        Self::from_packets(
            (0..count)
                .map(|seq| {
                    let mut packet = make_packet(seq);
                    if dropped.contains(&seq) {
                        packet.mark_dropped();
                    }
                    packet
                })
                .collect(),
        )
    }

    pub(crate) fn from_packets(packets: Vec<TsPacket>) -> Self {
        Self {
            packets,
            next: 0,
            bitrate: BitRate::UNKNOWN,
            delay: None,
            gate: None,
            abort: crossbeam_channel::unbounded(),
            probe: StopProbe::default(),
        }
    }

    pub(crate) fn bitrate(mut self, bitrate: BitRate) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Sleep before every receive.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block the first receive until `gate` yields or disconnects, or the
    /// pipeline aborts.
    pub(crate) fn gate(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn probe(&self) -> StopProbe {
        self.probe.clone()
    }
}

impl Plugin for MemoryInput {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn stop(&mut self, _ctx: &StageContext) -> Result<(), PluginError> {
        self.probe.mark();
        Ok(())
    }
}

impl InputPlugin for MemoryInput {
    fn receive(
        &mut self,
        _ctx: &StageContext,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> Result<usize, PluginError> {
        let aborted = || PluginError::Other("memory input aborted".into());
        if let Some(gate) = self.gate.take() {
            crossbeam_channel::select! {
                recv(gate) -> _ => {}
                recv(self.abort.1) -> _ => return Err(aborted()),
            }
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.abort.1.try_recv().is_ok() {
            return Err(aborted());
        }
        let count = packets.len().min(self.packets.len() - self.next);
        packets[..count].copy_from_slice(&self.packets[self.next..self.next + count]);
        self.next += count;
        Ok(count)
    }

    fn bitrate(&self) -> BitRate {
        self.bitrate
    }

    fn input_aborter(&self) -> Option<InputAborter> {
        let abort = self.abort.0.clone();
        Some(Arc::new(move || {
            let _ = abort.send(());
        }))
    }
}

/// Everything a [`CollectingOutput`] received, shared with the test.
#[derive(Debug, Clone, Default)]
pub(crate) struct Sink {
    packets: Arc<Mutex<Vec<TsPacket>>>,
    batches: Arc<Mutex<Vec<usize>>>,
    bitrates: Arc<Mutex<Vec<BitRate>>>,
}

impl Sink {
    pub(crate) fn packets(&self) -> Vec<TsPacket> {
        self.packets.lock().clone()
    }

    pub(crate) fn sequences(&self) -> Vec<u32> {
        self.packets.lock().iter().map(sequence).collect()
    }

    /// Size of every successful send call
    pub(crate) fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    pub(crate) fn last_bitrate(&self) -> Option<BitRate> {
        self.bitrates.lock().last().copied()
    }
}

/// Output storing every packet in a [`Sink`].
pub(crate) struct CollectingOutput {
    sink: Sink,
    calls: usize,
    fail_on_call: Option<usize>,
}

impl CollectingOutput {
    pub(crate) fn new() -> (Self, Sink) {
        let sink = Sink::default();
        (
            Self {
                sink: sink.clone(),
                calls: 0,
                fail_on_call: None,
            },
            sink,
        )
    }

    /// Fail the `call`-th send (1-based).
    pub(crate) fn fail_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }
}

impl Plugin for CollectingOutput {
    fn name(&self) -> &'static str {
        "collect"
    }
}

impl OutputPlugin for CollectingOutput {
    fn send(
        &mut self,
        ctx: &StageContext,
        packets: &[TsPacket],
        _metadata: &[PacketMetadata],
    ) -> Result<(), PluginError> {
        self.calls += 1;
        if self.fail_on_call == Some(self.calls) {
            return Err(PluginError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sink closed",
            )));
        }
        self.sink.packets.lock().extend_from_slice(packets);
        self.sink.batches.lock().push(packets.len());
        self.sink.bitrates.lock().push(ctx.bitrate());
        Ok(())
    }
}
