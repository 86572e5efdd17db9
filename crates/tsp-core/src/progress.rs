use std::fmt;
use std::sync::Arc;

use crate::BitRate;

/// Position of a stage in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Input,
    Processor,
    Output,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageKind::Input => "input",
            StageKind::Processor => "processor",
            StageKind::Output => "output",
        })
    }
}

/// Why a stage, or the whole pipeline, stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// End of input reached and fully drained.
    EndOfStream,
    /// The joint termination limit was reached.
    JointTermination,
    /// A plugin call reported an error.
    PluginFailure,
    /// A restart request could not be applied.
    RestartFailure,
    /// No work arrived within the stage timeout.
    Timeout,
    /// Aborted from outside the pipeline (user interrupt, abort handle).
    Interrupted,
    /// A neighbor stopped and this stage followed.
    NeighborAborted,
}

impl TerminationReason {
    /// Normal end or joint termination.
    pub fn is_clean(self) -> bool {
        matches!(
            self,
            TerminationReason::EndOfStream | TerminationReason::JointTermination
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminationReason::EndOfStream => "end of stream",
            TerminationReason::JointTermination => "joint termination",
            TerminationReason::PluginFailure => "plugin failure",
            TerminationReason::RestartFailure => "restart failure",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Interrupted => "interrupted",
            TerminationReason::NeighborAborted => "neighbor aborted",
        })
    }
}

/// Live counters of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStats {
    pub index: usize,
    pub kind: StageKind,
    /// Name of the current plugin
    pub name: &'static str,
    /// Packets handled by the plugin
    pub plugin_packets: u64,
    /// Packets passed without reaching the plugin (dropped markers, suspended traffic)
    pub passthrough_packets: u64,
    pub suspended: bool,
}

impl StageStats {
    pub fn total_packets(&self) -> u64 {
        self.plugin_packets + self.passthrough_packets
    }
}

/// Final state of a stage after its thread exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stats: StageStats,
    pub reason: TerminationReason,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage {} ({} {}): {} packets ({} plugin, {} passthrough), {}",
            self.stats.index,
            self.stats.kind,
            self.stats.name,
            self.stats.total_packets(),
            self.stats.plugin_packets,
            self.stats.passthrough_packets,
            self.reason
        )
    }
}

/// An enum to represent different progress events.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A stage thread was spawned.
    StageStarted {
        index: usize,
        kind: StageKind,
        name: &'static str,
    },
    /// A stage applied a restart request.
    StageRestarted { index: usize, name: &'static str },
    /// Every joint termination user voted; the stream stops at `limit` packets.
    JointTerminationFrozen { limit: u64 },
    /// A stage thread is about to exit.
    StageTerminated(StageReport),
    /// Input bitrate changed.
    BitRateChanged { bitrate: BitRate },
}

/// A callback function for progress updates.
///
/// Invoked from stage threads; it must not block.
pub type OnProgress = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
