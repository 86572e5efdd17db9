//! # Stage Executor
//!
//! Every stage thread runs the same control loop, [`run_stage`], specialized
//! by a [`StageRole`] for the input, processor and output variants. One
//! iteration:
//!
//! 1. wait for work, a wake-up or a timeout
//! 2. apply a pending restart
//! 3. stop on timeout, pipeline abort or neighbor abort
//! 4. stop cleanly when upstream ended and nothing is left
//! 5. cap the batch and clamp it to the joint termination limit
//! 6. hand the batch to the role, which calls the plugin and passes the
//!    packets on
//!
//! Roles return `Some(reason)` from [`StageRole::run_batch`] to stop.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use ts::TsPacket;

use crate::context::StageContext;
use crate::link::StageLink;
use crate::plugin::{Plugin, PluginError, PluginOptions, StageDef};
use crate::progress::{ProgressEvent, StageKind, StageReport, TerminationReason};
use crate::ring::{PacketRing, RangeGrant};
use crate::{BitRate, PipelineConfig};

mod input;
mod output;
mod processor;

pub(crate) use input::InputRole;
pub(crate) use output::OutputRole;
pub(crate) use processor::ProcessorRole;

/// Variant-specific part of a stage.
pub(crate) trait StageRole: Send + 'static {
    const KIND: StageKind;

    /// Maximum packets handled in one iteration.
    fn batch_limit(config: &PipelineConfig) -> usize;

    fn name(&self) -> &'static str;

    fn restart(&mut self, options: PluginOptions, ctx: &StageContext) -> Result<(), PluginError>;

    fn run_batch(&mut self, core: &mut StageCore, work: Work) -> Option<TerminationReason>;

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError>;
}

/// Shared plumbing for the three roles.
impl<P: Plugin + ?Sized> StageDef<P> {
    pub(crate) fn apply_restart(
        &mut self,
        options: PluginOptions,
        ctx: &StageContext,
    ) -> Result<(), PluginError> {
        self.restart(options, ctx)?;
        ctx.control().set_name(self.name());
        Ok(())
    }
}

/// A batch granted to a role.
#[derive(Debug)]
pub(crate) struct Work {
    pub grant: RangeGrant,
    pub bitrate: BitRate,
    /// End of input follows this batch
    pub input_end: bool,
    /// The batch ends exactly at the joint termination limit
    pub joint_stop: bool,
}

enum Step {
    Work(Work),
    Idle,
    Stop(TerminationReason),
}

pub(crate) struct StageCore {
    pub link: StageLink,
    pub ring: Arc<PacketRing>,
    pub ctx: StageContext,
    pub config: PipelineConfig,
}

impl StageCore {
    pub(crate) fn new(
        link: StageLink,
        ring: Arc<PacketRing>,
        ctx: StageContext,
        config: PipelineConfig,
    ) -> Self {
        Self {
            link,
            ring,
            ctx,
            config,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.ctx.index()
    }

    /// Packets seen by the stage so far.
    pub(crate) fn total(&self) -> u64 {
        self.ctx.control().total_packets()
    }

    /// Record a clean stop originating here, before the handoff that tells the
    /// rest of the chain.
    pub(crate) fn conclude(&self, reason: TerminationReason) -> TerminationReason {
        self.ctx
            .pipeline()
            .record_termination(Some(self.index()), reason);
        reason
    }

    /// Stop after a fatal error of this stage: tell both neighbors, then the
    /// whole pipeline.
    pub(crate) fn fail(&mut self, reason: TerminationReason) -> TerminationReason {
        self.link.notify_abort();
        self.ctx.pipeline().fail(self.index(), reason);
        reason
    }

    /// Why this stage stops on a pipeline abort it did not raise.
    pub(crate) fn abort_reason(&self) -> TerminationReason {
        if self.ctx.pipeline().is_interrupted() {
            TerminationReason::Interrupted
        } else {
            TerminationReason::NeighborAborted
        }
    }

    fn next_work<R: StageRole>(&mut self, role: &mut R) -> Step {
        let wait = {
            let pipeline = self.ctx.pipeline();
            self.link.wait_work(|| pipeline.is_aborting())
        };

        if let Some(request) = self.ctx.control().take_restart() {
            let result = role.restart(request.options, &self.ctx);
            let failed = result.is_err();
            match &result {
                Ok(()) => {
                    info!(stage = self.index(), plugin = role.name(), "stage restarted");
                    self.ctx.pipeline().emit(ProgressEvent::StageRestarted {
                        index: self.index(),
                        name: role.name(),
                    });
                }
                Err(e) => error!(stage = self.index(), error = %e, "stage restart failed"),
            }
            let _ = request.reply.send(result);
            if failed {
                return Step::Stop(self.fail(TerminationReason::RestartFailure));
            }
        }

        if wait.timed_out {
            warn!(stage = self.index(), "stage timed out waiting for packets");
            return Step::Stop(self.fail(TerminationReason::Timeout));
        }

        if self.ctx.is_aborting() {
            return Step::Stop(self.abort_reason());
        }

        if wait.downstream_aborted && R::KIND != StageKind::Output {
            debug!(stage = self.index(), "downstream stage aborted");
            self.link.notify_upstream();
            return Step::Stop(TerminationReason::NeighborAborted);
        }
        if wait.upstream_aborted {
            debug!(stage = self.index(), "upstream stage aborted");
            self.link.notify_downstream();
            return Step::Stop(TerminationReason::NeighborAborted);
        }

        if wait.count == 0 && wait.input_end {
            if R::KIND != StageKind::Output {
                self.link.pass_end(wait.bitrate);
            }
            return Step::Stop(TerminationReason::EndOfStream);
        }

        let mut count = wait.count.min(R::batch_limit(&self.config));
        let mut input_end = wait.input_end && count == wait.count;
        let mut joint_stop = false;

        if let Some(limit) = self.ctx.joint_limit() {
            let total = self.total();
            if total + count as u64 >= limit {
                count = limit.saturating_sub(total) as usize;
                joint_stop = true;
                input_end = false;
            }
        }

        if count == 0 && !joint_stop {
            return Step::Idle;
        }

        Step::Work(Work {
            grant: self.link.grant(count),
            bitrate: wait.bitrate,
            input_end,
            joint_stop,
        })
    }

    fn finish<R: StageRole>(&mut self, role: &mut R, reason: TerminationReason) -> StageReport {
        self.ctx.cast_implicit_vote(self.total());
        let mut reason = reason;
        if let Err(e) = role.stop(&self.ctx) {
            error!(stage = self.index(), plugin = role.name(), error = %e, "plugin stop failed");
            // Data lost on stop, e.g. an unflushed output.
            if reason.is_clean() {
                reason = TerminationReason::PluginFailure;
                self.ctx.pipeline().fail(self.index(), reason);
            }
        }
        self.ctx.control().close_restart();
        self.ctx.pipeline().record_termination(Some(self.index()), reason);

        let report = StageReport {
            stats: self.ctx.control().stats(),
            reason,
        };
        info!(
            stage = self.index(),
            kind = %R::KIND,
            plugin = role.name(),
            plugin_packets = report.stats.plugin_packets,
            passthrough_packets = report.stats.passthrough_packets,
            %reason,
            "stage terminated"
        );
        self.ctx
            .pipeline()
            .emit(ProgressEvent::StageTerminated(report.clone()));
        report
    }
}

impl Drop for StageCore {
    fn drop(&mut self) {
        self.ctx.control().close_restart();
        if std::thread::panicking() {
            error!(stage = self.index(), "stage thread panicked");
            self.link.notify_abort();
            self.ctx
                .pipeline()
                .fail(self.index(), TerminationReason::PluginFailure);
        }
    }
}

/// Body of a stage thread.
pub(crate) fn run_stage<R: StageRole>(mut core: StageCore, mut role: R) -> StageReport {
    debug!(stage = core.index(), kind = %R::KIND, plugin = role.name(), "stage thread started");

    let reason = loop {
        match core.next_work(&mut role) {
            Step::Work(work) => {
                if let Some(reason) = role.run_batch(&mut core, work) {
                    break reason;
                }
            }
            Step::Idle => continue,
            Step::Stop(reason) => break reason,
        }
    };

    core.finish(&mut role, reason)
}

/// Maximal runs of dropped or non-dropped packets, in order.
pub(crate) struct Runs<'a> {
    packets: &'a [TsPacket],
    start: usize,
}

impl<'a> Runs<'a> {
    pub(crate) fn new(packets: &'a [TsPacket]) -> Self {
        Self { packets, start: 0 }
    }
}

impl Iterator for Runs<'_> {
    /// (range, dropped)
    type Item = (Range<usize>, bool);

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.packets.get(self.start)?;
        let dropped = first.is_dropped();
        let len = self.packets[self.start..]
            .iter()
            .position(|p| p.is_dropped() != dropped)
            .unwrap_or(self.packets.len() - self.start);
        let range = self.start..self.start + len;
        self.start = range.end;
        Some((range, dropped))
    }
}

/// Split runs for a role that must not see dropped markers.
pub(crate) fn runs(packets: &[TsPacket]) -> Vec<(Range<usize>, bool)> {
    Runs::new(packets).collect()
}
