//! Pipeline and stage context
//!
//! [`PipelineContext`] holds the process-wide state of one running pipeline:
//! the abort flag, the bitrate cell, the joint termination coordinator and the
//! first recorded termination. It is owned by the controller and shared with
//! every stage through an `Arc`.
//!
//! [`StageContext`] is what a plugin sees of its stage: its position in the
//! chain, its packet position, the current bitrate, and the joint termination
//! and abort controls.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::link::LinkMessage;
use crate::plugin::{InputAborter, PluginError, PluginOptions};
use crate::progress::{OnProgress, ProgressEvent, StageKind, StageStats, TerminationReason};
use crate::{BitRate, JointTermination};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Termination {
    pub stage: Option<usize>,
    pub reason: TerminationReason,
}

pub(crate) struct PipelineContext {
    pub name: String,
    aborting: AtomicBool,
    interrupted: AtomicBool,
    bitrate: AtomicU64,
    pub joint: JointTermination,
    wakers: Vec<Sender<LinkMessage>>,
    termination: Mutex<Option<Termination>>,
    input_aborter: Mutex<Option<InputAborter>>,
    on_progress: Option<OnProgress>,
}

impl PipelineContext {
    pub(crate) fn new(
        name: String,
        wakers: Vec<Sender<LinkMessage>>,
        on_progress: Option<OnProgress>,
    ) -> Self {
        Self {
            name,
            aborting: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            bitrate: AtomicU64::new(0),
            joint: JointTermination::new(),
            wakers,
            termination: Mutex::new(None),
            input_aborter: Mutex::new(None),
            on_progress,
        }
    }

    pub(crate) fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Raise the abort flag and wake every stage. Only the first call has an
    /// effect.
    pub(crate) fn raise_abort(&self) {
        if self.aborting.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(pipeline = %self.name, "abort raised");
        for waker in &self.wakers {
            let _ = waker.send(LinkMessage::Wake);
        }
        self.abort_input();
    }

    /// Install the aborter of the current input plugin. Fires at once if the
    /// pipeline is already aborting.
    pub(crate) fn set_input_aborter(&self, aborter: Option<InputAborter>) {
        *self.input_aborter.lock() = aborter;
        if self.is_aborting() {
            self.abort_input();
        }
    }

    /// Release an input blocked in `receive`.
    fn abort_input(&self) {
        let aborter = self.input_aborter.lock().clone();
        if let Some(aborter) = aborter {
            debug!(pipeline = %self.name, "aborting input");
            aborter();
        }
    }

    /// Abort requested from outside the pipeline.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.record_termination(None, TerminationReason::Interrupted);
        self.raise_abort();
    }

    /// A stage failed: record it as the initiator and abort everything.
    pub(crate) fn fail(&self, stage: usize, reason: TerminationReason) {
        self.record_termination(Some(stage), reason);
        self.raise_abort();
    }

    /// Keep the first meaningful termination. A failure replaces an earlier
    /// clean end; following a neighbor is never recorded.
    pub(crate) fn record_termination(&self, stage: Option<usize>, reason: TerminationReason) {
        if reason == TerminationReason::NeighborAborted {
            return;
        }
        let mut termination = self.termination.lock();
        let replace = match *termination {
            None => true,
            Some(current) => current.reason.is_clean() && !reason.is_clean(),
        };
        if replace {
            *termination = Some(Termination { stage, reason });
        }
    }

    pub(crate) fn termination(&self) -> Option<Termination> {
        *self.termination.lock()
    }

    pub(crate) fn bitrate(&self) -> BitRate {
        BitRate::new(self.bitrate.load(Ordering::Acquire))
    }

    pub(crate) fn set_bitrate(&self, bitrate: BitRate) {
        let previous = self
            .bitrate
            .swap(bitrate.bits_per_second(), Ordering::AcqRel);
        if previous != bitrate.bits_per_second() {
            debug!(pipeline = %self.name, %bitrate, "bitrate changed");
            self.emit(ProgressEvent::BitRateChanged { bitrate });
        }
    }

    pub(crate) fn wake(&self, stage: usize) {
        if let Some(waker) = self.wakers.get(stage) {
            let _ = waker.send(LinkMessage::Wake);
        }
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.on_progress {
            callback(event);
        }
    }
}

/// A pending restart, answered by the stage thread.
pub(crate) struct RestartRequest {
    pub options: PluginOptions,
    pub reply: Sender<Result<(), PluginError>>,
}

#[derive(Default)]
struct RestartSlot {
    pending: Option<RestartRequest>,
    closed: bool,
}

/// State of one stage shared between its thread and the controller.
pub(crate) struct StageControl {
    pub index: usize,
    pub kind: StageKind,
    pub restartable: bool,
    name: Mutex<&'static str>,
    plugin_packets: AtomicU64,
    passthrough_packets: AtomicU64,
    suspended: AtomicBool,
    restart: Mutex<RestartSlot>,
}

impl StageControl {
    pub(crate) fn new(index: usize, kind: StageKind, name: &'static str, restartable: bool) -> Self {
        Self {
            index,
            kind,
            restartable,
            name: Mutex::new(name),
            plugin_packets: AtomicU64::new(0),
            passthrough_packets: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            restart: Mutex::new(RestartSlot::default()),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        *self.name.lock()
    }

    pub(crate) fn set_name(&self, name: &'static str) {
        *self.name.lock() = name;
    }

    pub(crate) fn add_plugin_packets(&self, count: usize) {
        self.plugin_packets
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_passthrough_packets(&self, count: usize) {
        self.passthrough_packets
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn total_packets(&self) -> u64 {
        self.plugin_packets.load(Ordering::Relaxed)
            + self.passthrough_packets.load(Ordering::Relaxed)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub(crate) fn stats(&self) -> StageStats {
        StageStats {
            index: self.index,
            kind: self.kind,
            name: self.name(),
            plugin_packets: self.plugin_packets.load(Ordering::Relaxed),
            passthrough_packets: self.passthrough_packets.load(Ordering::Relaxed),
            suspended: self.is_suspended(),
        }
    }

    /// Queue a restart. Gives the request back if the stage already exited.
    pub(crate) fn request_restart(&self, request: RestartRequest) -> Result<(), RestartRequest> {
        let mut slot = self.restart.lock();
        if slot.closed {
            return Err(request);
        }
        slot.pending = Some(request);
        Ok(())
    }

    pub(crate) fn take_restart(&self) -> Option<RestartRequest> {
        self.restart.lock().pending.take()
    }

    /// Refuse further restarts. Dropping a pending request disconnects its
    /// reply channel, which the requester reads as "not running".
    pub(crate) fn close_restart(&self) {
        let mut slot = self.restart.lock();
        slot.closed = true;
        slot.pending = None;
    }
}

/// The view of its stage given to a plugin.
pub struct StageContext {
    pipeline: Arc<PipelineContext>,
    control: Arc<StageControl>,
    position: Cell<u64>,
    batch_bitrate: Cell<BitRate>,
    joint_user: Cell<bool>,
    joint_voted: Cell<bool>,
}

impl StageContext {
    pub(crate) fn new(pipeline: Arc<PipelineContext>, control: Arc<StageControl>) -> Self {
        Self {
            pipeline,
            control,
            position: Cell::new(0),
            batch_bitrate: Cell::new(BitRate::UNKNOWN),
            joint_user: Cell::new(false),
            joint_voted: Cell::new(false),
        }
    }

    /// Index of the stage in the chain, the input being 0.
    pub fn index(&self) -> usize {
        self.control.index
    }

    pub fn kind(&self) -> StageKind {
        self.control.kind
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline.name
    }

    /// Bitrate that travelled with the current batch, or the latest pipeline
    /// bitrate when the batch carried none.
    pub fn bitrate(&self) -> BitRate {
        let batch = self.batch_bitrate.get();
        if batch.is_known() {
            batch
        } else {
            self.pipeline.bitrate()
        }
    }

    pub(crate) fn set_batch_bitrate(&self, bitrate: BitRate) {
        self.batch_bitrate.set(bitrate);
    }

    /// Packets seen by this stage before the first packet of the slice
    /// currently handed to the plugin, dropped markers included.
    pub fn total_packets(&self) -> u64 {
        self.position.get()
    }

    pub(crate) fn set_position(&self, position: u64) {
        self.position.set(position);
    }

    pub fn is_suspended(&self) -> bool {
        self.control.is_suspended()
    }

    /// Whether the pipeline is stopping.
    pub fn is_aborting(&self) -> bool {
        self.pipeline.is_aborting()
    }

    /// Register this stage as a joint termination user. Call from `start`.
    pub fn use_joint_termination(&self) {
        if self.joint_user.replace(true) {
            return;
        }
        if self.pipeline.joint.limit().is_some() {
            warn!(
                stage = self.index(),
                "joint termination limit already frozen, registration has no effect"
            );
        }
        self.pipeline.joint.register();
    }

    pub fn uses_joint_termination(&self) -> bool {
        self.joint_user.get()
    }

    /// Vote to end the stream at the current packet position.
    pub fn joint_terminate(&self) {
        self.joint_terminate_at(self.position.get());
    }

    /// Vote to end the stream once `position` packets went through the
    /// pipeline. Ignored unless registered; only the first vote counts.
    pub fn joint_terminate_at(&self, position: u64) {
        if !self.joint_user.get() || self.joint_voted.replace(true) {
            return;
        }
        if let Some(limit) = self.pipeline.joint.vote(position) {
            self.pipeline
                .emit(ProgressEvent::JointTerminationFrozen { limit });
        }
    }

    /// Current joint termination limit, if frozen.
    pub fn joint_limit(&self) -> Option<u64> {
        self.pipeline.joint.limit()
    }

    /// Abort the whole pipeline from within a plugin.
    pub fn abort(&self) {
        self.pipeline
            .fail(self.index(), TerminationReason::Interrupted);
    }

    /// A registered user that never voted agrees to stop at its final total.
    pub(crate) fn cast_implicit_vote(&self, total: u64) {
        if self.joint_user.get() && !self.joint_voted.get() {
            debug!(stage = self.index(), total, "implicit joint termination vote");
            self.joint_terminate_at(total);
        }
    }

    pub(crate) fn control(&self) -> &StageControl {
        &self.control
    }

    pub(crate) fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("index", &self.index())
            .field("kind", &self.kind())
            .field("position", &self.position.get())
            .field("joint_user", &self.joint_user.get())
            .finish()
    }
}
