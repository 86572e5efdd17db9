//! # Stage links
//!
//! Each stage owns one inbound queue. Three kinds of messages arrive on it:
//!
//! - [`Handoff`] descriptors from the upstream neighbor, transferring ownership
//!   of the next `count` slots after the range the stage already owns. For the
//!   input stage, the upstream neighbor is the output stage returning emptied
//!   slots, which closes the ring.
//! - `Abort` from the downstream neighbor: it stopped and will not accept more
//!   packets.
//! - `Wake` from the controller: a restart, suspend or abort request is
//!   pending and must be looked at now.
//!
//! Only range boundaries and flags travel through the queue; packet payloads
//! stay in the ring.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::trace;

use crate::BitRate;
use crate::ring::RangeGrant;

/// Ownership transfer of `count` slots starting at `first`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handoff {
    pub first: usize,
    pub count: usize,
    pub bitrate: BitRate,
    /// No packet will follow this range
    pub input_end: bool,
    /// The sender stopped abnormally
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum LinkMessage {
    Handoff(Handoff),
    Abort,
    Wake,
}

/// Result of [`StageLink::wait_work`].
#[derive(Debug)]
pub(crate) struct WaitResult {
    /// Index of the first owned slot
    pub first: usize,
    /// Contiguous packets available from `first`, capped at the end of the ring
    pub count: usize,
    pub bitrate: BitRate,
    /// End of input follows the returned range
    pub input_end: bool,
    /// The upstream neighbor aborted
    pub upstream_aborted: bool,
    /// The downstream neighbor stopped accepting packets
    pub downstream_aborted: bool,
    pub timed_out: bool,
}

pub(crate) struct StageLink {
    capacity: usize,
    inbound: Receiver<LinkMessage>,
    downstream: Sender<LinkMessage>,
    /// `None` for the input stage, which never pushes back on the output
    upstream: Option<Sender<LinkMessage>>,
    /// Whether a downstream abort makes `pass_packets` report a refusal.
    /// The output stage hands slots back to the input and ignores it.
    honor_refusal: bool,
    timeout: Option<Duration>,

    first: usize,
    count: usize,
    bitrate: BitRate,
    input_end: bool,
    upstream_aborted: bool,
    downstream_aborted: bool,
    woken: bool,
}

impl StageLink {
    pub(crate) fn new(
        capacity: usize,
        owned: usize,
        inbound: Receiver<LinkMessage>,
        downstream: Sender<LinkMessage>,
        upstream: Option<Sender<LinkMessage>>,
        honor_refusal: bool,
        timeout: Option<Duration>,
    ) -> Self {
        debug_assert!(owned <= capacity);
        Self {
            capacity,
            inbound,
            downstream,
            upstream,
            honor_refusal,
            timeout,
            first: 0,
            count: owned,
            bitrate: BitRate::UNKNOWN,
            input_end: false,
            upstream_aborted: false,
            downstream_aborted: false,
            woken: false,
        }
    }

    /// Packets currently owned by the stage, across a possible wrap.
    pub(crate) fn owned(&self) -> usize {
        self.count
    }

    fn apply(&mut self, message: LinkMessage) {
        match message {
            LinkMessage::Handoff(handoff) => {
                debug_assert_eq!(
                    handoff.first,
                    (self.first + self.count) % self.capacity,
                    "handoff is not contiguous with the owned range"
                );
                self.count += handoff.count;
                self.bitrate = handoff.bitrate;
                self.input_end |= handoff.input_end;
                self.upstream_aborted |= handoff.aborted;
            }
            LinkMessage::Abort => self.downstream_aborted = true,
            LinkMessage::Wake => self.woken = true,
        }
    }

    fn drain(&mut self) {
        loop {
            match self.inbound.try_recv() {
                Ok(message) => self.apply(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.upstream_aborted = true;
                    break;
                }
            }
        }
    }

    fn has_work(&self, aborting: bool) -> bool {
        self.count > 0
            || self.input_end
            || self.upstream_aborted
            || self.downstream_aborted
            || self.woken
            || aborting
    }

    /// Block until there is something for the stage to do.
    ///
    /// `aborting` is polled after every wake-up; the controller always sends a
    /// `Wake` after raising the pipeline abort flag.
    pub(crate) fn wait_work(&mut self, aborting: impl Fn() -> bool) -> WaitResult {
        let mut timed_out = false;
        self.drain();

        while !self.has_work(aborting()) {
            let received = match self.timeout {
                Some(timeout) => self.inbound.recv_timeout(timeout),
                None => self
                    .inbound
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(message) => {
                    self.apply(message);
                    self.drain();
                }
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.upstream_aborted = true;
                    break;
                }
            }
        }

        self.woken = false;
        let count = self.count.min(self.capacity - self.first);
        WaitResult {
            first: self.first,
            count,
            bitrate: self.bitrate,
            input_end: self.input_end && count == self.count,
            upstream_aborted: self.upstream_aborted,
            downstream_aborted: self.downstream_aborted,
            timed_out,
        }
    }

    /// Grant access to the first `len` owned slots.
    pub(crate) fn grant(&self, len: usize) -> RangeGrant {
        debug_assert!(len <= self.count.min(self.capacity - self.first));
        RangeGrant::new(self.first, len)
    }

    fn publish(&mut self, count: usize, bitrate: BitRate, input_end: bool, aborted: bool) {
        let first = self.first;
        self.first = (self.first + count) % self.capacity;
        self.count -= count;

        if count > 0 || input_end || aborted {
            trace!(first, count, input_end, aborted, "handoff");
            // A send error means the neighbor already exited; nothing to notify.
            let _ = self.downstream.send(LinkMessage::Handoff(Handoff {
                first,
                count,
                bitrate,
                input_end,
                aborted,
            }));
        }
        if aborted {
            self.notify_upstream();
        }
    }

    /// Hand the first `count` packets of `grant` to the downstream stage.
    ///
    /// Returns `false` when the pipeline must stop at this stage: the caller
    /// aborted, or the downstream stage refused further packets.
    pub(crate) fn pass_packets(
        &mut self,
        grant: RangeGrant,
        count: usize,
        bitrate: BitRate,
        input_end: bool,
        aborted: bool,
    ) -> bool {
        debug_assert_eq!(grant.first(), self.first);
        assert!(count <= grant.len(), "cannot pass more packets than granted");
        self.publish(count, bitrate, input_end, aborted);
        let refused = self.honor_refusal && self.downstream_aborted;
        !(aborted || refused)
    }

    /// Signal end of input downstream without passing packets.
    pub(crate) fn pass_end(&mut self, bitrate: BitRate) {
        self.publish(0, bitrate, true, false);
    }

    /// Tell the upstream stage to stop sending.
    pub(crate) fn notify_upstream(&self) {
        if let Some(upstream) = &self.upstream {
            let _ = upstream.send(LinkMessage::Abort);
        }
    }

    /// Tell the downstream stage that no more packets will come, abnormally.
    pub(crate) fn notify_downstream(&mut self) {
        self.publish(0, BitRate::UNKNOWN, false, true);
    }

    /// Notify both neighbors of an abort.
    pub(crate) fn notify_abort(&mut self) {
        // `publish` with `aborted` also notifies upstream.
        self.notify_downstream();
    }
}
