//! Joint termination coordination.
//!
//! Plugins that opt in are "users". A user that wants the stream to end votes
//! with the position (packets seen by its stage) at which it is done. Once all
//! registered users have voted, the smallest vote becomes the pipeline-wide
//! limit and the output stage stops after exactly that many packets.
//!
//! Registration happens from plugin `start` hooks, so the limit is only
//! allowed to freeze after the pipeline is armed, that is after every plugin
//! has been started.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

const NO_LIMIT: u64 = u64::MAX;

#[derive(Debug, Default)]
struct JointState {
    users: usize,
    voted: usize,
    lowest: Option<u64>,
    armed: bool,
}

#[derive(Debug)]
pub struct JointTermination {
    state: Mutex<JointState>,
    limit: AtomicU64,
}

impl Default for JointTermination {
    fn default() -> Self {
        Self::new()
    }
}

impl JointTermination {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(JointState::default()),
            limit: AtomicU64::new(NO_LIMIT),
        }
    }

    pub(crate) fn register(&self) {
        let mut state = self.state.lock();
        state.users += 1;
        debug!(users = state.users, "joint termination user registered");
    }

    /// Record a vote at `position`. Each user votes once; the caller tracks it.
    pub(crate) fn vote(&self, position: u64) -> Option<u64> {
        let mut state = self.state.lock();
        state.voted += 1;
        state.lowest = Some(state.lowest.map_or(position, |low| low.min(position)));
        debug!(
            position,
            voted = state.voted,
            users = state.users,
            "joint termination vote"
        );
        self.try_freeze(&state)
    }

    /// Allow the limit to freeze. Called once all plugins are started.
    pub(crate) fn arm(&self) -> Option<u64> {
        let mut state = self.state.lock();
        state.armed = true;
        self.try_freeze(&state)
    }

    fn try_freeze(&self, state: &JointState) -> Option<u64> {
        if !state.armed || state.users == 0 || state.voted < state.users {
            return None;
        }
        let lowest = state.lowest?;
        if self.limit.load(Ordering::Acquire) == NO_LIMIT {
            self.limit.store(lowest, Ordering::Release);
            info!(
                limit = lowest,
                users = state.users,
                "all joint termination users voted, stream ends at packet {}",
                lowest
            );
            return Some(lowest);
        }
        None
    }

    /// The frozen packet limit, once every user has voted.
    pub fn limit(&self) -> Option<u64> {
        match self.limit.load(Ordering::Acquire) {
            NO_LIMIT => None,
            limit => Some(limit),
        }
    }

    pub fn users(&self) -> usize {
        self.state.lock().users
    }
}
