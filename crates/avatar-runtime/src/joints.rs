//! Pinned joints.
//!
//! A joint pinned by a script holds a world pose until it is unpinned. The
//! records live in a fixed arena indexed by [`Action`] and are only touched
//! from the thread that owns the avatar; debug builds assert that.

use std::thread::{self, ThreadId};

use avatar_types::Action;
use glam::{Quat, Vec3};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinnedJoint {
    pub position: Vec3,
    pub rotation: Quat,
}

#[derive(Debug, Clone)]
pub struct PinnedJoints {
    records: Vec<Option<PinnedJoint>>,
    owner: ThreadId,
}

impl Default for PinnedJoints {
    fn default() -> Self {
        Self::new()
    }
}

/// Variants are declared in `Action::ALL` order.
fn slot(joint: Action) -> usize {
    joint as usize
}

impl PinnedJoints {
    /// Arena owned by the calling thread.
    pub fn new() -> Self {
        Self {
            records: vec![None; Action::ALL.len()],
            owner: thread::current().id(),
        }
    }

    fn assert_owner(&self) {
        debug_assert_eq!(thread::current().id(), self.owner, "pinned joints touched off the owning thread");
    }

    /// Only the hips can be pinned. Returns `false` for any other joint.
    pub fn pin(&mut self, joint: Action, position: Vec3, rotation: Quat) -> bool {
        self.assert_owner();
        if joint != Action::Hips {
            debug!(?joint, "only the hips can be pinned");
            return false;
        }
        self.records[slot(joint)] = Some(PinnedJoint { position, rotation });
        true
    }

    /// Returns `true` if the joint was pinned.
    pub fn unpin(&mut self, joint: Action) -> bool {
        self.assert_owner();
        self.records[slot(joint)].take().is_some()
    }

    pub fn get(&self, joint: Action) -> Option<PinnedJoint> {
        self.assert_owner();
        self.records[slot(joint)]
    }

    pub fn is_pinned(&self, joint: Action) -> bool {
        self.get(joint).is_some()
    }

    pub fn clear(&mut self) {
        self.assert_owner();
        self.records.iter_mut().for_each(|r| *r = None);
    }
}
