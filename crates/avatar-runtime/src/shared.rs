//! State shared with threads other than the simulation thread.
//!
//! - [`HoldActions`]: entities held in a hand, edited by scripts. The tick
//!   reads them with a try-lock and skips the frame on contention.
//! - [`EntityDataStore`]: opaque avatar-entity blobs, written on the main
//!   thread and read by the network send path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};

use avatar_types::Action;
use glam::{Quat, Vec3};
use tracing::warn;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Hold actions
// ────────────────────────────────────────────────────────────────────────────

/// An entity held relative to one hand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldAction {
    pub entity: Uuid,
    /// [`Action::LeftHand`] or [`Action::RightHand`].
    pub hand: Action,
    /// Offset from the hand in hand-local space, scaled with the avatar.
    pub offset: Vec3,
    pub rotation_offset: Quat,
}

impl HoldAction {
    pub fn new(entity: Uuid, hand: Action, offset: Vec3, rotation_offset: Quat) -> Self {
        Self {
            entity,
            hand,
            offset,
            rotation_offset,
        }
    }

    /// World target given the hand's world pose and the avatar scale.
    pub fn target(&self, hand_position: Vec3, hand_rotation: Quat, scale: f32) -> (Vec3, Quat) {
        (
            hand_position + hand_rotation * (self.offset * scale),
            (hand_rotation * self.rotation_offset).normalize(),
        )
    }
}

/// Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct HoldActions {
    inner: Arc<Mutex<Vec<HoldAction>>>,
}

impl HoldActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the hold on `action.entity`.
    pub fn hold(&self, action: HoldAction) {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|held| held.entity != action.entity);
        list.push(action);
    }

    /// Returns `true` if the entity was held.
    pub fn release(&self, entity: Uuid) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = list.len();
        list.retain(|held| held.entity != entity);
        list.len() != before
    }

    /// Snapshot without blocking; `None` when a writer holds the lock or it
    /// is poisoned.
    pub fn try_snapshot(&self) -> Option<Vec<HoldAction>> {
        match self.inner.try_lock() {
            Ok(list) => Some(list.clone()),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => {
                warn!("hold action list poisoned; skipping frame");
                None
            }
        }
    }

    /// Hold the lock until the guard drops.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HoldAction>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Avatar-entity data
// ────────────────────────────────────────────────────────────────────────────

/// Entity id → serialized entity properties. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct EntityDataStore {
    inner: Arc<RwLock<HashMap<Uuid, Vec<u8>>>>,
}

impl EntityDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity: Uuid, data: Vec<u8>) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(entity, data);
    }

    pub fn remove(&self, entity: Uuid) -> Option<Vec<u8>> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(&entity)
    }

    pub fn get(&self, entity: Uuid) -> Option<Vec<u8>> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&entity).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, sorted by id, for a network send.
    pub fn snapshot(&self) -> Vec<(Uuid, Vec<u8>)> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = map.iter().map(|(id, data)| (*id, data.clone())).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn holding_same_entity_replaces_it() {
        let holds = HoldActions::new();
        let id = Uuid::new_v4();
        holds.hold(HoldAction::new(id, Action::LeftHand, Vec3::X, Quat::IDENTITY));
        holds.hold(HoldAction::new(id, Action::RightHand, Vec3::Y, Quat::IDENTITY));
        let list = holds.try_snapshot().expect("uncontended");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].hand, Action::RightHand);
        assert!(holds.release(id));
        assert!(!holds.release(id));
    }

    #[test]
    fn contended_snapshot_skips() {
        let holds = HoldActions::new();
        let guard = holds.lock();
        assert!(holds.try_snapshot().is_none());
        drop(guard);
        assert!(holds.try_snapshot().is_some());
    }

    #[test]
    fn poisoned_list_is_skipped() {
        let holds = HoldActions::new();
        let writer = holds.clone();
        let _ = thread::spawn(move || {
            let _guard = writer.lock();
            panic!("script thread died mid-edit");
        })
        .join();
        assert!(holds.try_snapshot().is_none());
    }

    #[test]
    fn hold_target_applies_scaled_offset() {
        let hold = HoldAction::new(Uuid::new_v4(), Action::RightHand, Vec3::new(0.0, 0.0, -0.1), Quat::IDENTITY);
        let (position, rotation) = hold.target(Vec3::new(1.0, 1.0, 0.0), Quat::from_rotation_y(std::f32::consts::FRAC_PI_2), 2.0);
        assert!((position - Vec3::new(0.8, 1.0, 0.0)).length() < 1e-5, "{position}");
        assert!(rotation.abs_diff_eq(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2), 1e-5));
    }

    #[test]
    fn entity_data_is_readable_from_another_thread() {
        let store = EntityDataStore::new();
        let id = Uuid::new_v4();
        store.set(id, vec![1, 2, 3]);
        let reader = store.clone();
        let snapshot = thread::spawn(move || reader.snapshot()).join().expect("reader thread");
        assert_eq!(snapshot, vec![(id, vec![1, 2, 3])]);
        assert_eq!(store.remove(id), Some(vec![1, 2, 3]));
        assert!(store.is_empty());
    }
}
