//! Capabilities common to every avatar in the scene.
//!
//! The local avatar is simulated; other avatars only mirror snapshots
//! received from the network. Rendering and proximity code works against
//! [`AvatarBody`] and does not care which one it holds.

use avatar_physics::{EntityQuery, PhysicsEngine};
use avatar_types::{AvatarError, CharacterState};
use chrono::{DateTime, Utc};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::avatar::LocalAvatar;

pub trait AvatarBody {
    fn id(&self) -> Uuid;
    fn world_position(&self) -> Vec3;
    fn world_orientation(&self) -> Quat;
    fn character_state(&self) -> CharacterState;
    fn scale(&self) -> f32;
    fn is_local(&self) -> bool;

    fn snapshot(&self) -> AvatarSnapshot {
        AvatarSnapshot {
            id: self.id(),
            position: self.world_position(),
            orientation: self.world_orientation(),
            state: self.character_state(),
            scale: self.scale(),
            timestamp: Utc::now(),
        }
    }
}

/// Network-facing pose of one avatar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarSnapshot {
    pub id: Uuid,
    pub position: Vec3,
    pub orientation: Quat,
    pub state: CharacterState,
    pub scale: f32,
    pub timestamp: DateTime<Utc>,
}

impl AvatarSnapshot {
    pub fn to_json(&self) -> Result<String, AvatarError> {
        serde_json::to_string(self).map_err(|e| AvatarError::Channel(format!("avatar snapshot encode failed: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self, AvatarError> {
        serde_json::from_str(json).map_err(|e| AvatarError::Channel(format!("malformed avatar snapshot: {e}")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Remote avatars
// ────────────────────────────────────────────────────────────────────────────

/// An avatar driven by someone else; holds the newest snapshot received.
#[derive(Debug, Clone, PartialEq)]
pub struct OtherAvatar {
    id: Uuid,
    position: Vec3,
    orientation: Quat,
    state: CharacterState,
    scale: f32,
    last_update: Option<DateTime<Utc>>,
}

impl OtherAvatar {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            state: CharacterState::Ground,
            scale: 1.0,
            last_update: None,
        }
    }

    pub fn from_snapshot(snapshot: &AvatarSnapshot) -> Self {
        let mut avatar = Self::new(snapshot.id);
        avatar.apply(snapshot);
        avatar
    }

    /// Adopt `snapshot` unless it is for another avatar, older than the
    /// current one, or carries a non-finite pose.
    pub fn apply(&mut self, snapshot: &AvatarSnapshot) -> bool {
        if snapshot.id != self.id {
            return false;
        }
        if self.last_update.is_some_and(|last| snapshot.timestamp < last) {
            debug!(id = %self.id, "dropping stale avatar snapshot");
            return false;
        }
        if !snapshot.position.is_finite() || !snapshot.orientation.is_finite() || !snapshot.scale.is_finite() {
            debug!(id = %self.id, "dropping non-finite avatar snapshot");
            return false;
        }
        self.position = snapshot.position;
        self.orientation = snapshot.orientation.normalize();
        self.state = snapshot.state;
        self.scale = snapshot.scale;
        self.last_update = Some(snapshot.timestamp);
        true
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}

impl AvatarBody for OtherAvatar {
    fn id(&self) -> Uuid {
        self.id
    }

    fn world_position(&self) -> Vec3 {
        self.position
    }

    fn world_orientation(&self) -> Quat {
        self.orientation
    }

    fn character_state(&self) -> CharacterState {
        self.state
    }

    fn scale(&self) -> f32 {
        self.scale
    }

    fn is_local(&self) -> bool {
        false
    }
}

impl<W: PhysicsEngine + EntityQuery> AvatarBody for LocalAvatar<W> {
    fn id(&self) -> Uuid {
        LocalAvatar::id(self)
    }

    fn world_position(&self) -> Vec3 {
        self.position()
    }

    fn world_orientation(&self) -> Quat {
        self.orientation()
    }

    fn character_state(&self) -> CharacterState {
        self.state()
    }

    fn scale(&self) -> f32 {
        LocalAvatar::scale(self)
    }

    fn is_local(&self) -> bool {
        true
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scene entries
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AvatarInstance<W: PhysicsEngine + EntityQuery> {
    Local(Box<LocalAvatar<W>>),
    Other(OtherAvatar),
}

impl<W: PhysicsEngine + EntityQuery> AvatarInstance<W> {
    pub fn as_local_mut(&mut self) -> Option<&mut LocalAvatar<W>> {
        match self {
            Self::Local(avatar) => Some(avatar),
            Self::Other(_) => None,
        }
    }

    pub fn as_other_mut(&mut self) -> Option<&mut OtherAvatar> {
        match self {
            Self::Local(_) => None,
            Self::Other(avatar) => Some(avatar),
        }
    }

    fn body(&self) -> &dyn AvatarBody {
        match self {
            Self::Local(avatar) => &**avatar,
            Self::Other(avatar) => avatar,
        }
    }
}

impl<W: PhysicsEngine + EntityQuery> AvatarBody for AvatarInstance<W> {
    fn id(&self) -> Uuid {
        self.body().id()
    }

    fn world_position(&self) -> Vec3 {
        self.body().world_position()
    }

    fn world_orientation(&self) -> Quat {
        self.body().world_orientation()
    }

    fn character_state(&self) -> CharacterState {
        self.body().character_state()
    }

    fn scale(&self) -> f32 {
        self.body().scale()
    }

    fn is_local(&self) -> bool {
        self.body().is_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AvatarConfig;
    use crate::rig::RecordingRig;
    use avatar_middleware::EventBus;
    use avatar_perception::SharedInput;
    use avatar_physics::SimWorld;
    use chrono::Duration;
    use std::sync::Arc;

    fn snapshot(id: Uuid, x: f32) -> AvatarSnapshot {
        AvatarSnapshot {
            id,
            position: Vec3::new(x, 1.0, 0.0),
            orientation: Quat::IDENTITY,
            state: CharacterState::InAir,
            scale: 1.5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn other_avatar_ignores_stale_and_foreign_snapshots() {
        let id = Uuid::new_v4();
        let fresh = snapshot(id, 2.0);
        let mut other = OtherAvatar::from_snapshot(&fresh);
        assert_eq!(other.world_position(), Vec3::new(2.0, 1.0, 0.0));
        assert_eq!(other.character_state(), CharacterState::InAir);

        let stale = AvatarSnapshot {
            timestamp: fresh.timestamp - Duration::seconds(1),
            ..snapshot(id, 9.0)
        };
        assert!(!other.apply(&stale));
        assert!(!other.apply(&snapshot(Uuid::new_v4(), 9.0)));
        assert!(!other.apply(&snapshot(id, f32::NAN)));
        assert_eq!(other.world_position().x, 2.0);
    }

    #[test]
    fn snapshot_survives_json() {
        let original = snapshot(Uuid::new_v4(), 3.0);
        let json = original.to_json().expect("encode");
        assert_eq!(AvatarSnapshot::from_json(&json).expect("decode"), original);
        assert!(matches!(AvatarSnapshot::from_json("{"), Err(AvatarError::Channel(_))));
    }

    #[test]
    fn scene_mixes_local_and_other_avatars() {
        let local = LocalAvatar::new(
            AvatarConfig::default(),
            Arc::new(SharedInput::new()),
            SimWorld::new().with_floor(0.0),
            Box::new(RecordingRig::new()),
            EventBus::default(),
        )
        .expect("valid avatar");
        let local_id = local.id();
        let mut scene = vec![
            AvatarInstance::Local(Box::new(local)),
            AvatarInstance::Other(OtherAvatar::from_snapshot(&snapshot(Uuid::new_v4(), 4.0))),
        ];

        for avatar in scene.iter_mut().filter_map(AvatarInstance::as_local_mut) {
            avatar.update(1.0 / 90.0).expect("tick");
        }

        let locals: Vec<Uuid> = scene.iter().filter(|a| a.is_local()).map(|a| a.id()).collect();
        assert_eq!(locals, vec![local_id]);
        let snap = scene[1].snapshot();
        assert_eq!(snap.position.x, 4.0);
        assert_eq!(snap.scale, 1.5);
        assert!(scene[0].snapshot().position.is_finite());
    }
}
