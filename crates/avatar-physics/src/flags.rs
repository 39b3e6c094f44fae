//! Collision groups and masks.
//!
//! Every collision object belongs to one group; a mask lists the groups an
//! object (or a ray) collides with. The local avatar changes its own mask at
//! runtime to go collisionless or to ignore other avatars.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CollisionGroup(pub u32);

impl CollisionGroup {
    pub const NONE: Self = Self(0);

    /// The locally controlled avatar.
    pub const MY_AVATAR: Self = Self(1 << 0);

    /// Avatars driven by remote users.
    pub const OTHER_AVATAR: Self = Self(1 << 1);

    /// Immovable world geometry.
    pub const STATIC: Self = Self(1 << 2);

    /// Simulated entities.
    pub const DYNAMIC: Self = Self(1 << 3);

    /// Script-animated entities.
    pub const KINEMATIC: Self = Self(1 << 4);

    /// Group of an object that collides with nothing.
    pub const COLLISIONLESS: Self = Self(1 << 5);

    /// Everything the local avatar stands on or bumps into.
    pub const MASK_MY_AVATAR: Self = Self(Self::STATIC.0 | Self::DYNAMIC.0 | Self::KINEMATIC.0 | Self::OTHER_AVATAR.0);

    /// Local avatar mask with other avatars filtered out.
    pub const MASK_MY_AVATAR_NO_OTHERS: Self = Self(Self::STATIC.0 | Self::DYNAMIC.0 | Self::KINEMATIC.0);

    /// Collides with nothing.
    pub const MASK_COLLISIONLESS: Self = Self::NONE;

    /// Rays that look for floors, steps and walls.
    pub const MASK_ENVIRONMENT: Self = Self(Self::STATIC.0 | Self::DYNAMIC.0 | Self::KINEMATIC.0);

    /// Check if these flags contain every flag in `other`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if any of the given flags are set.
    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CollisionGroup {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for CollisionGroup {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_masks() {
        assert!(CollisionGroup::MASK_MY_AVATAR.intersects(CollisionGroup::OTHER_AVATAR));
        assert!(!CollisionGroup::MASK_MY_AVATAR_NO_OTHERS.intersects(CollisionGroup::OTHER_AVATAR));
        assert!(CollisionGroup::MASK_MY_AVATAR.contains(CollisionGroup::MASK_MY_AVATAR_NO_OTHERS));
        assert!(CollisionGroup::MASK_COLLISIONLESS.is_empty());
    }

    #[test]
    fn set_operations() {
        let mask = CollisionGroup::STATIC | CollisionGroup::DYNAMIC;
        assert_eq!(mask.difference(CollisionGroup::DYNAMIC), CollisionGroup::STATIC);
        assert_eq!(mask & CollisionGroup::STATIC, CollisionGroup::STATIC);
        assert_eq!(CollisionGroup::NONE.union(CollisionGroup::KINEMATIC), CollisionGroup::KINEMATIC);
    }
}
