//! Command queue into the simulation thread.
//!
//! Mutators that may be called from scripts, UI or network threads never
//! touch the avatar directly. They post an [`AvatarCommand`] through an
//! [`AvatarHandle`]; the owning [`LocalAvatar`](crate::avatar::LocalAvatar)
//! drains the queue once at the start of every tick.
//!
//! # Example
//!
//! ```rust
//! use avatar_runtime::commands::{AvatarCommand, CommandQueue};
//! use glam::Vec3;
//!
//! let mut queue = CommandQueue::new();
//! let handle = queue.handle();
//! std::thread::spawn(move || handle.go_to_location(Vec3::new(0.0, 2.0, 0.0), None))
//!     .join()
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(queue.drain().len(), 1);
//! ```

use avatar_perception::RigDefaults;
use avatar_types::{Action, AvatarError};
use glam::{Quat, Vec3};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::motion::ScriptedMotor;

#[derive(Debug, Clone, PartialEq)]
pub enum AvatarCommand {
    /// Teleport. Held until physics is ready.
    GoToLocation {
        position: Vec3,
        orientation: Option<Quat>,
    },
    GoHome,
    IncreaseSize,
    DecreaseSize,
    ResetSize,
    PinJoint {
        joint: Action,
        position: Vec3,
        rotation: Quat,
    },
    UnpinJoint(Action),
    SetFlyingAllowed(bool),
    SetFlying(bool),
    Jump,
    SetCollisionless(bool),
    SetZoneAllowsCollisionless(bool),
    SetCollideWithOtherAvatars(bool),
    BeginSit {
        position: Vec3,
        rotation: Quat,
    },
    EndSit,
    SetScriptedMotor(Option<ScriptedMotor>),
    AddThrust(Vec3),
    SetGravity(Vec3),
    SetUserHeight(f32),
    SetCgModel(bool),
    /// Freeze sit/stand detection in its current state.
    LockSitStand(bool),
    /// Swap the avatar model; rebuilds the collision shape.
    SetRig(RigDefaults),
    SetEntityData {
        entity: Uuid,
        data: Vec<u8>,
    },
    RemoveEntityData(Uuid),
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

/// Cheap, `Send` sender side of the queue.
#[derive(Debug, Clone)]
pub struct AvatarHandle {
    tx: mpsc::UnboundedSender<AvatarCommand>,
}

impl AvatarHandle {
    /// Post a command; fails only once the avatar has been dropped.
    pub fn send(&self, command: AvatarCommand) -> Result<(), AvatarError> {
        self.tx
            .send(command)
            .map_err(|e| AvatarError::Channel(format!("avatar command queue closed: {:?}", e.0)))
    }

    pub fn go_to_location(&self, position: Vec3, orientation: Option<Quat>) -> Result<(), AvatarError> {
        self.send(AvatarCommand::GoToLocation { position, orientation })
    }

    pub fn go_home(&self) -> Result<(), AvatarError> {
        self.send(AvatarCommand::GoHome)
    }

    pub fn increase_size(&self) -> Result<(), AvatarError> {
        self.send(AvatarCommand::IncreaseSize)
    }

    pub fn decrease_size(&self) -> Result<(), AvatarError> {
        self.send(AvatarCommand::DecreaseSize)
    }

    pub fn reset_size(&self) -> Result<(), AvatarError> {
        self.send(AvatarCommand::ResetSize)
    }

    pub fn pin_joint(&self, joint: Action, position: Vec3, rotation: Quat) -> Result<(), AvatarError> {
        self.send(AvatarCommand::PinJoint { joint, position, rotation })
    }

    pub fn unpin_joint(&self, joint: Action) -> Result<(), AvatarError> {
        self.send(AvatarCommand::UnpinJoint(joint))
    }

    pub fn set_flying(&self, flying: bool) -> Result<(), AvatarError> {
        self.send(AvatarCommand::SetFlying(flying))
    }

    pub fn jump(&self) -> Result<(), AvatarError> {
        self.send(AvatarCommand::Jump)
    }

    pub fn begin_sit(&self, position: Vec3, rotation: Quat) -> Result<(), AvatarError> {
        self.send(AvatarCommand::BeginSit { position, rotation })
    }

    pub fn end_sit(&self) -> Result<(), AvatarError> {
        self.send(AvatarCommand::EndSit)
    }

    pub fn set_scripted_motor(&self, motor: Option<ScriptedMotor>) -> Result<(), AvatarError> {
        self.send(AvatarCommand::SetScriptedMotor(motor))
    }

    pub fn add_thrust(&self, thrust: Vec3) -> Result<(), AvatarError> {
        self.send(AvatarCommand::AddThrust(thrust))
    }

    pub fn set_user_height(&self, height: f32) -> Result<(), AvatarError> {
        self.send(AvatarCommand::SetUserHeight(height))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Queue
// ────────────────────────────────────────────────────────────────────────────

/// Single-consumer end, owned by the avatar.
#[derive(Debug)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<AvatarCommand>,
    rx: mpsc::UnboundedReceiver<AvatarCommand>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn handle(&self) -> AvatarHandle {
        AvatarHandle { tx: self.tx.clone() }
    }

    /// Everything posted so far, in order. Never blocks.
    pub fn drain(&mut self) -> Vec<AvatarCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            commands.push(command);
        }
        commands
    }
}
