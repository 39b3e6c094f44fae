//! `avatar-middleware` – event routing for the avatar stack.
//!
//! # Modules
//!
//! - [`bus`] – Topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels. The runtime publishes rig frames and locomotion
//!   events here without waiting on any consumer.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
