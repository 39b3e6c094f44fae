//! Animation rig sinks.
//!
//! The avatar hands one [`RigFrame`] per tick to an [`AnimationRig`] and
//! never reads anything back.

use std::sync::{Arc, Mutex, PoisonError};

use avatar_middleware::{EventBus, Topic};
use avatar_types::{Event, EventPayload, RigFrame};
use tracing::trace;

/// Receiver of per-tick IK targets.
pub trait AnimationRig: Send {
    fn submit(&mut self, frame: RigFrame);
}

/// Publishes every frame on [`Topic::Rig`].
#[derive(Debug, Clone)]
pub struct BusRig {
    bus: EventBus,
    source: String,
}

impl BusRig {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            source: "avatar-runtime::rig".to_string(),
        }
    }
}

impl AnimationRig for BusRig {
    fn submit(&mut self, frame: RigFrame) {
        let event = Event::new(self.source.clone(), EventPayload::Rig(frame));
        // no subscribers is not an error
        if self.bus.publish_to(Topic::Rig, event).is_err() {
            trace!("rig frame dropped; no subscribers");
        }
    }
}

/// Keeps every submitted frame. Clones share the same recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingRig {
    frames: Arc<Mutex<Vec<RigFrame>>>,
}

impl RecordingRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<RigFrame> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn last(&self) -> Option<RigFrame> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AnimationRig for RecordingRig {
    fn submit(&mut self, frame: RigFrame) {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_types::CharacterState;

    fn frame(state: CharacterState) -> RigFrame {
        RigFrame {
            targets: Vec::new(),
            state,
        }
    }

    #[test]
    fn recording_rig_shares_frames_between_clones() {
        let recording = RecordingRig::new();
        let mut sink: Box<dyn AnimationRig> = Box::new(recording.clone());
        sink.submit(frame(CharacterState::Ground));
        sink.submit(frame(CharacterState::Hover));
        assert_eq!(recording.len(), 2);
        assert_eq!(recording.last().map(|f| f.state), Some(CharacterState::Hover));
    }

    #[test]
    fn bus_rig_publishes_on_rig_topic() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Rig);
        let mut rig = BusRig::new(bus);
        rig.submit(frame(CharacterState::InAir));
        let events = rx.drain();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Rig(f) => assert_eq!(f.state, CharacterState::InAir),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn bus_rig_without_subscribers_is_silent() {
        let mut rig = BusRig::new(EventBus::default());
        rig.submit(frame(CharacterState::Ground));
    }
}
