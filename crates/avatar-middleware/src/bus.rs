//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. Publishing never blocks the simulation tick: a full channel
//! drops its oldest event for slow subscribers.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Rig`] | Per-tick IK targets and controller state for the animation rig |
//! | [`Topic::Locomotion`] | State transitions, sit/stand changes, teleports, hold targets |
//! | [`Topic::SystemAlerts`] | Faults and safe-landing interventions |

use avatar_types::{AvatarError, Event};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// High-frequency rig frames, one per tick.
    Rig,
    /// Low-frequency locomotion events.
    Locomotion,
    /// Faults and recovery actions.
    SystemAlerts,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    rig: broadcast::Sender<Event>,
    locomotion: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (rig, _) = broadcast::channel(capacity);
        let (locomotion, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            rig,
            locomotion,
            system_alerts,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`AvatarError::Channel`] when nobody is listening on the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, AvatarError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| AvatarError::Channel(format!("No subscribers for topic {:?}", topic)))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Rig => &self.rig,
            Topic::Locomotion => &self.locomotion,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Drain every event currently buffered, skipping over lag gaps.
    ///
    /// Used by synchronous consumers such as the headless CLI that poll once
    /// per tick instead of awaiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                }
                Err(_) => break,
            }
        }
        events
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_types::EventPayload;
    use glam::Vec3;

    fn make_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::Teleported {
                position: Vec3::new(1.0, 0.0, 2.0),
            },
        )
    }

    #[test]
    fn publish_no_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::Rig, make_event("test"));
        assert!(matches!(result, Err(AvatarError::Channel(_))));
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::Locomotion);
        let mut subscriber2 = bus.subscribe_to(Topic::Locomotion);

        let event = make_event("avatar-runtime::avatar");
        bus.publish_to(Topic::Locomotion, event.clone())?;

        let recv1 = subscriber1.recv().await.expect("subscriber 1 must receive");
        let recv2 = subscriber2.recv().await.expect("subscriber 2 must receive");

        assert_eq!(recv1.id, event.id, "subscriber 1 got wrong event");
        assert_eq!(recv2.id, event.id, "subscriber 2 got wrong event");
        Ok(())
    }

    /// A subscriber on `SystemAlerts` must not receive events published to
    /// `Rig` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts_sub = bus.subscribe_to(Topic::SystemAlerts);
        let _rig_sub = bus.subscribe_to(Topic::Rig);

        bus.publish_to(Topic::Rig, make_event("avatar-runtime::rig"))?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), alerts_sub.recv()).await;
        assert!(result.is_err(), "SystemAlerts subscriber must not receive a Rig event");
        Ok(())
    }

    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        const CAPACITY: usize = 64;
        let bus = EventBus::new(CAPACITY);
        let mut slow_sub = bus.subscribe_to(Topic::Rig);

        for _ in 0..10_000 {
            let _ = bus.publish_to(Topic::Rig, make_event("flood::rig"));
        }

        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }

    #[test]
    fn drain_returns_buffered_events_in_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_to(Topic::Locomotion);
        let first = make_event("a");
        let second = make_event("b");
        bus.publish_to(Topic::Locomotion, first.clone()).unwrap();
        bus.publish_to(Topic::Locomotion, second.clone()).unwrap();

        let drained = sub.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, first.id);
        assert_eq!(drained[1].id, second.id);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn drain_survives_lag() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_to(Topic::Rig);
        for _ in 0..10 {
            bus.publish_to(Topic::Rig, make_event("flood")).unwrap();
        }
        let drained = sub.drain();
        assert_eq!(drained.len(), 4, "only the newest `capacity` events survive");
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(Topic::Rig), 0);
        let _a = bus.subscribe_to(Topic::Rig);
        let _b = bus.subscribe_to(Topic::Rig);
        assert_eq!(bus.subscriber_count(Topic::Rig), 2);
        assert_eq!(bus.subscriber_count(Topic::Locomotion), 0);
    }
}
