//! Process-wide event broker
//!
//! All inter-component communication inside the core is event-driven: the
//! dialog layer, the media streams and the sessions themselves publish named
//! events carrying a sender identity, and interested parties subscribe with a
//! filter. Publishing is synchronous and thread-safe; delivery goes through
//! per-subscriber bounded queues so a stuck consumer can never block a
//! publisher.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::core::session::SessionNotification;
use crate::protocols::invitation::InvitationEvent;
use crate::streams::MediaStreamEvent;

/// Identity of an event publisher (an invitation, a media stream or a session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(Uuid);

impl SenderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SenderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of sender identities a subscriber is watching. Shared so the owner
/// can add and remove senders while the subscription stays registered.
pub type SenderSet = Arc<DashSet<SenderId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Invitation,
    Media,
    Session,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Invitation(InvitationEvent),
    Media(MediaStreamEvent),
    Session(SessionNotification),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Invitation(_) => EventKind::Invitation,
            EventPayload::Media(_) => EventKind::Media,
            EventPayload::Session(_) => EventKind::Session,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub sender: SenderId,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(sender: SenderId, payload: EventPayload) -> Self {
        Self { sender, payload }
    }
}

/// Subscription filter: match on payload kind, on a set of senders, or both.
/// An empty filter matches every event.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub senders: Option<SenderSet>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn kind(kind: EventKind) -> Self {
        Self { kind: Some(kind), senders: None }
    }

    pub fn sender(sender: SenderId) -> Self {
        let set: SenderSet = Arc::new(DashSet::new());
        set.insert(sender);
        Self { kind: None, senders: Some(set) }
    }

    pub fn senders(senders: SenderSet) -> Self {
        Self { kind: None, senders: Some(senders) }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = self.kind {
            if event.payload.kind() != kind {
                return false;
            }
        }
        if let Some(senders) = &self.senders {
            if !senders.contains(&event.sender) {
                return false;
            }
        }
        true
    }
}

/// Outcome of handing an event to a subscriber sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResult {
    Delivered,
    Full,
    Closed,
}

/// Destination for delivered events. Implemented for plain channels and for
/// adapters that rewrap events into a consumer's own queue item type.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Event) -> SinkResult;
}

impl EventSink for mpsc::Sender<Event> {
    fn deliver(&self, event: Event) -> SinkResult {
        match self.try_send(event) {
            Ok(()) => SinkResult::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => SinkResult::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SinkResult::Closed,
        }
    }
}

pub type SubscriberId = u64;

struct SubscriberEntry {
    filter: EventFilter,
    sink: Box<dyn EventSink>,
}

/// Handle for a subscription created with [`EventBus::subscribe`]. Dropping it
/// unregisters the subscriber.
pub struct Subscription {
    id: SubscriberId,
    bus: EventBus,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

const SUBSCRIPTION_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    next_id: AtomicU64,
    subscribers: DashMap<SubscriberId, SubscriberEntry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: DashMap::new(),
            }),
        }
    }

    /// Deliver an event to every subscriber whose filter matches. Events are
    /// handed to subscriber queues in publish order; a full queue drops the
    /// event for that subscriber, a closed one unregisters it.
    pub fn publish(&self, event: Event) {
        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            if !entry.filter.matches(&event) {
                continue;
            }
            match entry.sink.deliver(event.clone()) {
                SinkResult::Delivered => {}
                SinkResult::Full => {
                    warn!(subscriber = entry.key(), sender = %event.sender,
                        "subscriber queue full, dropping event");
                }
                SinkResult::Closed => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        let id = self.register(filter, tx);
        Subscription { id, bus: self.clone(), rx }
    }

    /// Route matching events into a caller-owned sink. The caller is
    /// responsible for unsubscribing with the returned id.
    pub fn subscribe_with<S: EventSink + 'static>(&self, filter: EventFilter, sink: S) -> SubscriberId {
        self.register(filter, sink)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn register<S: EventSink + 'static>(&self, filter: EventFilter, sink: S) -> SubscriberId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(id, SubscriberEntry { filter, sink: Box::new(sink) });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::MediaStreamEvent;

    fn media_event(sender: SenderId) -> Event {
        Event::new(sender, EventPayload::Media(MediaStreamEvent::DidInitialize))
    }

    #[tokio::test]
    async fn test_subscribe_receives_matching_kind() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::kind(EventKind::Media));
        let sender = SenderId::new();

        bus.publish(media_event(sender));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.sender, sender);
        assert_eq!(event.payload.kind(), EventKind::Media);
    }

    #[tokio::test]
    async fn test_sender_filter() {
        let bus = EventBus::new();
        let watched = SenderId::new();
        let other = SenderId::new();
        let mut sub = bus.subscribe(EventFilter::sender(watched));

        bus.publish(media_event(other));
        bus.publish(media_event(watched));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.sender, watched);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_sender_set_can_grow_after_subscribing() {
        let bus = EventBus::new();
        let watched: SenderSet = Arc::new(DashSet::new());
        let mut sub = bus.subscribe(EventFilter::senders(watched.clone()));

        let late = SenderId::new();
        bus.publish(media_event(late));
        assert!(sub.try_recv().is_none());

        watched.insert(late);
        bus.publish(media_event(late));
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::any());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved() {
        let bus = EventBus::new();
        let sender = SenderId::new();
        let mut sub = bus.subscribe(EventFilter::sender(sender));

        bus.publish(Event::new(sender, EventPayload::Media(MediaStreamEvent::DidInitialize)));
        bus.publish(Event::new(sender, EventPayload::Media(MediaStreamEvent::DidStart)));

        assert!(matches!(
            sub.recv().await.unwrap().payload,
            EventPayload::Media(MediaStreamEvent::DidInitialize)
        ));
        assert!(matches!(
            sub.recv().await.unwrap().payload,
            EventPayload::Media(MediaStreamEvent::DidStart)
        ));
    }
}
