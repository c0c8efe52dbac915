//! Typed event bus with container and shared-object events.
//!
//! # Delivery
//!
//! Subscribers register per event kind and are called synchronously, in
//! subscription order, on the thread that publishes. Publishing from inside
//! a handler queues the new event behind the one being delivered, so every
//! subscriber sees a thread's events in publication order. No lock is held
//! while handlers run: threads publishing concurrently deliver
//! independently, and a handler may block on locks held by another
//! publisher.
//!
//! A panicking handler is logged and skipped; the others still run.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use cohort::events::{ContainerEvent, ContainerEventKind, EventBus};
//! use cohort::{IdValue, Id};
//!
//! let bus: EventBus<ContainerEvent> = EventBus::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//! bus.subscribe(&[ContainerEventKind::Connected], move |event| {
//!     sink.lock().unwrap().push(event.clone());
//! });
//!
//! let id = Id::new("member", IdValue::Long(1));
//! bus.publish(ContainerEvent::Connected { local: id.clone(), target: id });
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::error;

use crate::error::{ConnectError, ConnectionError, SharedObjectError};
use crate::identity::Id;
use crate::sharedobject::DeactivationReason;

/// An event deliverable through an [`EventBus`].
pub trait Event: Clone + Send + Sync + fmt::Debug + 'static {
    /// Discriminant used for subscriptions.
    type Kind: Copy + Eq + Hash + Send + Sync + fmt::Debug + 'static;

    /// Kind of this event.
    fn kind(&self) -> Self::Kind;

    /// Every kind, for [`EventBus::subscribe_all`].
    fn all_kinds() -> &'static [Self::Kind];
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Event bus keyed by event kind.
///
/// Cloning yields a handle to the same bus.
pub struct EventBus<E: Event> {
    inner: Arc<BusInner<E>>,
}

struct BusInner<E: Event> {
    subscribers: Mutex<HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>>,
    next_id: AtomicU64,
    /// Pending events of each thread currently delivering.
    dispatch: Mutex<HashMap<ThreadId, VecDeque<E>>>,
}

impl<E: Event> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dispatch: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<E: Event> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers: usize = self.inner.subscribers.lock().values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("subscriptions", &subscribers)
            .finish()
    }
}

impl<E: Event> EventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to the given kinds.
    pub fn subscribe<F>(&self, kinds: &[E::Kind], handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler<E> = Arc::new(handler);
        let mut subscribers = self.inner.subscribers.lock();
        for kind in kinds {
            subscribers
                .entry(*kind)
                .or_default()
                .push((id, handler.clone()));
        }
        id
    }

    /// Subscribe `handler` to every kind.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(E::all_kinds(), handler)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut found = false;
        for handlers in self.inner.subscribers.lock().values_mut() {
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            found |= handlers.len() != before;
        }
        found
    }

    /// Number of subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `event` to its subscribers.
    pub fn publish(&self, event: E) {
        let me = thread::current().id();
        {
            let mut dispatch = self.inner.dispatch.lock();
            if let Some(queue) = dispatch.get_mut(&me) {
                queue.push_back(event);
                return;
            }
            dispatch.insert(me, VecDeque::new());
        }
        let mut next = Some(event);
        while let Some(event) = next {
            self.deliver(&event);
            let mut dispatch = self.inner.dispatch.lock();
            next = dispatch.get_mut(&me).and_then(VecDeque::pop_front);
            if next.is_none() {
                dispatch.remove(&me);
            }
        }
    }

    fn deliver(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .inner
            .subscribers
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(kind = ?event.kind(), "event handler panicked");
            }
        }
    }
}

/// Container lifecycle and membership events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A connect attempt started.
    Connecting {
        /// The connecting container.
        local: Id,
        /// The group being joined.
        target: Id,
    },
    /// The container joined the group.
    Connected {
        /// The connected container.
        local: Id,
        /// The joined group.
        target: Id,
    },
    /// A connect attempt failed or was cancelled.
    ConnectFailed {
        /// The container.
        local: Id,
        /// The group it tried to join.
        target: Id,
        /// Why the attempt failed.
        error: ConnectError,
    },
    /// The container is leaving the group.
    Disconnecting {
        /// The container.
        local: Id,
        /// The group being left.
        target: Id,
    },
    /// The container left the group.
    Disconnected {
        /// The container.
        local: Id,
        /// The group it left.
        target: Id,
        /// The transport failure, for unsolicited disconnects.
        cause: Option<ConnectionError>,
    },
    /// A member joined the group.
    MemberAdded {
        /// The group.
        group: Id,
        /// The new member.
        member: Id,
    },
    /// A member left the group.
    MemberRemoved {
        /// The group.
        group: Id,
        /// The departed member.
        member: Id,
    },
}

/// Kinds of [`ContainerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerEventKind {
    /// [`ContainerEvent::Connecting`]
    Connecting,
    /// [`ContainerEvent::Connected`]
    Connected,
    /// [`ContainerEvent::ConnectFailed`]
    ConnectFailed,
    /// [`ContainerEvent::Disconnecting`]
    Disconnecting,
    /// [`ContainerEvent::Disconnected`]
    Disconnected,
    /// [`ContainerEvent::MemberAdded`]
    MemberAdded,
    /// [`ContainerEvent::MemberRemoved`]
    MemberRemoved,
}

impl Event for ContainerEvent {
    type Kind = ContainerEventKind;

    fn kind(&self) -> ContainerEventKind {
        match self {
            ContainerEvent::Connecting { .. } => ContainerEventKind::Connecting,
            ContainerEvent::Connected { .. } => ContainerEventKind::Connected,
            ContainerEvent::ConnectFailed { .. } => ContainerEventKind::ConnectFailed,
            ContainerEvent::Disconnecting { .. } => ContainerEventKind::Disconnecting,
            ContainerEvent::Disconnected { .. } => ContainerEventKind::Disconnected,
            ContainerEvent::MemberAdded { .. } => ContainerEventKind::MemberAdded,
            ContainerEvent::MemberRemoved { .. } => ContainerEventKind::MemberRemoved,
        }
    }

    fn all_kinds() -> &'static [ContainerEventKind] {
        use ContainerEventKind::*;
        &[
            Connecting,
            Connected,
            ConnectFailed,
            Disconnecting,
            Disconnected,
            MemberAdded,
            MemberRemoved,
        ]
    }
}

/// Shared object lifecycle and diagnostic events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedObjectEvent {
    /// An object was instantiated.
    Created {
        /// The object.
        object_id: Id,
        /// Its home container.
        home: Id,
        /// Its factory type name.
        type_name: String,
    },
    /// An object became active.
    Activated {
        /// The object.
        object_id: Id,
    },
    /// An object was deactivated.
    Deactivated {
        /// The object.
        object_id: Id,
        /// Why.
        reason: DeactivationReason,
    },
    /// An object was removed.
    Destroyed {
        /// The object.
        object_id: Id,
    },
    /// A message or creation could not be processed.
    MessageDeliveryFailed {
        /// The target object.
        object_id: Id,
        /// Sender of the message.
        from: Id,
        /// What went wrong.
        error: SharedObjectError,
    },
    /// A message named an object that is not registered. It was dropped.
    UnroutableMessage {
        /// The unknown object.
        object_id: Id,
        /// Sender of the message.
        from: Id,
    },
    /// A remote create named a type with no local factory.
    UnknownFactory {
        /// The object that was not created.
        object_id: Id,
        /// The missing type name.
        type_name: String,
    },
}

/// Kinds of [`SharedObjectEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedObjectEventKind {
    /// [`SharedObjectEvent::Created`]
    Created,
    /// [`SharedObjectEvent::Activated`]
    Activated,
    /// [`SharedObjectEvent::Deactivated`]
    Deactivated,
    /// [`SharedObjectEvent::Destroyed`]
    Destroyed,
    /// [`SharedObjectEvent::MessageDeliveryFailed`]
    MessageDeliveryFailed,
    /// [`SharedObjectEvent::UnroutableMessage`]
    UnroutableMessage,
    /// [`SharedObjectEvent::UnknownFactory`]
    UnknownFactory,
}

impl Event for SharedObjectEvent {
    type Kind = SharedObjectEventKind;

    fn kind(&self) -> SharedObjectEventKind {
        match self {
            SharedObjectEvent::Created { .. } => SharedObjectEventKind::Created,
            SharedObjectEvent::Activated { .. } => SharedObjectEventKind::Activated,
            SharedObjectEvent::Deactivated { .. } => SharedObjectEventKind::Deactivated,
            SharedObjectEvent::Destroyed { .. } => SharedObjectEventKind::Destroyed,
            SharedObjectEvent::MessageDeliveryFailed { .. } => {
                SharedObjectEventKind::MessageDeliveryFailed
            }
            SharedObjectEvent::UnroutableMessage { .. } => SharedObjectEventKind::UnroutableMessage,
            SharedObjectEvent::UnknownFactory { .. } => SharedObjectEventKind::UnknownFactory,
        }
    }

    fn all_kinds() -> &'static [SharedObjectEventKind] {
        use SharedObjectEventKind::*;
        &[
            Created,
            Activated,
            Deactivated,
            Destroyed,
            MessageDeliveryFailed,
            UnroutableMessage,
            UnknownFactory,
        ]
    }
}

/// The buses a container publishes to.
///
/// Injected into containers; cloning shares the buses.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    containers: EventBus<ContainerEvent>,
    objects: EventBus<SharedObjectEvent>,
}

impl EventHub {
    /// Create a hub with empty buses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Container events.
    pub fn containers(&self) -> &EventBus<ContainerEvent> {
        &self.containers
    }

    /// Shared object events.
    pub fn objects(&self) -> &EventBus<SharedObjectEvent> {
        &self.objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdValue;

    fn id(n: i64) -> Id {
        Id::new("long", IdValue::Long(n))
    }

    fn connected(n: i64) -> ContainerEvent {
        ContainerEvent::Connected {
            local: id(n),
            target: id(0),
        }
    }

    #[test]
    fn test_subscribers_called_in_order() {
        let bus = EventBus::<ContainerEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let log = log.clone();
            bus.subscribe(&[ContainerEventKind::Connected], move |_| log.lock().push(tag));
        }
        bus.publish(connected(1));
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_kind_filtering() {
        let bus = EventBus::<ContainerEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        bus.subscribe(&[ContainerEventKind::Disconnected], move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(connected(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(ContainerEventKind::Disconnected), 1);
        assert_eq!(bus.subscriber_count(ContainerEventKind::Connected), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::<ContainerEvent>::new();
        let sub = bus.subscribe_all(|_| {});
        assert_eq!(bus.subscriber_count(ContainerEventKind::MemberAdded), 1);
        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        assert_eq!(bus.subscriber_count(ContainerEventKind::MemberAdded), 0);
    }

    #[test]
    fn test_nested_publish_is_queued() {
        let bus = EventBus::<ContainerEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = bus.clone();
        bus.subscribe(&[ContainerEventKind::Connected], move |event| {
            if *event == connected(1) {
                inner_bus.publish(connected(2));
            }
        });
        let sink = log.clone();
        bus.subscribe(&[ContainerEventKind::Connected], move |event| {
            sink.lock().push(event.clone());
        });

        bus.publish(connected(1));
        // The second subscriber sees event 1 before event 2.
        assert_eq!(*log.lock(), vec![connected(1), connected(2)]);
    }

    #[test]
    fn test_other_thread_publishes_while_handler_blocks() {
        let bus = EventBus::<ContainerEvent>::new();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let log = Arc::new(Mutex::new(Vec::new()));

        let sink = log.clone();
        bus.subscribe(&[ContainerEventKind::Connected], move |event| {
            sink.lock().push(event.clone());
            if *event == connected(1) {
                let _ = entered_tx.lock().send(());
                let _ = release_rx
                    .lock()
                    .recv_timeout(std::time::Duration::from_secs(5));
            }
        });

        let blocked = bus.clone();
        let first = std::thread::spawn(move || blocked.publish(connected(1)));
        entered_rx.recv().unwrap();

        // Delivered on this thread while the first handler is still running.
        bus.publish(connected(2));
        assert_eq!(*log.lock(), vec![connected(1), connected(2)]);

        release_tx.send(()).unwrap();
        first.join().unwrap();
    }

    #[test]
    fn test_panicking_handler_isolated() {
        let bus = EventBus::<ContainerEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        bus.subscribe(&[ContainerEventKind::Connected], |_| panic!("boom"));
        let c = count.clone();
        bus.subscribe(&[ContainerEventKind::Connected], move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(connected(1));
        bus.publish(connected(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(connected(1).kind(), ContainerEventKind::Connected);
        assert_eq!(ContainerEvent::all_kinds().len(), 7);
        assert_eq!(SharedObjectEvent::all_kinds().len(), 7);
        let e = SharedObjectEvent::UnroutableMessage {
            object_id: id(1),
            from: id(2),
        };
        assert_eq!(e.kind(), SharedObjectEventKind::UnroutableMessage);
    }
}
