//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cohort::connection::{MemoryNetwork, MemoryTransport};
use cohort::events::{ContainerEvent, ContainerEventKind, Event, EventHub, SharedObjectEvent};
use cohort::sharedobject::{FactoryRegistry, SharedObject, SharedObjectContext};
use cohort::{Container, GroupServer, Id, IdValue, SharedObjectError};
use parking_lot::Mutex;

/// Factory type name of [`Recorder`].
pub const RECORDER: &str = "recorder";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn group_id(n: i64) -> Id {
    Id::new("group", IdValue::Long(n))
}

pub fn member(name: &str) -> Id {
    Id::new("member", IdValue::String(name.to_string()))
}

pub fn object(name: &str) -> Id {
    Id::new("object", IdValue::String(name.to_string()))
}

/// Start a server for `group` on the memory network.
pub fn start_server(network: &MemoryNetwork, group: &Id, factories: FactoryRegistry) -> GroupServer {
    let server = GroupServer::builder(group.clone())
        .factories(factories)
        .build()
        .unwrap();
    server.listen(network.bind(&group.to_external_form()).unwrap());
    server
}

/// A container named `name` on the memory network.
pub fn client(network: &MemoryNetwork, name: &str, factories: FactoryRegistry) -> Container {
    Container::builder(Arc::new(MemoryTransport::memory(network.clone())))
        .local_id(member(name))
        .factories(factories)
        .build()
}

/// Poll `condition` until it holds, failing after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Records container events.
#[derive(Clone, Default)]
pub struct ContainerLog(Arc<Mutex<Vec<ContainerEvent>>>);

impl ContainerLog {
    pub fn attach(events: &EventHub) -> Self {
        let log = Self::default();
        let sink = log.0.clone();
        events
            .containers()
            .subscribe_all(move |event: &ContainerEvent| sink.lock().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<ContainerEvent> {
        self.0.lock().clone()
    }

    pub fn kinds(&self) -> Vec<ContainerEventKind> {
        self.0.lock().iter().map(|e| e.kind()).collect()
    }

    pub fn count(&self, kind: ContainerEventKind) -> usize {
        self.0.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

/// Records shared object events.
#[derive(Clone, Default)]
pub struct ObjectLog(Arc<Mutex<Vec<SharedObjectEvent>>>);

impl ObjectLog {
    pub fn attach(events: &EventHub) -> Self {
        let log = Self::default();
        let sink = log.0.clone();
        events
            .objects()
            .subscribe_all(move |event: &SharedObjectEvent| sink.lock().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<SharedObjectEvent> {
        self.0.lock().clone()
    }
}

/// One message seen by a [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub object_id: Id,
    pub instance: usize,
    pub from: Id,
    pub payload: Vec<u8>,
}

/// Tracks the recorder instances built by one container's factories.
#[derive(Clone, Default)]
pub struct Spy {
    next_instance: Arc<AtomicUsize>,
    created: Arc<Mutex<Vec<(Id, usize)>>>,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl Spy {
    /// A registry holding the recorder factory.
    pub fn factories(&self) -> FactoryRegistry {
        let registry = FactoryRegistry::new();
        let spy = self.clone();
        registry.register_fn(RECORDER, move |object_id, _home, init_args| {
            let instance = spy.next_instance.fetch_add(1, Ordering::SeqCst);
            spy.created.lock().push((object_id.clone(), instance));
            Ok(Box::new(Recorder {
                object_id: object_id.clone(),
                instance,
                state: init_args.to_vec(),
                spy: spy.clone(),
            }))
        });
        registry
    }

    /// Instances built for `object_id`, in creation order.
    pub fn instances_of(&self, object_id: &Id) -> Vec<usize> {
        self.created
            .lock()
            .iter()
            .filter(|(id, _)| id == object_id)
            .map(|(_, instance)| *instance)
            .collect()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }
}

/// Shared object recording its messages. `set:<bytes>` replaces its state.
pub struct Recorder {
    object_id: Id,
    instance: usize,
    state: Vec<u8>,
    spy: Spy,
}

impl SharedObject for Recorder {
    fn handle_message(
        &mut self,
        _ctx: &mut SharedObjectContext<'_>,
        from: &Id,
        payload: &[u8],
    ) -> Result<(), SharedObjectError> {
        if let Some(state) = payload.strip_prefix(b"set:") {
            self.state = state.to_vec();
        }
        self.spy.deliveries.lock().push(Delivery {
            object_id: self.object_id.clone(),
            instance: self.instance,
            from: from.clone(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn replication_state(&self) -> Vec<u8> {
        self.state.clone()
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), SharedObjectError> {
        self.state = state.to_vec();
        Ok(())
    }
}
