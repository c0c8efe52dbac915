//! Shared object replication and message routing between members.

use std::time::Duration;

use cohort::connection::MemoryNetwork;
use cohort::events::{ContainerEventKind, SharedObjectEvent, SharedObjectEventKind};
use cohort::sharedobject::{ObjectState, SharedObject, SharedObjectContext};
use cohort::{ConnectContext, ConnectionState, Id, ReplicationFlags, SharedObjectError};
use parking_lot::Mutex;

use crate::common::{
    client, eventually, group_id, init_tracing, member, object, start_server, ContainerLog,
    ObjectLog, Spy, RECORDER,
};

/// Object type known to one member only.
struct Silent;

impl SharedObject for Silent {
    fn handle_message(
        &mut self,
        _ctx: &mut SharedObjectContext<'_>,
        _from: &Id,
        _payload: &[u8],
    ) -> Result<(), SharedObjectError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_create_replicates_with_same_id_and_state() {
    init_tracing();
    let network = MemoryNetwork::new();
    let group = group_id(20);
    let server_spy = Spy::default();
    let server = start_server(&network, &group, server_spy.factories());
    let (spy_a, spy_b) = (Spy::default(), Spy::default());
    let a = client(&network, "a", spy_a.factories());
    let b = client(&network, "b", spy_b.factories());
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();

    a.manager()
        .create_shared_object(
            object("obj1"),
            RECORDER,
            b"initial".to_vec(),
            ReplicationFlags::AUTO_REPLICATE,
        )
        .unwrap();

    eventually("replica on b", || b.manager().is_active(&object("obj1"))).await;
    eventually("replica on server", || {
        server.manager().is_active(&object("obj1"))
    })
    .await;

    let on_a = a.manager().description(&object("obj1")).unwrap();
    let on_b = b.manager().description(&object("obj1")).unwrap();
    assert_eq!(on_a, on_b);
    assert_eq!(on_b.home, member("a"));
    assert_eq!(
        a.manager().auto_replicated()[0].state,
        b.manager().auto_replicated()[0].state
    );
}

#[tokio::test]
async fn test_message_reaches_exact_replica_instance() {
    let network = MemoryNetwork::new();
    let group = group_id(21);
    let _server = start_server(&network, &group, Spy::default().factories());
    let (spy_a, spy_b) = (Spy::default(), Spy::default());
    let a = client(&network, "a", spy_a.factories());
    let b = client(&network, "b", spy_b.factories());
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();

    a.manager()
        .create_shared_object(object("obj1"), RECORDER, vec![], ReplicationFlags::AUTO_REPLICATE)
        .unwrap();
    eventually("replica on b", || b.manager().contains(&object("obj1"))).await;
    let replica = spy_b.instances_of(&object("obj1"));
    assert_eq!(replica.len(), 1);

    // Routed through the group.
    a.manager()
        .send_message(&object("obj1"), None, b"hello".to_vec())
        .unwrap();
    eventually("delivery on b", || !spy_b.deliveries().is_empty()).await;
    // Delivered directly.
    b.manager()
        .deliver_message(&object("obj1"), &member("a"), b"direct");

    let deliveries = spy_b.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.instance == replica[0]));
    assert_eq!(deliveries[0].from, member("a"));
    assert_eq!(deliveries[0].payload, b"hello");
    // The sender's own copy is not echoed.
    assert!(spy_a.deliveries().is_empty());
}

#[tokio::test]
async fn test_direct_message_reaches_one_member() {
    let network = MemoryNetwork::new();
    let group = group_id(22);
    let _server = start_server(&network, &group, Spy::default().factories());
    let spies = [Spy::default(), Spy::default(), Spy::default()];
    let a = client(&network, "a", spies[0].factories());
    let b = client(&network, "b", spies[1].factories());
    let c = client(&network, "c", spies[2].factories());
    for container in [&a, &b, &c] {
        container
            .connect(group.clone(), ConnectContext::new())
            .await
            .unwrap();
    }

    a.manager()
        .create_shared_object(object("obj1"), RECORDER, vec![], ReplicationFlags::empty())
        .unwrap();
    eventually("replicas", || {
        b.manager().contains(&object("obj1")) && c.manager().contains(&object("obj1"))
    })
    .await;

    a.manager()
        .send_message(&object("obj1"), Some(&member("c")), b"only c".to_vec())
        .unwrap();
    eventually("delivery on c", || !spies[2].deliveries().is_empty()).await;
    assert!(spies[1].deliveries().is_empty());
}

#[tokio::test]
async fn test_unroutable_message_is_only_diagnostic() {
    init_tracing();
    let network = MemoryNetwork::new();
    let group = group_id(23);
    let spy_a = Spy::default();
    let factories_a = spy_a.factories();
    factories_a.register_fn("private", |_id, _home, _args| {
        Ok(Box::new(Silent))
    });
    let _server = start_server(&network, &group, spy_a.factories());
    let a = client(&network, "a", factories_a);
    let b = client(&network, "b", Spy::default().factories());
    let b_objects = ObjectLog::attach(b.events());
    let b_container = ContainerLog::attach(b.events());
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();

    a.manager()
        .create_shared_object(object("ghost"), "private", vec![], ReplicationFlags::empty())
        .unwrap();
    a.manager()
        .send_message(&object("ghost"), None, b"boo".to_vec())
        .unwrap();

    eventually("unroutable diagnostic", || {
        b_objects
            .events()
            .iter()
            .any(|e| matches!(e, SharedObjectEvent::UnroutableMessage { .. }))
    })
    .await;
    let events = b_objects.events();
    assert!(events.contains(&SharedObjectEvent::UnknownFactory {
        object_id: object("ghost"),
        type_name: "private".to_string(),
    }));
    assert!(events.contains(&SharedObjectEvent::UnroutableMessage {
        object_id: object("ghost"),
        from: member("a"),
    }));
    assert!(b.is_connected());
    assert_eq!(b_container.count(ContainerEventKind::Disconnected), 0);
}

#[tokio::test]
async fn test_late_joiner_receives_auto_replicated_objects() {
    let network = MemoryNetwork::new();
    let group = group_id(24);
    let server = start_server(&network, &group, Spy::default().factories());
    let a = client(&network, "a", Spy::default().factories());
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();

    a.manager()
        .create_shared_object(object("auto"), RECORDER, b"v0".to_vec(), ReplicationFlags::AUTO_REPLICATE)
        .unwrap();
    a.manager()
        .create_shared_object(object("plain"), RECORDER, vec![], ReplicationFlags::empty())
        .unwrap();
    a.manager()
        .send_message(&object("auto"), None, b"set:v1".to_vec())
        .unwrap();
    eventually("server state updated", || {
        server
            .manager()
            .auto_replicated()
            .first()
            .is_some_and(|s| s.state == b"v1")
    })
    .await;

    let c = client(&network, "c", Spy::default().factories());
    c.connect(group.clone(), ConnectContext::new()).await.unwrap();
    // Snapshot objects are in place when connect returns.
    assert!(c.manager().is_active(&object("auto")));
    assert!(!c.manager().contains(&object("plain")));
    assert_eq!(c.manager().auto_replicated()[0].state, b"v1");
    assert_eq!(
        c.manager().description(&object("auto")).unwrap().home,
        member("a")
    );
}

#[tokio::test]
async fn test_destroy_propagates() {
    let network = MemoryNetwork::new();
    let group = group_id(25);
    let _server = start_server(&network, &group, Spy::default().factories());
    let a = client(&network, "a", Spy::default().factories());
    let b = client(&network, "b", Spy::default().factories());
    let b_objects = ObjectLog::attach(b.events());
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();

    a.manager()
        .create_shared_object(object("obj1"), RECORDER, vec![], ReplicationFlags::empty())
        .unwrap();
    eventually("replica on b", || b.manager().contains(&object("obj1"))).await;

    a.manager().destroy_shared_object(&object("obj1")).unwrap();
    assert!(!a.manager().contains(&object("obj1")));
    eventually("replica destroyed", || !b.manager().contains(&object("obj1"))).await;
    assert!(b_objects
        .events()
        .contains(&SharedObjectEvent::Destroyed {
            object_id: object("obj1")
        }));
}

#[tokio::test]
async fn test_disconnect_destroys_replicated_keeps_local_only() {
    let network = MemoryNetwork::new();
    let group = group_id(26);
    let _server = start_server(&network, &group, Spy::default().factories());
    let a = client(&network, "a", Spy::default().factories());

    assert_eq!(
        a.manager().create_shared_object(
            object("early"),
            RECORDER,
            vec![],
            ReplicationFlags::AUTO_REPLICATE
        ),
        Err(SharedObjectError::NotConnected)
    );
    a.manager()
        .create_shared_object(object("mine"), RECORDER, vec![], ReplicationFlags::LOCAL_ONLY)
        .unwrap();

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    a.manager()
        .create_shared_object(object("shared"), RECORDER, vec![], ReplicationFlags::AUTO_REPLICATE)
        .unwrap();
    a.disconnect();

    assert_eq!(a.manager().object_ids(), vec![object("mine")]);
    assert_eq!(
        a.manager().object_state(&object("mine")),
        Some(ObjectState::Active)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_disconnect_while_reader_publishes() {
    let network = MemoryNetwork::new();
    let group = group_id(27);
    let _server = start_server(&network, &group, Spy::default().factories());
    let a = client(&network, "a", Spy::default().factories());
    let factories_b = Spy::default().factories();
    factories_b.register_fn("private", |_id, _home, _args| Ok(Box::new(Silent)));
    let b = client(&network, "b", factories_b);
    let a_objects = ObjectLog::attach(a.events());
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();

    // While a's Created handler runs, a's reader publishes UnknownFactory
    // under the container's transition lock; the handler then disconnects.
    let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let handle = a.clone();
    a.events()
        .objects()
        .subscribe(&[SharedObjectEventKind::Created], move |event| {
            if matches!(event, SharedObjectEvent::Created { object_id, .. } if *object_id == object("mine"))
            {
                let _ = entered_tx.lock().send(());
                std::thread::sleep(Duration::from_millis(300));
                handle.disconnect();
            }
        });

    let creator = a.clone();
    let app = tokio::task::spawn_blocking(move || {
        creator.manager().create_shared_object(
            object("mine"),
            RECORDER,
            vec![],
            ReplicationFlags::LOCAL_ONLY,
        )
    });
    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();
    b.manager()
        .create_shared_object(object("ghost"), "private", vec![], ReplicationFlags::empty())
        .unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), app).await;
    assert!(finished.is_ok(), "handler calling disconnect never returned");
    finished.unwrap().unwrap().unwrap();
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert!(a.manager().contains(&object("mine")));
    eventually("unknown factory reported", || {
        a_objects.events().contains(&SharedObjectEvent::UnknownFactory {
            object_id: object("ghost"),
            type_name: "private".to_string(),
        })
    })
    .await;
}
