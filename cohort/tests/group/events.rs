//! Ordering of container lifecycle events.

use cohort::connection::MemoryNetwork;
use cohort::events::ContainerEventKind;
use cohort::sharedobject::FactoryRegistry;
use cohort::{ConnectContext, ConnectError};

use crate::common::{client, group_id, start_server, ContainerLog};

/// Checks that every `Connecting` is answered by `Connected` or
/// `ConnectFailed`, and that every `Connected` is closed by `Disconnected`
/// before the next attempt.
fn assert_alternates(kinds: &[ContainerEventKind]) {
    let mut connected = false;
    let mut connecting = false;
    for kind in kinds {
        match kind {
            ContainerEventKind::Connecting => {
                assert!(!connecting && !connected, "overlapping attempt in {kinds:?}");
                connecting = true;
            }
            ContainerEventKind::Connected => {
                assert!(connecting && !connected, "unexpected Connected in {kinds:?}");
                connecting = false;
                connected = true;
            }
            ContainerEventKind::ConnectFailed => {
                assert!(connecting, "unexpected ConnectFailed in {kinds:?}");
                connecting = false;
            }
            ContainerEventKind::Disconnected => {
                assert!(connected, "unexpected Disconnected in {kinds:?}");
                connected = false;
            }
            ContainerEventKind::Disconnecting => {
                assert!(connected, "unexpected Disconnecting in {kinds:?}");
            }
            ContainerEventKind::MemberAdded | ContainerEventKind::MemberRemoved => {}
        }
    }
}

#[tokio::test]
async fn test_events_alternate_across_sessions() {
    let network = MemoryNetwork::new();
    let group = group_id(10);
    let _server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());
    let log = ContainerLog::attach(a.events());

    for _ in 0..3 {
        a.connect(group.clone(), ConnectContext::new()).await.unwrap();
        a.disconnect();
    }
    // A failed attempt in between.
    let err = a
        .connect(group_id(99), ConnectContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Transport(_)));
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    a.disconnect();

    let kinds = log.kinds();
    assert_alternates(&kinds);
    assert_eq!(log.count(ContainerEventKind::Connected), 4);
    assert_eq!(log.count(ContainerEventKind::Disconnected), 4);
    assert_eq!(log.count(ContainerEventKind::ConnectFailed), 1);
}

#[tokio::test]
async fn test_member_events_follow_connected() {
    let network = MemoryNetwork::new();
    let group = group_id(11);
    let _server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());
    let b = client(&network, "b", FactoryRegistry::new());
    let log = ContainerLog::attach(a.events());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();
    crate::common::eventually("member added on a", || {
        log.count(ContainerEventKind::MemberAdded) == 1
    })
    .await;
    b.disconnect();
    crate::common::eventually("member removed on a", || {
        log.count(ContainerEventKind::MemberRemoved) == 1
    })
    .await;
    a.disconnect();

    assert_alternates(&log.kinds());
    assert_eq!(
        log.kinds(),
        vec![
            ContainerEventKind::Connecting,
            ContainerEventKind::Connected,
            ContainerEventKind::MemberAdded,
            ContainerEventKind::MemberRemoved,
            ContainerEventKind::Disconnecting,
            ContainerEventKind::Disconnected,
        ]
    );
}
