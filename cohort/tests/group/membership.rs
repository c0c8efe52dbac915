//! Membership changes, admission and object re-homing.

use std::sync::Arc;

use cohort::connection::{Acceptor, ConnectionListener, FramedConnection, MemoryNetwork};
use cohort::events::{ContainerEvent, ContainerEventKind, SharedObjectEvent};
use cohort::membership::{MemberRecord, PasswordPolicy};
use cohort::protocol::{JoinAccept, JoinResponse};
use cohort::sharedobject::{DeactivationReason, FactoryRegistry, ObjectState};
use cohort::{
    ConnectContext, ConnectError, ConnectionConfig, ConnectionState, GroupServer, Id, JsonCodec,
    MessageCodec, ReplicationFlags, SharedObjectError,
};

use crate::common::{
    client, eventually, group_id, member, object, start_server, ContainerLog, ObjectLog, Spy,
    RECORDER,
};

#[tokio::test]
async fn test_members_agree_after_joins() {
    let network = MemoryNetwork::new();
    let group = group_id(30);
    let server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());
    let b = client(&network, "b", FactoryRegistry::new());
    let a_log = ContainerLog::attach(a.events());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();

    let expected = vec![group.clone(), member("a"), member("b")];
    assert_eq!(b.members(), expected);
    assert_eq!(server.members(), expected);
    eventually("a to learn about b", || a.members() == expected).await;
    assert!(a_log.events().contains(&ContainerEvent::MemberAdded {
        group: group.clone(),
        member: member("b"),
    }));
}

#[tokio::test]
async fn test_departure_deactivates_then_migration_reactivates() {
    let network = MemoryNetwork::new();
    let group = group_id(31);
    let _server = start_server(&network, &group, Spy::default().factories());
    let a = client(&network, "a", Spy::default().factories());
    let b = client(&network, "b", Spy::default().factories());
    let b_objects = ObjectLog::attach(b.events());
    let b_container = ContainerLog::attach(b.events());
    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    b.connect(group.clone(), ConnectContext::new()).await.unwrap();

    a.manager()
        .create_shared_object(object("obj1"), RECORDER, vec![], ReplicationFlags::AUTO_REPLICATE)
        .unwrap();
    eventually("replica on b", || b.manager().is_active(&object("obj1"))).await;

    a.disconnect();
    eventually("a removed on b", || !b.members().contains(&member("a"))).await;
    assert!(b_container.events().contains(&ContainerEvent::MemberRemoved {
        group: group.clone(),
        member: member("a"),
    }));
    // Deactivated, not destroyed.
    assert_eq!(
        b.manager().object_state(&object("obj1")),
        Some(ObjectState::Inactive)
    );
    assert!(b_objects.events().contains(&SharedObjectEvent::Deactivated {
        object_id: object("obj1"),
        reason: DeactivationReason::HomeDeparted,
    }));

    assert_eq!(
        b.manager()
            .migrate_shared_object(&object("obj1"), member("a")),
        Err(SharedObjectError::UnknownMember(member("a")))
    );
    b.manager()
        .migrate_shared_object(&object("obj1"), member("b"))
        .unwrap();
    assert!(b.manager().is_active(&object("obj1")));
    assert_eq!(
        b.manager().description(&object("obj1")).unwrap().home,
        member("b")
    );
}

#[tokio::test]
async fn test_join_rejected_by_policy() {
    let network = MemoryNetwork::new();
    let group = group_id(32);
    let server = GroupServer::builder(group.clone())
        .policy(Arc::new(PasswordPolicy::new("open sesame")))
        .build()
        .unwrap();
    server.listen(network.bind(&group.to_external_form()).unwrap());
    let a = client(&network, "a", FactoryRegistry::new());

    let err = a
        .connect(
            group.clone(),
            ConnectContext::new().with_credentials("guess"),
        )
        .await
        .unwrap_err();
    assert_eq!(err, ConnectError::Refused("invalid credentials".to_string()));
    assert!(!a.is_connected());

    a.connect(
        group.clone(),
        ConnectContext::new().with_credentials("open sesame"),
    )
    .await
    .unwrap();
    assert!(a.is_connected());
}

#[tokio::test]
async fn test_duplicate_member_id_refused() {
    let network = MemoryNetwork::new();
    let group = group_id(33);
    let _server = start_server(&network, &group, FactoryRegistry::new());
    let first = client(&network, "a", FactoryRegistry::new());
    let second = client(&network, "a", FactoryRegistry::new());

    first
        .connect(group.clone(), ConnectContext::new())
        .await
        .unwrap();
    let err = second
        .connect(group.clone(), ConnectContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Refused(reason) if reason.contains("duplicate")));
    assert!(first.is_connected());
}

/// Accepts every join with a member table listing `x` twice.
struct DuplicateAccept {
    group: Id,
}

impl ConnectionListener for DuplicateAccept {
    fn on_request(&self, _payload: &[u8]) -> Option<Vec<u8>> {
        let record = MemberRecord::new(member("x"));
        let accept = JoinResponse::Accept(JoinAccept {
            group: self.group.clone(),
            members: vec![record.clone(), record],
            objects: Vec::new(),
        });
        JsonCodec.encode(&accept).ok()
    }
}

#[tokio::test]
async fn test_duplicate_members_in_accept_force_teardown() {
    let network = MemoryNetwork::new();
    let group = group_id(34);
    let mut acceptor = network.bind(&group.to_external_form()).unwrap();
    let responder = {
        let group = group.clone();
        tokio::spawn(async move {
            let link = acceptor.accept().await.unwrap();
            FramedConnection::accepted(
                link,
                ConnectionConfig::default(),
                vec![Arc::new(DuplicateAccept { group }) as Arc<dyn ConnectionListener>],
            )
        })
    };
    let a = client(&network, "a", FactoryRegistry::new());
    let log = ContainerLog::attach(a.events());

    let err = a
        .connect(group.clone(), ConnectContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::ProtocolViolation(_)));
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(a.target_id(), None);
    assert!(a.members().is_empty());
    assert_eq!(
        log.kinds(),
        vec![ContainerEventKind::Connecting, ContainerEventKind::ConnectFailed]
    );

    drop(responder.await.unwrap());
    eventually("links released", || network.live_endpoints() == 0).await;
}
