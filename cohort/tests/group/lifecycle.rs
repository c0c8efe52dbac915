//! Connect and disconnect behavior of a single container.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cohort::connection::{MemoryNetwork, MemoryTransport};
use cohort::events::ContainerEventKind;
use cohort::sharedobject::FactoryRegistry;
use cohort::{
    CodecError, ConnectContext, ConnectError, ConnectionState, Container, ContainerConfig,
    GroupServer, JsonCodec, MessageCodec,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::{
    client, eventually, group_id, init_tracing, member, start_server, ContainerLog,
};

#[tokio::test]
async fn test_connect_then_disconnect() {
    init_tracing();
    let network = MemoryNetwork::new();
    let group = group_id(1);
    let server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    assert_eq!(a.connection_state(), ConnectionState::Connected);
    assert_eq!(a.target_id(), Some(group.clone()));
    assert_eq!(a.members(), vec![group.clone(), member("a")]);
    assert_eq!(server.members(), vec![group.clone(), member("a")]);

    a.disconnect();
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(a.target_id(), None);
    assert!(a.members().is_empty());
    eventually("server to drop member", || server.members() == vec![group.clone()]).await;
}

#[tokio::test]
async fn test_connect_immediately_followed_by_disconnect() {
    init_tracing();
    let network = MemoryNetwork::new();
    let group = group_id(2);
    // Bound but never accepting: the join stays in flight.
    let acceptor = network.bind(&group.to_external_form()).unwrap();
    let a = client(&network, "a", FactoryRegistry::new());
    let log = ContainerLog::attach(a.events());

    let connecting = a.clone();
    let target = group.clone();
    let attempt =
        tokio::spawn(async move { connecting.connect(target, ConnectContext::new()).await });
    eventually("connect to start", || {
        a.connection_state() == ConnectionState::Connecting
    })
    .await;

    a.disconnect();
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(attempt.await.unwrap(), Err(ConnectError::Cancelled));
    assert_eq!(
        log.kinds(),
        vec![ContainerEventKind::Connecting, ContainerEventKind::ConnectFailed]
    );

    drop(acceptor);
    eventually("links to be released", || network.live_endpoints() == 0).await;
}

#[tokio::test]
async fn test_double_disconnect_fires_once() {
    init_tracing();
    let network = MemoryNetwork::new();
    let group = group_id(3);
    let _server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());
    let log = ContainerLog::attach(a.events());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    a.disconnect();
    a.disconnect();

    assert_eq!(log.count(ContainerEventKind::Disconnected), 1);
    assert_eq!(
        log.kinds(),
        vec![
            ContainerEventKind::Connecting,
            ContainerEventKind::Connected,
            ContainerEventKind::Disconnecting,
            ContainerEventKind::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_connect_while_connected_is_rejected() {
    let network = MemoryNetwork::new();
    let group = group_id(4);
    let _server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    let err = a
        .connect(group.clone(), ConnectContext::new())
        .await
        .unwrap_err();
    assert_eq!(err, ConnectError::InvalidState(ConnectionState::Connected));
    assert!(a.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let network = MemoryNetwork::new();
    let group = group_id(42);
    let _silent = network.bind(&group.to_external_form()).unwrap();
    let config = ContainerConfig::builder()
        .connect_timeout(Duration::from_millis(5000))
        .build()
        .unwrap();
    let a = Container::builder(Arc::new(MemoryTransport::memory(network.clone())))
        .local_id(member("a"))
        .config(config)
        .build();

    let started = tokio::time::Instant::now();
    let err = a
        .connect(group.clone(), ConnectContext::new())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ConnectError::Timeout(_)), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(5000), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(5100), "elapsed {elapsed:?}");
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_from_event_handler() {
    let network = MemoryNetwork::new();
    let group = group_id(5);
    let _server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());
    let log = ContainerLog::attach(a.events());

    let handle = a.clone();
    a.events()
        .containers()
        .subscribe(&[ContainerEventKind::Connected], move |_| handle.disconnect());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        log.kinds(),
        vec![
            ContainerEventKind::Connecting,
            ContainerEventKind::Connected,
            ContainerEventKind::Disconnecting,
            ContainerEventKind::Disconnected,
        ]
    );
}

#[tokio::test]
async fn test_server_shutdown_is_unsolicited_disconnect() {
    init_tracing();
    let network = MemoryNetwork::new();
    let group = group_id(6);
    let server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());
    let log = ContainerLog::attach(a.events());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    server.shutdown();

    eventually("unsolicited disconnect", || !a.is_connected()).await;
    assert_eq!(log.count(ContainerEventKind::Disconnected), 1);
    let cause = log.events().into_iter().find_map(|event| match event {
        cohort::events::ContainerEvent::Disconnected { cause, .. } => Some(cause),
        _ => None,
    });
    assert!(matches!(cause, Some(Some(_))));
}

#[tokio::test]
async fn test_reconnect_uses_fresh_connection() {
    let network = MemoryNetwork::new();
    let group = group_id(7);
    let server = start_server(&network, &group, FactoryRegistry::new());
    let a = client(&network, "a", FactoryRegistry::new());

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    a.disconnect();
    eventually("server to drop member", || server.members().len() == 1).await;

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    assert!(a.is_connected());
    assert_eq!(server.members(), vec![group.clone(), member("a")]);
}

/// JSON codec that counts the messages it encodes.
#[derive(Clone, Default)]
struct CountingCodec {
    encoded: Arc<AtomicUsize>,
}

impl MessageCodec for CountingCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        self.encoded.fetch_add(1, Ordering::SeqCst);
        JsonCodec.encode(msg)
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        JsonCodec.decode(buf)
    }
}

#[tokio::test]
async fn test_custom_codec_carries_the_session() {
    init_tracing();
    let network = MemoryNetwork::new();
    let group = group_id(35);
    let server_codec = CountingCodec::default();
    let server = GroupServer::builder(group.clone())
        .codec(server_codec.clone())
        .build()
        .unwrap();
    server.listen(network.bind(&group.to_external_form()).unwrap());

    let client_codec = CountingCodec::default();
    let a: Container<CountingCodec> =
        Container::builder(Arc::new(MemoryTransport::memory(network.clone())))
            .local_id(member("a"))
            .codec(client_codec.clone())
            .build();

    a.connect(group.clone(), ConnectContext::new()).await.unwrap();
    assert_eq!(a.members(), vec![group.clone(), member("a")]);
    assert!(client_codec.encoded.load(Ordering::SeqCst) >= 1);
    assert!(server_codec.encoded.load(Ordering::SeqCst) >= 1);

    a.disconnect();
    eventually("server to drop member", || server.members() == vec![group.clone()]).await;
}
