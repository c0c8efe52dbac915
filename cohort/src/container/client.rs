//! Client container: one member's session in a group.
//!
//! # Locking
//!
//! The session (phase, membership, generation) sits behind one
//! `parking_lot::Mutex`, held only for short reads and writes. A
//! `ReentrantMutex` serializes each transition with the events it
//! publishes, so subscribers see events in transition order and may call
//! [`Container::disconnect`] from inside a handler. Neither lock is held
//! across an `.await`.
//!
//! # Generations
//!
//! Every connect attempt bumps the session generation. Callbacks from a
//! connection carry the generation they were registered under and are
//! ignored once it is stale, so a cancelled attempt never touches the next
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{JsonCodec, MessageCodec};
use crate::config::ContainerConfig;
use crate::connection::{Connection, ConnectionListener, Transport};
use crate::error::{ConnectError, ConnectionError, SharedObjectError};
use crate::events::{ContainerEvent, EventHub};
use crate::identity::{GuidNamespace, Id};
use crate::membership::{Membership, MembershipVersion};
use crate::protocol::{Envelope, GroupMessage, JoinAccept, JoinRequest, JoinResponse};
use crate::sharedobject::{FactoryRegistry, GroupSender, SharedObjectManager};

use super::ConnectionState;

/// Credentials and application data sent with a join request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectContext {
    /// Checked by the group's admission policy.
    pub credentials: Option<String>,
    /// Opaque data for the admission policy.
    pub data: Option<Vec<u8>>,
}

impl ConnectContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    /// Set the application data.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Debug for ConnectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectContext")
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("data_len", &self.data.as_ref().map(Vec::len))
            .finish()
    }
}

enum Phase {
    Disconnected,
    Connecting {
        target: Id,
        connection: Arc<dyn Connection>,
        cancel: CancellationToken,
        /// Envelopes that arrived before the join completed.
        early: Vec<Envelope>,
    },
    Connected {
        target: Id,
        connection: Arc<dyn Connection>,
    },
    Disconnecting {
        target: Id,
    },
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected { .. } => ConnectionState::Connected,
            Phase::Disconnecting { .. } => ConnectionState::Disconnecting,
        }
    }
}

struct Session {
    phase: Phase,
    membership: Membership,
    generation: u64,
}

struct ContainerInner<C: MessageCodec> {
    local_id: Id,
    config: ContainerConfig,
    transport: Arc<dyn Transport>,
    codec: C,
    events: EventHub,
    manager: SharedObjectManager,
    session: Mutex<Session>,
    transitions: ReentrantMutex<()>,
    disposed: AtomicBool,
}

/// A member's endpoint in a group.
///
/// Cloning yields another handle to the same container. Envelopes are
/// encoded with [`JsonCodec`] unless [`ContainerBuilder::codec`] picks
/// another; the group server must use the same codec.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use cohort::connection::{MemoryNetwork, MemoryTransport};
/// use cohort::{ConnectContext, Container, GroupServer, Id, IdValue};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let network = MemoryNetwork::new();
/// let group = Id::new("group", IdValue::Long(42));
/// let server = GroupServer::builder(group.clone()).build().unwrap();
/// server.listen(network.bind(&group.to_external_form()).unwrap());
///
/// let container = Container::new(Arc::new(MemoryTransport::memory(network)));
/// container.connect(group.clone(), ConnectContext::new()).await.unwrap();
/// assert_eq!(container.target_id(), Some(group));
/// container.disconnect();
/// # }
/// ```
pub struct Container<C: MessageCodec = JsonCodec> {
    inner: Arc<ContainerInner<C>>,
}

impl<C: MessageCodec> Clone for Container<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for Container<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("local_id", &self.inner.local_id)
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Builder for [`Container`].
pub struct ContainerBuilder<C: MessageCodec = JsonCodec> {
    transport: Arc<dyn Transport>,
    local_id: Option<Id>,
    config: ContainerConfig,
    factories: FactoryRegistry,
    events: EventHub,
    codec: C,
}

impl<C: MessageCodec> ContainerBuilder<C> {
    /// Use `local_id` instead of a random GUID.
    pub fn local_id(mut self, local_id: Id) -> Self {
        self.local_id = Some(local_id);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a factory registry.
    pub fn factories(mut self, factories: FactoryRegistry) -> Self {
        self.factories = factories;
        self
    }

    /// Share an event hub.
    pub fn events(mut self, events: EventHub) -> Self {
        self.events = events;
        self
    }

    /// Encode envelopes with `codec`.
    pub fn codec<D: MessageCodec>(self, codec: D) -> ContainerBuilder<D> {
        ContainerBuilder {
            transport: self.transport,
            local_id: self.local_id,
            config: self.config,
            factories: self.factories,
            events: self.events,
            codec,
        }
    }

    /// Build the container, disconnected.
    pub fn build(self) -> Container<C> {
        let local_id = self
            .local_id
            .unwrap_or_else(|| GuidNamespace.generate());
        let inner = Arc::new_cyclic(|weak: &Weak<ContainerInner<C>>| {
            let sender: Weak<dyn GroupSender> = weak.clone();
            ContainerInner {
                manager: SharedObjectManager::new(
                    local_id.clone(),
                    self.factories,
                    self.events.objects().clone(),
                    sender,
                ),
                local_id,
                config: self.config,
                transport: self.transport,
                codec: self.codec,
                events: self.events,
                session: Mutex::new(Session {
                    phase: Phase::Disconnected,
                    membership: Membership::new(),
                    generation: 0,
                }),
                transitions: ReentrantMutex::new(()),
                disposed: AtomicBool::new(false),
            }
        });
        Container { inner }
    }
}

impl Container {
    /// Container with default settings and a random GUID.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    /// Start building a container over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> ContainerBuilder {
        ContainerBuilder {
            transport,
            local_id: None,
            config: ContainerConfig::default(),
            factories: FactoryRegistry::new(),
            events: EventHub::new(),
            codec: JsonCodec,
        }
    }
}

impl<C: MessageCodec> Container<C> {
    /// Join the group `target`.
    ///
    /// Resolves the target, opens a fresh connection and runs the join
    /// handshake, all bounded by the connect timeout. On success the
    /// container is `Connected`, the group's shared objects are replicated
    /// and messages that arrived during the handshake are delivered.
    ///
    /// # Errors
    ///
    /// - `InvalidState`: not `Disconnected`; concurrent attempts are
    ///   rejected, not queued
    /// - `MalformedTarget`: the transport cannot resolve `target`
    /// - `Refused`: the group rejected the join
    /// - `Timeout`: no answer within the connect timeout
    /// - `Cancelled`: [`Container::disconnect`] aborted the attempt
    /// - `Transport`, `Codec`, `ProtocolViolation`: the handshake failed
    /// - `Disposed`: [`Container::dispose`] was called
    pub async fn connect(&self, target: Id, context: ConnectContext) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(ConnectError::Disposed);
        }
        let state = self.connection_state();
        if state != ConnectionState::Disconnected {
            return Err(ConnectError::InvalidState(state));
        }
        let address = inner
            .transport
            .resolve(&target)
            .map_err(|e| ConnectError::MalformedTarget {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let connection = inner.transport.create_connection();
        let (generation, cancel) = inner.begin(&target, &connection)?;
        connection.add_listener(Arc::new(SessionListener {
            container: Arc::downgrade(inner),
            generation,
        }));

        let timeout = inner.config.connect_timeout();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            joined = tokio::time::timeout(timeout, inner.join(connection.as_ref(), &address, context)) => {
                joined.unwrap_or(Err(ConnectError::Timeout(timeout)))
            }
        };

        match outcome {
            Ok(accept) => inner.commit(generation, &target, &connection, accept),
            Err(error) => {
                inner.abort(generation, &target, &connection, error.clone());
                Err(error)
            }
        }
    }

    /// Leave the group.
    ///
    /// Does nothing when disconnected or already disconnecting. Cancels an
    /// attempt in flight. Otherwise sends `Leave`, destroys the replicated
    /// shared objects and closes the connection. Safe to call from an event
    /// handler.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Disconnect and refuse further connects.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            debug!(local = %self.inner.local_id, "container disposed");
        }
        self.inner.disconnect();
    }

    /// This container's ID.
    pub fn local_id(&self) -> &Id {
        &self.inner.local_id
    }

    /// The joined group, only while `Connected`.
    pub fn target_id(&self) -> Option<Id> {
        match &self.inner.session.lock().phase {
            Phase::Connected { target, .. } => Some(target.clone()),
            _ => None,
        }
    }

    /// Current state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.lock().phase.state()
    }

    /// Whether the container is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Current members, sorted. Empty unless connected.
    pub fn members(&self) -> Vec<Id> {
        self.inner.session.lock().membership.ids()
    }

    /// Version of the membership table.
    pub fn membership_version(&self) -> MembershipVersion {
        self.inner.session.lock().membership.version()
    }

    /// The shared object manager.
    pub fn manager(&self) -> &SharedObjectManager {
        &self.inner.manager
    }

    /// The event hub.
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    /// The configuration.
    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }
}

fn connect_failure(timeout: Duration) -> impl Fn(ConnectionError) -> ConnectError {
    move |error| match error {
        ConnectionError::Timeout => ConnectError::Timeout(timeout),
        other => ConnectError::Transport(other),
    }
}

impl<C: MessageCodec> ContainerInner<C> {
    fn begin(
        &self,
        target: &Id,
        connection: &Arc<dyn Connection>,
    ) -> Result<(u64, CancellationToken), ConnectError> {
        let _transition = self.transitions.lock();
        let cancel = CancellationToken::new();
        let generation = {
            let mut session = self.session.lock();
            let state = session.phase.state();
            if state != ConnectionState::Disconnected {
                return Err(ConnectError::InvalidState(state));
            }
            session.generation += 1;
            session.membership.clear();
            session.phase = Phase::Connecting {
                target: target.clone(),
                connection: connection.clone(),
                cancel: cancel.clone(),
                early: Vec::new(),
            };
            session.generation
        };
        info!(local = %self.local_id, target = %target, generation, "connecting");
        self.events.containers().publish(ContainerEvent::Connecting {
            local: self.local_id.clone(),
            target: target.clone(),
        });
        Ok((generation, cancel))
    }

    async fn join(
        &self,
        connection: &dyn Connection,
        address: &str,
        context: ConnectContext,
    ) -> Result<JoinAccept, ConnectError> {
        let connect_timeout = self.config.connect_timeout();
        connection
            .connect(address, connect_timeout)
            .await
            .map_err(connect_failure(connect_timeout))?;

        let request = JoinRequest {
            member: self.local_id.clone(),
            credentials: context.credentials,
            data: context.data,
        };
        let join_timeout = self.config.join_timeout();
        let reply = connection
            .send_synch(self.codec.encode(&request)?, join_timeout)
            .await
            .map_err(connect_failure(join_timeout))?;

        match self.codec.decode::<JoinResponse>(&reply)? {
            JoinResponse::Accept(accept) => Ok(accept),
            JoinResponse::Reject { reason } => Err(ConnectError::Refused(reason)),
        }
    }

    fn commit(
        &self,
        generation: u64,
        target: &Id,
        connection: &Arc<dyn Connection>,
        accept: JoinAccept,
    ) -> Result<(), ConnectError> {
        let JoinAccept {
            group,
            members,
            objects,
        } = accept;
        let membership = match Membership::from_snapshot(members) {
            Ok(membership) => membership,
            Err(e) => {
                let error = ConnectError::ProtocolViolation(e.to_string());
                self.abort(generation, target, connection, error.clone());
                return Err(error);
            }
        };
        if !connection.is_connected() {
            let error = ConnectError::Transport(ConnectionError::Closed);
            self.abort(generation, target, connection, error.clone());
            return Err(error);
        }

        let _transition = self.transitions.lock();
        let early = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return Err(ConnectError::Cancelled);
            }
            let early = match &mut session.phase {
                Phase::Connecting { early, .. } => std::mem::take(early),
                _ => return Err(ConnectError::Cancelled),
            };
            session.membership = membership;
            session.phase = Phase::Connected {
                target: target.clone(),
                connection: connection.clone(),
            };
            early
        };
        info!(
            local = %self.local_id,
            target = %target,
            members = self.session.lock().membership.len(),
            objects = objects.len(),
            "connected"
        );
        self.events.containers().publish(ContainerEvent::Connected {
            local: self.local_id.clone(),
            target: target.clone(),
        });

        if !self.is_connected() {
            // A handler disconnected on Connected.
            return Ok(());
        }
        self.manager.apply_snapshot(&group, objects);
        for envelope in early {
            self.route(envelope);
        }
        Ok(())
    }

    fn abort(
        &self,
        generation: u64,
        target: &Id,
        connection: &Arc<dyn Connection>,
        error: ConnectError,
    ) {
        connection.disconnect();
        let _transition = self.transitions.lock();
        {
            let mut session = self.session.lock();
            if session.generation != generation
                || session.phase.state() != ConnectionState::Connecting
            {
                return;
            }
            session.phase = Phase::Disconnected;
            session.membership.clear();
        }
        warn!(local = %self.local_id, target = %target, error = %error, "connect failed");
        self.events.containers().publish(ContainerEvent::ConnectFailed {
            local: self.local_id.clone(),
            target: target.clone(),
            error,
        });
    }

    fn disconnect(&self) {
        let _transition = self.transitions.lock();
        let previous = {
            let mut session = self.session.lock();
            let previous = std::mem::replace(&mut session.phase, Phase::Disconnected);
            match previous {
                Phase::Connecting { .. } => session.membership.clear(),
                Phase::Connected { ref target, .. } => {
                    session.phase = Phase::Disconnecting {
                        target: target.clone(),
                    };
                }
                Phase::Disconnected | Phase::Disconnecting { .. } => {
                    session.phase = previous;
                    return;
                }
            }
            previous
        };

        match previous {
            Phase::Connecting {
                target,
                connection,
                cancel,
                ..
            } => {
                cancel.cancel();
                connection.disconnect();
                info!(local = %self.local_id, target = %target, "connect cancelled");
                self.events.containers().publish(ContainerEvent::ConnectFailed {
                    local: self.local_id.clone(),
                    target,
                    error: ConnectError::Cancelled,
                });
            }
            Phase::Connected { target, connection } => {
                self.events.containers().publish(ContainerEvent::Disconnecting {
                    local: self.local_id.clone(),
                    target: target.clone(),
                });
                if self.config.leave_on_disconnect() {
                    self.send_leave(connection.as_ref());
                }
                self.teardown(target, connection, None);
            }
            Phase::Disconnected | Phase::Disconnecting { .. } => {}
        }
    }

    fn connection_failed(&self, generation: u64, error: ConnectionError) {
        let _transition = self.transitions.lock();
        let (target, connection) = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            match std::mem::replace(&mut session.phase, Phase::Disconnected) {
                Phase::Connected { target, connection } => {
                    session.phase = Phase::Disconnecting {
                        target: target.clone(),
                    };
                    (target, connection)
                }
                other => {
                    session.phase = other;
                    return;
                }
            }
        };
        warn!(local = %self.local_id, target = %target, error = %error, "connection lost");
        self.events.containers().publish(ContainerEvent::Disconnecting {
            local: self.local_id.clone(),
            target: target.clone(),
        });
        self.teardown(target, connection, Some(error));
    }

    fn teardown(&self, target: Id, connection: Arc<dyn Connection>, cause: Option<ConnectionError>) {
        self.manager.destroy_replicated();
        connection.disconnect();
        {
            let mut session = self.session.lock();
            session.phase = Phase::Disconnected;
            session.membership.clear();
        }
        info!(local = %self.local_id, target = %target, "disconnected");
        self.events.containers().publish(ContainerEvent::Disconnected {
            local: self.local_id.clone(),
            target,
            cause,
        });
    }

    fn send_leave(&self, connection: &dyn Connection) {
        let leave = Envelope::to_group(self.local_id.clone(), GroupMessage::Leave);
        let sent = self
            .codec
            .encode(&leave)
            .map_err(|e| e.to_string())
            .and_then(|bytes| connection.send_asynch(bytes).map_err(|e| e.to_string()));
        if let Err(e) = sent {
            debug!(local = %self.local_id, error = %e, "leave not sent");
        }
    }

    fn dispatch(&self, generation: u64, envelope: Envelope) {
        let _transition = self.transitions.lock();
        {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            match &mut session.phase {
                Phase::Connecting { early, .. } => {
                    early.push(envelope);
                    return;
                }
                Phase::Connected { .. } => {}
                Phase::Disconnected | Phase::Disconnecting { .. } => return,
            }
        }
        self.route(envelope);
    }

    fn route(&self, envelope: Envelope) {
        let Envelope { from, to, body } = envelope;
        if let Some(to) = &to {
            if to != &self.local_id {
                debug!(local = %self.local_id, to = %to, "envelope for another member dropped");
                return;
            }
        }
        match body {
            GroupMessage::MemberAdded(record) => {
                let member = record.member_id.clone();
                let group = {
                    let mut session = self.session.lock();
                    let Phase::Connected { target, .. } = &session.phase else {
                        return;
                    };
                    let group = target.clone();
                    if !session.membership.add(record) {
                        return;
                    }
                    group
                };
                debug!(local = %self.local_id, member = %member, "member added");
                self.events
                    .containers()
                    .publish(ContainerEvent::MemberAdded { group, member });
            }
            GroupMessage::MemberRemoved(member) => {
                let group = {
                    let mut session = self.session.lock();
                    let Phase::Connected { target, .. } = &session.phase else {
                        return;
                    };
                    let group = target.clone();
                    if session.membership.remove(&member).is_none() {
                        return;
                    }
                    group
                };
                let deactivated = self.manager.deactivate_homed_by(&member);
                info!(
                    local = %self.local_id,
                    member = %member,
                    deactivated = deactivated.len(),
                    "member removed"
                );
                self.events
                    .containers()
                    .publish(ContainerEvent::MemberRemoved { group, member });
            }
            GroupMessage::Leave => {
                debug!(local = %self.local_id, from = %from, "leave ignored");
            }
            GroupMessage::CreateObject(snapshot) => self.manager.apply_create(&from, snapshot),
            GroupMessage::DestroyObject(object_id) => self.manager.apply_destroy(&object_id),
            GroupMessage::ObjectMessage { object_id, payload } => {
                self.manager.deliver_message(&object_id, &from, &payload)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session.lock().phase.state().is_connected()
    }
}

impl<C: MessageCodec> GroupSender for ContainerInner<C> {
    fn send(&self, to: Option<&Id>, body: GroupMessage) -> Result<(), SharedObjectError> {
        let connection = match &self.session.lock().phase {
            Phase::Connected { connection, .. } => connection.clone(),
            _ => return Err(SharedObjectError::NotConnected),
        };
        let envelope = match to {
            Some(member) => Envelope::to_member(self.local_id.clone(), member.clone(), body),
            None => Envelope::to_group(self.local_id.clone(), body),
        };
        connection.send_asynch(self.codec.encode(&envelope)?)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        ContainerInner::is_connected(self)
    }

    fn is_member(&self, id: &Id) -> bool {
        self.session.lock().membership.contains(id)
    }
}

/// Feeds one session's connection back into its container.
struct SessionListener<C: MessageCodec> {
    container: Weak<ContainerInner<C>>,
    generation: u64,
}

impl<C: MessageCodec> ConnectionListener for SessionListener<C> {
    fn on_message(&self, payload: &[u8]) {
        let Some(container) = self.container.upgrade() else {
            return;
        };
        match container.codec.decode::<Envelope>(payload) {
            Ok(envelope) => container.dispatch(self.generation, envelope),
            Err(e) => {
                warn!(local = %container.local_id, error = %e, "undecodable envelope dropped")
            }
        }
    }

    fn on_disconnect(&self, error: &ConnectionError) {
        if let Some(container) = self.container.upgrade() {
            container.connection_failed(self.generation, error.clone());
        }
    }
}
