//! Group server: the container hosting a group.
//!
//! The server is itself a member of the group it hosts; its ID is the
//! group ID. It admits joiners through a [`MembershipPolicy`], keeps the
//! authoritative membership table and relays envelopes between members.
//!
//! # Relay
//!
//! - group-addressed envelopes are relayed to every other member, then
//!   applied to the server's own shared objects
//! - member-addressed envelopes go to that member only, or are applied
//!   locally when addressed to the group ID
//! - `Leave` and connection failures remove the member once

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{JsonCodec, MessageCodec};
use crate::config::ServerConfig;
use crate::connection::{Acceptor, Connection, ConnectionListener, FramedConnection, Link};
use crate::error::{ConfigError, ConnectionError, SharedObjectError};
use crate::events::{ContainerEvent, EventHub};
use crate::identity::Id;
use crate::membership::{
    MemberRecord, Membership, MembershipPolicy, MembershipVersion, OpenPolicy,
};
use crate::protocol::{Envelope, GroupMessage, JoinAccept, JoinRequest, JoinResponse};
use crate::sharedobject::{FactoryRegistry, GroupSender, SharedObjectManager};

struct ServerState {
    membership: Membership,
    /// Joined members' connections.
    peers: HashMap<Id, Arc<FramedConnection>>,
    /// Accepted connections that have not joined yet.
    pending: HashMap<u64, Arc<FramedConnection>>,
    next_peer: u64,
}

struct ServerInner<C: MessageCodec> {
    group_id: Id,
    config: ServerConfig,
    policy: Arc<dyn MembershipPolicy>,
    codec: C,
    events: EventHub,
    manager: SharedObjectManager,
    state: Mutex<ServerState>,
    transitions: ReentrantMutex<()>,
    shutdown: CancellationToken,
}

/// Hosts a group and relays messages between its members.
///
/// Cloning yields another handle to the same server. Members must use the
/// server's codec, [`JsonCodec`] unless
/// [`GroupServerBuilder::codec`] picks another.
pub struct GroupServer<C: MessageCodec = JsonCodec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: MessageCodec> Clone for GroupServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for GroupServer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupServer")
            .field("group_id", &self.inner.group_id)
            .field("members", &self.members())
            .finish()
    }
}

/// Builder for [`GroupServer`].
pub struct GroupServerBuilder<C: MessageCodec = JsonCodec> {
    group_id: Id,
    config: ServerConfig,
    policy: Arc<dyn MembershipPolicy>,
    factories: FactoryRegistry,
    events: EventHub,
    codec: C,
}

impl<C: MessageCodec> GroupServerBuilder<C> {
    /// Set the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the admission policy. Defaults to [`OpenPolicy`].
    pub fn policy(mut self, policy: Arc<dyn MembershipPolicy>) -> Self {
        self.policy = policy;
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

    /// Encode protocol messages with `codec`.
    pub fn codec<D: MessageCodec>(self, codec: D) -> GroupServerBuilder<D> {
        GroupServerBuilder {
            group_id: self.group_id,
            config: self.config,
            policy: self.policy,
            factories: self.factories,
            events: self.events,
            codec,
        }
    }

    /// Validate the configuration and build the server.
    pub fn build(self) -> Result<GroupServer<C>, ConfigError> {
        self.config.validate()?;
        let group_id = self.group_id;
        let mut membership = Membership::new();
        membership.add(MemberRecord::new(group_id.clone()));

        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner<C>>| {
            let sender: Weak<dyn GroupSender> = weak.clone();
            ServerInner {
                manager: SharedObjectManager::new(
                    group_id.clone(),
                    self.factories,
                    self.events.objects().clone(),
                    sender,
                ),
                group_id,
                config: self.config,
                policy: self.policy,
                codec: self.codec,
                events: self.events,
                state: Mutex::new(ServerState {
                    membership,
                    peers: HashMap::new(),
                    pending: HashMap::new(),
                    next_peer: 0,
                }),
                transitions: ReentrantMutex::new(()),
                shutdown: CancellationToken::new(),
            }
        });
        Ok(GroupServer { inner })
    }
}

impl GroupServer {
    /// Start building a server for the group `group_id`.
    pub fn builder(group_id: Id) -> GroupServerBuilder {
        GroupServerBuilder {
            group_id,
            config: ServerConfig::default(),
            policy: Arc::new(OpenPolicy),
            factories: FactoryRegistry::new(),
            events: EventHub::new(),
            codec: JsonCodec,
        }
    }
}

impl<C: MessageCodec> GroupServer<C> {
    /// Accept links from `acceptor` until [`GroupServer::shutdown`].
    ///
    /// Must be called inside a Tokio runtime.
    pub fn listen<A: Acceptor>(&self, mut acceptor: A) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            info!(group = %inner.group_id, address = %acceptor.local_address(), "group server listening");
            loop {
                let accepted = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    accepted = acceptor.accept() => accepted,
                };
                match accepted {
                    Ok(link) => inner.adopt(link),
                    Err(ConnectionError::Closed) => break,
                    Err(e) => warn!(group = %inner.group_id, error = %e, "accept failed"),
                }
            }
            debug!(group = %inner.group_id, "accept loop stopped");
        })
    }

    /// Close every peer connection and stop accepting.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let _transition = self.inner.transitions.lock();
        let connections: Vec<Arc<FramedConnection>> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let group = self.inner.group_id.clone();
            state.membership.clear();
            state.membership.add(MemberRecord::new(group));
            let peers = state.peers.drain().map(|(_, c)| c);
            let pending = state.pending.drain().map(|(_, c)| c);
            peers.chain(pending).collect()
        };
        info!(group = %self.inner.group_id, peers = connections.len(), "group server shut down");
        for connection in connections {
            connection.disconnect();
        }
    }

    /// The hosted group's ID, also this server's member ID.
    pub fn group_id(&self) -> &Id {
        &self.inner.group_id
    }

    /// Current members, the server included, sorted.
    pub fn members(&self) -> Vec<Id> {
        self.inner.state.lock().membership.ids()
    }

    /// Version of the membership table.
    pub fn membership_version(&self) -> MembershipVersion {
        self.inner.state.lock().membership.version()
    }

    /// The server's shared object manager.
    pub fn manager(&self) -> &SharedObjectManager {
        &self.inner.manager
    }

    /// The event hub.
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }
}

impl<C: MessageCodec> ServerInner<C> {
    fn adopt(self: &Arc<Self>, link: Link) {
        // Held until the connection is registered, so its first request
        // finds it in `pending`.
        let mut state = self.state.lock();
        let seq = state.next_peer;
        state.next_peer += 1;
        let listener = Arc::new(PeerListener {
            server: Arc::downgrade(self),
            seq,
            member: Mutex::new(None),
        });
        debug!(group = %self.group_id, peer = %link.peer, seq, "link accepted");
        let connection = FramedConnection::accepted(
            link,
            self.config.connection.clone(),
            vec![listener as Arc<dyn ConnectionListener>],
        );
        state.pending.insert(seq, Arc::new(connection));
    }

    fn handle_join(&self, peer: &PeerListener<C>, request: JoinRequest) -> JoinResponse {
        let _transition = self.transitions.lock();
        let member = request.member.clone();
        let admitted = {
            let mut state = self.state.lock();
            self.admit(&mut state, peer, &request)
        };
        let members = match admitted {
            Ok(members) => members,
            Err(reason) => {
                info!(group = %self.group_id, member = %member, reason = %reason, "join rejected");
                return JoinResponse::Reject { reason };
            }
        };
        *peer.member.lock() = Some(member.clone());

        let objects = self.manager.auto_replicated();
        info!(
            group = %self.group_id,
            member = %member,
            members = members.len(),
            objects = objects.len(),
            "member joined"
        );
        if let Some(record) = members.iter().find(|r| r.member_id == member) {
            self.broadcast(
                Some(&member),
                &Envelope::to_group(
                    self.group_id.clone(),
                    GroupMessage::MemberAdded(record.clone()),
                ),
            );
        }
        self.events.containers().publish(ContainerEvent::MemberAdded {
            group: self.group_id.clone(),
            member,
        });
        JoinResponse::Accept(JoinAccept {
            group: self.group_id.clone(),
            members,
            objects,
        })
    }

    fn admit(
        &self,
        state: &mut ServerState,
        peer: &PeerListener<C>,
        request: &JoinRequest,
    ) -> Result<Vec<MemberRecord>, String> {
        if peer.member.lock().is_some() {
            return Err("already joined".to_string());
        }
        if state.membership.contains(&request.member) {
            return Err(format!("duplicate member {}", request.member));
        }
        if let Some(max) = self.config.max_members {
            // The server's own record is not counted.
            if state.membership.len().saturating_sub(1) >= max {
                return Err(format!("group is full ({max} members)"));
            }
        }
        self.policy.admit(request, &state.membership)?;
        let connection = state
            .pending
            .remove(&peer.seq)
            .ok_or_else(|| "connection closed".to_string())?;
        state
            .membership
            .add(MemberRecord::new(request.member.clone()));
        state.peers.insert(request.member.clone(), connection);
        Ok(state.membership.records())
    }

    fn handle_envelope(&self, member: &Id, envelope: Envelope) {
        let _transition = self.transitions.lock();
        let Envelope { from, to, body } = envelope;
        if &from != member {
            warn!(group = %self.group_id, member = %member, claimed = %from, "envelope sender rewritten");
        }
        let envelope = Envelope {
            from: member.clone(),
            to,
            body,
        };

        match (&envelope.to, &envelope.body) {
            (_, GroupMessage::Leave) => {
                self.remove_member(member, None);
                return;
            }
            (_, GroupMessage::MemberAdded(_) | GroupMessage::MemberRemoved(_)) => {
                warn!(group = %self.group_id, member = %member, "membership message from member ignored");
                return;
            }
            (Some(to), _) if to != &self.group_id => {
                self.forward(to, &envelope);
                return;
            }
            (Some(_), _) => {}
            (None, _) => self.broadcast(Some(member), &envelope),
        }
        self.apply(envelope);
    }

    fn apply(&self, envelope: Envelope) {
        let Envelope { from, body, .. } = envelope;
        match body {
            GroupMessage::CreateObject(snapshot) => self.manager.apply_create(&from, snapshot),
            GroupMessage::DestroyObject(object_id) => self.manager.apply_destroy(&object_id),
            GroupMessage::ObjectMessage { object_id, payload } => {
                self.manager.deliver_message(&object_id, &from, &payload)
            }
            GroupMessage::MemberAdded(_) | GroupMessage::MemberRemoved(_) | GroupMessage::Leave => {}
        }
    }

    fn remove_member(&self, member: &Id, cause: Option<&ConnectionError>) {
        let _transition = self.transitions.lock();
        let connection = {
            let mut state = self.state.lock();
            if state.membership.remove(member).is_none() {
                return;
            }
            state.peers.remove(member)
        };
        if let Some(connection) = connection {
            connection.disconnect();
        }
        let deactivated = self.manager.deactivate_homed_by(member);
        match cause {
            Some(error) => warn!(
                group = %self.group_id,
                member = %member,
                error = %error,
                deactivated = deactivated.len(),
                "member lost"
            ),
            None => info!(
                group = %self.group_id,
                member = %member,
                deactivated = deactivated.len(),
                "member left"
            ),
        }
        self.broadcast(
            None,
            &Envelope::to_group(
                self.group_id.clone(),
                GroupMessage::MemberRemoved(member.clone()),
            ),
        );
        self.events.containers().publish(ContainerEvent::MemberRemoved {
            group: self.group_id.clone(),
            member: member.clone(),
        });
    }

    fn peer_closed(&self, peer: &PeerListener<C>, error: &ConnectionError) {
        let member = peer.member.lock().clone();
        match member {
            Some(member) => self.remove_member(&member, Some(error)),
            None => {
                self.state.lock().pending.remove(&peer.seq);
                debug!(group = %self.group_id, seq = peer.seq, "link closed before join");
            }
        }
    }

    /// Send to every joined member except `except`. Failures are logged.
    fn broadcast(&self, except: Option<&Id>, envelope: &Envelope) {
        let bytes = match self.codec.encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(group = %self.group_id, error = %e, "broadcast not encoded");
                return;
            }
        };
        let peers: Vec<(Id, Arc<FramedConnection>)> = self
            .state
            .lock()
            .peers
            .iter()
            .filter(|(id, _)| Some(*id) != except)
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        for (id, connection) in peers {
            if let Err(e) = connection.send_asynch(bytes.clone()) {
                debug!(group = %self.group_id, member = %id, error = %e, "relay failed");
            }
        }
    }

    fn forward(&self, to: &Id, envelope: &Envelope) {
        let connection = self.state.lock().peers.get(to).cloned();
        let Some(connection) = connection else {
            debug!(group = %self.group_id, to = %to, "envelope for unknown member dropped");
            return;
        };
        let sent = self
            .codec
            .encode(envelope)
            .map_err(|e| e.to_string())
            .and_then(|bytes| connection.send_asynch(bytes).map_err(|e| e.to_string()));
        if let Err(e) = sent {
            debug!(group = %self.group_id, to = %to, error = %e, "forward failed");
        }
    }
}

impl<C: MessageCodec> GroupSender for ServerInner<C> {
    fn send(&self, to: Option<&Id>, body: GroupMessage) -> Result<(), SharedObjectError> {
        if self.shutdown.is_cancelled() {
            return Err(SharedObjectError::NotConnected);
        }
        match to {
            None => {
                self.broadcast(None, &Envelope::to_group(self.group_id.clone(), body));
                Ok(())
            }
            Some(member) if member == &self.group_id => Ok(()),
            Some(member) => {
                let connection = self
                    .state
                    .lock()
                    .peers
                    .get(member)
                    .cloned()
                    .ok_or_else(|| SharedObjectError::UnknownMember(member.clone()))?;
                let envelope =
                    Envelope::to_member(self.group_id.clone(), member.clone(), body);
                connection.send_asynch(self.codec.encode(&envelope)?)?;
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    fn is_member(&self, id: &Id) -> bool {
        self.state.lock().membership.contains(id)
    }
}

/// Per-link listener on the server side.
struct PeerListener<C: MessageCodec> {
    server: Weak<ServerInner<C>>,
    seq: u64,
    member: Mutex<Option<Id>>,
}

impl<C: MessageCodec> ConnectionListener for PeerListener<C> {
    fn on_message(&self, payload: &[u8]) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let Some(member) = self.member.lock().clone() else {
            debug!(group = %server.group_id, seq = self.seq, "message before join dropped");
            return;
        };
        match server.codec.decode::<Envelope>(payload) {
            Ok(envelope) => server.handle_envelope(&member, envelope),
            Err(e) => warn!(group = %server.group_id, member = %member, error = %e, "undecodable envelope dropped"),
        }
    }

    fn on_request(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let server = self.server.upgrade()?;
        let response = match server.codec.decode::<JoinRequest>(payload) {
            Ok(request) => server.handle_join(self, request),
            Err(e) => JoinResponse::Reject {
                reason: format!("malformed join request: {e}"),
            },
        };
        match server.codec.encode(&response) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(group = %server.group_id, error = %e, "join response not encoded");
                None
            }
        }
    }

    fn on_disconnect(&self, error: &ConnectionError) {
        if let Some(server) = self.server.upgrade() {
            server.peer_closed(self, error);
        }
    }
}
