//! What a shared object sees while one of its hooks runs.

use tracing::debug;

use crate::error::SharedObjectError;
use crate::identity::Id;
use crate::protocol::GroupMessage;

use super::ReplicationFlags;

/// Outbound path from a [`SharedObjectManager`](super::SharedObjectManager)
/// to the group. Client containers and group servers implement it.
pub trait GroupSender: Send + Sync {
    /// Send `body` to one member, or to the whole group when `to` is `None`.
    fn send(&self, to: Option<&Id>, body: GroupMessage) -> Result<(), SharedObjectError>;

    /// Whether the group can currently be reached.
    fn is_connected(&self) -> bool;

    /// Whether `id` is a current member of the group.
    fn is_member(&self, id: &Id) -> bool;
}

/// Handle passed to [`SharedObject`](super::SharedObject) hooks.
pub struct SharedObjectContext<'a> {
    object_id: &'a Id,
    home: &'a Id,
    local_id: &'a Id,
    flags: ReplicationFlags,
    sender: Option<&'a dyn GroupSender>,
    destroy_requested: bool,
}

impl<'a> SharedObjectContext<'a> {
    pub(crate) fn new(
        object_id: &'a Id,
        home: &'a Id,
        local_id: &'a Id,
        flags: ReplicationFlags,
        sender: Option<&'a dyn GroupSender>,
    ) -> Self {
        Self {
            object_id,
            home,
            local_id,
            flags,
            sender,
            destroy_requested: false,
        }
    }

    /// This object's ID.
    pub fn object_id(&self) -> &Id {
        self.object_id
    }

    /// The container holding the primary.
    pub fn home_container_id(&self) -> &Id {
        self.home
    }

    /// The container running this hook.
    pub fn local_container_id(&self) -> &Id {
        self.local_id
    }

    /// Whether this copy is the primary.
    pub fn is_primary(&self) -> bool {
        self.home == self.local_id
    }

    /// Send `payload` to every other replica of this object.
    ///
    /// A `LOCAL_ONLY` object has no replicas; the call does nothing.
    pub fn send_to_group(&self, payload: Vec<u8>) -> Result<(), SharedObjectError> {
        self.send(None, payload)
    }

    /// Send `payload` to this object's replica on `member`.
    pub fn send_to(&self, member: &Id, payload: Vec<u8>) -> Result<(), SharedObjectError> {
        self.send(Some(member), payload)
    }

    /// Destroy this object once the current hook returns.
    pub fn request_destroy(&mut self) {
        self.destroy_requested = true;
    }

    pub(crate) fn destroy_requested(&self) -> bool {
        self.destroy_requested
    }

    fn send(&self, to: Option<&Id>, payload: Vec<u8>) -> Result<(), SharedObjectError> {
        if self.flags.contains(ReplicationFlags::LOCAL_ONLY) {
            debug!(object = %self.object_id, "local-only object, message not sent");
            return Ok(());
        }
        let sender = self.sender.ok_or(SharedObjectError::NotConnected)?;
        sender.send(
            to,
            GroupMessage::ObjectMessage {
                object_id: self.object_id.clone(),
                payload,
            },
        )
    }
}
