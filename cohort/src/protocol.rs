//! Group protocol messages.
//!
//! # Flow
//!
//! ```text
//! joiner                         group server
//!   | -- JoinRequest (synch) -------> |
//!   | <------ JoinResponse ---------- |   Accept { group, members, objects }
//!   |                                 |   or Reject { reason }
//!   | == Envelope (asynch) ==========>|   relayed to members
//!   | <========= Envelope ============|
//!   | -- Envelope { Leave } --------> |
//! ```
//!
//! After the handshake every message is an [`Envelope`]. An envelope without
//! a recipient goes to the whole group; one with a recipient goes to that
//! member only.

use serde::{Deserialize, Serialize};

use crate::identity::Id;
use crate::membership::MemberRecord;
use crate::sharedobject::SharedObjectDescription;

/// Request to join a group, sent synchronously right after the connection
/// opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// The joining container.
    pub member: Id,
    /// Credentials checked by the group's admission policy.
    pub credentials: Option<String>,
    /// Application data for the admission policy.
    pub data: Option<Vec<u8>>,
}

/// The group's answer to a [`JoinRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinResponse {
    /// Admitted.
    Accept(JoinAccept),
    /// Refused.
    Reject {
        /// Why the group refused.
        reason: String,
    },
}

/// State handed to a new member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAccept {
    /// The group ID.
    pub group: Id,
    /// Every member, the joiner and the group server included.
    pub members: Vec<MemberRecord>,
    /// Auto-replicated shared objects.
    pub objects: Vec<ObjectSnapshot>,
}

/// A shared object as sent to replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// How to instantiate the object.
    pub description: SharedObjectDescription,
    /// The object's replication state.
    pub state: Vec<u8>,
}

/// Body of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// A member joined.
    MemberAdded(MemberRecord),
    /// A member left.
    MemberRemoved(Id),
    /// The sender is leaving.
    Leave,
    /// Create a replica.
    CreateObject(ObjectSnapshot),
    /// Destroy a replica.
    DestroyObject(Id),
    /// Message for a shared object.
    ObjectMessage {
        /// Target object.
        object_id: Id,
        /// Application bytes.
        payload: Vec<u8>,
    },
}

/// Routed protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending member.
    pub from: Id,
    /// Recipient, or `None` for the whole group.
    pub to: Option<Id>,
    /// The message.
    pub body: GroupMessage,
}

impl Envelope {
    /// Envelope for the whole group.
    pub fn to_group(from: Id, body: GroupMessage) -> Self {
        Self {
            from,
            to: None,
            body,
        }
    }

    /// Envelope for one member.
    pub fn to_member(from: Id, to: Id, body: GroupMessage) -> Self {
        Self {
            from,
            to: Some(to),
            body,
        }
    }
}
