//! Shared objects: replicated units of application state and behavior.
//!
//! A shared object lives in every member of a group. The copy on the
//! container that created it is the **primary**; that container is the
//! object's *home*. Other members hold **replicas** created from the
//! primary's `CreateObject` broadcast. Objects talk to their replicas through
//! the [`SharedObjectContext`] passed to every hook.
//!
//! # Example
//!
//! ```rust
//! use cohort::sharedobject::{SharedObject, SharedObjectContext};
//! use cohort::{Id, SharedObjectError};
//!
//! struct Counter {
//!     value: u64,
//! }
//!
//! impl SharedObject for Counter {
//!     fn handle_message(
//!         &mut self,
//!         _ctx: &mut SharedObjectContext<'_>,
//!         _from: &Id,
//!         payload: &[u8],
//!     ) -> Result<(), SharedObjectError> {
//!         if payload == b"incr" {
//!             self.value += 1;
//!         }
//!         Ok(())
//!     }
//!
//!     fn replication_state(&self) -> Vec<u8> {
//!         self.value.to_le_bytes().to_vec()
//!     }
//! }
//! ```

mod context;
mod factory;
mod lifecycle;
mod manager;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::SharedObjectError;
use crate::identity::Id;

pub use context::{GroupSender, SharedObjectContext};
pub use factory::{FactoryRegistry, SharedObjectFactory};
pub use lifecycle::{DeactivationReason, ObjectState};
pub use manager::SharedObjectManager;

bitflags! {
    /// Replication behavior of a shared object.
    ///
    /// # Flags
    ///
    /// - `AUTO_REPLICATE`: included in the snapshot sent to new members
    /// - `LOCAL_ONLY`: never replicated; survives disconnects and may be
    ///   created while disconnected
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReplicationFlags: u8 {
        /// Replicate to members that join later.
        const AUTO_REPLICATE = 1 << 0;
        /// Keep the object on this container only.
        const LOCAL_ONLY = 1 << 1;
    }
}

impl Serialize for ReplicationFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReplicationFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u8::deserialize(deserializer)?;
        Ok(ReplicationFlags::from_bits_truncate(bits))
    }
}

/// Everything a member needs to instantiate a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedObjectDescription {
    /// The object's ID, unique within the group.
    pub object_id: Id,
    /// The container holding the primary.
    pub home: Id,
    /// Factory type name.
    pub type_name: String,
    /// Replication flags.
    pub flags: ReplicationFlags,
    /// Arguments passed to the factory.
    pub init_args: Vec<u8>,
}

/// A replicated unit of application state and behavior.
///
/// Hooks run synchronously on the thread delivering the message, one at a
/// time per object. Errors and panics in [`SharedObject::handle_message`]
/// are caught by the manager and reported as
/// [`MessageDeliveryFailed`](crate::events::SharedObjectEvent::MessageDeliveryFailed).
pub trait SharedObject: Send + 'static {
    /// Called once before the object processes messages. An error aborts
    /// the creation.
    fn activate(&mut self, _ctx: &mut SharedObjectContext<'_>) -> Result<(), SharedObjectError> {
        Ok(())
    }

    /// Handle a message from `from` (the local container for local
    /// deliveries).
    fn handle_message(
        &mut self,
        ctx: &mut SharedObjectContext<'_>,
        from: &Id,
        payload: &[u8],
    ) -> Result<(), SharedObjectError>;

    /// Called when the object stops processing messages.
    fn deactivate(&mut self, _ctx: &mut SharedObjectContext<'_>, _reason: DeactivationReason) {}

    /// State sent along with the object to new replicas.
    fn replication_state(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Load state received from the primary, before activation.
    fn restore_state(&mut self, _state: &[u8]) -> Result<(), SharedObjectError> {
        Ok(())
    }
}
