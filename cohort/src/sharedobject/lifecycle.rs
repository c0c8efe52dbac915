//! Shared object lifecycle state machine and deactivation reasons.

use serde::{Deserialize, Serialize};

/// Shared object lifecycle state.
///
/// # State Transitions
///
/// ```text
/// Created → Active ⇄ Inactive → Destroyed
///    ↓                  ↑
///    └──────────────────┘ (activation failed)
/// ```
///
/// # Invariants
///
/// - Only `Active` objects process messages
/// - `Destroyed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    /// Instantiated by its factory, not yet activated.
    Created,
    /// Activated; processes messages.
    Active,
    /// Deactivated, for example because its home left the group. May be
    /// migrated and reactivated.
    Inactive,
    /// Removed from the manager.
    Destroyed,
}

impl ObjectState {
    /// Check if transition to `next` is valid.
    pub fn can_transition_to(&self, next: ObjectState) -> bool {
        use ObjectState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Inactive)
                | (Active, Inactive)
                | (Inactive, Active)
                | (Inactive, Destroyed)
        )
    }

    /// Whether the object processes messages in this state.
    pub fn can_process_messages(&self) -> bool {
        matches!(self, ObjectState::Active)
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectState::Destroyed)
    }
}

/// Why a shared object is being deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeactivationReason {
    /// `destroy_shared_object` on this container.
    LocalDestroy,
    /// Another member destroyed the object.
    RemoteDestroy,
    /// The object asked to be destroyed from its own handler.
    SelfDestroy,
    /// The object's home container left the group.
    HomeDeparted,
    /// This container left the group.
    ContainerDisconnected,
    /// Activation failed.
    ActivationFailed,
}

impl DeactivationReason {
    /// Whether destruction follows the deactivation.
    pub fn is_final(&self) -> bool {
        !matches!(self, DeactivationReason::HomeDeparted)
    }
}
