//! Registry and router for the shared objects of one container.
//!
//! # Locking
//!
//! The registry map and each object's metadata sit behind short-lived
//! locks. An object's own lock is held only while one of its hooks runs, so
//! hooks of different objects run in parallel and hooks of one object run
//! one at a time. Events are published after every lock is released.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::SharedObjectError;
use crate::events::{EventBus, SharedObjectEvent};
use crate::identity::Id;
use crate::protocol::{GroupMessage, ObjectSnapshot};

use super::context::{GroupSender, SharedObjectContext};
use super::factory::FactoryRegistry;
use super::lifecycle::{DeactivationReason, ObjectState};
use super::{ReplicationFlags, SharedObject, SharedObjectDescription};

struct Slot {
    description: SharedObjectDescription,
    meta: Mutex<Meta>,
    object: Mutex<Box<dyn SharedObject>>,
}

struct Meta {
    home: Id,
    state: ObjectState,
}

impl Slot {
    fn state(&self) -> ObjectState {
        self.meta.lock().state
    }

    fn home(&self) -> Id {
        self.meta.lock().home.clone()
    }

    fn set_state(&self, next: ObjectState) {
        let mut meta = self.meta.lock();
        debug_assert!(
            meta.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            meta.state,
            next
        );
        meta.state = next;
    }

    fn flags(&self) -> ReplicationFlags {
        self.description.flags
    }

    fn is_local_only(&self) -> bool {
        self.flags().contains(ReplicationFlags::LOCAL_ONLY)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn guarded<R>(f: impl FnOnce() -> Result<R, SharedObjectError>) -> Result<R, SharedObjectError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(SharedObjectError::HandlerPanicked(panic_message(
            panic.as_ref(),
        ))),
    }
}

/// Registry of a container's shared objects.
///
/// Creates objects through a [`FactoryRegistry`], drives their lifecycle,
/// routes inbound messages to them and publishes
/// [`SharedObjectEvent`]s.
pub struct SharedObjectManager {
    local_id: Id,
    factories: FactoryRegistry,
    events: EventBus<SharedObjectEvent>,
    sender: Weak<dyn GroupSender>,
    objects: Mutex<HashMap<Id, Arc<Slot>>>,
}

impl std::fmt::Debug for SharedObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedObjectManager")
            .field("local_id", &self.local_id)
            .field("objects", &self.object_ids())
            .finish()
    }
}

impl SharedObjectManager {
    /// Create a manager sending to the group through `sender`.
    pub fn new(
        local_id: Id,
        factories: FactoryRegistry,
        events: EventBus<SharedObjectEvent>,
        sender: Weak<dyn GroupSender>,
    ) -> Self {
        Self {
            local_id,
            factories,
            events,
            sender,
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// ID of the owning container.
    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    /// The factory registry.
    pub fn factories(&self) -> &FactoryRegistry {
        &self.factories
    }

    /// Create a shared object homed on this container.
    ///
    /// Activates the object, then broadcasts it to the group unless it is
    /// `LOCAL_ONLY`. A failed broadcast is logged; the local object stays.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists`: the ID is taken
    /// - `NotConnected`: the group is unreachable and the object is not
    ///   `LOCAL_ONLY`
    /// - `UnknownFactory`: no factory for `type_name`
    /// - `CreateFailed`: the factory or the activation hook failed
    pub fn create_shared_object(
        &self,
        object_id: Id,
        type_name: &str,
        init_args: Vec<u8>,
        flags: ReplicationFlags,
    ) -> Result<(), SharedObjectError> {
        if self.contains(&object_id) {
            return Err(SharedObjectError::AlreadyExists(object_id));
        }
        let local_only = flags.contains(ReplicationFlags::LOCAL_ONLY);
        if !local_only && !self.group_connected() {
            return Err(SharedObjectError::NotConnected);
        }
        let object = guarded(|| {
            self.factories
                .create(type_name, &object_id, &self.local_id, &init_args)
        })?;

        let description = SharedObjectDescription {
            object_id: object_id.clone(),
            home: self.local_id.clone(),
            type_name: type_name.to_string(),
            flags,
            init_args,
        };
        let slot = self.install(description, object)?;
        if let Err(e) = self.activate(&slot) {
            self.discard(&slot);
            return Err(SharedObjectError::CreateFailed(e.to_string()));
        }
        info!(object = %object_id, type_name = %type_name, "shared object created");

        if !local_only {
            let snapshot = self.snapshot_of(&slot);
            if let Err(e) = self.send(None, GroupMessage::CreateObject(snapshot)) {
                warn!(object = %object_id, error = %e, "create broadcast failed");
            }
        }
        Ok(())
    }

    /// Create a replica from a remote `CreateObject`.
    ///
    /// Existing IDs are ignored. A missing factory is reported as
    /// `UnknownFactory`, other failures as `MessageDeliveryFailed`.
    pub fn apply_create(&self, from: &Id, snapshot: ObjectSnapshot) {
        let ObjectSnapshot { description, state } = snapshot;
        let object_id = description.object_id.clone();
        if self.contains(&object_id) {
            debug!(object = %object_id, "replica already exists");
            return;
        }
        let Some(factory) = self.factories.get(&description.type_name) else {
            warn!(object = %object_id, type_name = %description.type_name, "no factory for replica");
            self.events.publish(SharedObjectEvent::UnknownFactory {
                object_id,
                type_name: description.type_name,
            });
            return;
        };

        let created = guarded(|| {
            let mut object =
                factory.create(&object_id, &description.home, &description.init_args)?;
            if !state.is_empty() {
                object.restore_state(&state)?;
            }
            Ok(object)
        });
        let result = created.and_then(|object| {
            let slot = self.install(description, object)?;
            self.activate(&slot).inspect_err(|_| self.discard(&slot))
        });
        if let Err(error) = result {
            warn!(object = %object_id, error = %error, "replica creation failed");
            self.events.publish(SharedObjectEvent::MessageDeliveryFailed {
                object_id,
                from: from.clone(),
                error,
            });
        }
    }

    /// Apply a join snapshot. Failures are reported per object and skipped.
    pub fn apply_snapshot(&self, from: &Id, objects: Vec<ObjectSnapshot>) {
        for snapshot in objects {
            self.apply_create(from, snapshot);
        }
    }

    /// Destroy an object and tell the group, unless it is `LOCAL_ONLY`.
    ///
    /// Succeeds locally even if the broadcast fails.
    pub fn destroy_shared_object(&self, object_id: &Id) -> Result<(), SharedObjectError> {
        self.destroy_with(object_id, DeactivationReason::LocalDestroy)
    }

    /// Destroy a replica after a remote `DestroyObject`. Unknown IDs are
    /// ignored.
    pub fn apply_destroy(&self, object_id: &Id) {
        let Some(slot) = self.remove_slot(object_id) else {
            debug!(object = %object_id, "destroy for unknown object");
            return;
        };
        self.finish(&slot, DeactivationReason::RemoteDestroy);
    }

    /// Deliver `payload` from `from` to the object's handler.
    ///
    /// Unknown IDs are dropped and reported as `UnroutableMessage`. Handler
    /// errors and panics are reported as `MessageDeliveryFailed`.
    pub fn deliver_message(&self, object_id: &Id, from: &Id, payload: &[u8]) {
        let Some(slot) = self.slot(object_id) else {
            warn!(object = %object_id, from = %from, "message for unknown object dropped");
            self.events.publish(SharedObjectEvent::UnroutableMessage {
                object_id: object_id.clone(),
                from: from.clone(),
            });
            return;
        };
        if !slot.state().can_process_messages() {
            self.events.publish(SharedObjectEvent::MessageDeliveryFailed {
                object_id: object_id.clone(),
                from: from.clone(),
                error: SharedObjectError::Inactive(object_id.clone()),
            });
            return;
        }

        let (result, destroy) = self.run_hook(&slot, |object, ctx| {
            guarded(|| object.handle_message(ctx, from, payload))
        });
        if let Err(error) = result {
            warn!(object = %object_id, from = %from, error = %error, "message delivery failed");
            self.events.publish(SharedObjectEvent::MessageDeliveryFailed {
                object_id: object_id.clone(),
                from: from.clone(),
                error,
            });
        }
        if destroy {
            let _ = self.destroy_with(object_id, DeactivationReason::SelfDestroy);
        }
    }

    /// Send `payload` to the object's replicas: the whole group when `to`
    /// is `None`, otherwise one member.
    pub fn send_message(
        &self,
        object_id: &Id,
        to: Option<&Id>,
        payload: Vec<u8>,
    ) -> Result<(), SharedObjectError> {
        let slot = self
            .slot(object_id)
            .ok_or_else(|| SharedObjectError::NotFound(object_id.clone()))?;
        if slot.is_local_only() {
            debug!(object = %object_id, "local-only object, message not sent");
            return Ok(());
        }
        self.send(
            to,
            GroupMessage::ObjectMessage {
                object_id: object_id.clone(),
                payload,
            },
        )
    }

    /// Re-home an object on `new_home` and reactivate it if it was
    /// deactivated.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such object
    /// - `UnknownMember`: `new_home` is neither this container nor a member
    /// - `CreateFailed`: the activation hook failed; the object stays
    ///   inactive
    pub fn migrate_shared_object(&self, object_id: &Id, new_home: Id) -> Result<(), SharedObjectError> {
        let slot = self
            .slot(object_id)
            .ok_or_else(|| SharedObjectError::NotFound(object_id.clone()))?;
        if new_home != self.local_id && !self.sender.upgrade().is_some_and(|s| s.is_member(&new_home)) {
            return Err(SharedObjectError::UnknownMember(new_home));
        }
        let state = {
            let mut meta = slot.meta.lock();
            meta.home = new_home.clone();
            meta.state
        };
        info!(object = %object_id, home = %new_home, "shared object migrated");
        if state == ObjectState::Inactive {
            self.activate(&slot)
                .map_err(|e| SharedObjectError::CreateFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Deactivate the active objects homed on `member`. Returns their IDs.
    pub fn deactivate_homed_by(&self, member: &Id) -> Vec<Id> {
        let mut slots: Vec<Arc<Slot>> = self
            .objects
            .lock()
            .values()
            .filter(|slot| {
                let meta = slot.meta.lock();
                &meta.home == member && meta.state == ObjectState::Active
            })
            .cloned()
            .collect();
        slots.sort_by(|a, b| a.description.object_id.cmp(&b.description.object_id));

        let mut ids = Vec::with_capacity(slots.len());
        for slot in slots {
            self.deactivate(&slot, DeactivationReason::HomeDeparted);
            ids.push(slot.description.object_id.clone());
        }
        ids
    }

    /// Destroy every object that depends on group membership, without
    /// telling the group. `LOCAL_ONLY` objects stay.
    pub fn destroy_replicated(&self) {
        let mut removed: Vec<Arc<Slot>> = {
            let mut objects = self.objects.lock();
            let ids: Vec<Id> = objects
                .iter()
                .filter(|(_, slot)| !slot.is_local_only())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| objects.remove(id)).collect()
        };
        removed.sort_by(|a, b| a.description.object_id.cmp(&b.description.object_id));
        for slot in removed {
            self.finish(&slot, DeactivationReason::ContainerDisconnected);
        }
    }

    /// Snapshot of the auto-replicated objects, for new members.
    pub fn auto_replicated(&self) -> Vec<ObjectSnapshot> {
        let mut slots: Vec<Arc<Slot>> = self
            .objects
            .lock()
            .values()
            .filter(|slot| {
                slot.flags().contains(ReplicationFlags::AUTO_REPLICATE) && !slot.is_local_only()
            })
            .cloned()
            .collect();
        slots.sort_by(|a, b| a.description.object_id.cmp(&b.description.object_id));
        slots.iter().map(|slot| self.snapshot_of(slot)).collect()
    }

    /// Registered object IDs, sorted.
    pub fn object_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.objects.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether `object_id` is registered.
    pub fn contains(&self, object_id: &Id) -> bool {
        self.objects.lock().contains_key(object_id)
    }

    /// Whether `object_id` is registered and active.
    pub fn is_active(&self, object_id: &Id) -> bool {
        self.object_state(object_id) == Some(ObjectState::Active)
    }

    /// Lifecycle state of `object_id`.
    pub fn object_state(&self, object_id: &Id) -> Option<ObjectState> {
        self.slot(object_id).map(|slot| slot.state())
    }

    /// Description of `object_id`, with its current home.
    pub fn description(&self, object_id: &Id) -> Option<SharedObjectDescription> {
        self.slot(object_id).map(|slot| {
            let mut description = slot.description.clone();
            description.home = slot.home();
            description
        })
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether no object is registered.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    fn group_connected(&self) -> bool {
        self.sender.upgrade().is_some_and(|s| s.is_connected())
    }

    fn send(&self, to: Option<&Id>, body: GroupMessage) -> Result<(), SharedObjectError> {
        let sender = self
            .sender
            .upgrade()
            .ok_or(SharedObjectError::NotConnected)?;
        sender.send(to, body)
    }

    fn slot(&self, object_id: &Id) -> Option<Arc<Slot>> {
        self.objects.lock().get(object_id).cloned()
    }

    fn remove_slot(&self, object_id: &Id) -> Option<Arc<Slot>> {
        self.objects.lock().remove(object_id)
    }

    fn install(
        &self,
        description: SharedObjectDescription,
        object: Box<dyn SharedObject>,
    ) -> Result<Arc<Slot>, SharedObjectError> {
        let object_id = description.object_id.clone();
        let home = description.home.clone();
        let type_name = description.type_name.clone();
        let slot = Arc::new(Slot {
            meta: Mutex::new(Meta {
                home: home.clone(),
                state: ObjectState::Created,
            }),
            description,
            object: Mutex::new(object),
        });
        {
            let mut objects = self.objects.lock();
            if objects.contains_key(&object_id) {
                return Err(SharedObjectError::AlreadyExists(object_id));
            }
            objects.insert(object_id.clone(), slot.clone());
        }
        self.events.publish(SharedObjectEvent::Created {
            object_id,
            home,
            type_name,
        });
        Ok(slot)
    }

    fn run_hook<R>(
        &self,
        slot: &Slot,
        hook: impl FnOnce(&mut dyn SharedObject, &mut SharedObjectContext<'_>) -> R,
    ) -> (R, bool) {
        let sender = self.sender.upgrade();
        let home = slot.home();
        let mut object = slot.object.lock();
        let mut ctx = SharedObjectContext::new(
            &slot.description.object_id,
            &home,
            &self.local_id,
            slot.flags(),
            sender.as_deref(),
        );
        let result = hook(object.as_mut(), &mut ctx);
        (result, ctx.destroy_requested())
    }

    fn activate(&self, slot: &Arc<Slot>) -> Result<(), SharedObjectError> {
        let (result, destroy) =
            self.run_hook(slot, |object, ctx| guarded(|| object.activate(ctx)));
        result?;
        slot.set_state(ObjectState::Active);
        let object_id = slot.description.object_id.clone();
        self.events.publish(SharedObjectEvent::Activated {
            object_id: object_id.clone(),
        });
        if destroy {
            let _ = self.destroy_with(&object_id, DeactivationReason::SelfDestroy);
        }
        Ok(())
    }

    fn deactivate(&self, slot: &Slot, reason: DeactivationReason) {
        let (result, _) = self.run_hook(slot, |object, ctx| {
            guarded(|| {
                object.deactivate(ctx, reason);
                Ok(())
            })
        });
        if let Err(e) = result {
            warn!(object = %slot.description.object_id, error = %e, "deactivation hook failed");
        }
        slot.set_state(ObjectState::Inactive);
        self.events.publish(SharedObjectEvent::Deactivated {
            object_id: slot.description.object_id.clone(),
            reason,
        });
    }

    /// Deactivate (if active) and mark destroyed. The slot is already out
    /// of the registry.
    fn finish(&self, slot: &Slot, reason: DeactivationReason) {
        match slot.state() {
            ObjectState::Active => self.deactivate(slot, reason),
            ObjectState::Created => slot.set_state(ObjectState::Inactive),
            ObjectState::Inactive | ObjectState::Destroyed => {}
        }
        if slot.state() == ObjectState::Destroyed {
            return;
        }
        slot.set_state(ObjectState::Destroyed);
        debug!(object = %slot.description.object_id, reason = ?reason, "shared object destroyed");
        self.events.publish(SharedObjectEvent::Destroyed {
            object_id: slot.description.object_id.clone(),
        });
    }

    /// Drop a slot whose activation failed.
    fn discard(&self, slot: &Arc<Slot>) {
        let object_id = &slot.description.object_id;
        let mut objects = self.objects.lock();
        if objects.get(object_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            objects.remove(object_id);
        }
        drop(objects);
        self.finish(slot, DeactivationReason::ActivationFailed);
    }

    fn destroy_with(&self, object_id: &Id, reason: DeactivationReason) -> Result<(), SharedObjectError> {
        let slot = self
            .remove_slot(object_id)
            .ok_or_else(|| SharedObjectError::NotFound(object_id.clone()))?;
        self.finish(&slot, reason);
        if !slot.is_local_only() && self.group_connected() {
            if let Err(e) = self.send(None, GroupMessage::DestroyObject(object_id.clone())) {
                warn!(object = %object_id, error = %e, "destroy broadcast failed");
            }
        }
        Ok(())
    }

    fn snapshot_of(&self, slot: &Slot) -> ObjectSnapshot {
        let state = slot.object.lock().replication_state();
        let mut description = slot.description.clone();
        description.home = slot.home();
        ObjectSnapshot { description, state }
    }
}
