//! Membership: the per-container table of known group members.
//!
//! Every change bumps a [`MembershipVersion`], so observers can tell two
//! views apart without comparing member lists.

mod policy;

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::MembershipError;
use crate::identity::Id;

pub use policy::{MaxMembersPolicy, MembershipPolicy, OpenPolicy, PasswordPolicy};

/// Monotonically increasing membership version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Version 0 (empty table).
    pub fn new() -> Self {
        Self(0)
    }

    /// The next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// The member's container ID.
    pub member_id: Id,
    /// When the group admitted the member.
    pub joined_at: SystemTime,
}

impl MemberRecord {
    /// A record for a member joining now.
    pub fn new(member_id: Id) -> Self {
        Self {
            member_id,
            joined_at: SystemTime::now(),
        }
    }
}

/// Membership table.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    members: HashMap<Id, MemberRecord>,
    version: MembershipVersion,
}

impl Membership {
    /// Create an empty table at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a join snapshot.
    ///
    /// # Errors
    ///
    /// `DuplicateMember` if a member ID appears twice.
    pub fn from_snapshot(records: Vec<MemberRecord>) -> Result<Self, MembershipError> {
        let mut membership = Self::new();
        for record in records {
            let id = record.member_id.clone();
            if !membership.add(record) {
                return Err(MembershipError::DuplicateMember(id));
            }
        }
        Ok(membership)
    }

    /// Add a member. Returns false if it was already present.
    pub fn add(&mut self, record: MemberRecord) -> bool {
        if self.members.contains_key(&record.member_id) {
            return false;
        }
        self.members.insert(record.member_id.clone(), record);
        self.version = self.version.next();
        true
    }

    /// Remove a member, returning its record.
    pub fn remove(&mut self, member_id: &Id) -> Option<MemberRecord> {
        let removed = self.members.remove(member_id)?;
        self.version = self.version.next();
        Some(removed)
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        if !self.members.is_empty() {
            self.members.clear();
            self.version = self.version.next();
        }
    }

    /// Whether `member_id` is a member.
    pub fn contains(&self, member_id: &Id) -> bool {
        self.members.contains_key(member_id)
    }

    /// Record for `member_id`.
    pub fn get(&self, member_id: &Id) -> Option<&MemberRecord> {
        self.members.get(member_id)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member IDs, sorted.
    pub fn ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.members.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Member records in join order.
    pub fn records(&self) -> Vec<MemberRecord> {
        let mut records: Vec<MemberRecord> = self.members.values().cloned().collect();
        records.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.member_id.cmp(&b.member_id))
        });
        records
    }

    /// Current version.
    pub fn version(&self) -> MembershipVersion {
        self.version
    }
}
