//! Admission policies for group servers.

use std::fmt;

use crate::protocol::JoinRequest;

use super::Membership;

/// Decides whether a joiner may enter the group.
pub trait MembershipPolicy: Send + Sync + fmt::Debug {
    /// Admit or refuse `request` given the current table. The error string
    /// is sent back to the joiner as the rejection reason.
    fn admit(&self, request: &JoinRequest, membership: &Membership) -> Result<(), String>;
}

/// Admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPolicy;

impl MembershipPolicy for OpenPolicy {
    fn admit(&self, _request: &JoinRequest, _membership: &Membership) -> Result<(), String> {
        Ok(())
    }
}

/// Admits joiners whose credentials match a shared password.
#[derive(Clone)]
pub struct PasswordPolicy {
    password: String,
}

impl PasswordPolicy {
    /// Require `password`.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl fmt::Debug for PasswordPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordPolicy").finish_non_exhaustive()
    }
}

impl MembershipPolicy for PasswordPolicy {
    fn admit(&self, request: &JoinRequest, _membership: &Membership) -> Result<(), String> {
        match request.credentials.as_deref() {
            Some(given) if given == self.password => Ok(()),
            Some(_) => Err("invalid credentials".to_string()),
            None => Err("credentials required".to_string()),
        }
    }
}

/// Admits joiners while the group is below a size limit.
#[derive(Debug, Clone, Copy)]
pub struct MaxMembersPolicy {
    max: usize,
}

impl MaxMembersPolicy {
    /// Allow at most `max` members.
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl MembershipPolicy for MaxMembersPolicy {
    fn admit(&self, _request: &JoinRequest, membership: &Membership) -> Result<(), String> {
        if membership.len() >= self.max {
            return Err(format!("group is full ({} members)", self.max));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Id, IdValue};
    use crate::membership::MemberRecord;

    fn request(credentials: Option<&str>) -> JoinRequest {
        JoinRequest {
            member: Id::new("member", IdValue::String("joiner".to_string())),
            credentials: credentials.map(str::to_string),
            data: None,
        }
    }

    #[test]
    fn test_open_policy() {
        assert!(OpenPolicy.admit(&request(None), &Membership::new()).is_ok());
    }

    #[test]
    fn test_password_policy() {
        let policy = PasswordPolicy::new("secret");
        let table = Membership::new();
        assert!(policy.admit(&request(Some("secret")), &table).is_ok());
        assert_eq!(
            policy.admit(&request(Some("guess")), &table),
            Err("invalid credentials".to_string())
        );
        assert_eq!(
            policy.admit(&request(None), &table),
            Err("credentials required".to_string())
        );
        assert!(!format!("{:?}", policy).contains("secret"));
    }

    #[test]
    fn test_max_members_policy() {
        let policy = MaxMembersPolicy::new(1);
        let mut table = Membership::new();
        assert!(policy.admit(&request(None), &table).is_ok());
        table.add(MemberRecord::new(Id::new("member", IdValue::Long(1))));
        assert!(policy.admit(&request(None), &table).is_err());
    }
}
