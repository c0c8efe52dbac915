//! Namespace-qualified identifiers for containers, groups and shared objects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 128-bit globally unique identifier.
///
/// Rendered as 32 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Generate a random GUID.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Parse 32 hex digits (case-insensitive).
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Opaque value carried by an [`Id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdValue {
    /// Free-form string value.
    String(String),
    /// 128-bit GUID.
    Guid(Guid),
    /// Signed 64-bit value.
    Long(i64),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::String(s) => f.write_str(s),
            IdValue::Guid(g) => write!(f, "{}", g),
            IdValue::Long(v) => write!(f, "{}", v),
        }
    }
}

/// Immutable, namespace-qualified identifier.
///
/// # Structure
///
/// - `namespace`: name of the [`Namespace`](super::Namespace) that built it
/// - `value`: opaque value (string, GUID or integer)
///
/// # String Format
///
/// `namespace:value`
///
/// Examples: `group:42`, `guid:9f0c2a...`, `long:17`
///
/// # Equality
///
/// Equality and hashing cover both the namespace and the value, so
/// `string:42` and `group:42` are different IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
    namespace: String,
    value: IdValue,
}

impl Id {
    /// Create an ID. Namespaces call this after validating their arguments.
    pub fn new(namespace: impl Into<String>, value: IdValue) -> Self {
        Self {
            namespace: namespace.into(),
            value,
        }
    }

    /// Name of the namespace this ID belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The opaque value.
    pub fn value(&self) -> &IdValue {
        &self.value
    }

    /// The value rendered as a string, without the namespace prefix.
    pub fn name(&self) -> String {
        self.value.to_string()
    }

    /// Convert to string format: `namespace:value`.
    pub fn to_external_form(&self) -> String {
        format!("{}:{}", self.namespace, self.value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}
