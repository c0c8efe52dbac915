//! Namespaces: named schemes that build and validate IDs.
//!
//! A namespace declares the argument shapes it accepts (for example
//! "exactly one string") and refuses anything else with
//! [`IdCreateError::ArgumentMismatch`]. Providers plug their own schemes in by
//! implementing [`Namespace`] and registering it with a
//! [`NamespaceRegistry`](super::NamespaceRegistry).

use std::fmt;

use crate::error::IdCreateError;

use super::id::{Guid, Id, IdValue};

/// A constructor argument for [`Namespace::create_instance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdArg {
    /// String argument.
    Str(String),
    /// Integer argument.
    Long(i64),
    /// Raw bytes argument.
    Bytes(Vec<u8>),
}

impl IdArg {
    /// The shape of this argument.
    pub fn kind(&self) -> ArgKind {
        match self {
            IdArg::Str(_) => ArgKind::Str,
            IdArg::Long(_) => ArgKind::Long,
            IdArg::Bytes(_) => ArgKind::Bytes,
        }
    }
}

impl From<&str> for IdArg {
    fn from(s: &str) -> Self {
        IdArg::Str(s.to_string())
    }
}

impl From<String> for IdArg {
    fn from(s: String) -> Self {
        IdArg::Str(s)
    }
}

impl From<i64> for IdArg {
    fn from(v: i64) -> Self {
        IdArg::Long(v)
    }
}

impl From<Vec<u8>> for IdArg {
    fn from(v: Vec<u8>) -> Self {
        IdArg::Bytes(v)
    }
}

/// Shape of a constructor argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A string.
    Str,
    /// An integer.
    Long,
    /// Raw bytes.
    Bytes,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgKind::Str => write!(f, "string"),
            ArgKind::Long => write!(f, "long"),
            ArgKind::Bytes => write!(f, "bytes"),
        }
    }
}

/// A named scheme that knows how to construct IDs.
pub trait Namespace: Send + Sync + fmt::Debug {
    /// Registry name of this namespace. Also the prefix of its IDs.
    fn name(&self) -> &str;

    /// URI-style scheme. Defaults to the name.
    fn scheme(&self) -> &str {
        self.name()
    }

    /// Argument shapes accepted by [`Namespace::create_instance`].
    fn supported_parameter_types(&self) -> &'static [&'static [ArgKind]];

    /// Build an ID from constructor arguments.
    ///
    /// # Errors
    ///
    /// `ArgumentMismatch` for wrong arity or types, `Malformed` for values
    /// the scheme rejects.
    fn create_instance(&self, args: &[IdArg]) -> Result<Id, IdCreateError>;

    /// Build an ID from the value part of an external form (`scheme:value`).
    fn create_from_external(&self, value: &str) -> Result<Id, IdCreateError> {
        self.create_instance(&[IdArg::Str(value.to_string())])
    }
}

/// Reject arguments that match none of the namespace's declared shapes.
pub fn check_arguments(namespace: &dyn Namespace, args: &[IdArg]) -> Result<(), IdCreateError> {
    let shapes = namespace.supported_parameter_types();
    let matches = shapes.iter().any(|shape| {
        shape.len() == args.len() && shape.iter().zip(args).all(|(k, a)| *k == a.kind())
    });
    if matches {
        return Ok(());
    }
    Err(IdCreateError::ArgumentMismatch {
        namespace: namespace.name().to_string(),
        expected: describe_shapes(shapes),
        found: describe_kinds(args.iter().map(IdArg::kind)),
    })
}

fn describe_shapes(shapes: &[&[ArgKind]]) -> String {
    shapes
        .iter()
        .map(|shape| describe_kinds(shape.iter().copied()))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn describe_kinds(kinds: impl Iterator<Item = ArgKind>) -> String {
    let parts: Vec<String> = kinds.map(|k| k.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// Namespace of string IDs under an arbitrary name (`group`, `string`, ...).
///
/// Accepts exactly one non-empty string argument.
#[derive(Debug, Clone)]
pub struct StringNamespace {
    name: String,
}

impl StringNamespace {
    /// Name of the default string namespace.
    pub const DEFAULT_NAME: &'static str = "string";

    /// Create a string namespace with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for StringNamespace {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME)
    }
}

impl Namespace for StringNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_parameter_types(&self) -> &'static [&'static [ArgKind]] {
        &[&[ArgKind::Str]]
    }

    fn create_instance(&self, args: &[IdArg]) -> Result<Id, IdCreateError> {
        check_arguments(self, args)?;
        match args {
            [IdArg::Str(s)] if !s.is_empty() => Ok(Id::new(&self.name, IdValue::String(s.clone()))),
            _ => Err(IdCreateError::Malformed {
                namespace: self.name.clone(),
                reason: "value cannot be empty".to_string(),
            }),
        }
    }
}

/// Namespace of random 128-bit IDs.
///
/// No arguments generates a fresh GUID; one 16-byte argument or one
/// 32-hex-digit string rebuilds an existing one.
#[derive(Debug, Clone, Default)]
pub struct GuidNamespace;

impl GuidNamespace {
    /// Registry name.
    pub const NAME: &'static str = "guid";

    /// Generate a fresh random GUID ID.
    pub fn generate(&self) -> Id {
        Id::new(Self::NAME, IdValue::Guid(Guid::random()))
    }

    fn malformed(reason: impl Into<String>) -> IdCreateError {
        IdCreateError::Malformed {
            namespace: Self::NAME.to_string(),
            reason: reason.into(),
        }
    }
}

impl Namespace for GuidNamespace {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_parameter_types(&self) -> &'static [&'static [ArgKind]] {
        &[&[], &[ArgKind::Bytes], &[ArgKind::Str]]
    }

    fn create_instance(&self, args: &[IdArg]) -> Result<Id, IdCreateError> {
        check_arguments(self, args)?;
        let guid = match args {
            [] => Guid::random(),
            [IdArg::Bytes(bytes)] => {
                let raw: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Self::malformed(format!("expected 16 bytes, got {}", bytes.len())))?;
                Guid(raw)
            }
            [IdArg::Str(s)] => Guid::from_hex(s)
                .ok_or_else(|| Self::malformed(format!("expected 32 hex digits, got {:?}", s)))?,
            _ => return Err(Self::malformed("unsupported arguments")),
        };
        Ok(Id::new(Self::NAME, IdValue::Guid(guid)))
    }
}

/// Namespace of integer IDs.
///
/// Accepts one integer, or one decimal string.
#[derive(Debug, Clone, Default)]
pub struct LongNamespace;

impl LongNamespace {
    /// Registry name.
    pub const NAME: &'static str = "long";
}

impl Namespace for LongNamespace {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_parameter_types(&self) -> &'static [&'static [ArgKind]] {
        &[&[ArgKind::Long], &[ArgKind::Str]]
    }

    fn create_instance(&self, args: &[IdArg]) -> Result<Id, IdCreateError> {
        check_arguments(self, args)?;
        let value = match args {
            [IdArg::Long(v)] => *v,
            [IdArg::Str(s)] => s.parse().map_err(|_| IdCreateError::Malformed {
                namespace: Self::NAME.to_string(),
                reason: format!("not an integer: {:?}", s),
            })?,
            _ => {
                return Err(IdCreateError::Malformed {
                    namespace: Self::NAME.to_string(),
                    reason: "unsupported arguments".to_string(),
                })
            }
        };
        Ok(Id::new(Self::NAME, IdValue::Long(value)))
    }
}
