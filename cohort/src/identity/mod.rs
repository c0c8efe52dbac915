//! Identity: namespace-qualified IDs and the namespace registry.

mod id;
mod namespace;
mod registry;

pub use id::{Guid, Id, IdValue};
pub use namespace::{
    check_arguments, ArgKind, GuidNamespace, IdArg, LongNamespace, Namespace, StringNamespace,
};
pub use registry::NamespaceRegistry;
