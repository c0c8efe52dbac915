//! # cohort
//!
//! Container and shared-object framework for loosely-coupled group
//! applications.
//!
//! A [`Container`] joins a group hosted by a [`GroupServer`], receives the
//! group's membership and shared objects in the join handshake, and from
//! then on keeps its replicas in step with the rest of the group.
//!
//! ## Layers
//!
//! - [`identity`]: namespace-qualified [`Id`]s and the [`NamespaceRegistry`]
//! - [`connection`]: the [`Connection`](connection::Connection) contract,
//!   its framed implementation, and memory and TCP transports
//! - [`protocol`]: join handshake and routed [`Envelope`](protocol::Envelope)s
//! - [`membership`]: membership table and admission policies
//! - [`sharedobject`]: the [`SharedObject`](sharedobject::SharedObject)
//!   trait, factories and the [`SharedObjectManager`]
//! - [`events`]: typed event buses for container and shared-object events
//!
//! ## Runtime
//!
//! Everything runs on Tokio. Each open connection owns one reader task and
//! one writer task. Shared object hooks and event handlers run
//! synchronously on the task that triggered them.
//!
//! The library installs no `tracing` subscriber.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod config;
mod container;
mod error;

pub mod connection;
pub mod events;
pub mod identity;
pub mod membership;
pub mod protocol;
pub mod sharedobject;
pub mod wire;

// Codec exports
pub use codec::{JsonCodec, MessageCodec};

// Configuration exports
pub use config::{ConnectionConfig, ContainerConfig, ContainerConfigBuilder, ServerConfig};

// Container exports
pub use container::{
    ConnectContext, ConnectionState, Container, ContainerBuilder, GroupServer, GroupServerBuilder,
};

// Error exports
pub use error::{
    CodecError, ConfigError, ConnectError, ConnectionError, IdCreateError, MembershipError,
    SharedObjectError,
};

// Identity exports
pub use identity::{Guid, Id, IdValue, NamespaceRegistry};

// Shared object exports
pub use sharedobject::{ReplicationFlags, SharedObjectManager};
