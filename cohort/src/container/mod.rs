//! Containers: a member's endpoint in a group, and the server hosting one.
//!
//! A [`Container`] joins a group through a pluggable
//! [`Transport`](crate::connection::Transport). A [`GroupServer`] hosts the
//! group: it admits joiners, owns the authoritative membership table and
//! relays traffic between members.

mod client;
mod server;
mod state;

pub use client::{ConnectContext, Container, ContainerBuilder};
pub use server::{GroupServer, GroupServerBuilder};
pub use state::ConnectionState;
