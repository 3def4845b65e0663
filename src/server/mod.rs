//! Connection lifecycle, admission control, and virtual-host dispatch.

pub mod client;
pub mod server;
pub mod vhost;

pub use client::{Client, ClientIdentity, ConnectionFilter, Liveness};
pub use server::{Server, ServerBuilder, ServerState};
pub use vhost::VhostContainer;
