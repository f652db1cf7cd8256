//! Service registration and discovery on top of etcd v3.
//!
//! - [`EtcdRegistry`]: register/unregister addresses, subscribe to full
//!   membership snapshots of a service
//! - [`EtcdClient`]: session lease, ephemeral/persistent keys and shared child
//!   watches that the registry is built from
//! - [`MemoryBackend`]: in-process store with the same semantics, for embedding
//!   and tests

pub mod constants;
pub mod store;
pub mod url;

mod client;
mod config;
mod errors;
mod keystore;
mod lease;
mod metrics;
mod registry;
mod utils;
mod watch;

pub use client::*;
pub use config::*;
pub use errors::*;
pub use keystore::ChildrenSnapshot;
pub use keystore::KeyStore;
pub use lease::BackendKeepAlive;
pub use lease::KeepAliveStrategy;
pub use lease::Lease;
pub use lease::LeaseManager;
pub use lease::LeaseState;
pub use metrics::gather_metrics;
pub use registry::*;
pub use store::KvBackend;
pub use store::MemoryBackend;
pub use url::Url;
pub use watch::*;
