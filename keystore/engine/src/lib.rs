//! Encrypted Data Storage Key Manager Core Library

pub mod audit;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod discover;
pub mod error;
pub mod logging;
pub mod replica;
pub mod sharing;

pub use catalog::{CatalogAdapter, CatalogBinding, ExceptionDecoder};
pub use config::EdsConfig;
pub use coordinator::KeyCoordinator;
pub use crypto::{CipherKind, CipherSession, KeyMaterial};
pub use discover::{DnsDiscovery, ServiceDiscovery, StaticDiscovery};
pub use error::{EdsError, Result};
pub use replica::ReplicaId;

#[cfg(test)]
mod tests;
