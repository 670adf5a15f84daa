//! Database connections through OpenShift-hosted SSH tunnels.
//!
//! This crate provides:
//! - `services::descriptor` - Parsing of `openshiftproxy://` connection descriptors
//! - `services::ssh` - SSH sessions and forwardable remote ports
//! - `services::control` - Broker REST client resolving applications and cartridges
//! - `services::tunnel` - `TunnelHandler`, which ties the above together
//! - `driver` - `ProxyDriver`, the entry point handing a local port to a database driver

pub mod config;
pub mod driver;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

pub use config::TunnelConfig;
pub use driver::{ConnectionProperties, ProxyDriver, TunneledConnection};
pub use services::descriptor::{ConnectionDescriptor, DescriptorError};
pub use services::tunnel::{DatabaseMetadata, TunnelHandler};
