//! Control-plane access: resolving applications and their cartridges.
//!
//! `ControlPlane` and `ControlConnection` are the seams the tunnel handler
//! uses; `BrokerClient` implements them against the OpenShift broker REST API.

mod client;
mod types;

pub use client::{BrokerClient, BrokerConnection};

use anyhow::Result;
use std::collections::BTreeMap;

/// An application as known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub name: String,
    /// `ssh://user@host` of the application's gear
    pub ssh_url: String,
    pub services: Vec<ServiceInfo>,
}

/// An embedded service (cartridge) of an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub properties: BTreeMap<String, String>,
}

impl ApplicationInfo {
    pub fn service(&self, name: &str) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.name == name)
    }
}

impl ServiceInfo {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Creates authenticated control-plane connections.
pub trait ControlPlane {
    type Connection: ControlConnection;

    fn connect(&self, address: &str, user: &str, secret: &str) -> Result<Self::Connection>;
}

/// An authenticated control-plane connection.
pub trait ControlConnection {
    /// Login of the authenticated user.
    fn user(&self) -> &str;

    /// Look up an application in the user's namespace.
    ///
    /// Returns `Ok(None)` when the namespace or the application does not exist.
    fn application(&self, namespace: &str, application: &str) -> Result<Option<ApplicationInfo>>;
}
