//! Broker REST payloads.

use super::{ApplicationInfo, ServiceInfo};
use serde::Deserialize;

/// Envelope wrapping every broker response.
#[derive(Debug, Deserialize)]
pub struct BrokerResponse<T> {
    pub status: String,
    pub data: Option<T>,
    #[serde(default)]
    pub messages: Vec<BrokerMessage>,
}

#[derive(Debug, Deserialize)]
pub struct BrokerMessage {
    #[serde(default)]
    pub text: String,
}

impl<T> BrokerResponse<T> {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn is_not_found(&self) -> bool {
        self.status == "not_found"
    }

    /// Broker messages joined into one line, for error reporting.
    pub fn message_text(&self) -> String {
        let texts: Vec<&str> = self
            .messages
            .iter()
            .map(|m| m.text.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        if texts.is_empty() {
            self.status.clone()
        } else {
            texts.join("; ")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UserPayload {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct ApplicationPayload {
    pub name: String,
    pub ssh_url: String,
    #[serde(default)]
    pub cartridges: Vec<CartridgePayload>,
}

#[derive(Debug, Deserialize)]
pub struct CartridgePayload {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyPayload>,
}

#[derive(Debug, Deserialize)]
pub struct PropertyPayload {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl From<ApplicationPayload> for ApplicationInfo {
    fn from(payload: ApplicationPayload) -> Self {
        Self {
            name: payload.name,
            ssh_url: payload.ssh_url,
            services: payload.cartridges.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<CartridgePayload> for ServiceInfo {
    fn from(payload: CartridgePayload) -> Self {
        Self {
            name: payload.name,
            properties: payload
                .properties
                .into_iter()
                .filter_map(|p| p.value.map(|value| (p.name, value)))
                .collect(),
        }
    }
}
