//! OpenShift broker REST client.

use super::types::{ApplicationPayload, BrokerResponse, UserPayload};
use super::{ApplicationInfo, ControlConnection, ControlPlane};
use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use url::Url;

const API_VERSION: &str = "1.6";

/// Connects to a broker given its host name or base URL.
#[derive(Debug, Clone, Default)]
pub struct BrokerClient;

impl BrokerClient {
    pub fn new() -> Self {
        Self
    }
}

impl ControlPlane for BrokerClient {
    type Connection = BrokerConnection;

    fn connect(&self, address: &str, user: &str, secret: &str) -> Result<BrokerConnection> {
        let mut connection = BrokerConnection::new(address, user, secret)?;
        let login = connection
            .fetch_login()
            .with_context(|| format!("Could not authenticate {} at broker {}", user, address))?;
        tracing::info!("Authenticated at broker {} as {}", connection.base, login);
        connection.login = login;
        Ok(connection)
    }
}

/// An authenticated broker session. Every request carries basic auth.
#[derive(Debug, Clone)]
pub struct BrokerConnection {
    base: Url,
    login: String,
    authorization: String,
}

impl BrokerConnection {
    fn new(address: &str, user: &str, secret: &str) -> Result<Self> {
        Ok(Self {
            base: broker_base_url(address)?,
            login: user.to_string(),
            authorization: format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", user, secret))
            ),
        })
    }

    fn fetch_login(&self) -> Result<String> {
        let url = self.endpoint(&["user"])?;
        let response: BrokerResponse<UserPayload> = self.get(&url)?;
        if !response.is_ok() {
            return Err(anyhow!("Broker rejected user: {}", response.message_text()));
        }
        response
            .data
            .map(|user| user.login)
            .ok_or_else(|| anyhow!("Broker returned no user data"))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Broker URL {} cannot have a path", self.base))?
            .pop_if_empty()
            .extend(["broker", "rest"])
            .extend(segments);
        Ok(url)
    }

    fn get<T: DeserializeOwned>(&self, url: &Url) -> Result<BrokerResponse<T>> {
        tracing::debug!("GET {}", url);
        let response = smolhttp::Client::new(url.as_str())
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?
            .get()
            .headers(vec![
                ("Authorization".to_string(), self.authorization.clone()),
                (
                    "Accept".to_string(),
                    format!("application/json; version={}", API_VERSION),
                ),
                ("User-Agent".to_string(), "openshift-proxy".to_string()),
            ])
            .send()
            .map_err(|e| anyhow!("Broker request failed: {}", e))?;

        let body = response.text();
        serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse broker response: {}. Body: {}", e, body))
    }
}

impl ControlConnection for BrokerConnection {
    fn user(&self) -> &str {
        &self.login
    }

    fn application(&self, namespace: &str, application: &str) -> Result<Option<ApplicationInfo>> {
        let mut url = self.endpoint(&["domain", namespace, "application", application])?;
        url.set_query(Some("include=cartridges"));

        let response: BrokerResponse<ApplicationPayload> = self.get(&url)?;
        if response.is_not_found() {
            tracing::debug!(
                "Broker has no application {} in namespace {}: {}",
                application,
                namespace,
                response.message_text()
            );
            return Ok(None);
        }
        if !response.is_ok() {
            return Err(anyhow!(
                "Broker lookup of {} in {} failed: {}",
                application,
                namespace,
                response.message_text()
            ));
        }
        Ok(response.data.map(Into::into))
    }
}

/// `broker.example.com` becomes `https://broker.example.com/`; full URLs are kept.
fn broker_base_url(address: &str) -> Result<Url> {
    let raw = if address.contains("://") {
        address.to_string()
    } else {
        format!("https://{}/", address)
    };
    Url::parse(&raw).with_context(|| format!("Invalid broker address {}", address))
}
