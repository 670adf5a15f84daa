//! PostgreSQL driver on top of sqlx.

use super::{ConnectionProperties, DatabaseConnection, DatabaseDriver, PropertyInfo};
use anyhow::{Context, Result, anyhow};
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use url::Url;

const SCHEMES: [&str; 2] = ["postgres", "postgresql"];
const DEFAULT_PORT: u16 = 5432;

/// Property forwarded to the server as `application_name`.
pub const APPLICATION_NAME_KEY: &str = "application_name";

/// Connects a single `PgConnection` to the tunnel's local port.
#[derive(Debug, Clone, Default)]
pub struct PgDriver;

impl PgDriver {
    pub fn new() -> Self {
        Self
    }
}

impl DatabaseDriver for PgDriver {
    type Connection = PgConnection;

    fn accepts_driver(&self, name: &str) -> bool {
        SCHEMES.iter().any(|scheme| scheme.eq_ignore_ascii_case(name))
    }

    fn connect(&self, url: &str, properties: &ConnectionProperties) -> Result<PgConnection> {
        let options = connect_options(url, properties)?;
        tracing::debug!("Connecting to PostgreSQL at {}", url);
        smol::block_on(PgConnection::connect_with(&options))
            .with_context(|| format!("Failed to connect to {}", url))
    }

    fn property_info(&self, properties: &ConnectionProperties) -> Vec<PropertyInfo> {
        let info = |name: &'static str, description: &'static str| PropertyInfo {
            name,
            value: properties.get(name).map(str::to_string),
            description,
            required: false,
        };
        vec![
            info(super::USER_KEY, "Database user"),
            info(super::PASSWORD_KEY, "Database password"),
            info(APPLICATION_NAME_KEY, "Reported to the server as application_name"),
        ]
    }
}

impl DatabaseConnection for PgConnection {
    fn close(self) -> Result<()> {
        smol::block_on(Connection::close(self)).context("Failed to close database connection")
    }
}

/// Build connect options from `postgres://host:port/database` and the properties.
fn connect_options(url: &str, properties: &ConnectionProperties) -> Result<PgConnectOptions> {
    let parsed = Url::parse(url).context("Invalid connection URL format")?;
    if !SCHEMES.iter().any(|scheme| *scheme == parsed.scheme()) {
        return Err(anyhow!("URL must use a postgres:// scheme: {}", url));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("Missing hostname in URL"))?;
    let mut options = PgConnectOptions::new()
        .host(host)
        .port(parsed.port().unwrap_or(DEFAULT_PORT));

    let database = parsed.path().trim_start_matches('/');
    if !database.is_empty() {
        options = options.database(database);
    }
    if let Some(user) = properties.user() {
        options = options.username(user);
    }
    if let Some(password) = properties.password() {
        options = options.password(password);
    }
    if let Some(name) = properties.get(APPLICATION_NAME_KEY) {
        options = options.application_name(name);
    }
    Ok(options)
}
