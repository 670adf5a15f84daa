//! Database driver entry point.
//!
//! `ProxyDriver` accepts `openshiftproxy://` descriptors, sets up the tunnel
//! and hands `<driver>://localhost:<port>/<database>` to the target driver.
//! There is no global registry: build one `ProxyDriver` where the
//! application is composed and keep it.

mod connection;
mod postgres;
mod properties;

pub use connection::TunneledConnection;
pub use postgres::{APPLICATION_NAME_KEY, PgDriver};
pub use properties::{ConnectionProperties, PASSWORD_KEY, PRIVATE_KEY_PATH_KEY, USER_KEY};

use crate::config::TunnelConfig;
use crate::services::control::{BrokerClient, ControlPlane};
use crate::services::descriptor::{self, ConnectionDescriptor};
use crate::services::ssh::{SessionConnector, SshConnector};
use crate::services::tunnel::TunnelHandler;
use anyhow::{Context, Result, anyhow};

/// A driver the tunnel's local port is handed to.
pub trait DatabaseDriver {
    type Connection: DatabaseConnection;

    /// True if this driver serves the descriptor's `driver` parameter.
    fn accepts_driver(&self, name: &str) -> bool;

    fn connect(&self, url: &str, properties: &ConnectionProperties) -> Result<Self::Connection>;

    /// Properties this driver understands, with their current values.
    fn property_info(&self, _properties: &ConnectionProperties) -> Vec<PropertyInfo> {
        Vec::new()
    }
}

pub trait DatabaseConnection {
    fn close(self) -> Result<()>;
}

/// Description of one connection property understood by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: &'static str,
    pub value: Option<String>,
    pub description: &'static str,
    pub required: bool,
}

pub struct ProxyDriver<D, C = BrokerClient, S = SshConnector> {
    driver: D,
    control: C,
    connector: S,
    config: TunnelConfig,
}

impl<D: DatabaseDriver> ProxyDriver<D> {
    /// Driver talking to a real broker and real SSH servers.
    pub fn new(driver: D, config: TunnelConfig) -> Self {
        let connector = SshConnector::new(config.clone());
        Self::with_collaborators(driver, BrokerClient::new(), connector, config)
    }
}

impl<D, C, S> ProxyDriver<D, C, S>
where
    D: DatabaseDriver,
    C: ControlPlane + Clone + 'static,
    S: SessionConnector + Clone + 'static,
{
    pub fn with_collaborators(driver: D, control: C, connector: S, config: TunnelConfig) -> Self {
        Self {
            driver,
            control,
            connector,
            config,
        }
    }

    /// True if `url` is a descriptor for this driver, valid or not.
    pub fn accepts_url(&self, url: &str) -> bool {
        descriptor::accepts_prefix(url)
    }

    /// Open a tunneled connection.
    ///
    /// Returns `Ok(None)` when `url` is not an `openshiftproxy://` descriptor.
    /// `properties` must carry the control-plane `user` and `password`.
    pub fn connect(
        &self,
        url: &str,
        properties: &ConnectionProperties,
    ) -> Result<Option<TunneledConnection<D::Connection>>> {
        tracing::info!("Proxy connection request to {}", url);
        if !self.accepts_url(url) {
            tracing::debug!("Not an openshiftproxy descriptor: {}", url);
            return Ok(None);
        }

        let (user, password) = properties
            .credentials()
            .ok_or_else(|| anyhow!("Invalid properties: user and password must be set"))?;
        let descriptor = ConnectionDescriptor::parse(url).context("Invalid descriptor")?;
        if !self.driver.accepts_driver(descriptor.driver()) {
            return Err(anyhow!(
                "Driver {} is not served by the configured database driver",
                descriptor.driver()
            ));
        }

        let mut handler = TunnelHandler::new(
            self.control.clone(),
            self.connector.clone(),
            self.config.clone(),
        );
        handler.connect(descriptor.server(), user, password)?;
        let metadata = handler.resolve_database_metadata(
            descriptor.application(),
            descriptor.namespace(),
            descriptor.service(),
        )?;

        let port = match descriptor.external_forwarded_port() {
            Some(port) => {
                tracing::info!("Using external port forwarding on port {}", port);
                port
            }
            None => {
                tracing::info!("Starting port forwarding for {}", descriptor.application());
                handler.start_port_forwarding(
                    descriptor.application(),
                    descriptor.namespace(),
                    &metadata.connection_template,
                    properties.private_key_path(),
                )?
            }
        };

        let database_url = format!(
            "{}://localhost:{}/{}",
            descriptor.driver(),
            port,
            metadata.database_name
        );
        let database_properties = properties.for_database(&metadata.db_user, &metadata.db_password);
        if database_properties.credentials().is_none() {
            return Err(anyhow!(
                "Service {} returned empty database credentials",
                descriptor.service()
            ));
        }

        let connection = self
            .driver
            .connect(&database_url, &database_properties)
            .with_context(|| format!("Could not connect to {}", database_url))?;
        Ok(Some(TunneledConnection::new(connection, Box::new(handler))))
    }

    /// The proxy's own properties, followed by the target driver's.
    ///
    /// The target's `user` and `password` are left out; the proxy replaces
    /// them with the database credentials.
    pub fn property_info(&self, properties: &ConnectionProperties) -> Vec<PropertyInfo> {
        let own = [
            PropertyInfo {
                name: USER_KEY,
                value: properties.user().map(str::to_string),
                description: "OpenShift user",
                required: true,
            },
            PropertyInfo {
                name: PASSWORD_KEY,
                value: properties.password().map(str::to_string),
                description: "OpenShift password",
                required: true,
            },
            PropertyInfo {
                name: PRIVATE_KEY_PATH_KEY,
                value: properties.get(PRIVATE_KEY_PATH_KEY).map(str::to_string),
                description: "Absolute file path of private ssh key",
                required: false,
            },
        ];
        let target = self
            .driver
            .property_info(properties)
            .into_iter()
            .filter(|info| info.name != USER_KEY && info.name != PASSWORD_KEY);
        own.into_iter().chain(target).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ssh::RemoteSession;
    use crate::testing::{FakeConnector, FakeControlPlane, FakeDriver, FakeSession, application};

    const DESCRIPTOR: &str =
        "openshiftproxy://broker/app1?domain=ns1&cartridge=pg&driver=pgdriver";

    fn control_plane() -> FakeControlPlane {
        FakeControlPlane::new("u", "p").with_application(
            "ns1",
            application("app1", "ssh://gear@app1-ns1.example.com", "pg", "pg://HOST:PORT"),
        )
    }

    fn proxy(
        driver: &FakeDriver,
        session: &FakeSession,
    ) -> ProxyDriver<FakeDriver, FakeControlPlane, FakeConnector> {
        ProxyDriver::with_collaborators(
            driver.clone(),
            control_plane(),
            FakeConnector::new(session.clone()),
            TunnelConfig::default(),
        )
    }

    fn credentials() -> ConnectionProperties {
        ConnectionProperties::new()
            .with(USER_KEY, "u")
            .with(PASSWORD_KEY, "p")
    }

    #[test]
    fn test_connect_through_dynamic_forward() {
        let driver = FakeDriver::new("pgdriver");
        let session = FakeSession::new().with_output(
            "rhc-list-ports",
            vec!["mongodb -> 10.0.0.4:27017", "pg -> 10.0.0.5:5432"],
        );
        let proxy = proxy(&driver, &session);

        let connection = proxy.connect(DESCRIPTOR, &credentials()).unwrap().unwrap();
        assert_eq!(connection.url, "pgdriver://localhost:49152/db1");

        let calls = driver.calls();
        assert_eq!(calls.len(), 1);
        let (url, properties) = &calls[0];
        assert_eq!(url, "pgdriver://localhost:49152/db1");
        assert_eq!(properties.credentials(), Some(("du", "dp")));
        assert_eq!(session.local_forwards(), vec!["49152:10.0.0.5:5432"]);
    }

    #[test]
    fn test_connect_with_external_port_skips_listing() {
        let driver = FakeDriver::new("pgdriver");
        let session = FakeSession::new();
        let proxy = proxy(&driver, &session);

        let url = format!("{DESCRIPTOR}&externalforwardedport=7000");
        let connection = proxy.connect(&url, &credentials()).unwrap().unwrap();
        assert_eq!(connection.url, "pgdriver://localhost:7000/db1");
        assert!(session.executed().is_empty());
        assert!(session.bind_attempts().is_empty());
    }

    #[test]
    fn test_connect_strips_private_key_path() {
        let driver = FakeDriver::new("pgdriver");
        let session = FakeSession::new().with_output("rhc-list-ports", vec!["pg -> 10.0.0.5:5432"]);
        let proxy = ProxyDriver::with_collaborators(
            driver.clone(),
            control_plane(),
            FakeConnector::new(session.clone()),
            TunnelConfig::default(),
        );
        let properties = credentials()
            .with(PRIVATE_KEY_PATH_KEY, "/keys/id_rsa")
            .with("sslmode", "disable");

        proxy.connect(DESCRIPTOR, &properties).unwrap().unwrap();
        let (_, passed) = &driver.calls()[0];
        assert_eq!(passed.private_key_path(), None);
        assert_eq!(passed.get("sslmode"), Some("disable"));
    }

    #[test]
    fn test_foreign_url_is_not_handled() {
        let driver = FakeDriver::new("pgdriver");
        let session = FakeSession::new();
        let proxy = proxy(&driver, &session);

        assert!(!proxy.accepts_url("postgres://localhost/db"));
        let result = proxy
            .connect("postgres://localhost/db", &credentials())
            .unwrap();
        assert!(result.is_none());
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_connect_requires_credentials() {
        let driver = FakeDriver::new("pgdriver");
        let session = FakeSession::new();
        let proxy = proxy(&driver, &session);

        let err = proxy
            .connect(DESCRIPTOR, &ConnectionProperties::new().with(USER_KEY, "u"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("user and password"));
    }

    #[test]
    fn test_invalid_descriptor_fails_before_network() {
        let driver = FakeDriver::new("pgdriver");
        let session = FakeSession::new();
        let control = control_plane();
        let proxy = ProxyDriver::with_collaborators(
            driver.clone(),
            control.clone(),
            FakeConnector::new(session.clone()),
            TunnelConfig::default(),
        );

        let err = proxy
            .connect("openshiftproxy://broker/app1?driver=pgdriver", &credentials())
            .err()
            .unwrap();
        let message = format!("{err:#}");
        assert!(message.contains("domain"));
        assert!(message.contains("cartridge"));
        assert_eq!(control.connect_count(), 0);
    }

    #[test]
    fn test_unsupported_driver() {
        let driver = FakeDriver::new("other");
        let session = FakeSession::new();
        let proxy = proxy(&driver, &session);

        let err = proxy.connect(DESCRIPTOR, &credentials()).err().unwrap();
        assert!(err.to_string().contains("pgdriver"));
    }

    #[test]
    fn test_failed_driver_connect_tears_tunnel_down() {
        let driver = FakeDriver::new("pgdriver").failing("connection refused");
        let session = FakeSession::new().with_output("rhc-list-ports", vec!["pg -> 10.0.0.5:5432"]);
        let proxy = proxy(&driver, &session);

        let err = proxy.connect(DESCRIPTOR, &credentials()).err().unwrap();
        assert!(format!("{err:#}").contains("connection refused"));
        assert!(!session.is_connected());
        assert!(session.local_forwards().is_empty());
    }

    #[test]
    fn test_close_tears_tunnel_down_before_connection() {
        let session = FakeSession::new().with_output("rhc-list-ports", vec!["pg -> 10.0.0.5:5432"]);
        let driver = FakeDriver::new("pgdriver").sharing_events(session.event_log());
        let proxy = proxy(&driver, &session);

        let connection = proxy.connect(DESCRIPTOR, &credentials()).unwrap().unwrap();
        connection.close().unwrap();
        assert_eq!(
            session.events(),
            vec!["remove 49152", "disconnect", "close connection"]
        );
    }

    #[test]
    fn test_property_info() {
        let driver = FakeDriver::new("pgdriver");
        let session = FakeSession::new();
        let proxy = proxy(&driver, &session);

        let info = proxy.property_info(&credentials());
        let names: Vec<&str> = info.iter().map(|p| p.name).collect();
        assert_eq!(names, vec![USER_KEY, PASSWORD_KEY, PRIVATE_KEY_PATH_KEY]);
        assert_eq!(info[0].value.as_deref(), Some("u"));
        assert!(info[1].required);
        assert!(!info[2].required);
        assert_eq!(info[2].value, None);
    }

    #[test]
    fn test_property_info_appends_target_properties_without_credentials() {
        let driver = FakeDriver::new("pgdriver").with_properties(&[
            USER_KEY,
            "sslmode",
            PASSWORD_KEY,
            "application_name",
        ]);
        let session = FakeSession::new();
        let proxy = proxy(&driver, &session);

        let info = proxy.property_info(&credentials().with("sslmode", "require"));
        let names: Vec<&str> = info.iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                USER_KEY,
                PASSWORD_KEY,
                PRIVATE_KEY_PATH_KEY,
                "sslmode",
                "application_name"
            ]
        );
        assert_eq!(info[3].value.as_deref(), Some("require"));
        assert_eq!(info[4].value, None);
    }
}
