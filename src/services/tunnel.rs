//! Tunnel lifecycle for one logical database connection.
//!
//! `TunnelHandler` holds at most one control-plane connection, one SSH session
//! and one active forwarded port. It is not meant to be shared between
//! threads; every tunnel gets its own handler.

use super::control::{ControlConnection, ControlPlane};
use super::ssh::{ForwardablePort, PortRange, RemoteSession, SessionConnector};
use crate::config::TunnelConfig;
use anyhow::{Context, Result, anyhow};
use std::path::Path;

/// Cartridge property keys holding the database connection data.
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const CONNECTION_URL_KEY: &str = "connection_url";
pub const DATABASE_NAME_KEY: &str = "database_name";

/// Credentials and location of a database, as resolved from the control plane.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseMetadata {
    pub db_user: String,
    pub db_password: String,
    /// Remote URL template, e.g. `postgresql://$HOST:$PORT`
    pub connection_template: String,
    pub database_name: String,
}

impl std::fmt::Debug for DatabaseMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseMetadata")
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("connection_template", &self.connection_template)
            .field("database_name", &self.database_name)
            .finish()
    }
}

/// Anything that must be torn down when a tunneled connection closes.
pub trait Tunnel {
    /// Best-effort teardown. Never fails; problems are logged.
    fn disconnect(&mut self);
}

pub struct TunnelHandler<C: ControlPlane, S: SessionConnector> {
    control: C,
    connector: S,
    config: TunnelConfig,
    connection: Option<C::Connection>,
    session: Option<S::Session>,
    active_port: Option<ForwardablePort>,
}

impl<C: ControlPlane, S: SessionConnector> TunnelHandler<C, S> {
    pub fn new(control: C, connector: S, config: TunnelConfig) -> Self {
        Self {
            control,
            connector,
            config,
            connection: None,
            session: None,
            active_port: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Local port of the active forward, if any.
    pub fn local_port(&self) -> Option<u16> {
        self.active_port.as_ref().and_then(ForwardablePort::local_port)
    }

    /// Authenticate at the control plane. Does nothing when already connected.
    pub fn connect(&mut self, address: &str, user: &str, secret: &str) -> Result<()> {
        if self.connection.is_some() {
            tracing::debug!("Already connected to {}", address);
            return Ok(());
        }
        let connection = self
            .control
            .connect(address, user, secret)
            .with_context(|| format!("Could not connect to control plane {}", address))?;
        tracing::info!("Connected to control plane {} as {}", address, connection.user());
        self.connection = Some(connection);
        Ok(())
    }

    /// Read credentials and URL template of `service` in `application`.
    pub fn resolve_database_metadata(
        &self,
        application: &str,
        namespace: &str,
        service: &str,
    ) -> Result<DatabaseMetadata> {
        let app = self.lookup_application(application, namespace)?;
        let service_info = app.service(service).ok_or_else(|| {
            anyhow!(
                "Could not resolve service {} of application {} in namespace {}",
                service,
                application,
                namespace
            )
        })?;

        let property = |key: &str| {
            service_info.property(key).map(str::to_string).ok_or_else(|| {
                anyhow!(
                    "Service {} of application {} in namespace {} has no {} property",
                    service,
                    application,
                    namespace,
                    key
                )
            })
        };

        Ok(DatabaseMetadata {
            db_user: property(USERNAME_KEY)?,
            db_password: property(PASSWORD_KEY)?,
            connection_template: property(CONNECTION_URL_KEY)?,
            database_name: property(DATABASE_NAME_KEY)?,
        })
    }

    /// Open a session to the application's gear and forward the port whose
    /// name prefixes `connection_template`. Returns the local port.
    pub fn start_port_forwarding(
        &mut self,
        application: &str,
        namespace: &str,
        connection_template: &str,
        private_key: Option<&Path>,
    ) -> Result<u16> {
        let app = self.lookup_application(application, namespace)?;

        if self.session.is_some() {
            tracing::debug!("Replacing existing session before forwarding {}", application);
            self.close_session();
        }

        let session = self
            .connector
            .open(&app.ssh_url, private_key)
            .with_context(|| format!("Could not open session to {}", app.ssh_url))?;
        let session = self.session.insert(session);

        let lines = list_forwardable_ports(session, &self.config)?;
        let mut port = select_port(&lines, connection_template)?;
        let local_port = port.start_forwarding(session, PortRange::from_config(&self.config))?;

        tracing::info!("Started port forwarding {}", port);
        self.active_port = Some(port);
        Ok(local_port)
    }

    /// Tear everything down in order: forward, session, control connection.
    pub fn disconnect(&mut self) {
        self.close_session();
        if self.connection.take().is_some() {
            tracing::info!("Disconnected from control plane");
        }
    }

    fn close_session(&mut self) {
        if let (Some(port), Some(session)) = (self.active_port.as_mut(), self.session.as_mut()) {
            if let Err(e) = port.stop_forwarding(session) {
                tracing::warn!("Could not stop port forwarding {}: {:#}", port, e);
            }
        }
        self.active_port = None;

        if let Some(mut session) = self.session.take() {
            match session.disconnect() {
                Ok(()) => tracing::info!("SSH session closed"),
                Err(e) => tracing::warn!("Could not close SSH session: {:#}", e),
            }
        }
    }

    fn lookup_application(
        &self,
        application: &str,
        namespace: &str,
    ) -> Result<super::control::ApplicationInfo> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| anyhow!("Not connected to the control plane"))?;
        connection
            .application(namespace, application)
            .with_context(|| {
                format!(
                    "Could not resolve application {} in namespace {}",
                    application, namespace
                )
            })?
            .ok_or_else(|| {
                anyhow!(
                    "Could not resolve application {} in namespace {}",
                    application,
                    namespace
                )
            })
    }
}

impl<C: ControlPlane, S: SessionConnector> Tunnel for TunnelHandler<C, S> {
    fn disconnect(&mut self) {
        TunnelHandler::disconnect(self);
    }
}

impl<C: ControlPlane, S: SessionConnector> Drop for TunnelHandler<C, S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Run the optional wake command, then the listing command.
fn list_forwardable_ports<R>(session: &mut R, config: &TunnelConfig) -> Result<Vec<String>>
where
    R: RemoteSession + ?Sized,
{
    let timeout = config.command_timeout();
    if let Some(wake) = config.wake_command.as_deref() {
        session
            .exec(wake, timeout)
            .with_context(|| format!("Wake command '{}' failed", wake))?;
    }
    session
        .exec(&config.list_ports_command, timeout)
        .with_context(|| format!("Error while executing {}", config.list_ports_command))
}

/// First listed port whose name prefixes the connection template.
fn select_port(lines: &[String], connection_template: &str) -> Result<ForwardablePort> {
    let mut parsed_any = false;
    for line in lines {
        let Some(port) = ForwardablePort::parse_from(line) else {
            continue;
        };
        parsed_any = true;
        if connection_template.starts_with(port.name()) {
            return Ok(port);
        }
        tracing::debug!("Skipping forwardable port {}", port);
    }

    if parsed_any {
        Err(anyhow!(
            "No forwardable port found matching the required service {}",
            connection_template
        ))
    } else {
        Err(anyhow!("No forwardable port found"))
    }
}
