//! Scripted collaborators for unit tests.

use crate::driver::{ConnectionProperties, DatabaseConnection, DatabaseDriver, PropertyInfo};
use crate::services::control::{ApplicationInfo, ControlConnection, ControlPlane, ServiceInfo};
use crate::services::ssh::{ForwardError, RemoteSession, SessionConnector};
use anyhow::{Result, anyhow};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

pub type EventLog = Rc<RefCell<Vec<String>>>;

#[derive(Default)]
struct SessionState {
    connected: bool,
    forwards: Vec<String>,
    bind_attempts: Vec<u16>,
    ports_in_use: HashSet<u16>,
    bind_failure: Option<String>,
    outputs: HashMap<String, Vec<String>>,
    exec_failures: HashMap<String, String>,
    executed: Vec<String>,
    remove_failure: Option<String>,
    disconnect_failure: Option<String>,
}

/// In-memory SSH session. Clones share state.
#[derive(Clone)]
pub struct FakeSession {
    state: Rc<RefCell<SessionState>>,
    events: EventLog,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SessionState {
                connected: true,
                ..Default::default()
            })),
            events: EventLog::default(),
        }
    }

    pub fn with_ports_in_use(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.state.borrow_mut().ports_in_use.extend(ports);
        self
    }

    pub fn with_bind_failure(self, message: &str) -> Self {
        self.state.borrow_mut().bind_failure = Some(message.to_string());
        self
    }

    pub fn with_output(self, command: &str, lines: Vec<&str>) -> Self {
        self.state.borrow_mut().outputs.insert(
            command.to_string(),
            lines.into_iter().map(str::to_string).collect(),
        );
        self
    }

    pub fn with_exec_failure(self, command: &str, message: &str) -> Self {
        self.state
            .borrow_mut()
            .exec_failures
            .insert(command.to_string(), message.to_string());
        self
    }

    pub fn with_remove_failure(self, message: &str) -> Self {
        self.state.borrow_mut().remove_failure = Some(message.to_string());
        self
    }

    pub fn with_disconnect_failure(self, message: &str) -> Self {
        self.state.borrow_mut().disconnect_failure = Some(message.to_string());
        self
    }

    pub fn bind_attempts(&self) -> Vec<u16> {
        self.state.borrow().bind_attempts.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.borrow().executed.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    pub fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    /// Forget all forwards, as if the server dropped them.
    pub fn drop_forwards(&self) {
        self.state.borrow_mut().forwards.clear();
    }

    pub fn insert_forward(&self, entry: &str) {
        self.state.borrow_mut().forwards.push(entry.to_string());
    }

    fn reconnect(&self) {
        self.state.borrow_mut().connected = true;
    }
}

impl RemoteSession for FakeSession {
    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn local_forwards(&self) -> Vec<String> {
        // Newest first, so callers cannot rely on ordering
        self.state.borrow().forwards.iter().rev().cloned().collect()
    }

    fn add_local_forward(
        &mut self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16, ForwardError> {
        let mut state = self.state.borrow_mut();
        state.bind_attempts.push(local_port);
        if let Some(message) = &state.bind_failure {
            return Err(ForwardError::Other(anyhow!("{}", message)));
        }
        if state.ports_in_use.contains(&local_port) {
            return Err(ForwardError::AddressInUse(local_port));
        }
        state
            .forwards
            .push(format!("{}:{}:{}", local_port, remote_host, remote_port));
        Ok(local_port)
    }

    fn remove_local_forward(&mut self, local_port: u16) -> Result<()> {
        self.events.borrow_mut().push(format!("remove {}", local_port));
        let mut state = self.state.borrow_mut();
        if let Some(message) = &state.remove_failure {
            return Err(anyhow!("{}", message));
        }
        let prefix = format!("{}:", local_port);
        state.forwards.retain(|entry| !entry.starts_with(&prefix));
        Ok(())
    }

    fn exec(&mut self, command: &str, _timeout: Duration) -> Result<Vec<String>> {
        let mut state = self.state.borrow_mut();
        state.executed.push(command.to_string());
        if let Some(message) = state.exec_failures.get(command) {
            return Err(anyhow!("{}", message));
        }
        Ok(state.outputs.get(command).cloned().unwrap_or_default())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.events.borrow_mut().push("disconnect".to_string());
        let mut state = self.state.borrow_mut();
        state.connected = false;
        state.forwards.clear();
        match &state.disconnect_failure {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}

/// Hands out clones of one `FakeSession` and records what was opened.
#[derive(Clone)]
pub struct FakeConnector {
    session: FakeSession,
    opened: Rc<RefCell<Vec<String>>>,
    private_keys: Rc<RefCell<Vec<Option<PathBuf>>>>,
}

impl FakeConnector {
    pub fn new(session: FakeSession) -> Self {
        Self {
            session,
            opened: Rc::default(),
            private_keys: Rc::default(),
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.borrow().clone()
    }

    pub fn private_keys(&self) -> Vec<Option<PathBuf>> {
        self.private_keys.borrow().clone()
    }
}

impl SessionConnector for FakeConnector {
    type Session = FakeSession;

    fn open(&self, endpoint: &str, private_key: Option<&Path>) -> Result<FakeSession> {
        self.opened.borrow_mut().push(endpoint.to_string());
        self.private_keys
            .borrow_mut()
            .push(private_key.map(Path::to_path_buf));
        self.session.reconnect();
        Ok(self.session.clone())
    }
}

/// Control plane with a fixed user and a fixed set of applications.
#[derive(Clone)]
pub struct FakeControlPlane {
    user: String,
    secret: String,
    applications: Vec<(String, ApplicationInfo)>,
    connects: Rc<Cell<usize>>,
}

impl FakeControlPlane {
    pub fn new(user: &str, secret: &str) -> Self {
        Self {
            user: user.to_string(),
            secret: secret.to_string(),
            applications: Vec::new(),
            connects: Rc::default(),
        }
    }

    /// `app1` in `ns1` with a `postgresql-9.2` cartridge, for user/secret.
    pub fn with_postgres_app() -> Self {
        Self::new("user", "secret").with_application(
            "ns1",
            application(
                "app1",
                "ssh://5331abc@app1-ns1.rhcloud.com",
                "postgresql-9.2",
                "postgresql://$OPENSHIFT_POSTGRESQL_DB_HOST:$OPENSHIFT_POSTGRESQL_DB_PORT",
            ),
        )
    }

    pub fn with_application(mut self, namespace: &str, app: ApplicationInfo) -> Self {
        self.applications.push((namespace.to_string(), app));
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.get()
    }
}

/// An application with one web cartridge and one database cartridge.
pub fn application(name: &str, ssh_url: &str, service: &str, template: &str) -> ApplicationInfo {
    let properties: BTreeMap<String, String> = [
        ("username", "du"),
        ("password", "dp"),
        ("connection_url", template),
        ("database_name", "db1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    ApplicationInfo {
        name: name.to_string(),
        ssh_url: ssh_url.to_string(),
        services: vec![
            ServiceInfo {
                name: "jbossews-2.0".to_string(),
                properties: BTreeMap::new(),
            },
            ServiceInfo {
                name: service.to_string(),
                properties,
            },
        ],
    }
}

pub struct FakeControlConnection {
    user: String,
    applications: Vec<(String, ApplicationInfo)>,
}

impl ControlPlane for FakeControlPlane {
    type Connection = FakeControlConnection;

    fn connect(&self, _address: &str, user: &str, secret: &str) -> Result<FakeControlConnection> {
        self.connects.set(self.connects.get() + 1);
        if user != self.user || secret != self.secret {
            return Err(anyhow!("invalid credentials for {}", user));
        }
        Ok(FakeControlConnection {
            user: user.to_string(),
            applications: self.applications.clone(),
        })
    }
}

impl ControlConnection for FakeControlConnection {
    fn user(&self) -> &str {
        &self.user
    }

    fn application(&self, namespace: &str, application: &str) -> Result<Option<ApplicationInfo>> {
        Ok(self
            .applications
            .iter()
            .find(|(ns, app)| ns == namespace && app.name == application)
            .map(|(_, app)| app.clone()))
    }
}

/// Driver that records every connect call instead of talking to a database.
#[derive(Clone)]
pub struct FakeDriver {
    names: Vec<String>,
    properties: Vec<&'static str>,
    calls: Rc<RefCell<Vec<(String, ConnectionProperties)>>>,
    events: EventLog,
    failure: Option<String>,
}

impl FakeDriver {
    pub fn new(name: &str) -> Self {
        Self {
            names: vec![name.to_string()],
            properties: Vec::new(),
            calls: Rc::default(),
            events: EventLog::default(),
            failure: None,
        }
    }

    pub fn sharing_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Report these property names from `property_info`.
    pub fn with_properties(mut self, names: &[&'static str]) -> Self {
        self.properties = names.to_vec();
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, ConnectionProperties)> {
        self.calls.borrow().clone()
    }
}

pub struct FakeConnection {
    pub url: String,
    events: EventLog,
}

impl FakeConnection {
    pub fn execute(&self, sql: &str) -> String {
        format!("{} on {}", sql, self.url)
    }
}

impl DatabaseConnection for FakeConnection {
    fn close(self) -> Result<()> {
        self.events.borrow_mut().push("close connection".to_string());
        Ok(())
    }
}

impl DatabaseDriver for FakeDriver {
    type Connection = FakeConnection;

    fn accepts_driver(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    fn connect(&self, url: &str, properties: &ConnectionProperties) -> Result<FakeConnection> {
        self.calls
            .borrow_mut()
            .push((url.to_string(), properties.clone()));
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        Ok(FakeConnection {
            url: url.to_string(),
            events: self.events.clone(),
        })
    }

    fn property_info(&self, properties: &ConnectionProperties) -> Vec<PropertyInfo> {
        self.properties
            .iter()
            .map(|&name| PropertyInfo {
                name,
                value: properties.get(name).map(str::to_string),
                description: "fake driver property",
                required: false,
            })
            .collect()
    }
}
