//! Forwardable ports reported by a gear's `rhc-list-ports`.

use super::allocation::PortRange;
use super::session::RemoteSession;
use anyhow::Result;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Matches `<name> -> <host>:<port>` anywhere in a listing line.
static FORWARDED_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^ ]+) -> ([^:]+):(\d+)").expect("forwarded port pattern is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The local port is taken; the next candidate may be tried.
    #[error("local port {0} is already in use")]
    AddressInUse(u16),

    #[error("all local ports from {first} to {last} are already in use")]
    NoPortAvailable { first: u16, last: u16 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One remote service endpoint that can be forwarded to a local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardablePort {
    name: String,
    remote_host: String,
    remote_port: u16,
    local_port: Option<u16>,
}

impl ForwardablePort {
    /// Parse one listing line. Lines that are not port entries yield `None`.
    pub fn parse_from(line: &str) -> Option<Self> {
        let captures = FORWARDED_PORT.captures(line)?;
        let remote_port = captures[3].parse::<u16>().ok().filter(|port| *port > 0)?;
        Some(Self {
            name: captures[1].to_string(),
            remote_host: captures[2].to_string(),
            remote_port,
            local_port: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Start forwarding, or return the existing local port if still active.
    pub fn start_forwarding<S>(&mut self, session: &mut S, range: PortRange) -> Result<u16>
    where
        S: RemoteSession + ?Sized,
    {
        if let Some(port) = self.local_port {
            if self.is_forwarding_active(session) {
                tracing::debug!("Forwarding for {} already active on port {}", self.name, port);
                return Ok(port);
            }
            tracing::debug!("Forwarding for {} on port {} is gone, rebinding", self.name, port);
            self.local_port = None;
        }

        let port = self.bind_first_free(session, range)?;
        self.local_port = Some(port);
        Ok(port)
    }

    fn bind_first_free<S>(&self, session: &mut S, range: PortRange) -> Result<u16>
    where
        S: RemoteSession + ?Sized,
    {
        for candidate in range.candidates() {
            match session.add_local_forward(candidate, &self.remote_host, self.remote_port) {
                Ok(port) => return Ok(port),
                Err(ForwardError::AddressInUse(port)) => {
                    tracing::debug!("Local port {} in use, trying next", port);
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!(
                        "Failed to forward {}:{}",
                        self.remote_host, self.remote_port
                    )));
                }
            }
        }

        Err(ForwardError::NoPortAvailable {
            first: range.base(),
            last: range.last().unwrap_or(range.base()),
        }
        .into())
    }

    /// True if the session still holds this port's exact forward.
    pub fn is_forwarding_active<S>(&self, session: &S) -> bool
    where
        S: RemoteSession + ?Sized,
    {
        let Some(local_port) = self.local_port else {
            return false;
        };
        if !session.is_connected() {
            return false;
        }

        let key = format!("{}:{}:{}", local_port, self.remote_host, self.remote_port);
        let mut forwards = session.local_forwards();
        forwards.sort_unstable();
        forwards.binary_search(&key).is_ok()
    }

    /// Remove the forward. Does nothing when forwarding is not active.
    pub fn stop_forwarding<S>(&mut self, session: &mut S) -> Result<()>
    where
        S: RemoteSession + ?Sized,
    {
        if !self.is_forwarding_active(session) {
            return Ok(());
        }
        if let Some(port) = self.local_port {
            session.remove_local_forward(port)?;
            tracing::info!("Stopped forwarding {}", self);
        }
        self.local_port = None;
        Ok(())
    }
}

impl fmt::Display for ForwardablePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_port {
            Some(port) => write!(
                f,
                "{} localhost:{} -> {}:{}",
                self.name, port, self.remote_host, self.remote_port
            ),
            None => write!(
                f,
                "{} (unbound) -> {}:{}",
                self.name, self.remote_host, self.remote_port
            ),
        }
    }
}
