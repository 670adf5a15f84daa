//! SSH sessions to application gears.
//!
//! `RemoteSession` is the seam the tunnel logic talks to; `SshSession` is the
//! libssh2-backed implementation. Local forwards are served by one accept
//! thread per forward and one pump thread per client connection, each
//! pumping through a `direct-tcpip` channel of the shared session.

use super::forward::ForwardError;
use crate::config::{TunnelConfig, expand_home};
use anyhow::{Context, Result};
use ssh2::Session;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Prefix the broker puts in front of gear SSH URLs.
pub const SSH_URL_PREFIX: &str = "ssh://";

const LOCALHOST: &str = "127.0.0.1";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("could not extract user and host from ssh url '{0}'")]
    InvalidEndpoint(String),

    #[error("private key file not found: {0}")]
    PrivateKeyNotFound(String),

    #[error("could not connect to {host}:{port}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("ssh authentication failed for {user}@{host}")]
    AuthenticationFailed {
        user: String,
        host: String,
        #[source]
        source: ssh2::Error,
    },
}

/// An authenticated session that can run commands and hold local forwards.
pub trait RemoteSession {
    fn is_connected(&self) -> bool;

    /// Active local forwards as `localPort:remoteHost:remotePort`, in no particular order.
    fn local_forwards(&self) -> Vec<String>;

    /// Bind `local_port` and forward it to `remote_host:remote_port`.
    fn add_local_forward(
        &mut self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16, ForwardError>;

    fn remove_local_forward(&mut self, local_port: u16) -> Result<()>;

    /// Run `command` and collect its output lines.
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<Vec<String>>;

    fn disconnect(&mut self) -> Result<()>;
}

/// Opens sessions from broker SSH URLs.
pub trait SessionConnector {
    type Session: RemoteSession;

    fn open(&self, endpoint: &str, private_key: Option<&Path>) -> Result<Self::Session>;
}

/// Split `[ssh://]user@host` into user and host.
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, &str), SessionError> {
    let without_scheme = endpoint.strip_prefix(SSH_URL_PREFIX).unwrap_or(endpoint);
    let parts: Vec<&str> = without_scheme.split('@').collect();
    match parts.as_slice() {
        [user, host] if !user.is_empty() && !host.is_empty() => Ok((*user, *host)),
        _ => Err(SessionError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// Connector for real SSH servers.
///
/// Host keys are not verified: any key presented by the gear is accepted.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: TunnelConfig,
}

impl SshConnector {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }
}

impl SessionConnector for SshConnector {
    type Session = SshSession;

    fn open(&self, endpoint: &str, private_key: Option<&Path>) -> Result<SshSession> {
        let (user, host) = parse_endpoint(endpoint)?;
        let key_path = match private_key {
            Some(path) => path.to_path_buf(),
            None => expand_home(&self.config.default_private_key),
        };
        if !key_path.exists() {
            return Err(SessionError::PrivateKeyNotFound(key_path.display().to_string()).into());
        }

        let port = self.config.ssh_port;
        tracing::info!("Opening SSH session to {}@{}:{}", user, host, port);
        tracing::warn!("Host key verification is disabled for {}", host);

        let connection_failed = |source: std::io::Error| SessionError::ConnectionFailed {
            host: host.to_string(),
            port,
            source,
        };
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(connection_failed)?
            .next()
            .ok_or_else(|| {
                connection_failed(std::io::Error::new(
                    ErrorKind::NotFound,
                    "host did not resolve to any address",
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, self.config.connect_timeout())
            .map_err(connection_failed)?;

        let mut session = Session::new().context("Failed to create SSH session")?;
        session.set_tcp_stream(tcp);
        let connect_millis =
            u32::try_from(self.config.connect_timeout().as_millis()).unwrap_or(u32::MAX);
        session.set_timeout(connect_millis);
        session
            .handshake()
            .with_context(|| format!("SSH handshake with {} failed", host))?;
        session
            .userauth_pubkey_file(user, None, &key_path, None)
            .map_err(|source| SessionError::AuthenticationFailed {
                user: user.to_string(),
                host: host.to_string(),
                source,
            })?;
        if !session.authenticated() {
            anyhow::bail!("SSH authentication for {}@{} was not confirmed", user, host);
        }

        session.set_timeout(0);

        tracing::debug!("SSH session to {}@{} authenticated", user, host);
        Ok(SshSession::new(session, host))
    }
}

/// Session handle shared with forward threads.
///
/// Every libssh2 call goes through the lock. The session is in blocking mode
/// whenever the lock is not held.
#[derive(Clone)]
struct SharedSession {
    session: Session,
    io: Arc<Mutex<()>>,
}

impl SharedSession {
    fn new(session: Session) -> Self {
        Self {
            session,
            io: Arc::new(Mutex::new(())),
        }
    }

    fn blocking<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        f(&self.session)
    }

    /// Run one non-blocking step; `f` must not wait on the network.
    fn nonblocking<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        self.session.set_blocking(false);
        let result = f(&self.session);
        self.session.set_blocking(true);
        result
    }
}

/// A local listener forwarding to one remote endpoint.
struct LocalForward {
    remote_host: String,
    remote_port: u16,
    running: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
    pumps: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl LocalForward {
    /// Stop accepting and wait for every connection pump to finish.
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let pumps: Vec<_> = self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for pump in pumps {
            let _ = pump.join();
        }
    }
}

pub struct SshSession {
    shared: SharedSession,
    host: String,
    connected: bool,
    forwards: HashMap<u16, LocalForward>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .field("connected", &self.connected)
            .field("forwards", &self.local_forwards())
            .finish_non_exhaustive()
    }
}

/// Closes an exec channel on every exit path.
struct ChannelGuard(ssh2::Channel);

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let _ = self.0.send_eof();
        let _ = self.0.close();
        let _ = self.0.wait_close();
    }
}

impl SshSession {
    fn new(session: Session, host: &str) -> Self {
        Self {
            shared: SharedSession::new(session),
            host: host.to_string(),
            connected: true,
            forwards: HashMap::new(),
        }
    }

    fn stop_all_forwards(&mut self) {
        for (port, mut forward) in self.forwards.drain() {
            tracing::debug!("Stopping local forward on port {}", port);
            forward.stop();
        }
    }
}

/// Time left until `deadline` as a libssh2 timeout, or `None` once it passed.
fn remaining_millis(deadline: Instant) -> Option<u32> {
    let left = deadline.checked_duration_since(Instant::now())?;
    if left.is_zero() {
        return None;
    }
    Some(u32::try_from(left.as_millis()).unwrap_or(u32::MAX).max(1))
}

/// Run `command` and read its output, failing once `timeout` has elapsed in total.
fn run_command(session: &Session, command: &str, timeout: Duration) -> Result<Vec<String>> {
    let deadline = Instant::now() + timeout;
    let timed_out = || anyhow::anyhow!("'{}' did not finish within {:?}", command, timeout);
    let arm = || -> Result<()> {
        let millis = remaining_millis(deadline).ok_or_else(timed_out)?;
        session.set_timeout(millis);
        Ok(())
    };

    arm()?;
    let channel = session
        .channel_session()
        .context("Failed to open exec channel")?;
    let mut guard = ChannelGuard(channel);
    guard
        .0
        .request_pty("dumb", None, None)
        .context("Failed to request pty")?;
    guard
        .0
        .exec(command)
        .with_context(|| format!("Failed to execute '{}'", command))?;

    let mut lines = Vec::new();
    let mut reader = BufReader::new(&mut guard.0);
    loop {
        arm()?;
        let mut line = String::new();
        let read = match reader.read_line(&mut line) {
            Ok(read) => read,
            Err(_) if remaining_millis(deadline).is_none() => return Err(timed_out()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read output of '{}'", command)));
            }
        };
        if read == 0 {
            break;
        }
        lines.push(line.trim_end_matches(['\r', '\n']).to_string());
    }
    drop(reader);

    arm()?;
    let mut stderr = String::new();
    let _ = guard.0.stderr().read_to_string(&mut stderr);
    if !stderr.trim().is_empty() {
        tracing::debug!("'{}' stderr: {}", command, stderr.trim());
    }
    Ok(lines)
}

impl RemoteSession for SshSession {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn local_forwards(&self) -> Vec<String> {
        self.forwards
            .iter()
            .map(|(port, forward)| {
                format!("{}:{}:{}", port, forward.remote_host, forward.remote_port)
            })
            .collect()
    }

    fn add_local_forward(
        &mut self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16, ForwardError> {
        if !self.connected {
            return Err(anyhow::anyhow!("SSH session to {} is closed", self.host).into());
        }
        let listener = TcpListener::bind((LOCALHOST, local_port)).map_err(|e| {
            if e.kind() == ErrorKind::AddrInUse {
                ForwardError::AddressInUse(local_port)
            } else {
                ForwardError::Other(
                    anyhow::Error::new(e).context(format!("Failed to bind local port {}", local_port)),
                )
            }
        })?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| ForwardError::Other(e.into()))?
            .port();

        let running = Arc::new(AtomicBool::new(true));
        let pumps = Arc::new(Mutex::new(Vec::new()));
        let accept_thread = spawn_accept_loop(
            listener,
            self.shared.clone(),
            remote_host.to_string(),
            remote_port,
            running.clone(),
            pumps.clone(),
        );
        self.forwards.insert(
            bound_port,
            LocalForward {
                remote_host: remote_host.to_string(),
                remote_port,
                running,
                accept_thread: Some(accept_thread),
                pumps,
            },
        );
        tracing::debug!(
            "Forwarding {}:{} -> {}:{}",
            LOCALHOST,
            bound_port,
            remote_host,
            remote_port
        );
        Ok(bound_port)
    }

    fn remove_local_forward(&mut self, local_port: u16) -> Result<()> {
        let mut forward = self
            .forwards
            .remove(&local_port)
            .ok_or_else(|| anyhow::anyhow!("No local forward on port {}", local_port))?;
        forward.stop();
        Ok(())
    }

    fn exec(&mut self, command: &str, timeout: Duration) -> Result<Vec<String>> {
        tracing::debug!("Executing '{}' on {}", command, self.host);
        self.shared.blocking(|session| {
            let result = run_command(session, command, timeout);
            session.set_timeout(0);
            result
        })
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.stop_all_forwards();
        self.connected = false;
        self.shared
            .blocking(|session| session.disconnect(None, "Tunnel closed", None))
            .with_context(|| format!("Failed to disconnect SSH session to {}", self.host))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            tracing::warn!("{:#}", e);
        }
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    shared: SharedSession,
    remote_host: String,
    remote_port: u16,
    running: Arc<AtomicBool>,
    pumps: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let Err(e) = listener.set_nonblocking(true) {
            tracing::error!("Failed to configure forward listener: {}", e);
            return;
        }

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted forwarded connection from {}", peer);
                    let shared = shared.clone();
                    let remote_host = remote_host.clone();
                    let running = running.clone();
                    let pump = thread::spawn(move || {
                        if let Err(e) =
                            pump_connection(stream, &shared, &remote_host, remote_port, &running)
                        {
                            tracing::debug!("Forwarded connection ended: {:#}", e);
                        }
                    });
                    let mut pumps = pumps.lock().unwrap_or_else(PoisonError::into_inner);
                    pumps.retain(|handle| !handle.is_finished());
                    pumps.push(pump);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    tracing::warn!("Error accepting forwarded connection: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("Forward listener for {}:{} stopped", remote_host, remote_port);
    })
}

fn pump_connection(
    mut local: TcpStream,
    shared: &SharedSession,
    remote_host: &str,
    remote_port: u16,
    running: &AtomicBool,
) -> Result<()> {
    local.set_nonblocking(false)?;
    local.set_read_timeout(Some(Duration::from_millis(5)))?;

    let mut channel = shared
        .blocking(|session| session.channel_direct_tcpip(remote_host, remote_port, None))
        .with_context(|| format!("Failed to open channel to {}:{}", remote_host, remote_port))?;

    let mut local_buf = [0u8; 8192];
    let mut remote_buf = [0u8; 8192];

    while running.load(Ordering::SeqCst) {
        let mut activity = false;

        match local.read(&mut local_buf) {
            Ok(0) => break,
            Ok(n) => {
                shared.blocking(|_| channel.write_all(&local_buf[..n]))?;
                activity = true;
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e.into()),
        }

        let (read, eof) = shared.nonblocking(|_| {
            let read = channel.read(&mut remote_buf);
            (read, channel.eof())
        });
        match read {
            Ok(0) if eof => break,
            Ok(0) => {}
            Ok(n) => {
                local.write_all(&remote_buf[..n])?;
                activity = true;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        if !activity {
            thread::sleep(Duration::from_millis(1));
        }
    }

    shared.blocking(|_| {
        let _ = channel.send_eof();
        let _ = channel.close();
        drop(channel);
    });
    Ok(())
}
