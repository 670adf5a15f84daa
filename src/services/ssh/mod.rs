//! SSH access to application gears.
//!
//! This module provides:
//! - `SshConnector` / `SshSession` - Authenticated sessions with local forwards
//! - `ForwardablePort` - A remote endpoint from `rhc-list-ports` and its forwarding state
//! - `PortRange` - The bounded run of local ports tried when forwarding

mod allocation;
mod forward;
mod session;

pub use allocation::PortRange;
pub use forward::{ForwardError, ForwardablePort};
pub use session::{
    RemoteSession, SSH_URL_PREFIX, SessionConnector, SessionError, SshConnector, SshSession,
    parse_endpoint,
};
