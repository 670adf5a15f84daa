//! A database connection that owns its tunnel.

use super::DatabaseConnection;
use crate::services::tunnel::Tunnel;
use anyhow::Result;
use std::ops::{Deref, DerefMut};

/// Wraps a driver connection and tears the tunnel down when closed.
///
/// Every operation of the inner connection is reachable through `Deref`;
/// only `close` is augmented. Dropping without `close` still tears the tunnel
/// down, after the inner connection is dropped.
pub struct TunneledConnection<C> {
    connection: C,
    tunnel: Box<dyn Tunnel>,
}

impl<C: DatabaseConnection> TunneledConnection<C> {
    pub fn new(connection: C, tunnel: Box<dyn Tunnel>) -> Self {
        Self { connection, tunnel }
    }

    /// Disconnect the tunnel, then close the inner connection.
    pub fn close(self) -> Result<()> {
        let Self {
            connection,
            mut tunnel,
        } = self;
        tracing::info!("Closing tunneled connection");
        tunnel.disconnect();
        connection.close()
    }
}

impl<C> Deref for TunneledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

impl<C> DerefMut for TunneledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.connection
    }
}
