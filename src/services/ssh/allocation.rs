//! Sequential local port allocation.

use crate::config::TunnelConfig;

/// A bounded run of consecutive local ports tried one after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    base: u16,
    attempts: u16,
}

impl PortRange {
    pub fn new(base: u16, attempts: u16) -> Self {
        Self { base, attempts }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(config.base_local_port, config.port_attempts)
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// Last candidate port, or `None` for an empty range.
    pub fn last(&self) -> Option<u16> {
        self.candidates().last()
    }

    /// Candidate ports in the order they are tried. Stops early at 65535.
    pub fn candidates(&self) -> impl Iterator<Item = u16> + use<> {
        let base = self.base;
        (0..self.attempts).map_while(move |offset| base.checked_add(offset))
    }
}
