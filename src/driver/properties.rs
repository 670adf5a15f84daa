//! Caller-supplied connection properties.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub const USER_KEY: &str = "user";
pub const PASSWORD_KEY: &str = "password";
/// Path of the private key used for the gear's SSH session
pub const PRIVATE_KEY_PATH_KEY: &str = "privateSshKeyFilePath";

/// Immutable string properties; every modification returns a new set.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionProperties(BTreeMap<String, String>);

impl ConnectionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn without(mut self, key: &str) -> Self {
        self.0.remove(key);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn user(&self) -> Option<&str> {
        self.get(USER_KEY)
    }

    pub fn password(&self) -> Option<&str> {
        self.get(PASSWORD_KEY)
    }

    pub fn private_key_path(&self) -> Option<&Path> {
        self.get(PRIVATE_KEY_PATH_KEY).map(Path::new)
    }

    /// Both user and password, if both are set and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user(), self.password()) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            }
            _ => None,
        }
    }

    /// Properties for the target driver: platform keys stripped, platform
    /// credentials replaced by the database's own.
    pub fn for_database(&self, db_user: &str, db_password: &str) -> Self {
        self.clone()
            .without(PRIVATE_KEY_PATH_KEY)
            .with(USER_KEY, db_user)
            .with(PASSWORD_KEY, db_password)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(k, v)| {
                if k == PASSWORD_KEY { (k, "<redacted>") } else { (k, v) }
            }))
            .finish()
    }
}
