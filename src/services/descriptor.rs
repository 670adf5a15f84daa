//! Parsing of `openshiftproxy://` connection descriptors.
//!
//! A descriptor names the broker, the application and the cartridge instead of
//! a database host:
//!
//! ```text
//! openshiftproxy://broker.example.com/myapp?domain=myns&cartridge=postgresql-9.2&driver=postgres
//! ```

use std::num::ParseIntError;

/// Scheme prefix every descriptor starts with (matched case-insensitively).
pub const DESCRIPTOR_PREFIX: &str = "openshiftproxy://";

const PARAMETER_DELIMITER: char = '&';

/// Errors raised while parsing a descriptor. No network I/O has happened yet.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor must start with {DESCRIPTOR_PREFIX}: {0}")]
    UnsupportedScheme(String),

    #[error("invalid descriptor {0}: expected <host>/<application>?<parameters>")]
    Malformed(String),

    #[error("descriptor is missing mandatory parameters: {}", .0.join(", "))]
    MissingParameters(Vec<&'static str>),

    #[error("externalforwardedport must be a port number, got '{value}'")]
    InvalidPort {
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Parameters of one tunneled connection, validated once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    server: String,
    application: String,
    namespace: String,
    service: String,
    driver: String,
    external_forwarded_port: Option<u16>,
}

/// Raw values collected from the descriptor before validation.
#[derive(Default)]
struct RawParameters<'a> {
    server: Option<&'a str>,
    application: Option<&'a str>,
    namespace: Option<&'a str>,
    service: Option<&'a str>,
    driver: Option<&'a str>,
    external_forwarded_port: Option<&'a str>,
}

impl ConnectionDescriptor {
    /// Parse and validate a descriptor.
    ///
    /// All missing mandatory parameters are reported in a single error.
    pub fn parse(raw: &str) -> Result<Self, DescriptorError> {
        if !accepts_prefix(raw) {
            return Err(DescriptorError::UnsupportedScheme(raw.to_string()));
        }

        let without_scheme = &raw[DESCRIPTOR_PREFIX.len()..];
        let (location, query) = match without_scheme.split_once('?') {
            Some((location, query)) if !query.contains('?') => (location, query),
            _ => return Err(DescriptorError::Malformed(raw.to_string())),
        };

        let mut params = RawParameters::default();

        if let Some((server, application)) = location.split_once('/') {
            if !application.contains('/') {
                params.server = Some(server);
                params.application = Some(application);
            }
        }

        for pair in query.split(PARAMETER_DELIMITER) {
            let Some((key, value)) = pair.split_once('=') else {
                tracing::debug!("Ignoring descriptor parameter without value: {}", pair);
                continue;
            };
            match key {
                "domain" | "namespace" => params.namespace = Some(value),
                "cartridge" | "service" => params.service = Some(value),
                "driver" => params.driver = Some(value),
                "externalforwardedport" => params.external_forwarded_port = Some(value),
                other => tracing::debug!("Ignoring unknown descriptor parameter: {}", other),
            }
        }

        params.validate()
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Port of a tunnel managed outside this crate, if one was given.
    pub fn external_forwarded_port(&self) -> Option<u16> {
        self.external_forwarded_port
    }
}

impl<'a> RawParameters<'a> {
    fn validate(self) -> Result<ConnectionDescriptor, DescriptorError> {
        let fields = [
            ("server", self.server),
            ("application", self.application),
            ("domain", self.namespace),
            ("cartridge", self.service),
            ("driver", self.driver),
        ];

        let missing: Vec<&'static str> = fields
            .iter()
            .filter(|(_, value)| value.is_none_or(str::is_empty))
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(DescriptorError::MissingParameters(missing));
        }

        let external_forwarded_port = self
            .external_forwarded_port
            .map(|value| {
                value.parse::<u16>().map_err(|source| DescriptorError::InvalidPort {
                    value: value.to_string(),
                    source,
                })
            })
            .transpose()?;

        let [server, application, namespace, service, driver] =
            fields.map(|(_, value)| value.unwrap_or_default().to_string());

        Ok(ConnectionDescriptor {
            server,
            application,
            namespace,
            service,
            driver,
            external_forwarded_port,
        })
    }
}

/// True if `raw` is meant for this crate, whether or not it is valid.
pub fn accepts_prefix(raw: &str) -> bool {
    raw.get(..DESCRIPTOR_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(DESCRIPTOR_PREFIX))
}
