//! Bootstrap configuration.
//!
//! Built in code with `with_*` methods or read from `TRACKER_*` environment
//! variables. Read-only once a session starts.

use std::str::FromStr;
use std::time::Duration;

use crate::error::BootstrapError;
use crate::topology::TopologyKind;

pub const DEFAULT_PORT: u16 = 9091;
pub const DEFAULT_PORT_SEARCH: u16 = 1000;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Number of workers expected to join.
    pub world_size: usize,
    /// Host the listener binds to.
    pub host: String,
    /// Host workers are told to dial. Detected when unset and `host` is a wildcard.
    pub advertise_host: Option<String>,
    /// First port tried. 0 binds an ephemeral port.
    pub port: u16,
    /// How many consecutive ports to try when `port` is taken.
    pub port_search: u16,
    /// Time a connection gets to send its hello, and each dispatch step.
    pub handshake_timeout: Duration,
    /// Time every worker gets to connect.
    pub rendezvous_timeout: Duration,
    /// Rejected handshakes tolerated per requested rank.
    pub max_retries: u32,
    pub topology: TopologyKind,
}

impl BootstrapConfig {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            host: "0.0.0.0".to_string(),
            advertise_host: None,
            port: DEFAULT_PORT,
            port_search: DEFAULT_PORT_SEARCH,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            topology: TopologyKind::default(),
        }
    }

    /// Defaults overridden by `TRACKER_*` environment variables.
    pub fn from_env(world_size: usize) -> Result<Self, BootstrapError> {
        Self::from_lookup(world_size, |key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup(
        world_size: usize,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BootstrapError> {
        let mut config = Self::new(world_size);

        if let Some(host) = lookup("TRACKER_HOST") {
            config.host = host;
        }
        if let Some(host) = lookup("TRACKER_ADVERTISE_HOST") {
            config.advertise_host = Some(host);
        }
        if let Some(port) = parse_var(&lookup, "TRACKER_PORT")? {
            config.port = port;
        }
        if let Some(search) = parse_var(&lookup, "TRACKER_PORT_SEARCH")? {
            config.port_search = search;
        }
        if let Some(secs) = parse_var(&lookup, "TRACKER_HANDSHAKE_TIMEOUT_SECS")? {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "TRACKER_RENDEZVOUS_TIMEOUT_SECS")? {
            config.rendezvous_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_var(&lookup, "TRACKER_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(topology) = parse_var(&lookup, "TRACKER_TOPOLOGY")? {
            config.topology = topology;
        }

        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_port_search(mut self, attempts: u16) -> Self {
        self.port_search = attempts;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_topology(mut self, topology: TopologyKind) -> Self {
        self.topology = topology;
        self
    }

    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.world_size < 1 {
            return Err(BootstrapError::invalid_argument(
                "world size must be at least 1",
            ));
        }
        if u32::try_from(self.world_size).is_err() {
            return Err(BootstrapError::invalid_argument(format!(
                "world size {} is too large",
                self.world_size
            )));
        }
        if self.host.trim().is_empty() {
            return Err(BootstrapError::invalid_argument("bind host is empty"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BootstrapError::invalid_argument(
                "handshake timeout must be positive",
            ));
        }
        if self.rendezvous_timeout.is_zero() {
            return Err(BootstrapError::invalid_argument(
                "rendezvous timeout must be positive",
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, BootstrapError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            BootstrapError::invalid_argument(format!("{key}={raw:?} is invalid: {e}"))
        }),
    }
}
