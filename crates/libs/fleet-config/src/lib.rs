//! # fleet-config
//!
//! The static service directory for a fleet deployment.
//!
//! Every logical service instance is identified by a [`ServiceCoord`]
//! (name + shard) and resolved to a network [`Address`] through a
//! [`ServiceDirectory`] loaded once from a JSON config file:
//!
//! ```json
//! {
//!     "services": {
//!         "UserService": [["127.0.0.1", 5000]],
//!         "PrintingService": [["127.0.0.1", 5010], ["127.0.0.1", 5011]]
//!     },
//!     "api": ["0.0.0.0", 8080]
//! }
//! ```
//!
//! Resolution never defaults: an unknown coordinate is a hard
//! [`ConfigError::NotConfigured`], raised to whoever tried to reach the
//! service.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors from loading or querying the service directory.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no address configured for service {0}")]
    NotConfigured(ServiceCoord),
}

/// One network endpoint, stored as `[host, port]` in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<Address> for (String, u16) {
    fn from(address: Address) -> Self {
        (address.host, address.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Logical identifier of one service instance: name plus shard number.
///
/// Stable for the process lifetime; the directory maps it to an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceCoord {
    pub name: String,
    pub shard: u32,
}

impl ServiceCoord {
    pub fn new(name: impl Into<String>, shard: u32) -> Self {
        Self {
            name: name.into(),
            shard,
        }
    }
}

impl fmt::Display for ServiceCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.shard)
    }
}

/// The full directory: service name → per-shard address list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDirectory {
    services: HashMap<String, Vec<Address>>,
    /// Endpoint of the HTTP-facing API surface. Not consumed by the RPC
    /// core; carried so one config file serves the whole deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api: Option<Address>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the directory from a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Register a service's shard addresses (mainly for tests and embedders
    /// that build the directory programmatically).
    pub fn add_service(&mut self, name: impl Into<String>, addresses: Vec<Address>) {
        self.services.insert(name.into(), addresses);
    }

    /// Resolve a coordinate to its configured address.
    pub fn address_of(&self, coord: &ServiceCoord) -> Result<Address, ConfigError> {
        self.services
            .get(&coord.name)
            .and_then(|shards| shards.get(coord.shard as usize))
            .cloned()
            .ok_or_else(|| ConfigError::NotConfigured(coord.clone()))
    }

    /// The HTTP API endpoint, if the deployment declares one.
    pub fn api(&self) -> Option<&Address> {
        self.api.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "services": {
            "UserService": [["127.0.0.1", 5000]],
            "PrintingService": [["127.0.0.1", 5010], ["127.0.0.1", 5011]]
        },
        "api": ["0.0.0.0", 8080]
    }"#;

    #[test]
    fn parses_sample_config() {
        let directory: ServiceDirectory = serde_json::from_str(SAMPLE).expect("parse failed");
        let address = directory
            .address_of(&ServiceCoord::new("PrintingService", 1))
            .expect("resolve failed");
        assert_eq!(address, Address::new("127.0.0.1", 5011));
        assert_eq!(directory.api(), Some(&Address::new("0.0.0.0", 8080)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile failed");
        file.write_all(SAMPLE.as_bytes()).expect("write failed");
        let directory = ServiceDirectory::load(file.path()).expect("load failed");
        assert!(directory
            .address_of(&ServiceCoord::new("UserService", 0))
            .is_ok());
    }

    #[test]
    fn unknown_service_is_not_configured() {
        let directory: ServiceDirectory = serde_json::from_str(SAMPLE).expect("parse failed");
        let error = directory
            .address_of(&ServiceCoord::new("ScoreboardService", 0))
            .expect_err("resolved an unconfigured service");
        assert!(matches!(error, ConfigError::NotConfigured(_)));
    }

    #[test]
    fn unknown_shard_is_not_configured() {
        let directory: ServiceDirectory = serde_json::from_str(SAMPLE).expect("parse failed");
        assert!(directory
            .address_of(&ServiceCoord::new("UserService", 3))
            .is_err());
    }

    #[test]
    fn api_entry_is_optional() {
        let directory: ServiceDirectory =
            serde_json::from_str(r#"{"services": {}}"#).expect("parse failed");
        assert!(directory.api().is_none());
    }

    #[test]
    fn display_formats() {
        assert_eq!(Address::new("10.0.0.1", 5000).to_string(), "10.0.0.1:5000");
        assert_eq!(
            ServiceCoord::new("UserService", 2).to_string(),
            "UserService:2"
        );
    }
}
