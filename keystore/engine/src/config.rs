//! Runtime settings, read from the environment.

use crate::crypto::algorithm::{CipherKind, DEFAULT_CIPHER};
use crate::error::{EdsError, Result};

pub const ENV_SERVICE_TYPE: &str = "GLITE_SD_METADATA_TYPE";
pub const ENV_DEFAULT_CIPHER: &str = "EDS_DEFAULT_CIPHER";
pub const ENV_ENDPOINTS: &str = "EDS_CATALOG_ENDPOINTS";
pub const ENV_PORT: &str = "EDS_CATALOG_PORT";

pub const DEFAULT_SERVICE_TYPE: &str = "org.glite.Metadata";
pub const DEFAULT_PORT: u16 = 8443;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdsConfig {
    /// Service type handed to discovery.
    pub service_type: String,
    pub default_cipher: String,
    /// Static endpoint list, primary first. Empty means "ask DNS".
    pub endpoints: Vec<String>,
    pub dns_port: u16,
}

impl Default for EdsConfig {
    fn default() -> Self {
        EdsConfig {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            default_cipher: DEFAULT_CIPHER.to_string(),
            endpoints: Vec::new(),
            dns_port: DEFAULT_PORT,
        }
    }
}

impl EdsConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or blank values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = EdsConfig::default();

        if let Some(service_type) = get(ENV_SERVICE_TYPE) {
            config.service_type = service_type;
        }

        if let Some(cipher) = get(ENV_DEFAULT_CIPHER) {
            let kind = CipherKind::from_name(&cipher)
                .map_err(|_| EdsError::Config(format!("{ENV_DEFAULT_CIPHER}: unknown cipher '{cipher}'")))?;
            config.default_cipher = kind.name().to_string();
        }

        if let Some(list) = get(ENV_ENDPOINTS) {
            config.endpoints = list
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(port) = get(ENV_PORT) {
            config.dns_port = port
                .parse()
                .map_err(|_| EdsError::Config(format!("{ENV_PORT}: '{port}' is not a port number")))?;
        }

        Ok(config)
    }
}
