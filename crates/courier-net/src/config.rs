//! Path discovery for service identities and the discovery cache.

use std::path::{Path, PathBuf};

/// Environment variable overriding the discovery cache path.
pub const CACHE_PATH_ENV: &str = "COURIER_CACHE_PATH";

/// Environment variable overriding the service certificate directory.
pub const CERT_DIR_ENV: &str = "COURIER_CERT_DIR";

/// Where courier finds service identities and the discovery cache.
#[derive(Debug, Clone)]
pub struct Config {
    cert_dir: PathBuf,
    cache_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("/etc/courier/services"),
            cache_path: PathBuf::from("/etc/courier/discovery.cache"),
        }
    }
}

impl Config {
    /// Builds a config from defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(cert_dir) = std::env::var(CERT_DIR_ENV) {
            config.cert_dir = PathBuf::from(cert_dir);
        }
        if let Ok(cache_path) = std::env::var(CACHE_PATH_ENV) {
            config.cache_path = PathBuf::from(cache_path);
        }
        config
    }

    /// Replaces the certificate directory.
    #[must_use]
    pub fn with_cert_dir(mut self, cert_dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = cert_dir.into();
        self
    }

    /// Replaces the discovery cache path.
    #[must_use]
    pub fn with_cache_path(mut self, cache_path: impl Into<PathBuf>) -> Self {
        self.cache_path = cache_path.into();
        self
    }

    /// The discovery cache file path.
    #[must_use]
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// The certificate file for `name`, if it exists.
    #[must_use]
    pub fn service_cert_path(&self, name: &str) -> Option<PathBuf> {
        existing(self.cert_dir.join(format!("{name}.crt")))
    }

    /// The private key file for `name`, if it exists.
    #[must_use]
    pub fn service_key_path(&self, name: &str) -> Option<PathBuf> {
        existing(self.cert_dir.join(format!("{name}.key")))
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}
