//! Session affinity configuration
//!
//! Options are read from the `[affinity]` table of a TOML file and then
//! overridden by CLI flags / environment in the binary. [`SessionAffinityOptions::validate`]
//! runs before the filter is built, so a bad override address or cache
//! selector stops startup instead of failing requests later.
//!
//! ```toml
//! [affinity]
//! local_server_address = "http://10.0.1.5:5000"
//! cache = "sqlite:/var/lib/mcp/affinity.db"
//! entry_ttl_secs = 86400
//! ```

use std::path::Path;
use std::time::Duration;

use axum::http::HeaderName;
use serde::Deserialize;

use crate::cache::{CacheBackend, CacheOptions};

use super::error::AffinityError;
use super::resolver::normalize_explicit;
use super::routes::ProtocolRoutes;
use super::store::DEFAULT_KEY_PREFIX;

/// Header carrying the session identifier
pub const DEFAULT_SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionAffinityOptions {
    /// Address siblings should forward to. Blank or absent means auto-detect
    /// from the bound listeners.
    pub local_server_address: Option<String>,

    /// Cache selector: `memory` or `sqlite:<path>`
    pub cache: String,

    pub session_header: String,

    /// Prefix for ownership keys in the shared cache
    pub key_prefix: String,

    /// Lifetime of ownership entries in the cache; unset keeps them until removed
    pub entry_ttl_secs: Option<u64>,

    /// Routes registered as protocol endpoints
    pub protocol_paths: Vec<String>,

    /// Also treat any path with an `mcp`/`sse`/`message` segment as a protocol endpoint
    pub legacy_path_matching: bool,

    /// Connect timeout for forwarded requests. Responses are never time-boxed.
    pub connect_timeout_secs: u64,
}

impl Default for SessionAffinityOptions {
    fn default() -> Self {
        Self {
            local_server_address: None,
            cache: "memory".to_string(),
            session_header: DEFAULT_SESSION_HEADER.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            entry_ttl_secs: None,
            protocol_paths: vec!["/mcp".to_string()],
            legacy_path_matching: true,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    affinity: SessionAffinityOptions,
}

impl SessionAffinityOptions {
    /// Parse the `[affinity]` table from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, AffinityError> {
        let file: ConfigFile = toml::from_str(text)
            .map_err(|e| AffinityError::Config(format!("invalid config file: {}", e)))?;
        Ok(file.affinity)
    }

    pub fn load(path: &Path) -> Result<Self, AffinityError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AffinityError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check every field that can only fail at startup
    pub fn validate(&self) -> Result<(), AffinityError> {
        if let Some(address) = self.explicit_address() {
            normalize_explicit(address)?;
        }
        self.cache_backend()?;
        self.session_header_name()?;

        if let Some(path) = self.protocol_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(AffinityError::Config(format!(
                "protocol path '{}' must start with '/'",
                path
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(AffinityError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The override address, if one is actually set
    pub fn explicit_address(&self) -> Option<&str> {
        self.local_server_address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
    }

    pub fn cache_backend(&self) -> Result<CacheBackend, AffinityError> {
        Ok(self.cache.parse::<CacheBackend>()?)
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            entry_ttl: self.entry_ttl_secs.map(Duration::from_secs),
        }
    }

    pub fn session_header_name(&self) -> Result<HeaderName, AffinityError> {
        HeaderName::from_bytes(self.session_header.trim().as_bytes()).map_err(|_| {
            AffinityError::Config(format!("invalid session header '{}'", self.session_header))
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn protocol_routes(&self) -> ProtocolRoutes {
        self.protocol_paths
            .iter()
            .fold(ProtocolRoutes::new(), |routes, path| routes.mark(path.clone()))
            .with_legacy_fallback(self.legacy_path_matching)
    }
}
