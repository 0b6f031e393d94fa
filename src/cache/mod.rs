//! Shared key/value cache backing the ownership store
//!
//! The affinity layer only needs three primitives: read a key, atomically
//! get-or-create a key from an async factory, and remove a key. Backends:
//!
//! - [`MemoryCache`] - in-process map, single-flight per key
//! - [`SqliteCache`] - SQLite file shared by every instance that can open it
//!
//! Backends are picked at startup from a selector string, see [`CacheBackend`].

pub mod memory;
pub mod sqlite;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// Boxed error produced by a value factory
pub type FactoryError = Box<dyn std::error::Error + Send + Sync>;

/// Lazily evaluated value for [`SharedCache::get_or_create`]
pub type ValueFactory<'a> =
    Box<dyn FnOnce() -> BoxFuture<'a, Result<Vec<u8>, FactoryError>> + Send + 'a>;

/// Error types for cache backends
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Invalid cache selector '{0}' (expected 'memory' or 'sqlite:<path>')")]
    InvalidSelector(String),
    #[error("Value factory failed: {0}")]
    Factory(#[source] FactoryError),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Keyed byte store with atomic get-or-create semantics
///
/// Implementations must be safe for concurrent use. `get_or_create` must
/// return whichever value ends up stored for the key, which is not
/// necessarily the one produced by this caller's factory.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Read a live value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Return the stored value, or run `factory` and store its output if none
    async fn get_or_create(
        &self,
        key: &str,
        factory: ValueFactory<'_>,
    ) -> Result<Vec<u8>, CacheError>;

    /// Delete a value. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// Settings common to every backend
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Entries older than this are treated as absent. `None` keeps entries
    /// until they are removed.
    pub entry_ttl: Option<Duration>,
}

/// Which backend to build, parsed from `memory` or `sqlite:<path>`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheBackend {
    #[default]
    Memory,
    Sqlite(PathBuf),
}

impl FromStr for CacheBackend {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("memory") {
            return Ok(CacheBackend::Memory);
        }
        match trimmed.split_once(':') {
            Some((scheme, path)) if scheme.eq_ignore_ascii_case("sqlite") && !path.is_empty() => {
                Ok(CacheBackend::Sqlite(PathBuf::from(path)))
            }
            _ => Err(CacheError::InvalidSelector(s.to_string())),
        }
    }
}

/// Build the configured backend
pub async fn open_cache(
    backend: &CacheBackend,
    options: CacheOptions,
) -> Result<Arc<dyn SharedCache>, CacheError> {
    match backend {
        CacheBackend::Memory => {
            tracing::info!("Using in-process session ownership cache");
            Ok(Arc::new(MemoryCache::new(options)))
        }
        CacheBackend::Sqlite(path) => {
            tracing::info!(path = %path.display(), "Using SQLite session ownership cache");
            Ok(Arc::new(SqliteCache::open(path, options).await?))
        }
    }
}
