//! Session ownership store
//!
//! Claim-or-get over a [`SharedCache`]. The record factory is only evaluated
//! when no record exists, and the record returned is whichever one the cache
//! ended up holding, so callers must compare owners instead of assuming their
//! own claim won.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::cache::{FactoryError, SharedCache, ValueFactory};
use crate::types::OwnershipRecord;

use super::codec;
use super::error::AffinityError;

/// Default prefix for ownership keys in the shared cache
pub const DEFAULT_KEY_PREFIX: &str = "mcp:session-owner:";

/// Produces the local ownership record, evaluated only on a cache miss
pub type RecordFactory<'a> =
    Box<dyn FnOnce() -> BoxFuture<'a, Result<OwnershipRecord, AffinityError>> + Send + 'a>;

/// Ownership records keyed by session id
#[async_trait]
pub trait SessionOwnershipStore: Send + Sync {
    /// Return the current owner, claiming the session via `factory` if unowned
    async fn get_or_claim(
        &self,
        session_id: &str,
        factory: RecordFactory<'_>,
    ) -> Result<OwnershipRecord, AffinityError>;

    /// Drop the record for `session_id`; absent records are not an error
    async fn remove(&self, session_id: &str) -> Result<(), AffinityError>;
}

/// [`SessionOwnershipStore`] persisting JSON records in a [`SharedCache`]
#[derive(Clone)]
pub struct CacheSessionStore {
    cache: Arc<dyn SharedCache>,
    key_prefix: String,
}

impl CacheSessionStore {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self::with_prefix(cache, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(cache: Arc<dyn SharedCache>, key_prefix: impl Into<String>) -> Self {
        Self {
            cache,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.key_prefix, session_id)
    }

    /// Current record without claiming
    pub async fn get(&self, session_id: &str) -> Result<Option<OwnershipRecord>, AffinityError> {
        match self.cache.get(&self.key(session_id)).await? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionOwnershipStore for CacheSessionStore {
    async fn get_or_claim(
        &self,
        session_id: &str,
        factory: RecordFactory<'_>,
    ) -> Result<OwnershipRecord, AffinityError> {
        let key = self.key(session_id);

        let value_factory: ValueFactory<'_> = Box::new(move || encode_claim(factory).boxed());
        let bytes = self.cache.get_or_create(&key, value_factory).await?;
        Ok(codec::decode(&bytes)?)
    }

    async fn remove(&self, session_id: &str) -> Result<(), AffinityError> {
        self.cache.remove(&self.key(session_id)).await?;
        Ok(())
    }
}

/// Run the record factory and serialize its output for the cache
async fn encode_claim(factory: RecordFactory<'_>) -> Result<Vec<u8>, FactoryError> {
    let record = factory().await?;
    tracing::debug!(owner = %record.owner_id, address = %record.address, "Claiming session ownership");
    Ok(codec::encode(&record).map_err(AffinityError::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheOptions, MemoryCache};
    use crate::types::OwnerId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed(record: OwnershipRecord) -> RecordFactory<'static> {
        Box::new(move || async move { Ok::<_, AffinityError>(record) }.boxed())
    }

    fn store() -> (CacheSessionStore, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new(CacheOptions::default()));
        (CacheSessionStore::new(cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_claim_then_get_returns_first_record() {
        let (store, _cache) = store();
        let a = OwnershipRecord::claim(OwnerId::from("a"), "http://10.0.0.1:5000");
        let b = OwnershipRecord::claim(OwnerId::from("b"), "http://10.0.0.2:5000");

        assert_eq!(store.get_or_claim("s1", fixed(a.clone())).await.unwrap(), a);
        assert_eq!(store.get_or_claim("s1", fixed(b)).await.unwrap(), a);
        assert_eq!(store.get("s1").await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_factory_not_invoked_when_present() {
        let (store, _cache) = store();
        let calls = Arc::new(AtomicUsize::new(0));
        store
            .get_or_claim("s1", fixed(OwnershipRecord::claim(OwnerId::from("a"), "http://a:1")))
            .await
            .unwrap();

        let counted = calls.clone();
        let factory: RecordFactory<'_> = Box::new(move || {
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AffinityError>(OwnershipRecord::claim(OwnerId::from("b"), "http://b:1"))
            }
            .boxed()
        });
        store.get_or_claim("s1", factory).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_records_are_stored_under_prefixed_key() {
        let cache = Arc::new(MemoryCache::default());
        let store = CacheSessionStore::with_prefix(cache.clone(), "test:");
        store
            .get_or_claim("abc", fixed(OwnershipRecord::claim(OwnerId::from("a"), "http://a:1")))
            .await
            .unwrap();

        assert!(cache.get("test:abc").await.unwrap().is_some());
        assert!(cache.get("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (store, cache) = store();
        store
            .get_or_claim("s1", fixed(OwnershipRecord::claim(OwnerId::from("a"), "http://a:1")))
            .await
            .unwrap();

        store.remove("s1").await.unwrap();
        store.remove("s1").await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_factory_error_propagates_unwrapped() {
        let (store, cache) = store();
        let failing: RecordFactory<'_> = Box::new(|| {
            async { Err::<OwnershipRecord, _>(AffinityError::invalid_address("ftp://x", "bad scheme")) }
                .boxed()
        });

        let err = store.get_or_claim("s1", failing).await.unwrap_err();
        assert!(matches!(err, AffinityError::InvalidAddress { .. }));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_null_record_in_cache_is_a_decode_error() {
        let (store, cache) = store();
        let null: ValueFactory<'_> =
            Box::new(|| async { Ok::<_, FactoryError>(b"null".to_vec()) }.boxed());
        cache
            .get_or_create(&format!("{}s1", DEFAULT_KEY_PREFIX), null)
            .await
            .unwrap();

        let err = store
            .get_or_claim("s1", fixed(OwnershipRecord::claim(OwnerId::from("a"), "http://a:1")))
            .await
            .unwrap_err();
        assert!(matches!(err, AffinityError::Codec(codec::CodecError::NullDocument)));
    }
}
