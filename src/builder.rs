//! Affinity builder - constructs a fully configured session affinity filter
//!
//! Used by the node binary and the integration tests.

use std::sync::Arc;

use crate::affinity::{
    AffinityError, CacheSessionStore, HttpForwarder, ServerAddresses, SessionAffinityFilter,
    SessionAffinityOptions,
};
use crate::cache::{open_cache, SharedCache};
use crate::types::OwnerId;

/// Build the filter from options: open the configured cache, then wire the
/// ownership store and HTTP forwarder around it
pub async fn build_session_affinity(
    options: &SessionAffinityOptions,
    owner_id: OwnerId,
    addresses: Arc<dyn ServerAddresses>,
) -> Result<Arc<SessionAffinityFilter>, AffinityError> {
    options.validate()?;
    let cache = open_cache(&options.cache_backend()?, options.cache_options()).await?;
    build_with_cache(options, owner_id, addresses, cache)
}

/// Same as [`build_session_affinity`] over an already opened cache, so
/// several filters can share one in-process cache
pub fn build_with_cache(
    options: &SessionAffinityOptions,
    owner_id: OwnerId,
    addresses: Arc<dyn ServerAddresses>,
    cache: Arc<dyn SharedCache>,
) -> Result<Arc<SessionAffinityFilter>, AffinityError> {
    let store = CacheSessionStore::with_prefix(cache, options.key_prefix.clone());
    let forwarder = HttpForwarder::new(options.connect_timeout())
        .map_err(|e| AffinityError::Config(format!("cannot build forwarding client: {}", e)))?;

    let filter = SessionAffinityFilter::new(
        owner_id,
        Arc::new(store),
        Arc::new(forwarder),
        addresses,
        options,
    )?;

    tracing::info!(
        owner = %filter.owner_id(),
        header = %filter.session_header(),
        "Session affinity enabled"
    );
    Ok(Arc::new(filter))
}
