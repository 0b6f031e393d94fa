//! Session affinity filter
//!
//! Runs in front of the protocol handlers. For every request carrying a
//! session header it claims-or-gets ownership of that session and then either
//! lets the request through to the local handler or forwards it to the owner:
//!
//! | Record returned                         | Action                                  |
//! |-----------------------------------------|-----------------------------------------|
//! | no header                               | next handler, store untouched           |
//! | owned by this process                   | next handler                            |
//! | our address, another owner id (stale)   | remove, claim once more, then decide    |
//! | another address                         | forward                                 |
//!
//! After forwarding, a 404 from a protocol endpoint means the owner forgot the
//! session and the record is evicted so the next request re-claims. A
//! transport failure becomes a 502 and the record is kept: the owner may only
//! be briefly unreachable.
//!
//! Install with `middleware::from_fn_with_state(filter, session_affinity)` via
//! `Router::layer` so protocol routes are visible through `MatchedPath`.

use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;

use crate::types::{OwnerId, OwnershipRecord};

use super::error::AffinityError;
use super::forwarder::{bad_gateway, Forwarder};
use super::options::SessionAffinityOptions;
use super::resolver::{normalize_explicit, resolve_listening_address, ServerAddresses};
use super::routes::ProtocolRoutes;
use super::store::{RecordFactory, SessionOwnershipStore};

/// Where a session-bearing request should be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(OwnershipRecord),
}

pub struct SessionAffinityFilter {
    owner_id: OwnerId,
    store: Arc<dyn SessionOwnershipStore>,
    forwarder: Arc<dyn Forwarder>,
    addresses: Arc<dyn ServerAddresses>,
    /// Normalized override, validated at construction
    explicit_address: Option<String>,
    session_header: HeaderName,
    routes: ProtocolRoutes,
}

impl fmt::Debug for SessionAffinityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAffinityFilter")
            .field("owner_id", &self.owner_id)
            .field("session_header", &self.session_header)
            .field("explicit_address", &self.explicit_address)
            .finish_non_exhaustive()
    }
}

impl SessionAffinityFilter {
    /// Build a filter, failing on invalid configuration
    pub fn new(
        owner_id: OwnerId,
        store: Arc<dyn SessionOwnershipStore>,
        forwarder: Arc<dyn Forwarder>,
        addresses: Arc<dyn ServerAddresses>,
        options: &SessionAffinityOptions,
    ) -> Result<Self, AffinityError> {
        options.validate()?;
        let explicit_address = options.explicit_address().map(normalize_explicit).transpose()?;

        Ok(Self {
            owner_id,
            store,
            forwarder,
            addresses,
            explicit_address,
            session_header: options.session_header_name()?,
            routes: options.protocol_routes(),
        })
    }

    /// Replace the protocol routes derived from options
    pub fn with_protocol_routes(mut self, routes: ProtocolRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn session_header(&self) -> &HeaderName {
        &self.session_header
    }

    pub fn protocol_routes(&self) -> &ProtocolRoutes {
        &self.routes
    }

    /// Address siblings should use to reach this process, recomputed per call
    pub fn local_address(&self) -> Result<String, AffinityError> {
        let bound = self.addresses.addresses();
        resolve_listening_address(bound.as_deref(), self.explicit_address.as_deref())
    }

    fn local_record(&self) -> RecordFactory<'_> {
        Box::new(move || {
            async move {
                let address = self.local_address()?;
                Ok(OwnershipRecord::claim(self.owner_id.clone(), address))
            }
            .boxed()
        })
    }

    /// Session id carried by `request`, if any
    pub fn session_id(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get(&self.session_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    /// Claim a session this process just created. Returns the record now
    /// stored, which names this process unless a sibling got there first.
    pub async fn claim_local(&self, session_id: &str) -> Result<OwnershipRecord, AffinityError> {
        let record = self.store.get_or_claim(session_id, self.local_record()).await?;
        if record.is_owned_by(&self.owner_id) {
            tracing::info!(session_id, address = %record.address, "Claimed new session");
        } else {
            tracing::warn!(session_id, owner = %record, "New session already owned elsewhere");
        }
        Ok(record)
    }

    /// Decide where `session_id` is served, claiming it if nobody owns it
    pub async fn route(&self, session_id: &str) -> Result<Route, AffinityError> {
        let record = self.store.get_or_claim(session_id, self.local_record()).await?;
        if record.is_owned_by(&self.owner_id) {
            return Ok(Route::Local);
        }

        let local_address = self.local_address()?;
        if record.address != local_address {
            return Ok(Route::Remote(record));
        }

        // A previous incarnation at our address claimed it and never released it
        tracing::warn!(
            session_id,
            stale_owner = %record.owner_id,
            address = %record.address,
            "Reclaiming session from stale owner at this address"
        );
        self.store.remove(session_id).await?;

        let record = self.store.get_or_claim(session_id, self.local_record()).await?;
        if record.is_owned_by(&self.owner_id) {
            tracing::info!(session_id, "Reclaimed stale session");
            return Ok(Route::Local);
        }
        if record.address == local_address {
            // Only this process answers at this address, so serve it here
            tracing::warn!(
                session_id,
                owner = %record.owner_id,
                "Session re-claimed by another owner at this address; serving locally"
            );
            return Ok(Route::Local);
        }
        Ok(Route::Remote(record))
    }

    /// Handle one request: pass through, serve locally, or forward
    pub async fn handle(&self, request: Request, next: Next) -> Response {
        let Some(session_id) = self.session_id(&request) else {
            return next.run(request).await;
        };

        match self.route(&session_id).await {
            Ok(Route::Local) => {
                tracing::debug!(session_id = %session_id, "Serving session locally");
                next.run(request).await
            }
            Ok(Route::Remote(record)) => self.forward(&session_id, record, request).await,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Session ownership lookup failed");
                ownership_failure(&e)
            }
        }
    }

    async fn forward(&self, session_id: &str, record: OwnershipRecord, request: Request) -> Response {
        let protocol = self.routes.is_protocol_request(&request);
        tracing::debug!(
            session_id,
            owner = %record.owner_id,
            destination = %record.address,
            "Forwarding session request to owner"
        );

        match self.forwarder.forward(&record.address, request).await {
            Ok(response) => {
                if response.status() == StatusCode::NOT_FOUND && protocol {
                    tracing::info!(
                        session_id,
                        owner = %record.owner_id,
                        "Owner no longer recognizes session, evicting ownership record"
                    );
                    // The remote response is relayed regardless
                    if let Err(e) = self.store.remove(session_id).await {
                        tracing::warn!(session_id, error = %e, "Failed to evict ownership record");
                    }
                }
                response
            }
            Err(e) => {
                tracing::warn!(
                    session_id,
                    destination = %record.address,
                    error = %e,
                    "Forwarding to session owner failed"
                );
                bad_gateway(session_id)
            }
        }
    }
}

/// axum middleware entry point
pub async fn session_affinity(
    State(filter): State<Arc<SessionAffinityFilter>>,
    request: Request,
    next: Next,
) -> Response {
    filter.handle(request, next).await
}

fn ownership_failure(error: &AffinityError) -> Response {
    let body = serde_json::json!({
        "error": "Session ownership unavailable",
        "detail": error.to_string(),
    });
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
