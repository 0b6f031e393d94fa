//! Protocol route classification
//!
//! A 404 relayed from the owning instance only means "session gone" when the
//! request hit a protocol endpoint. Routes are marked explicitly when the
//! router is built and matched against axum's [`MatchedPath`]. Requests that
//! carry no matched path (fallbacks, nested services) are checked against the
//! same set by raw path, and finally by path segment (`mcp`, `sse`, `message`)
//! unless that legacy fallback is switched off.

use std::collections::HashSet;

use axum::extract::{MatchedPath, Request};

/// Segments treated as protocol endpoints by the legacy fallback
pub const LEGACY_PROTOCOL_SEGMENTS: &[&str] = &["mcp", "sse", "message", "messages"];

#[derive(Debug, Clone)]
pub struct ProtocolRoutes {
    routes: HashSet<String>,
    legacy_fallback: bool,
}

impl Default for ProtocolRoutes {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRoutes {
    pub fn new() -> Self {
        Self {
            routes: HashSet::new(),
            legacy_fallback: true,
        }
    }

    /// Register a route pattern (as written in `Router::route`) as a protocol endpoint
    pub fn mark(mut self, route: impl Into<String>) -> Self {
        self.routes.insert(route.into());
        self
    }

    pub fn with_legacy_fallback(mut self, enabled: bool) -> Self {
        self.legacy_fallback = enabled;
        self
    }

    pub fn is_marked(&self, route: &str) -> bool {
        self.routes.contains(route)
    }

    /// Whether `request` targets a protocol message/event endpoint
    pub fn is_protocol_request(&self, request: &Request) -> bool {
        if let Some(matched) = request.extensions().get::<MatchedPath>() {
            if self.is_marked(matched.as_str()) {
                return true;
            }
        }
        self.is_protocol_path(request.uri().path())
    }

    /// Path-only classification, used when no matched route is available
    pub fn is_protocol_path(&self, path: &str) -> bool {
        if self.is_marked(path) {
            return true;
        }
        self.legacy_fallback
            && path
                .split('/')
                .any(|segment| LEGACY_PROTOCOL_SEGMENTS.iter().any(|p| segment.eq_ignore_ascii_case(p)))
    }
}
