//! Distributed session affinity for MCP server fleets
//!
//! Several instances of the same MCP server sit behind one load balancer.
//! Session state lives in process memory, so every request for a session has
//! to reach the instance that created it. The first instance to see a session
//! claims it in a shared cache; every other instance forwards that session's
//! requests to the claimant.

pub mod codec;
pub mod error;
pub mod filter;
pub mod forwarder;
pub mod options;
pub mod resolver;
pub mod routes;
pub mod store;

pub use codec::CodecError;
pub use error::AffinityError;
pub use filter::{session_affinity, Route, SessionAffinityFilter};
pub use forwarder::{ForwardError, Forwarder, HttpForwarder};
pub use options::{SessionAffinityOptions, DEFAULT_SESSION_HEADER};
pub use resolver::{resolve_listening_address, ListenerAddresses, ServerAddresses, FALLBACK_ADDRESS};
pub use routes::ProtocolRoutes;
pub use store::{CacheSessionStore, RecordFactory, SessionOwnershipStore, DEFAULT_KEY_PREFIX};
