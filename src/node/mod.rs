//! Demo MCP node
//!
//! A minimal stateful protocol endpoint used by the binary and the
//! multi-instance tests to exercise the affinity filter end to end.

pub mod transport;
pub mod types;

pub use transport::{node_router, NodeState, INSTANCE_HEADER, MCP_PATH};
pub use types::{JsonRpcRequest, JsonRpcResponse};
