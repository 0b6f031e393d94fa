pub mod affinity;
pub mod builder;
pub mod cache;
pub mod node;
pub mod types;

// Re-export commonly used items
pub use affinity::{AffinityError, SessionAffinityFilter, SessionAffinityOptions};
pub use builder::{build_session_affinity, build_with_cache};
pub use types::{OwnerId, OwnershipRecord};
