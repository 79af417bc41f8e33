//! Access Key Registry
//!
//! Issues opaque access keys, binds each key to at most one client IP address
//! and resolves keys back to their bound address. Creating, listing and
//! revoking keys requires the admin secret; binding and resolving only
//! require possession of the key itself.
//!
//! State lives in a single [`KeyRegistry`] which delegates durability to a
//! [`CredentialStore`] back end (in-memory or JSON file).

pub mod errors;
pub mod registry;
pub mod storage;
pub mod types;

pub use errors::*;
pub use registry::KeyRegistry;
pub use storage::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreKind};
pub use types::*;
