//! Library entrypoint for peervault.
//!
//! This re-exports the coordination and peer modules as a library surface so
//! the binary (and other crates) can consume them via `use peervault::...`.
//! The registry side lives in [`registry`], the storage daemon in
//! [`peer_node`]; everything else supports those two.

pub mod cipher;
pub mod config;
pub mod discovery;
pub mod erasure;
pub mod mapping_store;
pub mod membership;
pub mod peer_node;
pub mod placement;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod retrieval;
pub mod storage_target;
pub mod transfer;

pub use config::{PeerNodeConfig, RegistryConfig};
pub use protocol::{ChunkName, PeerId};
pub use registry::{RegistryHandle, RegistryNode};
