//! Storage node: local chunk data and the data-plane server.

mod chunk_store;
mod server;
mod service;

pub use chunk_store::{ChunkStore, StoredChunk};
pub use server::{dispatch, DataServer};
pub use service::{NodeStatus, StorageNodeService};
