//! Resource-manager implementations.

mod memory;

pub use memory::{MemoryResourceManager, MemorySessionHolder, MemoryStore, MemoryTransaction};
