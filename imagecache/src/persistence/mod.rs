pub mod memory;

pub use memory::{MemoryBlobStore, MemoryDocumentStore, MemoryStorageFactory};
