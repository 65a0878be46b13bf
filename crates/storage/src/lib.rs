//! Storage backends for cumulo.
//!
//! Architecture role:
//! - defines the byte-blob [`StorageBackend`] contract the builder, future,
//!   and wait layers coordinate through
//! - ships a process-local [`MemoryBackend`] for tests and local runs
//! - ships an `object_store`-backed backend for real services (feature-gated)
//!
//! Feature flags:
//! - `object-store`: enables [`object_store_backend::ObjectStoreBackend`].

pub mod backend;
pub mod memory;
#[cfg(feature = "object-store")]
pub mod object_store_backend;

pub use backend::{ByteRange, ObjectMeta, StorageBackend};
pub use memory::MemoryBackend;
#[cfg(feature = "object-store")]
pub use object_store_backend::ObjectStoreBackend;
