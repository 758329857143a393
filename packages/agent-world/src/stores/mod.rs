//! Storage implementations.
//!
//! Available backends:
//! - `MemoryStorage` - In-memory storage (tests, ephemeral worlds)
//! - `FileStorage` - JSON files under a data directory

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;
