//! Session-scoped assistant memory.

pub mod store;

pub use store::{MemoryStats, MessageRecord, ProfileStore, RawFacts};
