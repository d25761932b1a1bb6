//! Transport port: durable storage of commit content.
//!
//! - [`traits`] - The `Transport` trait and its key types
//! - [`memory`] - In-memory backend

pub mod memory;
pub mod traits;

pub use memory::{MemoryTransport, TransportOp};
pub use traits::{CommitKey, ProductKey, ResourceKey, Transport, TransportError};
