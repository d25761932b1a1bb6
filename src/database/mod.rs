//! Persistence port: structured records of projects, resources and commits.
//!
//! - [`traits`] - The `Database` trait
//! - [`memory`] - In-memory backend

pub mod memory;
pub mod traits;

pub use memory::{DatabaseOp, MemoryDatabase};
pub use traits::{glob_to_regex, Database, DatabaseError};
