//! Pulse - versioning and dependency engine for directory-based assets
//!
//! Pulse versions production assets ("resources") as immutable numbered
//! commits. Creators work in a mutable local checkout ("work") that tracks
//! file changes and declares dependencies on the published outputs
//! ("products") of other resources.
//!
//! # Architecture
//!
//! The codebase is layered, leaf to root:
//!
//! - [`core`] - URI codec, domain types, schemas, cache paths and config
//! - [`database`] - Persistence port for project, resource and commit records
//! - [`transport`] - Transport port storing commit content
//! - [`registry`] - Backend lookup by name
//! - [`project`] - Resources, commits, products and works
//! - [`error`] - Errors surfaced by engine operations
//!
//! # Guarantees
//!
//! 1. Commits are append-only and never rewritten
//! 2. A work commits only on top of the version it was checked out from
//! 3. A cached product is evicted only when nothing uses it
//! 4. Every failure is typed; nothing is retried or rolled back silently
//!
//! # Example
//!
//! ```
//! use pulse::core::types::{ConflictPolicy, ProductType};
//! use pulse::core::uri::UriVersion;
//! use pulse::project::Connection;
//!
//! let sandbox = tempfile::tempdir().unwrap();
//! let products = tempfile::tempdir().unwrap();
//! let connection = Connection::in_memory("alice", sandbox.path(), products.path());
//! let project = connection.create_project("film").unwrap();
//!
//! let resource = project.create_resource("anna", "model", None).unwrap();
//! let mut work = resource.checkout(UriVersion::Last, None, ConflictPolicy::Error).unwrap();
//! std::fs::write(work.directory().join("anna.obj"), "v 0 0 0").unwrap();
//! work.create_product(&ProductType::new("geo").unwrap()).unwrap();
//!
//! let commit = work.commit("first pass").unwrap();
//! assert_eq!(commit.version(), 1);
//! assert_eq!(work.version(), 2);
//! ```

pub mod core;
pub mod database;
pub mod error;
pub mod project;
pub mod registry;
pub mod transport;

pub use error::{PulseError, Result};
