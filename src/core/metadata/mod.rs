//! core::metadata
//!
//! Entity record schemas and local sidecars.
//!
//! # Modules
//!
//! - [`schema`] - Records persisted through the database port (v1)
//! - [`sidecar`] - Work and product bookkeeping in the local cache
//!
//! # Schema Design
//!
//! - Self-describing: includes `kind` and `schema_version`
//! - Strict parsing: unknown fields are rejected

pub mod schema;
pub mod sidecar;

pub use schema::{
    CommitRecord, EntityKind, MetadataError, ProjectRecord, Record, ResourceRecord, COMMIT_KIND,
    PROJECT_KIND, RESOURCE_KIND, SCHEMA_VERSION,
};
pub use sidecar::{InputEntry, ProductUsersRecord, SidecarError, WorkIndexRecord, WorkRecord};
