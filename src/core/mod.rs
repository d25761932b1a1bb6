//! core
//!
//! Core domain types, schemas and local layout for Pulse.
//!
//! # Modules
//!
//! - [`uri`] - Resource addressing scheme
//! - [`types`] - Strong types: ProductType, Alias, Fingerprint, manifests
//! - [`metadata`] - Record schemas and local sidecars
//! - [`config`] - Configuration schema and loading
//! - [`paths`] - Centralized path routing for the local cache
//! - [`fsutil`] - Filesystem helpers
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at compile time
//! - Schemas are strict and self-describing
//! - Nothing here talks to a backend

pub mod config;
pub mod fsutil;
pub mod metadata;
pub mod paths;
pub mod types;
pub mod uri;
