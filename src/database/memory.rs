//! database::memory
//!
//! In-memory persistence backend.
//!
//! # Design
//!
//! Records live in a map shared by every clone, so several connections
//! (for example two users on two machines) can be simulated against the
//! same store. Each clone carries its own user name. A failure can be
//! armed for the next call of a given operation to exercise partial
//! failure paths.
//!
//! # Example
//!
//! ```
//! use pulse::core::metadata::EntityKind;
//! use pulse::database::{Database, MemoryDatabase};
//! use serde_json::json;
//!
//! let alice = MemoryDatabase::new("alice");
//! let bob = alice.with_user("bob");
//!
//! alice.create_project("film").unwrap();
//! alice.create("film", EntityKind::Resource, "anna-rig", json!({"last_version": 0})).unwrap();
//! bob.update("film", EntityKind::Resource, "anna-rig", json!({"last_version": 1})).unwrap();
//!
//! let record = alice.read("film", EntityKind::Resource, "anna-rig").unwrap();
//! assert_eq!(record["last_version"], 1);
//! assert_eq!(bob.get_user_name(), "bob");
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{glob_to_regex, Database, DatabaseError};
use crate::core::metadata::EntityKind;

type RecordKey = (String, EntityKind, String);

/// Operations that can be armed to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseOp {
    CreateProject,
    FindUris,
    Create,
    Update,
    Read,
}

/// In-memory database for tests and embedding.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<MemoryDatabaseInner>>,
    user: String,
}

#[derive(Debug, Default)]
struct MemoryDatabaseInner {
    projects: BTreeSet<String>,
    records: BTreeMap<RecordKey, serde_json::Value>,
    fail_next: Option<(DatabaseOp, DatabaseError)>,
}

impl MemoryDatabase {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryDatabaseInner::default())),
            user: user.into(),
        }
    }

    /// Another connection to the same store, as a different user.
    pub fn with_user(&self, user: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            user: user.into(),
        }
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: DatabaseOp, error: DatabaseError) {
        self.lock().fail_next = Some((op, error));
    }

    /// Number of stored records of `kind` across all projects.
    pub fn record_count(&self, kind: EntityKind) -> usize {
        self.lock().records.keys().filter(|k| k.1 == kind).count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDatabaseInner> {
        // A poisoned lock only means another test thread panicked mid-call;
        // the map itself is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_fail(inner: &mut MemoryDatabaseInner, op: DatabaseOp) -> Result<(), DatabaseError> {
        match inner.fail_next.take() {
            Some((armed, error)) if armed == op => Err(error),
            other => {
                inner.fail_next = other;
                Ok(())
            }
        }
    }

    fn require_project(inner: &MemoryDatabaseInner, project: &str) -> Result<(), DatabaseError> {
        if inner.projects.contains(project) {
            Ok(())
        } else {
            Err(DatabaseError::NotFound(format!("project {project}")))
        }
    }

    fn key(project: &str, kind: EntityKind, uri: &str) -> RecordKey {
        (project.to_string(), kind, uri.to_string())
    }
}

fn require_object(uri: &str, fields: &serde_json::Value) -> Result<(), DatabaseError> {
    if fields.is_object() {
        Ok(())
    } else {
        Err(DatabaseError::InvalidRecord {
            uri: uri.to_string(),
            message: "record must be a JSON object".to_string(),
        })
    }
}

impl Database for MemoryDatabase {
    fn create_project(&self, name: &str) -> Result<(), DatabaseError> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, DatabaseOp::CreateProject)?;
        if !inner.projects.insert(name.to_string()) {
            return Err(DatabaseError::AlreadyExists(format!("project {name}")));
        }
        Ok(())
    }

    fn find_uris(
        &self,
        project: &str,
        kind: EntityKind,
        pattern: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, DatabaseOp::FindUris)?;
        Self::require_project(&inner, project)?;
        let re = glob_to_regex(pattern)?;
        Ok(inner
            .records
            .keys()
            .filter(|(p, k, uri)| p == project && *k == kind && re.is_match(uri))
            .map(|(_, _, uri)| uri.clone())
            .collect())
    }

    fn create(
        &self,
        project: &str,
        kind: EntityKind,
        uri: &str,
        fields: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, DatabaseOp::Create)?;
        Self::require_project(&inner, project)?;
        require_object(uri, &fields)?;
        let key = Self::key(project, kind, uri);
        if inner.records.contains_key(&key) {
            return Err(DatabaseError::AlreadyExists(format!("{kind} {uri}")));
        }
        inner.records.insert(key, fields);
        Ok(())
    }

    fn update(
        &self,
        project: &str,
        kind: EntityKind,
        uri: &str,
        fields: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, DatabaseOp::Update)?;
        Self::require_project(&inner, project)?;
        let serde_json::Value::Object(partial) = fields else {
            return Err(DatabaseError::InvalidRecord {
                uri: uri.to_string(),
                message: "update must be a JSON object".to_string(),
            });
        };
        let record = inner
            .records
            .get_mut(&Self::key(project, kind, uri))
            .ok_or_else(|| DatabaseError::NotFound(format!("{kind} {uri}")))?;
        if let serde_json::Value::Object(existing) = record {
            for (field, value) in partial {
                existing.insert(field, value);
            }
        }
        Ok(())
    }

    fn read(
        &self,
        project: &str,
        kind: EntityKind,
        uri: &str,
    ) -> Result<serde_json::Value, DatabaseError> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, DatabaseOp::Read)?;
        Self::require_project(&inner, project)?;
        inner
            .records
            .get(&Self::key(project, kind, uri))
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(format!("{kind} {uri}")))
    }

    fn get_user_name(&self) -> String {
        self.user.clone()
    }
}
