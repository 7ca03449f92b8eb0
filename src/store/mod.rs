//! Versioned record storage
//!
//! Every persisted object lives in a [`RecordStore`] keyed by name. Writes are
//! guarded by optimistic concurrency: an update must carry the resource
//! version it read, otherwise it fails with [`FleetError::Conflict`] and the
//! caller re-reads and tries again (see [`modify`]).

mod memory;
mod meta;

pub use memory::MemoryStore;
pub use meta::ObjectMeta;

use crate::error::{FleetError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A persisted object
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Kind name used in errors and manifests
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }
}

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// The object is gone
    Deleted,
    /// The object still carries finalizers; removal completes when they are dropped
    Pending,
}

/// Storage for one kind of object
pub trait RecordStore<T: Resource>: Send + Sync {
    /// Get an object by name
    fn get(&self, name: &str) -> Result<T>;

    /// List all objects ordered by name
    fn list(&self) -> Result<Vec<T>>;

    /// Create a new object; fails if the name is taken
    fn create(&self, obj: T) -> Result<T>;

    /// Replace an object. The object's resource version must match the stored one.
    fn update(&self, obj: T) -> Result<T>;

    /// Request deletion of an object
    fn delete(&self, name: &str) -> Result<Deletion>;

    /// Get an object, mapping not-found to `None`
    fn try_get(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Run `op` until it succeeds or fails with something other than a conflict
pub fn retry_on_conflict<T, F>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!("Retrying after conflict (attempt {}): {}", attempt, e);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Read-modify-write an object with retry on conflict.
///
/// `mutate` returns whether it changed anything; unchanged objects are not
/// written back. Returns the stored object after the cycle.
pub fn modify<T, F>(store: &dyn RecordStore<T>, name: &str, attempts: u32, mut mutate: F) -> Result<T>
where
    T: Resource,
    F: FnMut(&mut T) -> Result<bool>,
{
    retry_on_conflict(attempts, || {
        let mut obj = store.get(name)?;
        if mutate(&mut obj)? {
            store.update(obj)
        } else {
            Ok(obj)
        }
    })
}

/// Monotonic counter used for completion evidence
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    value: Arc<AtomicU64>,
}

impl Sequence {
    pub fn new(start: u64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Allocate the next sequence number
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last allocated number
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Build a conflict error for `obj`
pub(crate) fn conflict<T: Resource>(obj: &T, found: u64) -> FleetError {
    FleetError::Conflict {
        kind: T::KIND,
        name: obj.name().to_string(),
        expected: obj.meta().resource_version,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let seq = Sequence::new(10);
        assert_eq!(seq.next(), 11);
        assert_eq!(seq.next(), 12);
        assert_eq!(seq.current(), 12);
        let shared = seq.clone();
        assert_eq!(shared.next(), 13);
        assert_eq!(seq.current(), 13);
    }

    #[test]
    fn test_retry_on_conflict_gives_up() {
        let mut calls = 0;
        let result: Result<()> = retry_on_conflict(3, || {
            calls += 1;
            Err(FleetError::Conflict {
                kind: "Secret",
                name: "s".to_string(),
                expected: 1,
                found: 2,
            })
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_on_conflict_passes_other_errors() {
        let mut calls = 0;
        let result: Result<()> = retry_on_conflict(3, || {
            calls += 1;
            Err(FleetError::Validation("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
