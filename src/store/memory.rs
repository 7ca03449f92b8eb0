//! In-memory record store

use super::{conflict, Deletion, RecordStore, Resource};
use crate::error::{FleetError, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Record store backed by a map behind a lock
pub struct MemoryStore<T: Resource> {
    records: Arc<RwLock<BTreeMap<String, T>>>,
    revision: Arc<AtomicU64>,
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            revision: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Store that shares its revision counter with other stores, so creation
    /// indexes are comparable across kinds
    pub fn with_revision(revision: Arc<AtomicU64>) -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            revision,
        }
    }

    /// Replace the contents wholesale, used when loading a snapshot
    pub fn restore(&self, objects: Vec<T>) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;
        records.clear();
        for obj in objects {
            let meta = obj.meta();
            let seen = meta.resource_version.max(meta.creation_index);
            self.revision.fetch_max(seen, Ordering::SeqCst);
            records.insert(obj.name().to_string(), obj);
        }
        Ok(())
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl<T: Resource> RecordStore<T> for MemoryStore<T> {
    fn get(&self, name: &str) -> Result<T> {
        let records = self
            .records
            .read()
            .map_err(|_| FleetError::Lock("Failed to acquire read lock".to_string()))?;
        records
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::not_found(T::KIND, name))
    }

    fn list(&self) -> Result<Vec<T>> {
        let records = self
            .records
            .read()
            .map_err(|_| FleetError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(records.values().cloned().collect())
    }

    fn create(&self, mut obj: T) -> Result<T> {
        let mut records = self
            .records
            .write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;

        if obj.name().is_empty() {
            return Err(FleetError::Validation(format!(
                "{} name must not be empty",
                T::KIND
            )));
        }
        if records.contains_key(obj.name()) {
            return Err(FleetError::AlreadyExists {
                kind: T::KIND,
                name: obj.name().to_string(),
            });
        }

        let revision = self.next_revision();
        let meta = obj.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        meta.resource_version = revision;
        meta.creation_index = revision;
        meta.generation = meta.generation.max(1);
        meta.created_at.get_or_insert_with(Utc::now);
        meta.deletion_requested_at = None;

        debug!("Created {} {}", T::KIND, obj.name());
        records.insert(obj.name().to_string(), obj.clone());
        Ok(obj)
    }

    fn update(&self, mut obj: T) -> Result<T> {
        let mut records = self
            .records
            .write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;

        let stored = records
            .get(obj.name())
            .ok_or_else(|| FleetError::not_found(T::KIND, obj.name()))?;
        let found = stored.meta().resource_version;
        if obj.meta().resource_version != found {
            return Err(conflict(&obj, found));
        }

        // Identity and deletion state belong to the store.
        let stored_meta = stored.meta().clone();
        let revision = self.next_revision();
        let meta = obj.meta_mut();
        meta.uid = stored_meta.uid;
        meta.creation_index = stored_meta.creation_index;
        meta.created_at = stored_meta.created_at;
        if stored_meta.deletion_requested_at.is_some() {
            meta.deletion_requested_at = stored_meta.deletion_requested_at;
        }
        meta.resource_version = revision;

        if obj.meta().is_deleting() && obj.meta().finalizers.is_empty() {
            info!("Last finalizer removed, deleting {} {}", T::KIND, obj.name());
            records.remove(obj.name());
            return Ok(obj);
        }

        records.insert(obj.name().to_string(), obj.clone());
        Ok(obj)
    }

    fn delete(&self, name: &str) -> Result<Deletion> {
        let mut records = self
            .records
            .write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;

        let revision = self.next_revision();
        let obj = records
            .get_mut(name)
            .ok_or_else(|| FleetError::not_found(T::KIND, name))?;

        if obj.meta().finalizers.is_empty() {
            records.remove(name);
            info!("Deleted {} {}", T::KIND, name);
            return Ok(Deletion::Deleted);
        }

        let meta = obj.meta_mut();
        if meta.deletion_requested_at.is_none() {
            meta.deletion_requested_at = Some(Utc::now());
            meta.resource_version = revision;
        }
        info!(
            "Deletion of {} {} pending on finalizers: {:?}",
            T::KIND,
            name,
            meta.finalizers
        );
        Ok(Deletion::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{modify, ObjectMeta};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        meta: ObjectMeta,
        value: u32,
    }

    impl Resource for Counter {
        const KIND: &'static str = "Counter";

        fn meta(&self) -> &ObjectMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.meta
        }
    }

    fn counter(name: &str) -> Counter {
        Counter {
            meta: ObjectMeta::named(name),
            value: 0,
        }
    }

    #[test]
    fn test_create_assigns_identity() {
        let store = MemoryStore::new();
        let a = store.create(counter("a")).unwrap();
        let b = store.create(counter("b")).unwrap();
        assert!(!a.meta.uid.is_empty());
        assert_eq!(a.meta.generation, 1);
        assert!(b.meta.creation_index > a.meta.creation_index);
        assert!(matches!(
            store.create(counter("a")),
            Err(FleetError::AlreadyExists { .. })
        ));
        assert!(store.create(counter("")).is_err());
    }

    #[test]
    fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let original = store.create(counter("a")).unwrap();

        let mut first = original.clone();
        first.value = 1;
        store.update(first).unwrap();

        let mut stale = original;
        stale.value = 2;
        let err = store.update(stale).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("a").unwrap().value, 1);
    }

    #[test]
    fn test_concurrent_modify_loses_nothing() {
        let store = MemoryStore::new();
        store.create(counter("shared")).unwrap();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..25 {
                        modify(&store, "shared", 1000, |c: &mut Counter| {
                            c.value += 1;
                            Ok(true)
                        })
                        .unwrap();
                    }
                });
            }
        });

        assert_eq!(store.get("shared").unwrap().value, 200);
    }

    #[test]
    fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        let mut guarded = counter("guarded");
        guarded.meta.finalizers.push("nodeset.os/b0accd1c-nova".to_string());
        store.create(guarded).unwrap();

        assert_eq!(store.delete("guarded").unwrap(), Deletion::Pending);
        let pending = store.get("guarded").unwrap();
        assert!(pending.meta.is_deleting());

        modify(&store, "guarded", 3, |c: &mut Counter| {
            Ok(c.meta.remove_finalizer("nodeset.os/b0accd1c-nova"))
        })
        .unwrap();
        assert!(store.get("guarded").unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_without_finalizers() {
        let store = MemoryStore::new();
        store.create(counter("plain")).unwrap();
        assert_eq!(store.delete("plain").unwrap(), Deletion::Deleted);
        assert!(store.try_get("plain").unwrap().is_none());
        assert!(store.delete("plain").unwrap_err().is_not_found());
    }

    #[test]
    fn test_restore_advances_revision() {
        let store = MemoryStore::new();
        let mut old = counter("old");
        old.meta.resource_version = 40;
        old.meta.creation_index = 12;
        store.restore(vec![old]).unwrap();

        let fresh = store.create(counter("fresh")).unwrap();
        assert!(fresh.meta.creation_index > 40);
    }
}
