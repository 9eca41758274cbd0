//! In-process store

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{StepStore, StoreWrite, StoredSnapshot, UserRecord};
use crate::error::StoreError;
use crate::types::UserKey;

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<UserKey, UserRecord>,
    fail_loads: bool,
    fail_writes: bool,
    writes: Vec<(UserKey, StoreWrite)>,
}

/// Shared in-memory document store.
///
/// Clones share the same documents, so a caller can keep one clone to inspect
/// what a tracker persisted through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user's document
    pub fn insert(&self, user: &UserKey, record: UserRecord) {
        self.lock().users.insert(user.clone(), record);
    }

    /// Make subsequent loads fail as if the store were unreachable
    pub fn set_fail_loads(&self, fail: bool) {
        self.lock().fail_loads = fail;
    }

    /// Make subsequent writes fail as if the store were unreachable
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Every write applied so far, in order
    pub fn writes(&self) -> Vec<(UserKey, StoreWrite)> {
        self.lock().writes.clone()
    }

    pub fn get(&self, user: &UserKey) -> Option<UserRecord> {
        self.lock().users.get(user).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StepStore for MemoryStore {
    fn load(&mut self, user: &UserKey, date: &str) -> Result<StoredSnapshot, StoreError> {
        let inner = self.lock();
        if inner.fail_loads {
            return Err(StoreError::Unavailable("memory store loads disabled".into()));
        }
        Ok(inner
            .users
            .get(user)
            .map(|record| record.snapshot(date))
            .unwrap_or_default())
    }

    fn write(&mut self, user: &UserKey, write: &StoreWrite) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Unavailable("memory store writes disabled".into()));
        }
        inner.users.entry(user.clone()).or_default().apply(write);
        inner.writes.push((user.clone(), write.clone()));
        Ok(())
    }

    fn record(&self, user: &UserKey) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.get(user))
    }
}
