//! Single-file JSON document store
//!
//! Mirrors the remote document layout (`users/<key>/...`) in one JSON file so
//! the tracker can run without a network backend. The file is rewritten in
//! full after every write through a temp file and rename.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::{StepStore, StoreWrite, StoredSnapshot, UserRecord};
use crate::error::StoreError;
use crate::types::UserKey;

/// On-disk document tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
}

impl StoreDocument {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    document: StoreDocument,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => StoreDocument::default(),
            Ok(content) => StoreDocument::from_json(&content)?,
            Err(e) if e.kind() == ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, document })
    }

    pub fn document(&self) -> &StoreDocument {
        &self.document
    }

    fn persist(&self) -> Result<(), StoreError> {
        let json = self.document.to_json()?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StepStore for JsonFileStore {
    fn load(&mut self, user: &UserKey, date: &str) -> Result<StoredSnapshot, StoreError> {
        Ok(self
            .document
            .users
            .get(user.as_str())
            .map(|record| record.snapshot(date))
            .unwrap_or_default())
    }

    fn write(&mut self, user: &UserKey, write: &StoreWrite) -> Result<(), StoreError> {
        self.document
            .users
            .entry(user.as_str().to_string())
            .or_default()
            .apply(write);
        self.persist()
    }

    fn record(&self, user: &UserKey) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.document.users.get(user.as_str()).cloned())
    }
}
