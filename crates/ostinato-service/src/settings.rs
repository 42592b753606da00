//! Simple persisted key/value settings backing the resource caches.
//!
//! Each cache stores its serialized value and last-sync timestamp under two
//! keys. The store is deliberately dumb: a flat map, flushed as one JSON
//! file. Anything missing or unreadable is treated as "never synced".

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::Value;

pub trait SettingsStore: Send + Sync + fmt::Debug {
    fn get_str(&self, key: &str) -> Option<String>;
    fn set_str(&self, key: &str, value: String);
    fn get_i64(&self, key: &str) -> Option<i64>;
    fn set_i64(&self, key: &str, value: i64);
    fn remove(&self, key: &str);

    /// Writes pending changes out. A no-op for non-persistent stores.
    fn flush(&self) -> Result<()>;
}

/// Settings persisted as a single JSON object on disk.
#[derive(Debug)]
pub struct JsonSettings {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonSettings {
    /// Opens the settings file, starting empty if it is absent or unreadable.
    pub fn open(path: PathBuf) -> Self {
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        path = %path.display(),
                        "ignoring malformed settings file"
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SettingsStore for JsonSettings {
    fn get_str(&self, key: &str) -> Option<String> {
        self.lock().get(key)?.as_str().map(str::to_owned)
    }

    fn set_str(&self, key: &str, value: String) {
        self.lock().insert(key.to_owned(), Value::String(value));
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.lock().get(key)?.as_i64()
    }

    fn set_i64(&self, key: &str, value: i64) {
        self.lock().insert(key.to_owned(), Value::from(value));
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    fn flush(&self) -> Result<()> {
        let serialized = {
            let entries = self.lock();
            serde_json::to_string_pretty(&*entries).context("failed to serialize settings")?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("failed to create settings directory")?;
        }
        fs::write(&self.path, serialized).context("failed to write settings file")
    }
}

/// Volatile settings for tests and persistence-free runs.
#[derive(Debug, Default)]
pub struct MemorySettings {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn get_str(&self, key: &str) -> Option<String> {
        self.lock().get(key)?.as_str().map(str::to_owned)
    }

    fn set_str(&self, key: &str, value: String) {
        self.lock().insert(key.to_owned(), Value::String(value));
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.lock().get(key)?.as_i64()
    }

    fn set_i64(&self, key: &str, value: i64) {
        self.lock().insert(key.to_owned(), Value::from(value));
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
