//! Key-path addressable status document persisted as JSON.
//!
//! Keys are dot-separated paths (`mqtt.status`) into a nested JSON object.
//! Every `set` rewrites the whole document through a staging file that is
//! renamed into place before returning. Write failures are logged and
//! swallowed so status updates never block the caller's hot path.

use serde_json::{Map, Value};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to create status directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read status file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persisted status document
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    doc: Mutex<Map<String, Value>>,
}

impl StatusStore {
    /// Open the store at `path`, loading the existing document if there is one.
    ///
    /// A missing file yields an empty document. A file that does not parse as
    /// a JSON object also yields an empty document.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let doc = match std::fs::read(&path) {
            Ok(bytes) => parse_document(&path, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(source) => return Err(PersistError::Read { path, source }),
        };

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the value at `key_path`, creating intermediate objects as needed.
    ///
    /// A non-object value found on the way is replaced by an object.
    pub fn set(&self, key_path: &str, value: impl Into<Value>) {
        let segments: Vec<&str> = key_path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            warn!(key_path, "Ignoring status write to malformed key path");
            return;
        }

        let mut doc = self.doc.lock().unwrap_or_else(|p| p.into_inner());
        insert_at(&mut doc, &segments, value.into());
        self.flush(&doc);
    }

    /// Value at `key_path`, or None if any segment is missing or not an object
    pub fn get(&self, key_path: &str) -> Option<Value> {
        let doc = self.doc.lock().unwrap_or_else(|p| p.into_inner());
        let mut segments = key_path.split('.');
        let mut current = doc.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current.clone())
    }

    /// String value at `key_path`
    pub fn get_str(&self, key_path: &str) -> Option<String> {
        self.get(key_path)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Copy of the whole document
    pub fn document(&self) -> Value {
        Value::Object(self.doc.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn flush(&self, doc: &Map<String, Value>) {
        let result = serde_json::to_vec_pretty(doc)
            .map_err(std::io::Error::from)
            .and_then(|bytes| {
                // Readers never observe a truncated document
                let staging = self.path.with_extension("json.tmp");
                let mut file = File::create(&staging)?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                std::fs::rename(&staging, &self.path)
            });

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to persist status document");
        }
    }
}

fn parse_document(path: &Path, bytes: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = %path.display(), "Status file is not a JSON object, starting empty");
            Map::new()
        }
        Err(e) => {
            if !bytes.is_empty() {
                warn!(path = %path.display(), error = %e, "Status file is malformed, starting empty");
            } else {
                debug!(path = %path.display(), "Status file is empty");
            }
            Map::new()
        }
    }
}

fn insert_at(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [leaf] => {
            map.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_at(child, rest, value);
            }
        }
    }
}
