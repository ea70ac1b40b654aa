use std::collections::BTreeMap;

use tracing::{debug, warn};

use waypoint_core::config::OutputPolicy;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::session::{MemoryEntry, MemorySnapshot};

use crate::graph::NodeSpec;

/// Versioned key/value store of the outputs accumulated across all phases
/// of one session.
///
/// Keys are never removed mid-session; a later write to the same key wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedMemory {
    version: u64,
    entries: BTreeMap<String, MemoryEntry>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild memory from its persisted form.
    pub fn restore(snapshot: MemorySnapshot) -> Self {
        Self {
            version: snapshot.version,
            entries: snapshot.entries,
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            version: self.version,
            entries: self.entries.clone(),
        }
    }

    /// Current version. Increments on every write.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn read(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MemoryEntry> {
        self.entries.get(key)
    }

    /// Copy of every key and value.
    pub fn read_all(&self) -> BTreeMap<String, serde_json::Value> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), &e.value))
    }

    /// Whether `key` holds a non-null value.
    pub fn is_present(&self, key: &str) -> bool {
        self.read(key).is_some_and(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unconditionally write `key`. `phase` is the node that produced the
    /// value, or `None` for session input. Returns the new version.
    pub fn write(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
        phase: Option<&str>,
    ) -> u64 {
        self.version += 1;
        let key = key.into();
        debug!(key = %key, version = self.version, "Memory write");
        self.entries.insert(
            key,
            MemoryEntry {
                value,
                version: self.version,
                written_by: phase.map(str::to_string),
            },
        );
        self.version
    }

    /// Seed memory with session input.
    pub fn seed(&mut self, input: impl IntoIterator<Item = (String, serde_json::Value)>) {
        for (key, value) in input {
            self.write(key, value, None);
        }
    }

    /// Write an output on behalf of `node`, checking it against the node's
    /// declared `output_keys`.
    pub fn write_checked(
        &mut self,
        node: &NodeSpec,
        key: &str,
        value: serde_json::Value,
        policy: OutputPolicy,
    ) -> Result<u64> {
        if key.trim().is_empty() {
            return Err(WaypointError::OutputContract {
                node: node.id.clone(),
                message: "output key must not be empty".into(),
            });
        }
        if !node.declares_output(key) {
            match policy {
                OutputPolicy::Strict => {
                    return Err(WaypointError::OutputContract {
                        node: node.id.clone(),
                        message: format!(
                            "'{}' is not a declared output (expected one of: {})",
                            key,
                            node.output_keys.join(", ")
                        ),
                    });
                }
                OutputPolicy::Warn => {
                    warn!(node_id = %node.id, key, "Accepting undeclared output key");
                }
            }
        }
        Ok(self.write(key, value, Some(&node.id)))
    }
}
