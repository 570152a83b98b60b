//! Out-of-process bulk-replace bridge.
//!
//! Collection stores such as ChromaDB are read and written by an external
//! helper. The helper is invoked as:
//!
//! ```text
//! <command…> export <store_dir> <payload_file>
//! <command…> import <store_dir> <payload_file>
//! ```
//!
//! `export` writes `{"success": true, "memories": [...]}` to the payload
//! file. `import` reads the same envelope from the payload file, replaces
//! the whole collection and prints `{"success": true}` on stdout. Failures
//! are reported with `"success": false` and an `"error"` string, or a
//! non-zero exit status.
//!
//! Every call runs under a wall-clock timeout. On expiry the child is
//! killed and the call fails with [`StoreError::Timeout`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Record;
use crate::store::collection::CollectionBridge;
use crate::store::{metadata_from_json, timestamp_from_secs, timestamp_to_secs};

/// One record as exchanged with collection helpers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl WireRecord {
    /// `None` when the entry lacks an id or content.
    pub fn into_record(self) -> Option<Record> {
        let id = self.id.filter(|id| !id.is_empty())?;
        let content = self.content?;
        let mut metadata = self.metadata.map(metadata_from_json).unwrap_or_default();
        if let Some(tags) = self.tags.filter(|t| !t.is_empty()) {
            metadata.insert("tags".to_string(), tags.join(", "));
        }
        let content_hash = self
            .content_hash
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| id.clone());
        Some(Record {
            embedding: self.embedding.unwrap_or_default(),
            timestamp: timestamp_from_secs(self.timestamp.unwrap_or(0.0)),
            id,
            content,
            metadata,
            content_hash,
        })
    }
}

impl From<&Record> for WireRecord {
    fn from(record: &Record) -> Self {
        Self {
            id: Some(record.id.clone()),
            content: Some(record.content.clone()),
            embedding: Some(record.embedding.clone()),
            metadata: Some(Value::Object(
                record
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )),
            timestamp: Some(timestamp_to_secs(&record.timestamp)),
            content_hash: Some(record.content_hash.clone()),
            tags: None,
        }
    }
}

/// Decode wire entries, dropping the ones that are not usable records.
pub fn decode_records(entries: Vec<Value>) -> Vec<Record> {
    let total = entries.len();
    let records: Vec<Record> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<WireRecord>(entry).ok())
        .filter_map(WireRecord::into_record)
        .collect();
    if records.len() < total {
        debug!(dropped = total - records.len(), "skipped incomplete wire records");
    }
    records
}

pub fn encode_records(records: &[Record]) -> Vec<WireRecord> {
    records.iter().map(WireRecord::from).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    memories: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// [`CollectionBridge`] that shells out to a helper program.
pub struct ProcessBridge {
    command: Vec<String>,
    timeout: Duration,
}

impl ProcessBridge {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    fn payload_path(action: &str) -> PathBuf {
        std::env::temp_dir().join(format!("memdefrag-{}-{}.json", action, Uuid::new_v4()))
    }

    /// Run one helper call and return its stdout.
    async fn run(&self, action: &str, dir: &Path, payload: &Path) -> Result<String, StoreError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| StoreError::Bridge("bridge command is empty".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .arg(action)
            .arg(dir)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StoreError::Bridge(format!("failed to start '{}': {}", program, e)))?;

        // Dropping the wait future on expiry drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(program = %program, action, timeout_secs = self.timeout.as_secs(), "bridge call timed out");
                return Err(StoreError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StoreError::Bridge(format!(
                "'{} {}' exited with {}: {}",
                program,
                action,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CollectionBridge for ProcessBridge {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn export(&self, dir: &Path) -> Result<Vec<Record>, StoreError> {
        let payload = Self::payload_path("export");
        let result = self.export_via(dir, &payload).await;
        let _ = tokio::fs::remove_file(&payload).await;
        result
    }

    async fn import(&self, dir: &Path, records: &[Record]) -> Result<(), StoreError> {
        let payload = Self::payload_path("import");
        let result = self.import_via(dir, records, &payload).await;
        let _ = tokio::fs::remove_file(&payload).await;
        result
    }
}

impl ProcessBridge {
    async fn export_via(&self, dir: &Path, payload: &Path) -> Result<Vec<Record>, StoreError> {
        self.run("export", dir, payload).await?;
        let bytes = tokio::fs::read(payload).await?;
        let envelope: Envelope<Value> = serde_json::from_slice(&bytes)?;
        if !envelope.success {
            return Err(StoreError::Bridge(
                envelope
                    .error
                    .unwrap_or_else(|| "export reported failure".to_string()),
            ));
        }
        Ok(decode_records(envelope.memories))
    }

    async fn import_via(
        &self,
        dir: &Path,
        records: &[Record],
        payload: &Path,
    ) -> Result<(), StoreError> {
        let envelope = Envelope {
            success: true,
            memories: encode_records(records),
            error: None,
        };
        tokio::fs::write(payload, serde_json::to_vec(&envelope)?).await?;

        let stdout = self.run("import", dir, payload).await?;
        let reply = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| StoreError::Bridge("import printed no reply".to_string()))?;
        let reply: Envelope<Value> = serde_json::from_str(reply.trim())
            .map_err(|e| StoreError::Bridge(format!("unreadable import reply: {}", e)))?;
        if !reply.success {
            return Err(StoreError::Bridge(
                reply
                    .error
                    .unwrap_or_else(|| "import reported failure".to_string()),
            ));
        }
        Ok(())
    }
}
