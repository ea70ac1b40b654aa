use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use waypoint_core::error::Result;
use waypoint_core::session::{ConversationPart, SessionCursor, SessionMeta};
use waypoint_core::traits::ConversationStore;

use crate::blocking;

const META_FILE: &str = "meta.json";
const CURSOR_FILE: &str = "cursor.json";
const PARTS_DIR: &str = "parts";

/// Conversation store backed by one JSON document per part.
///
/// Layout under `root`:
/// ```text
/// meta.json
/// cursor.json
/// parts/0000000000.json
/// parts/0000000001.json
/// ```
pub struct FileConversationStore {
    root: PathBuf,
}

impl FileConversationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn parts_dir(&self) -> PathBuf {
        self.root.join(PARTS_DIR)
    }

    fn part_path(&self, seq: u64) -> PathBuf {
        self.parts_dir().join(format!("{:010}.json", seq))
    }
}

/// Write a document to a sibling temp file, then rename it into place.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a document. Missing and undecodable documents both read as `None`.
fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring undecodable document");
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List `(seq, path)` for every well-named part file, ascending.
fn list_part_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let seq = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".json"))
            .and_then(|stem| stem.parse::<u64>().ok());
        match seq {
            Some(seq) => files.push((seq, path)),
            None => debug!(path = %path.display(), "Skipping stray file in parts directory"),
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

impl ConversationStore for FileConversationStore {
    fn write_part(&self, seq: u64, part: ConversationPart) -> BoxFuture<'_, Result<()>> {
        let path = self.part_path(seq);
        Box::pin(async move { blocking(move || write_json_atomic(&path, &part)).await })
    }

    fn read_parts(&self) -> BoxFuture<'_, Result<Vec<ConversationPart>>> {
        let dir = self.parts_dir();
        Box::pin(async move {
            blocking(move || {
                let mut parts = Vec::new();
                for (seq, path) in list_part_files(&dir)? {
                    let bytes = match std::fs::read(&path) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(seq, error = %e, "Skipping unreadable conversation part");
                            continue;
                        }
                    };
                    match serde_json::from_slice::<ConversationPart>(&bytes) {
                        Ok(part) => parts.push(part),
                        Err(e) => warn!(seq, error = %e, "Skipping corrupt conversation part"),
                    }
                }
                Ok(parts)
            })
            .await
        })
    }

    fn write_meta(&self, meta: SessionMeta) -> BoxFuture<'_, Result<()>> {
        let path = self.root.join(META_FILE);
        Box::pin(async move { blocking(move || write_json_atomic(&path, &meta)).await })
    }

    fn read_meta(&self) -> BoxFuture<'_, Result<Option<SessionMeta>>> {
        let path = self.root.join(META_FILE);
        Box::pin(async move { blocking(move || read_json_opt(&path)).await })
    }

    fn write_cursor(&self, cursor: SessionCursor) -> BoxFuture<'_, Result<()>> {
        let path = self.root.join(CURSOR_FILE);
        Box::pin(async move { blocking(move || write_json_atomic(&path, &cursor)).await })
    }

    fn read_cursor(&self) -> BoxFuture<'_, Result<Option<SessionCursor>>> {
        let path = self.root.join(CURSOR_FILE);
        Box::pin(async move { blocking(move || read_json_opt(&path)).await })
    }

    fn delete_parts_before(&self, seq: u64) -> BoxFuture<'_, Result<usize>> {
        let dir = self.parts_dir();
        Box::pin(async move {
            blocking(move || {
                let mut removed = 0;
                for (part_seq, path) in list_part_files(&dir)? {
                    if part_seq >= seq {
                        break;
                    }
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
                debug!(before = seq, removed, "Pruned conversation parts");
                Ok(removed)
            })
            .await
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn destroy(&self) -> BoxFuture<'_, Result<()>> {
        let root = self.root.clone();
        Box::pin(async move {
            blocking(move || match std::fs::remove_dir_all(&root) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::session::{NodeSnapshot, PartKind};
    use waypoint_core::types::SessionId;

    fn text_part(seq: u64, text: &str) -> ConversationPart {
        ConversationPart::new(
            seq,
            "intake",
            PartKind::UserText {
                text: text.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_parts_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(dir.path().join("conversations"));

        for seq in [2, 0, 1] {
            store
                .write_part(seq, text_part(seq, &format!("part {}", seq)))
                .await
                .unwrap();
        }

        let parts = store.read_parts().await.unwrap();
        let seqs: Vec<u64> = parts.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(dir
            .path()
            .join("conversations/parts/0000000001.json")
            .exists());
    }

    #[tokio::test]
    async fn test_corrupt_and_stray_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(dir.path());
        store.write_part(0, text_part(0, "ok")).await.unwrap();
        store.write_part(2, text_part(2, "ok too")).await.unwrap();

        std::fs::write(dir.path().join("parts/0000000001.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("parts/0000000003.json.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("parts/notes.txt"), b"hello").unwrap();

        let parts = store.read_parts().await.unwrap();
        let seqs: Vec<u64> = parts.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_missing_documents_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(dir.path().join("never-written"));
        assert!(store.read_meta().await.unwrap().is_none());
        assert!(store.read_cursor().await.unwrap().is_none());
        assert!(store.read_parts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_documents_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(dir.path());
        std::fs::write(dir.path().join(META_FILE), b"{\"session_id\":").unwrap();
        std::fs::write(dir.path().join(CURSOR_FILE), b"[]").unwrap();

        assert!(store.read_meta().await.unwrap().is_none());
        assert!(store.read_cursor().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_meta_and_cursor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(dir.path());
        let now = chrono::Utc::now();
        let meta = SessionMeta {
            session_id: SessionId::from_str("s-1"),
            graph_id: "research".into(),
            entry_point: "default".into(),
            node: NodeSnapshot {
                id: "intake".into(),
                name: "Intake".into(),
                max_node_visits: 1,
                ..Default::default()
            },
            system_prompt: "You are helpful.".into(),
            created_at: now,
            updated_at: now,
        };
        store.write_meta(meta.clone()).await.unwrap();
        assert_eq!(store.read_meta().await.unwrap(), Some(meta));

        let mut cursor = SessionCursor::new("intake");
        cursor.iteration = 4;
        cursor.execution_path.push("intake".into());
        store.write_cursor(cursor.clone()).await.unwrap();
        assert_eq!(store.read_cursor().await.unwrap(), Some(cursor));
        assert!(!dir.path().join("cursor.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_parts_before() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(dir.path());
        for seq in 0..5 {
            store.write_part(seq, text_part(seq, "x")).await.unwrap();
        }

        assert_eq!(store.delete_parts_before(3).await.unwrap(), 3);
        let seqs: Vec<u64> = store
            .read_parts()
            .await
            .unwrap()
            .iter()
            .map(|p| p.seq)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(store.delete_parts_before(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("conversations");
        let store = FileConversationStore::new(&root);
        store.write_part(0, text_part(0, "x")).await.unwrap();

        store.destroy().await.unwrap();
        assert!(!root.exists());
        store.destroy().await.unwrap();
    }
}
