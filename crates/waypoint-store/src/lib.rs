pub mod file;
pub mod layout;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use waypoint_core::config::StorageBackend;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::ConversationStore;

pub use file::FileConversationStore;
pub use layout::{list_session_ids, SessionLayout};
pub use sqlite::SqliteConversationStore;

/// Open the configured conversation store rooted at `dir`.
pub async fn open_store(
    backend: StorageBackend,
    dir: &Path,
) -> Result<Arc<dyn ConversationStore>> {
    match backend {
        StorageBackend::File => Ok(Arc::new(FileConversationStore::new(dir))),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteConversationStore::open_async(dir).await?)),
    }
}

/// Run blocking storage work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WaypointError::Storage(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::session::{ConversationPart, PartKind};

    #[tokio::test]
    async fn test_backends_share_semantics() {
        for backend in [StorageBackend::File, StorageBackend::Sqlite] {
            let dir = tempfile::tempdir().unwrap();
            let store = open_store(backend, dir.path()).await.unwrap();
            let part = ConversationPart::new(
                0,
                "intake",
                PartKind::UserText {
                    text: "hello".into(),
                },
            );
            store.write_part(0, part.clone()).await.unwrap();
            assert_eq!(store.read_parts().await.unwrap(), vec![part]);
            assert!(store.read_meta().await.unwrap().is_none());
            store.close().await.unwrap();
        }
    }
}
