use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::session::{ConversationPart, SessionCursor, SessionMeta};
use waypoint_core::traits::ConversationStore;

use crate::blocking;

/// Database file name inside a session's conversation directory.
pub const DB_FILE: &str = "conversation.db";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS parts (
        seq INTEGER PRIMARY KEY,
        phase_id TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS documents (
        name TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );";

fn db_err(e: rusqlite::Error) -> WaypointError {
    WaypointError::Storage(e.to_string())
}

type SharedConn = Arc<Mutex<Option<Connection>>>;

/// Conversation store keeping one SQLite database per session.
///
/// Every statement runs on the blocking pool; the connection is shared with
/// those tasks behind a mutex and is `None` once closed.
pub struct SqliteConversationStore {
    path: PathBuf,
    conn: SharedConn,
}

impl SqliteConversationStore {
    /// Open or create the database inside `dir`.
    ///
    /// Blocking; async callers go through [`SqliteConversationStore::open_async`].
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            WaypointError::Storage(format!("Failed to create conversation directory: {}", e))
        })?;

        let path = dir.join(DB_FILE);
        let conn = Connection::open(&path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite conversation store opened");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub async fn open_async(dir: &Path) -> Result<Self> {
        let dir = dir.to_path_buf();
        blocking(move || Self::open(&dir)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        blocking(move || with_conn(&conn, f)).await
    }

    async fn put_document<T: Serialize>(&self, name: &'static str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO documents (name, body) VALUES (?1, ?2)",
                params![name, body],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_document<T: DeserializeOwned>(&self, name: &'static str) -> Result<Option<T>> {
        let body: Option<String> = self
            .run(move |conn| {
                conn.query_row(
                    "SELECT body FROM documents WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)
            })
            .await?;
        match body {
            Some(body) => match serde_json::from_str(&body) {
                Ok(doc) => Ok(Some(doc)),
                Err(e) => {
                    warn!(document = name, error = %e, "Ignoring undecodable document");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

fn with_conn<T>(conn: &SharedConn, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let guard = conn
        .lock()
        .map_err(|e| WaypointError::Storage(e.to_string()))?;
    let conn = guard
        .as_ref()
        .ok_or_else(|| WaypointError::Storage("conversation store is closed".into()))?;
    f(conn)
}

fn take_conn(conn: &SharedConn) -> Result<Option<Connection>> {
    Ok(conn
        .lock()
        .map_err(|e| WaypointError::Storage(e.to_string()))?
        .take())
}

fn to_sql_seq(seq: u64) -> Result<i64> {
    i64::try_from(seq).map_err(|_| WaypointError::Storage(format!("sequence {} out of range", seq)))
}

impl ConversationStore for SqliteConversationStore {
    fn write_part(&self, seq: u64, part: ConversationPart) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let seq = to_sql_seq(seq)?;
            let body = serde_json::to_string(&part)?;
            self.run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO parts (seq, phase_id, body) VALUES (?1, ?2, ?3)",
                    params![seq, part.phase_id, body],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
        })
    }

    fn read_parts(&self) -> BoxFuture<'_, Result<Vec<ConversationPart>>> {
        Box::pin(async move {
            let rows: Vec<(i64, String)> = self
                .run(|conn| {
                    let mut stmt = conn
                        .prepare("SELECT seq, body FROM parts ORDER BY seq ASC")
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                        .map_err(db_err)?;
                    rows.collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(db_err)
                })
                .await?;

            let mut parts = Vec::with_capacity(rows.len());
            for (seq, body) in rows {
                match serde_json::from_str::<ConversationPart>(&body) {
                    Ok(part) => parts.push(part),
                    Err(e) => warn!(seq, error = %e, "Skipping corrupt conversation part"),
                }
            }
            Ok(parts)
        })
    }

    fn write_meta(&self, meta: SessionMeta) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.put_document("meta", &meta).await })
    }

    fn read_meta(&self) -> BoxFuture<'_, Result<Option<SessionMeta>>> {
        Box::pin(async move { self.get_document("meta").await })
    }

    fn write_cursor(&self, cursor: SessionCursor) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.put_document("cursor", &cursor).await })
    }

    fn read_cursor(&self) -> BoxFuture<'_, Result<Option<SessionCursor>>> {
        Box::pin(async move { self.get_document("cursor").await })
    }

    fn delete_parts_before(&self, seq: u64) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let seq = to_sql_seq(seq)?;
            let removed = self
                .run(move |conn| {
                    conn.execute("DELETE FROM parts WHERE seq < ?1", params![seq])
                        .map_err(db_err)
                })
                .await?;
            debug!(before = seq, removed, "Pruned conversation parts");
            Ok(removed)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        let conn = self.conn.clone();
        Box::pin(async move {
            blocking(move || {
                if let Some(conn) = take_conn(&conn)? {
                    conn.close().map_err(|(_, e)| db_err(e))?;
                }
                Ok(())
            })
            .await
        })
    }

    fn destroy(&self) -> BoxFuture<'_, Result<()>> {
        let conn = self.conn.clone();
        let db = self.path.clone();
        Box::pin(async move {
            blocking(move || {
                // Drop the connection before unlinking its files.
                drop(take_conn(&conn)?);

                let mut names = vec![db.clone()];
                for suffix in ["-wal", "-shm"] {
                    let mut name = db.clone().into_os_string();
                    name.push(suffix);
                    names.push(PathBuf::from(name));
                }
                for path in names {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::session::PartKind;

    fn part(seq: u64) -> ConversationPart {
        ConversationPart::new(
            seq,
            "research",
            PartKind::AssistantText {
                text: format!("turn {}", seq),
            },
        )
    }

    #[tokio::test]
    async fn test_parts_and_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConversationStore::open(dir.path()).unwrap();

        for seq in [1, 0, 2] {
            store.write_part(seq, part(seq)).await.unwrap();
        }
        let seqs: Vec<u64> = store
            .read_parts()
            .await
            .unwrap()
            .iter()
            .map(|p| p.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        assert!(store.read_cursor().await.unwrap().is_none());
        let mut cursor = SessionCursor::new("research");
        cursor.next_seq = 3;
        store.write_cursor(cursor.clone()).await.unwrap();
        cursor.next_seq = 4;
        store.write_cursor(cursor.clone()).await.unwrap();
        assert_eq!(store.read_cursor().await.unwrap(), Some(cursor));
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteConversationStore::open(dir.path()).unwrap();
            store.write_part(0, part(0)).await.unwrap();
            store.close().await.unwrap();
            assert!(store.read_parts().await.is_err());
        }
        let store = SqliteConversationStore::open(dir.path()).unwrap();
        assert_eq!(store.read_parts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_body_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConversationStore::open(dir.path()).unwrap();
        store.write_part(0, part(0)).await.unwrap();
        store
            .run(|conn| {
                conn.execute(
                    "INSERT INTO parts (seq, phase_id, body) VALUES (1, 'research', 'garbage')",
                    [],
                )
                .map_err(db_err)
            })
            .await
            .unwrap();
        store.write_part(2, part(2)).await.unwrap();

        let seqs: Vec<u64> = store
            .read_parts()
            .await
            .unwrap()
            .iter()
            .map(|p| p.seq)
            .collect();
        assert_eq!(seqs, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_undecodable_document_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConversationStore::open_async(dir.path()).await.unwrap();
        store
            .run(|conn| {
                conn.execute(
                    "INSERT INTO documents (name, body) VALUES ('cursor', '{broken')",
                    [],
                )
                .map_err(db_err)
            })
            .await
            .unwrap();
        assert!(store.read_cursor().await.unwrap().is_none());
    }

    // Statements run on the blocking pool, so a single-threaded runtime keeps
    // serving other tasks while the store works.
    #[tokio::test(flavor = "current_thread")]
    async fn test_store_runs_off_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteConversationStore::open_async(dir.path()).await.unwrap());

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for seq in 0..20 {
                    store.write_part(seq, part(seq)).await.unwrap();
                }
            })
        };
        let ticker = tokio::spawn(async {
            tokio::task::yield_now().await;
            true
        });
        assert!(ticker.await.unwrap());
        writer.await.unwrap();
        assert_eq!(store.read_parts().await.unwrap().len(), 20);

        store.close().await.unwrap();
        assert!(store.write_part(20, part(20)).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConversationStore::open(dir.path()).unwrap();
        for seq in 0..4 {
            store.write_part(seq, part(seq)).await.unwrap();
        }
        assert_eq!(store.delete_parts_before(2).await.unwrap(), 2);
        assert_eq!(store.read_parts().await.unwrap()[0].seq, 2);

        store.destroy().await.unwrap();
        assert!(!dir.path().join(DB_FILE).exists());
        store.destroy().await.unwrap();
    }
}
