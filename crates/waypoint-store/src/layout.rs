use std::path::{Path, PathBuf};

use waypoint_core::error::Result;
use waypoint_core::types::SessionId;

/// On-disk locations belonging to one session.
///
/// ```text
/// {sessions_dir}/{session_id}/
///     conversations/   conversation store
///     data/            spillover files written by data tools
///     adapt.md         optional agent working memory
/// ```
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(sessions_dir: &Path, session_id: &SessionId) -> Self {
        Self {
            root: sessions_dir.join(session_id.as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.root.join("conversations")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn adapt_file(&self) -> PathBuf {
        self.root.join("adapt.md")
    }

    pub fn exists(&self) -> bool {
        self.conversations_dir().is_dir()
    }

    /// Contents of `adapt.md`, if the agent has written one.
    pub async fn read_adapt(&self) -> Option<String> {
        tokio::fs::read_to_string(self.adapt_file())
            .await
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    /// Remove everything under the session root. A missing root is success.
    pub fn remove_all(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Ids of all sessions under `sessions_dir` that have a conversation store,
/// sorted.
pub fn list_session_ids(sessions_dir: &Path) -> Result<Vec<SessionId>> {
    let entries = match std::fs::read_dir(sessions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.path().join("conversations").is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            ids.push(SessionId::from_str(name));
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = SessionLayout::new(Path::new("/tmp/sessions"), &SessionId::from_str("abc"));
        assert_eq!(layout.root(), Path::new("/tmp/sessions/abc"));
        assert_eq!(
            layout.conversations_dir(),
            PathBuf::from("/tmp/sessions/abc/conversations")
        );
        assert_eq!(layout.data_dir(), PathBuf::from("/tmp/sessions/abc/data"));
        assert_eq!(layout.adapt_file(), PathBuf::from("/tmp/sessions/abc/adapt.md"));
    }

    #[test]
    fn test_list_sessions_ignores_other_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/conversations")).unwrap();
        std::fs::create_dir_all(dir.path().join("a/conversations")).unwrap();
        std::fs::create_dir_all(dir.path().join("scratch")).unwrap();
        std::fs::write(dir.path().join("README"), "x").unwrap();

        let ids = list_session_ids(dir.path()).unwrap();
        assert_eq!(ids, vec![SessionId::from_str("a"), SessionId::from_str("b")]);

        assert!(list_session_ids(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adapt_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path(), &SessionId::from_str("s"));
        assert!(layout.read_adapt().await.is_none());

        std::fs::create_dir_all(layout.conversations_dir()).unwrap();
        std::fs::write(layout.adapt_file(), "prefers short answers").unwrap();
        assert!(layout.exists());
        assert_eq!(layout.read_adapt().await.as_deref(), Some("prefers short answers"));

        layout.remove_all().unwrap();
        assert!(!layout.root().exists());
        layout.remove_all().unwrap();
    }
}
