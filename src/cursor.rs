//! Persistent scan watermark.
//!
//! A single integer — the highest message row fully processed — stored as
//! plain text. The write goes through a temp file in the same directory
//! followed by a rename, so a crash leaves either the old value or the new
//! value, never a truncated file.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::message_store::MessageStore;

pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Last persisted row id, or None when uninitialized.
    pub fn load(&self) -> Option<i64> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match contents.trim().parse::<i64>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Cursor file {:?} is corrupt ({}), ignoring", self.path, e);
                None
            }
        }
    }

    /// Atomically persist `row_id`.
    pub fn save(&self, row_id: i64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{}\n", row_id))
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move cursor into place at {:?}", self.path))?;
        Ok(())
    }

    /// First-run initialization: commit the store's current maximum row id
    /// without processing history, so monitoring starts "from now".
    pub fn baseline(&self, store: &MessageStore) -> Result<i64> {
        let max = store.max_row_id()?;
        self.save(max)?;
        tracing::info!("Cursor baselined at row {}", max);
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state/cursor");
        (dir, path)
    }

    #[test]
    fn absent_file_loads_none() {
        let (_dir, path) = scratch();
        let store = CursorStore::new(path);
        assert_eq!(store.load(), None);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (_dir, path) = scratch();
        let store = CursorStore::new(path);
        store.save(12345).unwrap();
        assert_eq!(store.load(), Some(12345));

        store.save(12346).unwrap();
        assert_eq!(store.load(), Some(12346));
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let (_dir, path) = scratch();
        let store = CursorStore::new(path.clone());
        store.save(7).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_loads_none() {
        let (_dir, path) = scratch();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a number").unwrap();
        let store = CursorStore::new(path);
        assert_eq!(store.load(), None);
    }
}
