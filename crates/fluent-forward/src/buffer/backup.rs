//! File spill for unsent chunks.
//!
//! On close, chunks that could not be delivered are written one-per-file as
//! `<prefix>#<tag>#<chunk id>#<created at millis>.msgpack`, where the chunk
//! id is URL-safe base64 of the 16 raw UUID bytes. On startup the directory
//! is scanned and matching files are re-enqueued for flush, preserving bytes
//! and identity exactly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::buffer::chunk::Chunk;
use crate::protocol;

const BACKUP_EXTENSION: &str = "msgpack";

#[derive(Debug)]
pub(crate) struct FileBackup {
    dir: PathBuf,
    prefix: String,
}

impl FileBackup {
    pub fn new(dir: &Path, prefix: String) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(FileBackup {
            dir: dir.to_owned(),
            prefix,
        })
    }

    pub fn save(&self, chunk: &Chunk) -> io::Result<()> {
        let path = self.dir.join(format!(
            "{}#{}#{}#{}.{}",
            self.prefix,
            chunk.tag(),
            URL_SAFE_NO_PAD.encode(chunk.chunk_id()),
            chunk.created_at_unix_ms(),
            BACKUP_EXTENSION,
        ));
        fs::write(&path, chunk.raw())?;
        debug!(path = %path.display(), bytes = chunk.len(), "saved unsent chunk");
        Ok(())
    }

    /// Loads every chunk this backup previously saved, deleting each file as
    /// it is taken over. Files with foreign prefixes or unparsable names or
    /// contents are left alone or skipped with a warning.
    pub fn load(&self) -> io::Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            let Some(parsed) = self.parse_file_name(&path) else {
                continue;
            };
            let (tag, chunk_id, created_at_unix_ms) = parsed;

            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read backup file");
                    continue;
                }
            };
            let events = match protocol::count_entries(&data) {
                Ok(n) => n,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt backup file, skipping");
                    continue;
                }
            };

            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove backup file");
            }
            debug!(path = %path.display(), %tag, events, "rehydrated chunk from backup");
            chunks.push(Chunk::from_backup(
                tag,
                chunk_id,
                created_at_unix_ms,
                data,
                events,
            ));
        }
        // Oldest first so the flush order roughly matches the original emits.
        chunks.sort_by_key(Chunk::created_at_unix_ms);
        Ok(chunks)
    }

    pub fn clear(&self) -> io::Result<()> {
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if self.parse_file_name(&path).is_some() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn parse_file_name(&self, path: &Path) -> Option<(String, [u8; 16], u64)> {
        if path.extension()?.to_str()? != BACKUP_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let mut parts = stem.split('#');
        if parts.next()? != self.prefix {
            return None;
        }
        let tag = parts.next()?.to_owned();
        let id_part = parts.next()?;
        let millis_part = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let id_bytes = URL_SAFE_NO_PAD.decode(id_part).ok()?;
        let chunk_id: [u8; 16] = id_bytes.try_into().ok()?;
        let created_at_unix_ms = millis_part.parse().ok()?;
        Some((tag, chunk_id, created_at_unix_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Timestamp;
    use serde_json::json;

    fn test_chunk(tag: &str, entries: usize) -> Chunk {
        let mut chunk = Chunk::new(tag, 1024);
        for i in 0..entries {
            let map = rmp_serde::to_vec(&json!({"i": i})).unwrap();
            let mut entry = Vec::new();
            protocol::encode_entry(&mut entry, Timestamp::Unix(i as u64), &map).unwrap();
            chunk.push_entry(&entry);
        }
        chunk
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "fwd_24224".into()).unwrap();

        let chunk = test_chunk("app.access", 5);
        backup.save(&chunk).unwrap();

        let restored = backup.load().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].tag(), "app.access");
        assert_eq!(restored[0].chunk_id(), chunk.chunk_id());
        assert_eq!(restored[0].raw(), chunk.raw());
        assert_eq!(restored[0].events(), 5);

        // Files are taken over on load.
        assert!(backup.load().unwrap().is_empty());
    }

    #[test]
    fn foreign_prefixes_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ours = FileBackup::new(dir.path(), "mine".into()).unwrap();
        let theirs = FileBackup::new(dir.path(), "theirs".into()).unwrap();

        theirs.save(&test_chunk("t", 1)).unwrap();
        assert!(ours.load().unwrap().is_empty());
        assert_eq!(theirs.load().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "p".into()).unwrap();

        let name = format!(
            "p#tag#{}#123.msgpack",
            URL_SAFE_NO_PAD.encode([9u8; 16])
        );
        fs::write(dir.path().join(name), b"\xff\xff not msgpack").unwrap();
        assert!(backup.load().unwrap().is_empty());
    }

    #[test]
    fn clear_removes_only_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "p".into()).unwrap();
        backup.save(&test_chunk("t", 1)).unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"keep me").unwrap();

        backup.clear().unwrap();
        assert!(backup.load().unwrap().is_empty());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
