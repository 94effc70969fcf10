//! # Segment Store
//!
//! Durable storage for flushed audio segments. Each segment is one immutable
//! `.webm` file named `{session_id}_{role}_{YYYYMMDD_HHMMSS}.webm`; segments
//! are never rewritten after creation and are only removed by an explicit
//! per-session purge.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Metadata for one stored segment, as reported by the listing endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SegmentInfo {
    pub filename: String,
    pub size: u64,
    /// Modification time as unix seconds.
    pub modified: u64,
}

/// Filesystem-backed store rooted at one directory.
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    /// Open the store, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build a store around a path without creating it. Tests use this to
    /// simulate storage write failures.
    #[cfg(test)]
    pub(crate) fn unchecked(root: PathBuf) -> Self {
        Self { root }
    }

    /// Write one segment. Returns the filename actually used.
    ///
    /// Timestamps have one-second resolution, so a timed flush and a final
    /// flush landing in the same second would collide; a numeric suffix is
    /// appended instead of overwriting an immutable segment.
    pub fn write_segment(&self, filename: &str, data: &[u8]) -> io::Result<String> {
        let mut name = filename.to_string();
        let mut attempt = 1u32;
        while self.root.join(&name).exists() {
            name = match filename.strip_suffix(".webm") {
                Some(stem) => format!("{}-{}.webm", stem, attempt),
                None => format!("{}-{}", filename, attempt),
            };
            attempt += 1;
        }

        fs::write(self.root.join(&name), data)?;
        debug!(filename = %name, bytes = data.len(), "Segment written");
        Ok(name)
    }

    /// List segments belonging to a session, oldest first.
    ///
    /// Matches on the `{session_id}_` filename prefix; session ids are full
    /// UUIDs, so one session's id is never a prefix of another's files.
    pub fn list_session(&self, session_id: &str) -> io::Result<Vec<SegmentInfo>> {
        let prefix = format!("{}_", session_id);
        let mut segments = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !filename.starts_with(&prefix) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            segments.push(SegmentInfo {
                filename,
                size: meta.len(),
                modified,
            });
        }

        segments.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(segments)
    }

    /// Read one segment's bytes by filename.
    ///
    /// Rejects anything that is not a bare filename so the HTTP download
    /// handler cannot be steered outside the storage root.
    pub fn read_segment(&self, filename: &str) -> io::Result<Vec<u8>> {
        if !is_safe_filename(filename) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid segment filename",
            ));
        }
        fs::read(self.root.join(filename))
    }

    /// Delete all of a session's segments. Returns how many were removed.
    pub fn purge_session(&self, session_id: &str) -> io::Result<usize> {
        let mut removed = 0;
        for segment in self.list_session(session_id)? {
            match fs::remove_file(self.root.join(&segment.filename)) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(filename = %segment.filename, error = %e, "Failed to delete segment")
                }
            }
        }
        Ok(removed)
    }

    /// Total number of segments in the store (for health reporting).
    pub fn segment_count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }
}

/// A safe filename has no path separators and no parent-directory steps.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && name != "."
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();

        let name = store.write_segment("s1_client_20250101_000000.webm", b"abc").unwrap();
        assert_eq!(name, "s1_client_20250101_000000.webm");
        assert_eq!(store.read_segment(&name).unwrap(), b"abc");
    }

    #[test]
    fn colliding_names_get_suffixed_not_overwritten() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();

        let first = store.write_segment("s1_client_20250101_000000.webm", b"one").unwrap();
        let second = store.write_segment("s1_client_20250101_000000.webm", b"two").unwrap();

        assert_ne!(first, second);
        assert_eq!(store.read_segment(&first).unwrap(), b"one");
        assert_eq!(store.read_segment(&second).unwrap(), b"two");
    }

    #[test]
    fn listing_is_per_session() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();

        store.write_segment("aaa_client_20250101_000000.webm", b"x").unwrap();
        store.write_segment("aaa_operator_20250101_000010.webm", b"y").unwrap();
        store.write_segment("bbb_client_20250101_000000.webm", b"z").unwrap();

        let files = store.list_session("aaa").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.filename.starts_with("aaa_")));

        assert!(store.list_session("ccc").unwrap().is_empty());
    }

    #[test]
    fn purge_removes_only_that_session() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();

        store.write_segment("aaa_client_20250101_000000.webm", b"x").unwrap();
        store.write_segment("aaa_operator_20250101_000010.webm", b"y").unwrap();
        store.write_segment("bbb_client_20250101_000000.webm", b"z").unwrap();

        assert_eq!(store.purge_session("aaa").unwrap(), 2);
        assert!(store.list_session("aaa").unwrap().is_empty());
        assert_eq!(store.list_session("bbb").unwrap().len(), 1);
    }

    #[test]
    fn unsafe_filenames_are_rejected() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();

        for bad in ["../etc/passwd", "a/b.webm", "a\\b.webm", "..", ""] {
            let err = store.read_segment(bad).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{:?}", bad);
        }
    }
}
