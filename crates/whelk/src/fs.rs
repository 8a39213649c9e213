//! Virtual filesystem adapter over the narrow backend contract.
//!
//! The backend only knows how to list, download, upload, and write. This
//! adapter recovers hierarchical-filesystem semantics on top: existence
//! checks, the file/directory distinction, stat metadata, and directory
//! iteration. Listings enumerate the children of a directory — never "does
//! this single path exist" — so single-path questions go through a two-tier
//! fallback: look the path up in its parent's listing first, then attempt a
//! content download for backends that cannot enumerate everything (e.g. a
//! flat key-value store).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{Backend, DownloadResult};

/// Errors from virtual filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path could not be read through the backend.
    #[error("file not found: {0}")]
    NotFound(String),
    /// The backend contract has no primitive for this operation.
    #[error("{0} is not supported")]
    NotSupported(&'static str),
    /// Text read hit content that is not valid UTF-8. Fails loudly rather
    /// than silently replacing bytes.
    #[error("invalid UTF-8 in {path}")]
    InvalidUtf8 {
        /// The offending path.
        path: String,
        /// The decode failure.
        #[source]
        source: std::string::FromUtf8Error,
    },
    /// Error reported by the backend.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Kind of a virtual filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory (possibly synthesized from child paths).
    Directory,
}

/// Synthesized stat metadata.
///
/// The backend does not track modification times, so `mtime` is always the
/// epoch. Mode bits are fixed per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualStat {
    /// File or directory.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// POSIX mode bits.
    pub mode: u32,
    /// Always 0; the backend has no timestamp concept.
    pub mtime: i64,
}

impl VirtualStat {
    /// Stat for a directory.
    pub fn dir() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mode: 0o755,
            mtime: 0,
        }
    }

    /// Stat for a file of the given size.
    pub fn file(size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mode: 0o644,
            mtime: 0,
        }
    }

    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Whether this entry is a file.
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Hierarchical filesystem view over a borrowed backend.
///
/// Cheap to clone; one instance is bound to each execution session. All paths
/// are absolute and POSIX-style with root `/`. No operation retries: a single
/// backend failure surfaces immediately.
#[derive(Clone)]
pub struct VirtualFs {
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for VirtualFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFs").finish_non_exhaustive()
    }
}

/// Parent of an absolute path; the root is its own parent.
fn parent_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

impl VirtualFs {
    /// Bind an adapter to a backend for the duration of a session.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    fn download_one(&self, path: &str) -> DownloadResult {
        self.backend
            .download(std::slice::from_ref(&path.to_string()))
            .into_iter()
            .next()
            .unwrap_or_else(|| DownloadResult {
                path: path.to_string(),
                content: None,
                error: Some("backend returned no response".to_string()),
            })
    }

    fn lookup_in_parent(&self, path: &str) -> Option<bool> {
        self.backend
            .list(&parent_of(path))
            .into_iter()
            .find(|entry| entry.path == path)
            .map(|entry| entry.is_dir)
    }

    /// Whether `path` exists. The root always does. A non-empty listing of
    /// the path itself means a non-empty directory; otherwise the parent
    /// listing is consulted, which is how files are detected.
    pub fn exists(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        if !self.backend.list(path).is_empty() {
            return true;
        }
        let parent = parent_of(path);
        if parent == path {
            return false;
        }
        self.backend
            .list(&parent)
            .iter()
            .any(|entry| entry.path == path)
    }

    /// Whether `path` is a file. Falls back to a content download when the
    /// parent listing does not enumerate it.
    pub fn is_file(&self, path: &str) -> bool {
        if path == "/" {
            return false;
        }
        if let Some(is_dir) = self.lookup_in_parent(path) {
            return !is_dir;
        }
        let res = self.download_one(path);
        res.error.is_none() && res.content.is_some()
    }

    /// Whether `path` is a directory. Falls back to listing the path itself
    /// when the parent listing does not enumerate it.
    pub fn is_dir(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        if let Some(is_dir) = self.lookup_in_parent(path) {
            return is_dir;
        }
        !self.backend.list(path).is_empty()
    }

    /// Always false: the backend abstraction has no symlink concept.
    pub fn is_symlink(&self, _path: &str) -> bool {
        false
    }

    /// Read file content as bytes.
    pub fn read_bytes(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let res = self.download_one(path);
        if res.error.is_some() {
            return Err(FsError::NotFound(path.to_string()));
        }
        res.content.ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Read file content as UTF-8 text.
    pub fn read_text(&self, path: &str) -> Result<String, FsError> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes).map_err(|source| FsError::InvalidUtf8 {
            path: path.to_string(),
            source,
        })
    }

    /// Write text through the backend's single-path write primitive.
    pub fn write_text(&self, path: &str, data: &str) -> Result<(), FsError> {
        match self.backend.write(path, data).error {
            Some(err) => Err(FsError::Backend(err)),
            None => Ok(()),
        }
    }

    /// Write bytes through the backend's batch upload, as a one-entry batch.
    pub fn write_bytes(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let outcomes = self
            .backend
            .upload(&[(path.to_string(), data.to_vec())]);
        match outcomes.into_iter().next().and_then(|o| o.error) {
            Some(err) => Err(FsError::Backend(err)),
            None => Ok(()),
        }
    }

    /// Create a directory.
    ///
    /// Directories are implicit from file paths; the backend has no mkdir
    /// primitive. With `exist_ok` this is a no-op, without it the adapter
    /// cannot guarantee mkdir-or-fail semantics and reports "not supported".
    pub fn make_dir(&self, _path: &str, _parents: bool, exist_ok: bool) -> Result<(), FsError> {
        if exist_ok {
            Ok(())
        } else {
            Err(FsError::NotSupported("mkdir with exist_ok=false"))
        }
    }

    /// Always fails: the backend contract has no delete primitive.
    pub fn remove_file(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported("remove_file"))
    }

    /// Always fails: the backend contract has no delete primitive.
    pub fn remove_dir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported("remove_dir"))
    }

    /// Always fails: the backend contract has no rename primitive.
    pub fn rename(&self, _path: &str, _target: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported("rename"))
    }

    /// Child paths of a directory: the backend's authoritative listing.
    pub fn iter_dir(&self, path: &str) -> Vec<String> {
        self.backend
            .list(path)
            .into_iter()
            .map(|entry| entry.path)
            .collect()
    }

    /// Stat metadata for `path`, synthesized from the parent listing with a
    /// download fallback for unenumerated files.
    pub fn stat(&self, path: &str) -> Result<VirtualStat, FsError> {
        if path == "/" {
            return Ok(VirtualStat::dir());
        }
        for entry in self.backend.list(&parent_of(path)) {
            if entry.path == path {
                return Ok(if entry.is_dir {
                    VirtualStat::dir()
                } else {
                    VirtualStat::file(entry.size.unwrap_or(0))
                });
            }
        }
        let res = self.download_one(path);
        match res.content {
            Some(content) if res.error.is_none() => Ok(VirtualStat::file(content.len() as u64)),
            _ => Err(FsError::NotFound(path.to_string())),
        }
    }

    /// Identity: paths in this virtual space are already canonical.
    pub fn resolve(&self, path: &str) -> String {
        path.to_string()
    }

    /// Identity if rooted at `/`, otherwise prefixed with `/`.
    pub fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        }
    }

    /// Always absent: the sandbox has no process environment.
    pub fn getenv(&self, _key: &str) -> Option<String> {
        None
    }

    /// Always empty: the sandbox has no process environment.
    pub fn environ(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}
