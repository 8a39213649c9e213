//! Storage backend capability interface.
//!
//! A backend is the filesystem of record behind the virtual adapter. The
//! contract is deliberately narrow — listing, content download, batch upload,
//! single-path write — so that wildly different storage systems (local disk,
//! remote object store, pure in-memory state) can implement it trivially.
//! Everything filesystem-shaped is recovered on top by
//! [`VirtualFs`](crate::VirtualFs).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::limits::ResourceLimits;

/// One entry from a backend listing.
///
/// Backends are not required to report `is_dir` or `size`; both fields are
/// absent-safe and consumers must not assume they are authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute, forward-slash separated path.
    pub path: String,
    /// Whether the entry is a directory. Defaults to false when unreported.
    #[serde(default)]
    pub is_dir: bool,
    /// Size in bytes, when the backend tracks it.
    #[serde(default)]
    pub size: Option<u64>,
}

/// Per-path response from a content download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    /// The requested path.
    pub path: String,
    /// File content, or `None` when the path could not be read.
    pub content: Option<Vec<u8>>,
    /// Backend-reported error, if any.
    pub error: Option<String>,
}

/// Per-path response from a batch upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// The uploaded path.
    pub path: String,
    /// Backend-reported error, if any.
    pub error: Option<String>,
}

/// Response from a single-path text write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// The written path.
    pub path: String,
    /// Backend-reported error, if any.
    pub error: Option<String>,
}

/// Result of one script evaluation.
#[derive(Debug, Clone, Default)]
pub struct ReplOutcome {
    /// Captured textual output (final value or printed stream).
    pub output: String,
    /// Error text when construction or evaluation failed.
    pub error: Option<String>,
    /// Opaque interpreter state to thread into the next invocation. Produced
    /// on both success and failure when the engine supports state capture.
    pub state: Option<String>,
}

/// The minimal contract a storage backend must implement.
///
/// All operations are synchronous and block the calling execution thread;
/// retry policy is a backend concern, never the adapter's.
pub trait Backend: Send + Sync {
    /// List the children of `path`. A missing or empty directory yields an
    /// empty listing; the result is the backend's authoritative child set.
    fn list(&self, path: &str) -> Vec<FileEntry>;

    /// Download content for each requested path, one response per path.
    fn download(&self, paths: &[String]) -> Vec<DownloadResult>;

    /// Upload a batch of `(path, bytes)` pairs, one response per pair.
    fn upload(&self, files: &[(String, Vec<u8>)]) -> Vec<UploadOutcome>;

    /// Write text to a single path. The backend decides persistence semantics.
    fn write(&self, path: &str, content: &str) -> WriteOutcome;

    /// The optional interactive-evaluation capability.
    ///
    /// Backends that only implement the filesystem primitives return `None`;
    /// the binding layer short-circuits those with a fixed error instead of
    /// probing attributes at runtime.
    fn as_repl(&self) -> Option<&dyn ReplBackend> {
        None
    }
}

/// Interactive script evaluation, offered by backends that support it.
pub trait ReplBackend: Send + Sync {
    /// Unique identifier for this evaluator instance.
    fn id(&self) -> &str;

    /// Evaluate `code` under `limits`, restoring `prior_state` when given.
    ///
    /// Never panics past this boundary: construction and runtime failures are
    /// reported through [`ReplOutcome::error`].
    fn repl(&self, code: &str, limits: &ResourceLimits, prior_state: Option<&str>) -> ReplOutcome;
}

/// In-memory backend over a flat key space.
///
/// Directories are implicit: they exist exactly where file paths imply them,
/// which makes this a faithful stand-in for object stores in tests and for
/// conversation-scoped scratch state in servers.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, normalizing the path to be rooted at `/`.
    pub fn with_file(self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rooted(path), content.into());
        self
    }

    /// Current content of `path`, if present. Intended for assertions.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&rooted(path))
            .cloned()
    }
}

fn rooted(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

impl Backend for InMemoryBackend {
    fn list(&self, path: &str) -> Vec<FileEntry> {
        let path = rooted(path);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };

        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries = Vec::new();
        let mut seen_dirs = BTreeSet::new();

        for (key, data) in files.iter() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((name, _)) => {
                    if seen_dirs.insert(name.to_string()) {
                        entries.push(FileEntry {
                            path: format!("{prefix}{name}"),
                            is_dir: true,
                            size: None,
                        });
                    }
                }
                None => entries.push(FileEntry {
                    path: key.clone(),
                    is_dir: false,
                    size: Some(data.len() as u64),
                }),
            }
        }
        entries
    }

    fn download(&self, paths: &[String]) -> Vec<DownloadResult> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        paths
            .iter()
            .map(|path| match files.get(&rooted(path)) {
                Some(data) => DownloadResult {
                    path: path.clone(),
                    content: Some(data.clone()),
                    error: None,
                },
                None => DownloadResult {
                    path: path.clone(),
                    content: None,
                    error: Some("file_not_found".to_string()),
                },
            })
            .collect()
    }

    fn upload(&self, files: &[(String, Vec<u8>)]) -> Vec<UploadOutcome> {
        let mut store = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files
            .iter()
            .map(|(path, data)| {
                store.insert(rooted(path), data.clone());
                UploadOutcome {
                    path: path.clone(),
                    error: None,
                }
            })
            .collect()
    }

    fn write(&self, path: &str, content: &str) -> WriteOutcome {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rooted(path), content.as_bytes().to_vec());
        WriteOutcome {
            path: path.to_string(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_root_mixes_files_and_implied_dirs() {
        let backend = InMemoryBackend::new()
            .with_file("/a.txt", b"hi".to_vec())
            .with_file("/docs/readme.md", b"# hello".to_vec())
            .with_file("/docs/notes/today.md", b"x".to_vec());

        let entries = backend.list("/");
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a.txt", "/docs"]);

        assert!(!entries[0].is_dir);
        assert_eq!(entries[0].size, Some(2));
        assert!(entries[1].is_dir);
        assert_eq!(entries[1].size, None);
    }

    #[test]
    fn test_list_nested_directory() {
        let backend = InMemoryBackend::new()
            .with_file("/docs/readme.md", b"# hello".to_vec())
            .with_file("/docs/notes/today.md", b"x".to_vec());

        let entries = backend.list("/docs");
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/docs/notes", "/docs/readme.md"]);
    }

    #[test]
    fn test_list_missing_path_is_empty() {
        let backend = InMemoryBackend::new().with_file("/a.txt", b"hi".to_vec());
        assert!(backend.list("/nope").is_empty());
    }

    #[test]
    fn test_download_reports_missing_files() {
        let backend = InMemoryBackend::new().with_file("/a.txt", b"hi".to_vec());

        let results = backend.download(&["/a.txt".to_string(), "/missing".to_string()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content.as_deref(), Some(b"hi".as_slice()));
        assert!(results[0].error.is_none());
        assert!(results[1].content.is_none());
        assert_eq!(results[1].error.as_deref(), Some("file_not_found"));
    }

    #[test]
    fn test_upload_then_download_round_trip() {
        let backend = InMemoryBackend::new();
        let outcomes = backend.upload(&[("/blob.bin".to_string(), vec![0, 159, 146, 150])]);
        assert!(outcomes[0].error.is_none());

        let results = backend.download(&["/blob.bin".to_string()]);
        assert_eq!(results[0].content.as_deref(), Some([0, 159, 146, 150].as_slice()));
    }

    #[test]
    fn test_write_stores_utf8_text() {
        let backend = InMemoryBackend::new();
        let outcome = backend.write("/note.txt", "hello");
        assert!(outcome.error.is_none());
        assert_eq!(backend.contents("/note.txt"), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_plain_backend_has_no_repl_capability() {
        let backend = InMemoryBackend::new();
        assert!(backend.as_repl().is_none());
    }
}
