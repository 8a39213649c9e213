//! Script evaluation layered over an existing backend.
//!
//! [`ScriptRepl`] wraps any [`Backend`] and re-exposes it unchanged, adding
//! the interactive-evaluation capability on top. Filesystem traffic passes
//! straight through to the wrapped backend, so callers that only need
//! storage never notice the wrapper. Evaluation runs in a [`Session`] bound
//! to a virtual filesystem over the same backend, which is how scripts end
//! up reading and writing the caller's files.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rhai::Dynamic;

use crate::backend::{
    Backend, DownloadResult, FileEntry, ReplBackend, ReplOutcome, UploadOutcome, WriteOutcome,
};
use crate::fs::VirtualFs;
use crate::limits::ResourceLimits;
use crate::session::{ForeignFn, OutputMode, Session};

static NEXT_REPL_ID: AtomicU64 = AtomicU64::new(1);

fn next_repl_id() -> String {
    let n = NEXT_REPL_ID.fetch_add(1, Ordering::Relaxed);
    format!("repl-{n:03}")
}

/// A backend decorated with script evaluation.
pub struct ScriptRepl {
    inner: Arc<dyn Backend>,
    session: Session,
    id: String,
}

impl std::fmt::Debug for ScriptRepl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRepl")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ScriptRepl {
    /// Wrap `backend` with default session settings.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::builder(backend).build()
    }

    /// Start configuring a wrapper around `backend`.
    pub fn builder(backend: Arc<dyn Backend>) -> ScriptReplBuilder {
        ScriptReplBuilder {
            backend,
            mode: OutputMode::default(),
            script_name: None,
            foreign: Vec::new(),
        }
    }
}

/// Builder for [`ScriptRepl`].
pub struct ScriptReplBuilder {
    backend: Arc<dyn Backend>,
    mode: OutputMode,
    script_name: Option<String>,
    foreign: Vec<(String, ForeignFn)>,
}

impl std::fmt::Debug for ScriptReplBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptReplBuilder")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ScriptReplBuilder {
    /// Set the output mode for evaluations.
    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the source name reported in script error positions.
    pub fn script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    /// Expose a host function to evaluated scripts.
    pub fn foreign_function(mut self, name: impl Into<String>, f: ForeignFn) -> Self {
        self.foreign.push((name.into(), f));
        self
    }

    /// Build the wrapper.
    pub fn build(self) -> ScriptRepl {
        let mut session =
            Session::new(VirtualFs::new(Arc::clone(&self.backend))).output_mode(self.mode);
        if let Some(name) = self.script_name {
            session = session.script_name(name);
        }
        for (name, f) in self.foreign {
            session = session.foreign_function(name, f);
        }
        ScriptRepl {
            inner: self.backend,
            session,
            id: next_repl_id(),
        }
    }
}

impl Backend for ScriptRepl {
    fn list(&self, path: &str) -> Vec<FileEntry> {
        self.inner.list(path)
    }

    fn download(&self, paths: &[String]) -> Vec<DownloadResult> {
        self.inner.download(paths)
    }

    fn upload(&self, files: &[(String, Vec<u8>)]) -> Vec<UploadOutcome> {
        self.inner.upload(files)
    }

    fn write(&self, path: &str, content: &str) -> WriteOutcome {
        self.inner.write(path, content)
    }

    fn as_repl(&self) -> Option<&dyn ReplBackend> {
        Some(self)
    }
}

impl ReplBackend for ScriptRepl {
    fn id(&self) -> &str {
        &self.id
    }

    fn repl(&self, code: &str, limits: &ResourceLimits, prior_state: Option<&str>) -> ReplOutcome {
        self.session.evaluate(code, limits, prior_state)
    }
}

/// Convenience: a host function from a plain closure.
pub fn host_fn<F>(f: F) -> ForeignFn
where
    F: Fn(Dynamic) -> Result<Dynamic, Box<rhai::EvalAltResult>> + Send + Sync + 'static,
{
    Arc::new(f)
}
