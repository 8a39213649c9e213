//! Binding of script evaluation to an agent-facing tool call.
//!
//! This layer turns one tool invocation into one evaluation: it validates
//! caller parameters before any engine work, resolves the backend for the
//! call, threads the per-session state blob through the run, and renders the
//! outcome as a single reply string. Errors are part of that string rather
//! than a separate channel, because the caller on the other side is a
//! language model reading text.
//!
//! State is written back on every path, including validation failures, so a
//! bad parameter never loses what earlier calls accumulated.

use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::limits::{DEFAULT_MAX_TIMEOUT_SECS, ResourceLimits};
use crate::tasks::CancelFlag;

/// Per-call context: which session this call belongs to and that session's
/// accumulated interpreter state.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Stable key identifying the session (conversation, thread, user).
    pub session_key: String,
    /// Opaque state blob carried between calls. Updated in place by
    /// [`ReplTool::invoke`]; treat the content as opaque.
    pub repl_state: Option<String>,
}

impl CallContext {
    /// Context for a session key with no prior state.
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            repl_state: None,
        }
    }
}

/// Produces the backend serving a given call.
pub type BackendFactory = Arc<dyn Fn(&CallContext) -> Arc<dyn Backend> + Send + Sync>;

enum BackendSource {
    Fixed(Arc<dyn Backend>),
    Factory(BackendFactory),
}

impl std::fmt::Debug for BackendSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(_) => f.write_str("BackendSource::Fixed"),
            Self::Factory(_) => f.write_str("BackendSource::Factory"),
        }
    }
}

/// The evaluation tool an agent calls.
#[derive(Debug)]
pub struct ReplTool {
    source: BackendSource,
    max_timeout_secs: u64,
}

impl ReplTool {
    /// Tool over one fixed backend, shared by every session.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            source: BackendSource::Fixed(backend),
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
        }
    }

    /// Tool that resolves a backend per call, letting each session key map
    /// to its own storage.
    pub fn with_factory(factory: BackendFactory) -> Self {
        Self {
            source: BackendSource::Factory(factory),
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
        }
    }

    /// Override the ceiling on caller-supplied timeouts.
    pub fn with_max_timeout(mut self, max_timeout_secs: u64) -> Self {
        self.max_timeout_secs = max_timeout_secs;
        self
    }

    /// Run one tool call. The reply is always a string; `ctx.repl_state` is
    /// updated in place on every path.
    pub fn invoke(&self, ctx: &mut CallContext, code: &str, timeout_secs: Option<i64>) -> String {
        self.invoke_inner(ctx, code, timeout_secs, None)
    }

    /// Like [`invoke`](Self::invoke), with a cancellation flag the run will
    /// observe.
    pub fn invoke_with_cancel(
        &self,
        ctx: &mut CallContext,
        code: &str,
        timeout_secs: Option<i64>,
        cancel: CancelFlag,
    ) -> String {
        self.invoke_inner(ctx, code, timeout_secs, Some(cancel))
    }

    fn invoke_inner(
        &self,
        ctx: &mut CallContext,
        code: &str,
        timeout_secs: Option<i64>,
        cancel: Option<CancelFlag>,
    ) -> String {
        // Parameters are validated before the backend is even resolved; a
        // rejected call must not touch storage.
        let limits = match ResourceLimits::with_timeout_secs(timeout_secs, self.max_timeout_secs) {
            Ok(limits) => limits,
            Err(err) => {
                write_back(ctx, None);
                return format!("Error: {err}.");
            }
        };
        let limits = match cancel {
            Some(flag) => limits.cancellable(flag),
            None => limits,
        };

        let backend = match &self.source {
            BackendSource::Fixed(backend) => Arc::clone(backend),
            BackendSource::Factory(factory) => factory(ctx),
        };
        let Some(repl) = backend.as_repl() else {
            write_back(ctx, None);
            return "Error: REPL evaluation not available for this backend.".to_string();
        };

        let prior = ctx
            .repl_state
            .take()
            .filter(|blob| !blob.is_empty());
        debug!(
            session_key = %ctx.session_key,
            repl_id = repl.id(),
            has_prior_state = prior.is_some(),
            "evaluating tool call"
        );

        let outcome = repl.repl(code, &limits, prior.as_deref());

        ctx.repl_state = Some(
            outcome
                .state
                .or(prior)
                .unwrap_or_default(),
        );

        match outcome.error {
            None => outcome.output,
            Some(err) if outcome.output.is_empty() => err,
            Some(err) => format!("{}\n[Error]\n{}", outcome.output, err),
        }
    }
}

/// Restore the state slot after a short-circuited call: the prior blob if
/// there was one, the empty blob otherwise.
fn write_back(ctx: &mut CallContext, new_state: Option<String>) {
    let prior = ctx.repl_state.take().unwrap_or_default();
    ctx.repl_state = Some(new_state.unwrap_or(prior));
}
