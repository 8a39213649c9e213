//! Whelk: Sandboxed Script Evaluation over Capability-Limited Storage
//!
//! Whelk gives agents a persistent, sandboxed scripting surface on top of a
//! deliberately narrow storage backend. A virtual filesystem adapter recovers
//! hierarchical semantics from the backend's four primitives, execution
//! sessions evaluate scripts against that filesystem under resource limits,
//! and the tool layer binds one evaluation per agent tool call with
//! interpreter state threaded between calls.

mod backend;
mod fs;
mod limits;
mod repl;
mod session;
mod state;
mod tasks;
mod tool;

pub use backend::{
    Backend, DownloadResult, FileEntry, InMemoryBackend, ReplBackend, ReplOutcome, UploadOutcome,
    WriteOutcome,
};
pub use fs::{EntryKind, FsError, VirtualFs, VirtualStat};
pub use limits::{
    DEFAULT_MAX_OPERATIONS, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MAX_TIMEOUT_SECS, OutputBuffer,
    ResourceLimits, ValidationError,
};
pub use repl::{ScriptRepl, ScriptReplBuilder, host_fn};
pub use session::{ForeignFn, OutputMode, Session};
pub use state::{STATE_VERSION, StateError, decode_scope, encode_scope};
pub use tasks::{CancelFlag, TaskRegistry};
pub use tool::{BackendFactory, CallContext, ReplTool};
