//! Sandboxed script execution sessions.
//!
//! A session binds a script engine to a virtual filesystem and an
//! allow-listed set of host functions. Scripts see only what is registered
//! here: the filesystem surface, the host functions, and the language's own
//! builtins. There is no ambient authority, no process environment, and no
//! escape from the resource limits supplied per run.
//!
//! Failures never cross this boundary as panics. Compile errors, runtime
//! errors, timeouts, and cancellation all come back through
//! [`ReplOutcome::error`], and interpreter state is carried on every path so
//! a failed run does not lose what earlier runs accumulated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use tracing::warn;

use crate::backend::ReplOutcome;
use crate::fs::VirtualFs;
use crate::limits::{OutputBuffer, ResourceLimits};
use crate::state::{decode_scope, encode_scope};

/// A host function callable from scripts.
///
/// Called with the script-supplied argument, or [`Dynamic::UNIT`] for a
/// zero-argument call.
pub type ForeignFn =
    Arc<dyn Fn(Dynamic) -> Result<Dynamic, Box<EvalAltResult>> + Send + Sync>;

/// How a session reports script output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// The value of the final expression, rendered as text. An expressionless
    /// script yields the empty string.
    #[default]
    FinalValue,
    /// Everything the script printed, joined in emission order.
    Printed,
}

/// One execution session: engine configuration plus the capability set
/// scripts may touch.
pub struct Session {
    fs: VirtualFs,
    mode: OutputMode,
    script_name: String,
    foreign_names: Vec<String>,
    foreign_impls: HashMap<String, ForeignFn>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("script_name", &self.script_name)
            .field("foreign_names", &self.foreign_names)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over a virtual filesystem.
    pub fn new(fs: VirtualFs) -> Self {
        Self {
            fs,
            mode: OutputMode::FinalValue,
            script_name: "repl".to_string(),
            foreign_names: Vec::new(),
            foreign_impls: HashMap::new(),
        }
    }

    /// Set the output mode.
    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the source name reported in script error positions.
    pub fn script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = name.into();
        self
    }

    /// Allow-list a host function name. Every allowed name must also receive
    /// an implementation before the session runs.
    pub fn allow_function(mut self, name: impl Into<String>) -> Self {
        self.foreign_names.push(name.into());
        self
    }

    /// Provide the implementation for an allow-listed name. Implementations
    /// without a matching allowance are ignored.
    pub fn provide_function(mut self, name: impl Into<String>, f: ForeignFn) -> Self {
        self.foreign_impls.insert(name.into(), f);
        self
    }

    /// Allow-list a name and provide its implementation in one step.
    pub fn foreign_function(self, name: impl Into<String>, f: ForeignFn) -> Self {
        let name = name.into();
        self.allow_function(name.clone()).provide_function(name, f)
    }

    /// Evaluate `code`, reporting the final expression's value.
    pub fn eval(
        &self,
        code: &str,
        limits: &ResourceLimits,
        prior_state: Option<&str>,
    ) -> ReplOutcome {
        self.execute(code, limits, prior_state, OutputMode::FinalValue)
    }

    /// Evaluate `code`, reporting what it printed.
    pub fn run(
        &self,
        code: &str,
        limits: &ResourceLimits,
        prior_state: Option<&str>,
    ) -> ReplOutcome {
        self.execute(code, limits, prior_state, OutputMode::Printed)
    }

    /// Evaluate `code` in the session's configured output mode.
    pub fn evaluate(
        &self,
        code: &str,
        limits: &ResourceLimits,
        prior_state: Option<&str>,
    ) -> ReplOutcome {
        self.execute(code, limits, prior_state, self.mode)
    }

    fn execute(
        &self,
        code: &str,
        limits: &ResourceLimits,
        prior_state: Option<&str>,
        mode: OutputMode,
    ) -> ReplOutcome {
        // An allow-listed name without an implementation is a wiring bug in
        // the host, not a script error. Fail before touching the engine.
        for name in &self.foreign_names {
            if !self.foreign_impls.contains_key(name) {
                return ReplOutcome {
                    output: String::new(),
                    error: Some(format!("foreign function `{name}` has no implementation")),
                    state: carry(prior_state),
                };
            }
        }

        let mut engine = Engine::new();
        engine.set_max_operations(limits.max_operations);

        let output = Arc::new(Mutex::new(OutputBuffer::new(limits.max_output_bytes)));
        let sink = Arc::clone(&output);
        engine.on_print(move |line| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_line(line);
        });

        let deadline = limits.timeout.map(|budget| Instant::now() + budget);
        let cancel = limits.cancel.clone();
        engine.on_progress(move |_ops| {
            if cancel.as_ref().is_some_and(|flag| flag.is_cancelled()) {
                return Some("cancelled".into());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Some("timeout".into());
            }
            None
        });

        register_fs_surface(&mut engine, &self.fs);
        for name in &self.foreign_names {
            // Presence checked above.
            let Some(f) = self.foreign_impls.get(name) else {
                continue;
            };
            let unary = Arc::clone(f);
            engine.register_fn(name.as_str(), move |arg: Dynamic| unary(arg));
            let nullary = Arc::clone(f);
            engine.register_fn(name.as_str(), move || nullary(Dynamic::UNIT));
        }

        let mut ast = match engine.compile(code) {
            Ok(ast) => ast,
            Err(err) => {
                return ReplOutcome {
                    output: String::new(),
                    error: Some(err.to_string()),
                    state: carry(prior_state),
                };
            }
        };
        ast.set_source(self.script_name.as_str());

        let mut scope = restore_scope(prior_state);

        let result = match mode {
            OutputMode::FinalValue => engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map(Some),
            OutputMode::Printed => engine.run_ast_with_scope(&mut scope, &ast).map(|()| None),
        };

        let state = match encode_scope(&scope) {
            Ok(blob) => Some(blob),
            Err(err) => {
                warn!(error = %err, "state capture failed, carrying prior state");
                carry(prior_state)
            }
        };

        match result {
            Ok(final_value) => {
                let text = match mode {
                    OutputMode::FinalValue => final_value
                        .filter(|v| !v.is_unit())
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    OutputMode::Printed => {
                        output.lock().unwrap_or_else(PoisonError::into_inner).join()
                    }
                };
                ReplOutcome {
                    output: text,
                    error: None,
                    state,
                }
            }
            Err(err) => ReplOutcome {
                output: output.lock().unwrap_or_else(PoisonError::into_inner).join(),
                error: Some(describe_error(err, limits.timeout)),
                state,
            },
        }
    }
}

/// State to report when no new image was produced: the prior blob, or an
/// empty one. State is never dropped, even on failure.
fn carry(prior_state: Option<&str>) -> Option<String> {
    Some(prior_state.unwrap_or_default().to_string())
}

fn restore_scope(prior_state: Option<&str>) -> Scope<'static> {
    match prior_state.filter(|s| !s.is_empty()) {
        None => Scope::new(),
        Some(blob) => match decode_scope(blob) {
            Ok(scope) => scope,
            Err(err) => {
                warn!(error = %err, "state restore failed, starting fresh");
                Scope::new()
            }
        },
    }
}

fn describe_error(err: Box<EvalAltResult>, budget: Option<Duration>) -> String {
    match *err {
        EvalAltResult::ErrorTerminated(token, _) => {
            if token.into_string().is_ok_and(|t| t == "cancelled") {
                "execution cancelled".to_string()
            } else {
                format!(
                    "execution timed out after {}ms",
                    budget.unwrap_or_default().as_millis()
                )
            }
        }
        other => other.to_string(),
    }
}

/// Register the filesystem surface scripts may call. Everything routes
/// through the virtual adapter; scripts never see the backend directly.
fn register_fs_surface(engine: &mut Engine, fs: &VirtualFs) {
    let f = fs.clone();
    engine.register_fn("exists", move |path: &str| f.exists(path));
    let f = fs.clone();
    engine.register_fn("is_file", move |path: &str| f.is_file(path));
    let f = fs.clone();
    engine.register_fn("is_dir", move |path: &str| f.is_dir(path));
    let f = fs.clone();
    engine.register_fn("list_dir", move |path: &str| -> rhai::Array {
        f.iter_dir(path).into_iter().map(Dynamic::from).collect()
    });
    let f = fs.clone();
    engine.register_fn(
        "read_file",
        move |path: &str| -> Result<String, Box<EvalAltResult>> {
            f.read_text(path).map_err(|e| e.to_string().into())
        },
    );
    let f = fs.clone();
    engine.register_fn(
        "write_file",
        move |path: &str, text: &str| -> Result<(), Box<EvalAltResult>> {
            f.write_text(path, text).map_err(|e| e.to_string().into())
        },
    );
    let f = fs.clone();
    engine.register_fn(
        "read_bytes",
        move |path: &str| -> Result<rhai::Blob, Box<EvalAltResult>> {
            f.read_bytes(path).map_err(|e| e.to_string().into())
        },
    );
    let f = fs.clone();
    engine.register_fn(
        "write_bytes",
        move |path: &str, data: rhai::Blob| -> Result<(), Box<EvalAltResult>> {
            f.write_bytes(path, &data).map_err(|e| e.to_string().into())
        },
    );
    let f = fs.clone();
    engine.register_fn(
        "mkdir",
        move |path: &str| -> Result<(), Box<EvalAltResult>> {
            f.make_dir(path, true, true).map_err(|e| e.to_string().into())
        },
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::tasks::CancelFlag;

    fn session() -> Session {
        Session::new(VirtualFs::new(Arc::new(InMemoryBackend::new())))
    }

    #[test]
    fn test_eval_reports_final_value() {
        let outcome = session().eval("1 + 1", &ResourceLimits::default(), None);
        assert_eq!(outcome.output, "2");
        assert!(outcome.error.is_none());
        assert!(outcome.state.is_some());
    }

    #[test]
    fn test_eval_unit_result_is_empty_output() {
        let outcome = session().eval("let x = 1;", &ResourceLimits::default(), None);
        assert_eq!(outcome.output, "");
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_run_reports_printed_lines() {
        let outcome = session().run(
            "print(\"one\"); print(\"two\"); 42",
            &ResourceLimits::default(),
            None,
        );
        assert_eq!(outcome.output, "one\ntwo");
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_compile_error_carries_prior_state() {
        let outcome = session().eval("let = ;", &ResourceLimits::default(), Some("prior-blob"));
        assert!(outcome.error.is_some());
        assert_eq!(outcome.output, "");
        assert_eq!(outcome.state.as_deref(), Some("prior-blob"));
    }

    #[test]
    fn test_runtime_error_keeps_printed_output() {
        let outcome = session().run(
            "print(\"before\"); this_fn_does_not_exist();",
            &ResourceLimits::default(),
            None,
        );
        assert_eq!(outcome.output, "before");
        assert!(outcome.error.is_some());
        assert!(outcome.state.is_some());
    }

    #[test]
    fn test_state_persists_across_runs() {
        let s = session();
        let limits = ResourceLimits::default();

        let first = s.eval("let x = 41;", &limits, None);
        assert!(first.error.is_none());
        let blob = first.state.unwrap();

        let second = s.eval("x + 1", &limits, Some(&blob));
        assert!(second.error.is_none());
        assert_eq!(second.output, "42");
    }

    #[test]
    fn test_function_pointer_variable_carries_prior_state() {
        let s = session();
        let limits = ResourceLimits::default();

        let first = s.eval("let x = 41;", &limits, None);
        let blob = first.state.unwrap();

        // The function pointer makes the dump fail, so the prior blob is
        // carried instead of a lossy string-typed restore.
        let second = s.eval("let f = Fn(\"abs\");", &limits, Some(&blob));
        assert!(second.error.is_none());
        assert_eq!(second.state.as_deref(), Some(blob.as_str()));

        let third = s.eval("x + 1", &limits, second.state.as_deref());
        assert_eq!(third.output, "42");
    }

    #[test]
    fn test_corrupted_state_starts_fresh() {
        let outcome = session().eval("1 + 1", &ResourceLimits::default(), Some("{garbage"));
        assert!(outcome.error.is_none());
        assert_eq!(outcome.output, "2");
    }

    #[test]
    fn test_empty_prior_state_is_treated_as_absent() {
        let outcome = session().eval("1 + 1", &ResourceLimits::default(), Some(""));
        assert!(outcome.error.is_none());
        assert_eq!(outcome.output, "2");
    }

    #[test]
    fn test_timeout_aborts_infinite_loop() {
        let limits = ResourceLimits {
            timeout: Some(Duration::from_millis(50)),
            max_operations: 0,
            ..ResourceLimits::default()
        };
        let outcome = session().eval("loop {}", &limits, None);
        let error = outcome.error.unwrap();
        assert_eq!(error, "execution timed out after 50ms");
        assert!(outcome.state.is_some());
    }

    #[test]
    fn test_cancellation_aborts_infinite_loop() {
        let flag = CancelFlag::new();
        flag.cancel();
        let limits = ResourceLimits {
            max_operations: 0,
            ..ResourceLimits::default()
        }
        .cancellable(flag);

        let outcome = session().eval("loop {}", &limits, None);
        assert_eq!(outcome.error.as_deref(), Some("execution cancelled"));
    }

    #[test]
    fn test_operation_cap_aborts_runaway_script() {
        let limits = ResourceLimits {
            max_operations: 1000,
            ..ResourceLimits::default()
        };
        let outcome = session().eval("loop {}", &limits, None);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_foreign_function_callable_from_script() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        let s = session().foreign_function(
            "double",
            Arc::new(move |arg: Dynamic| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Dynamic::from(arg.as_int().unwrap_or(0) * 2))
            }),
        );

        let outcome = s.eval("double(21)", &ResourceLimits::default(), None);
        assert_eq!(outcome.output, "42");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_foreign_function_nullary_call() {
        let s = session().foreign_function(
            "answer",
            Arc::new(|_arg: Dynamic| Ok(Dynamic::from(42_i64))),
        );
        let outcome = s.eval("answer()", &ResourceLimits::default(), None);
        assert_eq!(outcome.output, "42");
    }

    #[test]
    fn test_allowed_function_without_impl_is_wiring_error() {
        let s = session().allow_function("ghost");
        let outcome = s.eval("1 + 1", &ResourceLimits::default(), Some("prior"));
        let error = outcome.error.unwrap();
        assert!(error.contains("ghost"));
        assert!(error.contains("no implementation"));
        assert_eq!(outcome.state.as_deref(), Some("prior"));
    }

    #[test]
    fn test_extra_impl_without_allowance_is_unreachable() {
        let s = session().provide_function(
            "hidden",
            Arc::new(|_arg: Dynamic| Ok(Dynamic::from(1_i64))),
        );
        let outcome = s.eval("hidden()", &ResourceLimits::default(), None);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_scripts_reach_the_virtual_filesystem() {
        let backend = Arc::new(InMemoryBackend::new().with_file("/in.txt", b"ping".to_vec()));
        let s = Session::new(VirtualFs::new(backend.clone()));
        let limits = ResourceLimits::default();

        let outcome = s.eval("read_file(\"/in.txt\")", &limits, None);
        assert_eq!(outcome.output, "ping");

        let outcome = s.eval("write_file(\"/out.txt\", \"pong\"); exists(\"/out.txt\")", &limits, None);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.output, "true");
        assert_eq!(backend.contents("/out.txt"), Some(b"pong".to_vec()));
    }

    #[test]
    fn test_script_fs_errors_become_script_errors() {
        let outcome = session().eval(
            "read_file(\"/missing.txt\")",
            &ResourceLimits::default(),
            None,
        );
        let error = outcome.error.unwrap();
        assert!(error.contains("file not found"));
    }

    #[test]
    fn test_script_list_dir() {
        let backend = Arc::new(
            InMemoryBackend::new()
                .with_file("/a.txt", b"1".to_vec())
                .with_file("/b.txt", b"2".to_vec()),
        );
        let s = Session::new(VirtualFs::new(backend));
        let outcome = s.eval("list_dir(\"/\").len()", &ResourceLimits::default(), None);
        assert_eq!(outcome.output, "2");
    }
}
