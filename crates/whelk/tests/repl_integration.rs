//! Integration tests for the full evaluation stack.
//!
//! These tests exercise the complete path a tool call takes:
//! - tool invocation over a script-capable backend
//! - filesystem access from inside evaluated scripts
//! - interpreter state threading across invocations
//! - per-session-key cancellation of in-flight runs

use std::sync::Arc;

use whelk::{
    CallContext, InMemoryBackend, ReplTool, ScriptRepl, TaskRegistry,
};

fn repl_tool_over(backend: Arc<InMemoryBackend>) -> ReplTool {
    ReplTool::new(Arc::new(ScriptRepl::new(backend)))
}

// =============================================================================
// End-to-end evaluation
// =============================================================================

mod end_to_end {
    use super::*;

    #[tokio::test]
    async fn test_script_writes_file_and_reports_final_value() {
        let backend = Arc::new(InMemoryBackend::new());
        let tool = repl_tool_over(backend.clone());

        let reply = tokio::task::spawn_blocking(move || {
            let mut ctx = CallContext::new("conv-1");
            tool.invoke(&mut ctx, "write_file(\"/out.txt\", \"done\"); 2 + 2", None)
        })
        .await
        .expect("join blocking task");

        assert_eq!(reply, "4");
        assert_eq!(backend.contents("/out.txt"), Some(b"done".to_vec()));
    }

    #[tokio::test]
    async fn test_script_reads_seeded_files() {
        let backend = Arc::new(
            InMemoryBackend::new().with_file("/config/name.txt", b"whelk".to_vec()),
        );
        let tool = repl_tool_over(backend);

        let reply = tokio::task::spawn_blocking(move || {
            let mut ctx = CallContext::new("conv-1");
            tool.invoke(&mut ctx, "read_file(\"/config/name.txt\")", None)
        })
        .await
        .expect("join blocking task");

        assert_eq!(reply, "whelk");
    }
}

// =============================================================================
// State threading
// =============================================================================

mod state_threading {
    use super::*;

    #[tokio::test]
    async fn test_variables_survive_across_invocations() {
        let tool = Arc::new(repl_tool_over(Arc::new(InMemoryBackend::new())));

        let replies = tokio::task::spawn_blocking(move || {
            let mut ctx = CallContext::new("conv-1");
            let first = tool.invoke(&mut ctx, "let total = 0;", None);
            let second = tool.invoke(&mut ctx, "total += 40;", None);
            let third = tool.invoke(&mut ctx, "total + 2", None);
            (first, second, third)
        })
        .await
        .expect("join blocking task");

        assert_eq!(replies.0, "");
        assert_eq!(replies.2, "42");
    }

    #[tokio::test]
    async fn test_session_keys_are_isolated() {
        let tool = Arc::new(repl_tool_over(Arc::new(InMemoryBackend::new())));

        let (a_reply, b_reply) = tokio::task::spawn_blocking(move || {
            let mut a = CallContext::new("conv-a");
            let mut b = CallContext::new("conv-b");
            tool.invoke(&mut a, "let secret = 7;", None);
            (
                tool.invoke(&mut a, "secret", None),
                tool.invoke(&mut b, "secret", None),
            )
        })
        .await
        .expect("join blocking task");

        assert_eq!(a_reply, "7");
        // The other session never defined it.
        assert_ne!(b_reply, "7");
    }

    #[tokio::test]
    async fn test_failed_run_keeps_prior_state() {
        let tool = Arc::new(repl_tool_over(Arc::new(InMemoryBackend::new())));

        let reply = tokio::task::spawn_blocking(move || {
            let mut ctx = CallContext::new("conv-1");
            tool.invoke(&mut ctx, "let kept = 9;", None);
            tool.invoke(&mut ctx, "no_such_function();", None);
            tool.invoke(&mut ctx, "kept", None)
        })
        .await
        .expect("join blocking task");

        assert_eq!(reply, "9");
    }
}

// =============================================================================
// Cancellation
// =============================================================================

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_run() {
        let tool = Arc::new(repl_tool_over(Arc::new(InMemoryBackend::new())));
        let registry = Arc::new(TaskRegistry::new());

        let flag = registry.begin("conv-1");
        let worker_tool = Arc::clone(&tool);
        let worker_flag = flag.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let mut ctx = CallContext::new("conv-1");
            worker_tool.invoke_with_cancel(&mut ctx, "loop {}", None, worker_flag)
        });

        registry.cancel("conv-1");
        let reply = worker.await.expect("join blocking task");
        // Cancelled but not replaced: the run is still the current one.
        assert!(registry.finish("conv-1", &flag));

        assert!(reply.contains("cancelled"), "got: {reply}");
    }

    #[tokio::test]
    async fn test_new_run_revokes_previous_run_same_key() {
        let tool = Arc::new(repl_tool_over(Arc::new(InMemoryBackend::new())));
        let registry = Arc::new(TaskRegistry::new());

        let stale_flag = registry.begin("conv-1");
        let stale_tool = Arc::clone(&tool);
        let stale = tokio::task::spawn_blocking(move || {
            let mut ctx = CallContext::new("conv-1");
            stale_tool.invoke_with_cancel(&mut ctx, "loop {}", None, stale_flag)
        });

        // A newer run for the same key revokes the stale one.
        let fresh_flag = registry.begin("conv-1");
        let stale_reply = stale.await.expect("join blocking task");
        assert!(stale_reply.contains("cancelled"), "got: {stale_reply}");

        let fresh_tool = Arc::clone(&tool);
        let fresh = tokio::task::spawn_blocking(move || {
            let mut ctx = CallContext::new("conv-1");
            fresh_tool.invoke_with_cancel(&mut ctx, "1 + 1", None, fresh_flag)
        })
        .await
        .expect("join blocking task");

        assert_eq!(fresh, "2");
    }
}
