//! Whelk MCP Server
//!
//! An MCP server that exposes Whelk script evaluation as a tool. Each MCP
//! session gets a persistent interpreter: variables defined in one `repl`
//! call are visible in the next, and a new call under the same session key
//! cancels any still-running previous one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::*,
    schemars::{self, JsonSchema},
    service::{RequestContext, RoleServer},
};
use serde::{Deserialize, Serialize};
use whelk::{CallContext, InMemoryBackend, ReplTool, ScriptRepl, TaskRegistry};

/// Parameters for the script evaluation tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReplParams {
    /// The script to evaluate. Top-level variables persist across calls
    /// within the same session.
    pub code: String,

    /// Wall-clock timeout in seconds. Must be positive and below the
    /// server's configured ceiling.
    #[serde(default)]
    pub timeout: Option<i64>,

    /// Session key scoping interpreter state. Calls sharing a key share
    /// variables; omitting it uses a single shared session.
    #[serde(default)]
    pub session: Option<String>,
}

/// MCP server that provides persistent sandboxed script evaluation
#[derive(Clone)]
pub struct WhelkServer {
    tool: Arc<ReplTool>,
    states: Arc<Mutex<HashMap<String, String>>>,
    tasks: Arc<TaskRegistry>,
}

impl std::fmt::Debug for WhelkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhelkServer").finish_non_exhaustive()
    }
}

impl WhelkServer {
    /// Create a server over a fresh in-memory workspace.
    ///
    /// # Arguments
    /// * `max_timeout_secs` - Ceiling on caller-supplied timeouts
    pub fn new(max_timeout_secs: u64) -> Self {
        let backend = Arc::new(ScriptRepl::new(Arc::new(InMemoryBackend::new())));
        Self {
            tool: Arc::new(ReplTool::new(backend).with_max_timeout(max_timeout_secs)),
            states: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(TaskRegistry::new()),
        }
    }

    /// Evaluate one script under the caller's session key.
    async fn run_repl(&self, params: ReplParams) -> Result<CallToolResult, McpError> {
        let reply = self.eval(params).await?;
        Ok(CallToolResult::success(vec![Content::text(reply)]))
    }

    /// Evaluate one script and return the raw reply text.
    pub async fn eval(&self, params: ReplParams) -> Result<String, McpError> {
        let key = params.session.unwrap_or_else(|| "default".to_string());

        let mut ctx = CallContext::new(key.clone());
        ctx.repl_state = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        // A new call for the key revokes any run still in flight for it.
        let flag = self.tasks.begin(&key);

        let tool = Arc::clone(&self.tool);
        let code = params.code;
        let timeout = params.timeout;
        let run_flag = flag.clone();
        let (reply, ctx) = tokio::task::spawn_blocking(move || {
            let reply = tool.invoke_with_cancel(&mut ctx, &code, timeout, run_flag);
            (reply, ctx)
        })
        .await
        .map_err(|e| McpError::internal_error(format!("Evaluation task failed: {}", e), None))?;

        // A run revoked by a newer call for the same key must not publish its
        // state; the newer run owns the slot now.
        let still_current = self.tasks.finish(&key, &flag);
        if still_current {
            if let Some(state) = ctx.repl_state {
                self.states
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, state);
            }
        }

        Ok(reply)
    }

    fn repl_tool(&self) -> Tool {
        let schema = schemars::schema_for!(ReplParams);
        let schema_json = serde_json::to_value(schema).unwrap_or_default();
        let input_schema = match schema_json {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: "repl".into(),
            title: Some("Evaluate Script".into()),
            description: Some(
                "Evaluate a script in a persistent sandboxed interpreter. Top-level variables \
                survive across calls within the same session, and scripts can read and write a \
                private virtual filesystem via exists, is_file, is_dir, list_dir, read_file, \
                write_file, read_bytes, write_bytes, and mkdir. The sandbox has no network \
                access and no process environment."
                    .into(),
            ),
            input_schema,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for WhelkServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Whelk provides a persistent sandboxed scripting environment. Use the 'repl' \
                tool to evaluate scripts; variables defined at the top level persist across \
                calls within the same session, and the virtual filesystem is shared by all \
                scripts in that session. Pass a 'session' key to keep separate conversations \
                isolated."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: vec![self.repl_tool()],
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "repl" => {
                let params: ReplParams = match &request.arguments {
                    Some(args) => serde_json::from_value(serde_json::Value::Object(args.clone()))
                        .map_err(|e| {
                        McpError::invalid_params(format!("Invalid parameters: {}", e), None)
                    })?,
                    None => {
                        return Err(McpError::invalid_params("Missing 'code' parameter", None));
                    }
                };
                self.run_repl(params).await
            }
            _ => Err(McpError::invalid_params(
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}
