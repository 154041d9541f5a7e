//! Tool registry: the uniform adapter layer between the model (or the plan
//! runtime) and everything a tool invocation can touch.
//!
//! Every tool has a fixed name, typed parameters decoded at the boundary,
//! and a handler whose failures become `Error: …` strings — exceptions
//! never cross the model boundary. Relative paths resolve against the
//! session root, not the process working directory. Shell commands funnel
//! through the permission policy and the executor.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::info_span;

use scout_cmdpolicy::Policy;
use scout_cmdpolicy::parse as parse_command;

use crate::client::ModelClient;
use crate::exec;
use crate::exec::ExecRequest;
use crate::exec::SpawnMode;
use crate::models::ToolInvocation;

/// Interface to the external code-search/extract binary. Download and
/// resolution of the binary are its own concern; the registry only speaks
/// this contract.
pub trait CodeSearchBackend: Send + Sync {
    fn search(&self, request: SearchRequest) -> BoxFuture<'_, Result<String, String>>;
    fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<String, String>>;
    fn extract(&self, request: ExtractRequest) -> BoxFuture<'_, Result<String, String>>;
    fn list_files(
        &self,
        pattern: Option<String>,
        root: PathBuf,
    ) -> BoxFuture<'_, Result<String, String>>;
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub path: PathBuf,
    pub exact: bool,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub pattern: String,
    pub path: PathBuf,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// `path[:line[-end]]` or `path#symbol` targets.
    pub targets: Vec<String>,
    pub context_lines: u32,
    pub format: Option<String>,
    pub root: PathBuf,
}

/// Nested provider call used by the `LLM` tool.
pub trait NestedModel: Send + Sync {
    fn complete(
        &self,
        instruction: String,
        data: String,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<String, String>>;
}

impl NestedModel for ModelClient {
    fn complete(
        &self,
        instruction: String,
        data: String,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<String, String>> {
        let client = self.clone();
        async move {
            let messages = vec![
                crate::models::ChatMessage::system(instruction),
                crate::models::ChatMessage::user(data),
            ];
            client
                .complete(&messages, &cancel)
                .await
                .map_err(|error| error.to_string())
        }
        .boxed()
    }
}

/// Spawns a subordinate agent loop for the `delegate` tool. Installed by
/// the agent after construction; the relation is a back-reference, never
/// shared ownership.
pub trait DelegateRunner: Send + Sync {
    fn run(
        &self,
        task: String,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<String, String>>;
}

/// Interface to externally imported (MCP) tools.
pub trait McpBridge: Send + Sync {
    fn tool_names(&self) -> Vec<String>;
    fn call(
        &self,
        name: &str,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<serde_json::Value, String>>;
}

/// Tools whose handlers suspend; the plan transformer treats calls to
/// these as await points. Everything else (`chunk`, `range`, `flatten`,
/// `groupBy`, `log`) is synchronous inside the plan runtime.
pub const ASYNC_TOOLS: &[&str] = &[
    "search",
    "query",
    "extract",
    "listFiles",
    "bash",
    "LLM",
    "delegate",
    "map",
];

pub struct ToolRegistry {
    cwd: PathBuf,
    allowed_roots: Vec<PathBuf>,
    policy: Arc<Policy>,
    backend: Arc<dyn CodeSearchBackend>,
    model: Arc<dyn NestedModel>,
    delegate: Mutex<Option<Arc<dyn DelegateRunner>>>,
    mcp: Option<Arc<dyn McpBridge>>,
    plan_options: scout_plan::RuntimeOptions,
}

impl ToolRegistry {
    pub fn new(
        cwd: PathBuf,
        allowed_roots: Vec<PathBuf>,
        policy: Arc<Policy>,
        backend: Arc<dyn CodeSearchBackend>,
        model: Arc<dyn NestedModel>,
    ) -> Self {
        Self {
            cwd,
            allowed_roots,
            policy,
            backend,
            model,
            delegate: Mutex::new(None),
            mcp: None,
            plan_options: scout_plan::RuntimeOptions::default(),
        }
    }

    pub fn with_mcp(mut self, bridge: Arc<dyn McpBridge>) -> Self {
        self.mcp = Some(bridge);
        self
    }

    /// Deadline, loop budget, and `map` concurrency applied to every plan
    /// executed through the `plan` tool.
    pub fn with_plan_options(mut self, options: scout_plan::RuntimeOptions) -> Self {
        self.plan_options = options;
        self
    }

    /// Installed by the agent once it exists; see [`DelegateRunner`].
    pub fn set_delegate_runner(&self, runner: Arc<dyn DelegateRunner>) {
        if let Ok(mut slot) = self.delegate.lock() {
            *slot = Some(runner);
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Names the tool-call parser should recognize as invocations.
    pub fn known_tool_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = ["search", "query", "extract", "listFiles", "bash", "LLM", "delegate", "plan"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(mcp) = &self.mcp {
            names.extend(mcp.tool_names());
        }
        names
    }

    /// Imported tool names, for the plan transformer's async-name set.
    pub fn mcp_tool_names(&self) -> Vec<String> {
        self.mcp
            .as_ref()
            .map(|mcp| mcp.tool_names())
            .unwrap_or_default()
    }

    pub fn is_async_tool(&self, name: &str) -> bool {
        ASYNC_TOOLS.contains(&name)
            || self
                .mcp
                .as_ref()
                .is_some_and(|mcp| mcp.tool_names().iter().any(|t| t == name))
    }

    fn resolve(&self, path: Option<&str>) -> PathBuf {
        match path {
            Some(p) if !p.trim().is_empty() => {
                let p = Path::new(p.trim());
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.cwd.join(p)
                }
            }
            _ => self.cwd.clone(),
        }
    }

    /// Dispatch one invocation. The result is always model-presentable
    /// text; handler failures come back as `Error: …` /
    /// `Permission denied: …` strings, never as Err.
    pub async fn invoke(
        self: &Arc<Self>,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> String {
        let span = info_span!("tool", name = %invocation.name);
        self.invoke_inner(invocation, cancel).instrument(span).await
    }

    async fn invoke_inner(
        self: &Arc<Self>,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> String {
        match invocation.name.as_str() {
            "search" => self.tool_search(invocation).await,
            "query" => self.tool_query(invocation).await,
            "extract" => self.tool_extract(invocation).await,
            "listFiles" => self.tool_list_files(invocation).await,
            "bash" => self.tool_bash(invocation, cancel).await,
            "LLM" => self.tool_llm(invocation, cancel).await,
            "delegate" => self.tool_delegate(invocation, cancel).await,
            "plan" => self.tool_plan(invocation, cancel).await,
            name => {
                if let Some(mcp) = &self.mcp {
                    if mcp.tool_names().iter().any(|t| t == name) {
                        let args = params_to_json(&invocation.params);
                        return match mcp.call(name, args, cancel.child_token()).await {
                            Ok(value) => value_to_text(value),
                            Err(error) => format!("Error: {error}"),
                        };
                    }
                }
                format!("Error: unknown tool '{name}'")
            }
        }
    }

    async fn tool_search(&self, invocation: &ToolInvocation) -> String {
        let Some(query) = invocation.param("query") else {
            return missing("search", "query");
        };
        let request = SearchRequest {
            query: query.to_string(),
            path: self.resolve(invocation.param("path")),
            exact: bool_param(invocation, "exact"),
            max_tokens: u64_param(invocation, "maxTokens"),
        };
        match self.backend.search(request).await {
            Ok(text) => text,
            Err(error) => format!("Error: {error}"),
        }
    }

    async fn tool_query(&self, invocation: &ToolInvocation) -> String {
        let Some(pattern) = invocation.param("pattern") else {
            return missing("query", "pattern");
        };
        let request = QueryRequest {
            pattern: pattern.to_string(),
            path: self.resolve(invocation.param("path")),
            language: invocation.param("language").map(str::to_string),
        };
        match self.backend.query(request).await {
            Ok(text) => text,
            Err(error) => format!("Error: {error}"),
        }
    }

    async fn tool_extract(&self, invocation: &ToolInvocation) -> String {
        let context_lines = u64_param(invocation, "context_lines").unwrap_or(0) as u32;
        let format = invocation.param("format").map(str::to_string);

        // `input_content` is materialized as a file for the duration of the
        // call; targets then address that file.
        let mut tempfile_guard = None;
        let targets: Vec<String> = if let Some(content) = invocation.param("input_content") {
            let mut file = match tempfile::NamedTempFile::new() {
                Ok(file) => file,
                Err(error) => return format!("Error: could not materialize input content: {error}"),
            };
            if let Err(error) = file.write_all(content.as_bytes()) {
                return format!("Error: could not materialize input content: {error}");
            }
            let path = file.path().display().to_string();
            tempfile_guard = Some(file);
            vec![path]
        } else if let Some(targets) = invocation.param("targets") {
            targets
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            return missing("extract", "targets");
        };

        let request = ExtractRequest {
            targets,
            context_lines,
            format,
            root: self.cwd.clone(),
        };
        let result = self.backend.extract(request).await;
        drop(tempfile_guard);
        match result {
            Ok(text) => text,
            Err(error) => format!("Error: {error}"),
        }
    }

    async fn tool_list_files(&self, invocation: &ToolInvocation) -> String {
        let pattern = invocation.param("pattern").map(str::to_string);
        match self
            .backend
            .list_files(pattern, self.resolve(invocation.param("path")))
            .await
        {
            Ok(text) => text,
            Err(error) => format!("Error: {error}"),
        }
    }

    async fn tool_bash(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> String {
        let Some(command) = invocation.param("command") else {
            return missing("bash", "command");
        };

        let decision = self.policy.check(command);
        if !decision.allowed {
            let why = decision
                .detail
                .clone()
                .or(decision.matched_pattern.clone())
                .unwrap_or_else(|| decision.reason.to_string());
            return format!("Permission denied: {command} ({why})");
        }

        let parsed = parse_command(command);
        // Approved simple commands run without a shell; anything compound —
        // or carrying a redirection that only a shell can apply — runs via
        // `sh -c`.
        let mode = match parsed.single() {
            Some(component) if !parsed.structure.redirection => {
                let mut argv = vec![component.head.clone()];
                argv.extend(component.args.iter().cloned());
                SpawnMode::Direct(argv)
            }
            _ => SpawnMode::Shell(command.to_string()),
        };

        let mut request = ExecRequest::new(mode, command, self.resolve(invocation.param("working_directory")));
        if let Some(timeout_ms) = u64_param(invocation, "timeout") {
            request.timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(env) = invocation.param("env") {
            for pair in env.split(['\n', ',']) {
                if let Some((key, value)) = pair.split_once('=') {
                    request
                        .env
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }

        let result = exec::execute(request, &self.allowed_roots, cancel).await;
        result.render(!result.success)
    }

    async fn tool_llm(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> String {
        let Some(instruction) = invocation.param("instruction") else {
            return missing("LLM", "instruction");
        };
        let data = invocation.param("data").unwrap_or_default();
        match self
            .model
            .complete(
                instruction.to_string(),
                data.to_string(),
                cancel.child_token(),
            )
            .await
        {
            Ok(text) => text,
            Err(error) => format!("Error: {error}"),
        }
    }

    async fn tool_delegate(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> String {
        let Some(task) = invocation.param("task") else {
            return missing("delegate", "task");
        };
        let runner = self.delegate.lock().ok().and_then(|slot| slot.clone());
        match runner {
            Some(runner) => match runner.run(task.to_string(), cancel.child_token()).await {
                Ok(text) => text,
                Err(error) => format!("Error: {error}"),
            },
            None => "Error: delegate is not available in this session".to_string(),
        }
    }

    async fn tool_plan(self: &Arc<Self>, invocation: &ToolInvocation, cancel: &CancellationToken) -> String {
        let Some(script) = invocation
            .param("script")
            .or_else(|| invocation.param("program"))
        else {
            return missing("plan", "script");
        };
        let host: Arc<dyn scout_plan::ToolHost> = Arc::new(RegistryHost(Arc::clone(self)));
        let outcome = scout_plan::execute(
            script,
            host,
            self.plan_options.clone(),
            cancel.child_token(),
        )
        .await;
        serde_json::to_string_pretty(&outcome)
            .unwrap_or_else(|error| format!("Error: could not serialize plan outcome: {error}"))
    }
}

/// Adapter letting the plan runtime call back into the registry. Plan
/// tools are called positionally; an object argument contributes named
/// parameters instead.
struct RegistryHost(Arc<ToolRegistry>);

fn positional_params(tool: &str) -> &'static [&'static str] {
    match tool {
        "search" => &["query", "path", "exact", "maxTokens"],
        "query" => &["pattern", "path", "language"],
        "extract" => &["targets", "context_lines", "format"],
        "listFiles" => &["pattern", "path"],
        "bash" => &["command", "working_directory", "timeout"],
        "LLM" => &["instruction", "data", "options"],
        "delegate" => &["task"],
        _ => &["input"],
    }
}

fn json_to_param_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl scout_plan::ToolHost for RegistryHost {
    fn has_tool(&self, name: &str) -> bool {
        self.0.known_tool_names().contains(name) && name != "plan"
    }

    fn extra_tool_names(&self) -> Vec<String> {
        self.0.mcp_tool_names()
    }

    fn call_tool(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<serde_json::Value, String>> {
        let registry = Arc::clone(&self.0);
        let name = name.to_string();
        async move {
            // Plans must not recurse into plans.
            if name == "plan" {
                return Err("Error: the plan tool cannot be called from a plan".to_string());
            }
            let mut params = BTreeMap::new();
            let names = positional_params(&name);
            for (i, arg) in args.iter().enumerate() {
                match arg {
                    serde_json::Value::Object(map) => {
                        for (key, value) in map {
                            params.insert(key.clone(), json_to_param_text(value));
                        }
                    }
                    other => {
                        if let Some(param_name) = names.get(i) {
                            params.insert(param_name.to_string(), json_to_param_text(other));
                        }
                    }
                }
            }
            let invocation = ToolInvocation {
                name: name.clone(),
                raw: format!("<{name}>…</{name}>"),
                params,
            };
            let text = registry.invoke(&invocation, &cancel).await;
            if text.starts_with("Error:") || text.starts_with("Permission denied:") {
                Err(text)
            } else {
                Ok(serde_json::Value::String(text))
            }
        }
        .boxed()
    }
}

fn missing(tool: &str, param: &str) -> String {
    format!("Error: missing required parameter '{param}' for tool '{tool}'")
}

fn bool_param(invocation: &ToolInvocation, name: &str) -> bool {
    invocation
        .param(name)
        .map(|v| matches!(v.trim(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn u64_param(invocation: &ToolInvocation, name: &str) -> Option<u64> {
    invocation.param(name).and_then(|v| v.trim().parse().ok())
}

fn params_to_json(params: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

fn value_to_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    struct StubBackend;

    impl CodeSearchBackend for StubBackend {
        fn search(&self, request: SearchRequest) -> BoxFuture<'_, Result<String, String>> {
            async move { Ok(format!("File: src/found.rs\nhit for {}", request.query)) }.boxed()
        }
        fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<String, String>> {
            async move { Ok(format!("ast match for {}", request.pattern)) }.boxed()
        }
        fn extract(&self, request: ExtractRequest) -> BoxFuture<'_, Result<String, String>> {
            async move { Ok(format!("extracted {}", request.targets.join(", "))) }.boxed()
        }
        fn list_files(
            &self,
            pattern: Option<String>,
            _root: PathBuf,
        ) -> BoxFuture<'_, Result<String, String>> {
            async move { Ok(format!("files matching {pattern:?}")) }.boxed()
        }
    }

    struct StubModel;

    impl NestedModel for StubModel {
        fn complete(
            &self,
            instruction: String,
            _data: String,
            _cancel: CancellationToken,
        ) -> BoxFuture<'static, Result<String, String>> {
            async move { Ok(format!("model says: {instruction}")) }.boxed()
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let cwd = std::env::temp_dir();
        Arc::new(ToolRegistry::new(
            cwd.clone(),
            vec![cwd],
            Arc::new(Policy::with_defaults()),
            Arc::new(StubBackend),
            Arc::new(StubModel),
        ))
    }

    fn invocation(name: &str, params: &[(&str, &str)]) -> ToolInvocation {
        ToolInvocation {
            name: name.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn search_delegates_to_backend() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation("search", &[("query", "TODO")]),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.contains("hit for TODO"));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_an_error_string() {
        let registry = registry();
        let out = registry
            .invoke(&invocation("search", &[]), &CancellationToken::new())
            .await;
        assert_eq!(
            out,
            "Error: missing required parameter 'query' for tool 'search'"
        );
    }

    #[tokio::test]
    async fn unknown_tools_are_rejected_at_the_boundary() {
        let registry = registry();
        let out = registry
            .invoke(&invocation("edit_file", &[]), &CancellationToken::new())
            .await;
        assert_eq!(out, "Error: unknown tool 'edit_file'");
    }

    #[tokio::test]
    async fn denied_bash_command_reports_permission_denied() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation("bash", &[("command", "sudo rm -rf /")]),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.starts_with("Permission denied:"), "{out}");
    }

    #[tokio::test]
    async fn allowed_simple_command_runs_without_shell() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation("bash", &[("command", "echo scout-test")]),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.trim_end(), "scout-test");
    }

    #[tokio::test]
    async fn approved_compound_command_runs_with_shell() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation("bash", &[("command", "echo one && echo two")]),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.trim_end(), "one\ntwo");
    }

    #[tokio::test]
    async fn llm_tool_reaches_nested_model() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation("LLM", &[("instruction", "summarize"), ("data", "x")]),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out, "model says: summarize");
    }

    #[tokio::test]
    async fn delegate_without_runner_is_unavailable() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation("delegate", &[("task", "do it")]),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out, "Error: delegate is not available in this session");
    }

    #[tokio::test]
    async fn plan_tool_runs_scripts_against_the_registry() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation(
                    "plan",
                    &[(
                        "script",
                        "const r = search('alpha'); log('done'); return r;",
                    )],
                ),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.contains("\"status\": \"success\""), "{out}");
        assert!(out.contains("done"), "{out}");
    }

    #[tokio::test]
    async fn plan_tool_honors_configured_runtime_options() {
        let cwd = std::env::temp_dir();
        let registry = Arc::new(
            ToolRegistry::new(
                cwd.clone(),
                vec![cwd],
                Arc::new(Policy::with_defaults()),
                Arc::new(StubBackend),
                Arc::new(StubModel),
            )
            .with_plan_options(scout_plan::RuntimeOptions {
                loop_budget: 10,
                ..scout_plan::RuntimeOptions::default()
            }),
        );
        let out = registry
            .invoke(
                &invocation("plan", &[("script", "while (true) {} return 1;")]),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.contains("\"status\": \"error\""), "{out}");
        assert!(out.contains("Loop iteration budget exceeded (10)"), "{out}");
    }

    #[tokio::test]
    async fn extract_materializes_input_content() {
        let registry = registry();
        let out = registry
            .invoke(
                &invocation("extract", &[("input_content", "fn main() {}")]),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.starts_with("extracted "), "{out}");
    }
}
