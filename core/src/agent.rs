//! The agent loop: drive turns against the provider, dispatch tool
//! invocations, append results, and decide termination.
//!
//! The agent is a queue pair (submissions in, events out) around a session
//! that owns the conversation history, the tool registry, and the
//! cancellation token. A task ends when the model invokes `completion`,
//! the iteration cap is reached, the session is cancelled, or a provider
//! error survives retry and fallback. Context overflow triggers exactly
//! one compaction-and-retry per occurrence.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_channel::Receiver;
use async_channel::Sender;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::client::ModelClient;
use crate::config::Config;
use crate::error::Result;
use crate::error::ScoutErr;
use crate::history::CloneOptions;
use crate::history::ConversationHistory;
use crate::history::JSON_CORRECTION_PREFIX;
use crate::history::TOOL_REMINDER;
use crate::models::ToolInvocation;
use crate::protocol::AgentMessageEvent;
use crate::protocol::BackgroundEventEvent;
use crate::protocol::ErrorEvent;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::Op;
use crate::protocol::Submission;
use crate::protocol::TaskCompleteEvent;
use crate::protocol::ToolCallBeginEvent;
use crate::protocol::ToolCallEndEvent;
use crate::toolcall::parse_tool_invocations;
use crate::tools::CodeSearchBackend;
use crate::tools::DelegateRunner;
use crate::tools::ToolRegistry;
use crate::tracker::FileTracker;

/// Tool name the model invokes to end the task.
pub const COMPLETION_TOOL: &str = "completion";

/// Tools whose output is a file/symbol observation feeding the tracker.
const READ_STYLE_TOOLS: &[&str] = &["search", "query", "extract", "listFiles"];

const MAX_SCHEMA_CORRECTIONS: u32 = 1;

/// Handle to a running agent session: submissions in, events out.
pub struct Agent {
    next_id: AtomicU64,
    tx_sub: Sender<Submission>,
    rx_event: Receiver<Event>,
    session: Arc<Session>,
}

impl Agent {
    pub fn spawn(
        config: Config,
        backend: Arc<dyn CodeSearchBackend>,
        cancel: CancellationToken,
    ) -> Agent {
        let (tx_sub, rx_sub) = async_channel::bounded(64);
        let (tx_event, rx_event) = async_channel::bounded(64);

        let client = ModelClient::new(
            config.model.clone(),
            config.provider.clone(),
            config.fallback_provider.clone(),
        )
        .with_overflow_markers(config.extra_overflow_markers.clone());

        let registry = Arc::new(
            ToolRegistry::new(
                config.cwd.clone(),
                config.allowed_roots.clone(),
                config.policy(),
                backend,
                Arc::new(client.clone()),
            )
            .with_plan_options(config.plan.clone()),
        );

        let session = Arc::new(Session {
            session_id: Uuid::new_v4(),
            client,
            registry: Arc::clone(&registry),
            tracker: Arc::new(FileTracker::new()),
            tx_event,
            cancel,
            history: tokio::sync::Mutex::new(ConversationHistory::new(
                config.instructions.clone(),
            )),
            config,
            state: Mutex::new(State::default()),
        });

        registry.set_delegate_runner(Arc::new(SubAgentRunner {
            session: Arc::downgrade(&session),
            depth: Arc::new(AtomicU64::new(0)),
        }));

        tokio::spawn(submission_loop(Arc::clone(&session), rx_sub));

        Agent {
            next_id: AtomicU64::new(0),
            tx_sub,
            rx_event,
            session,
        }
    }

    pub async fn submit(&self, op: Op) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.submit_with_id(Submission { id: id.clone(), op })
            .await?;
        Ok(id)
    }

    pub async fn submit_with_id(&self, submission: Submission) -> Result<()> {
        self.tx_sub
            .send(submission)
            .await
            .map_err(|_| ScoutErr::InternalAgentDied)
    }

    pub async fn next_event(&self) -> Result<Event> {
        self.rx_event
            .recv()
            .await
            .map_err(|_| ScoutErr::InternalAgentDied)
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id
    }

    /// Deep-copy the conversation for branching a child agent off the
    /// current state. `new_session_id` controls whether the branch keeps
    /// this session's id or gets a fresh one.
    pub async fn clone_history(
        &self,
        options: CloneOptions,
        new_session_id: bool,
    ) -> (Uuid, ConversationHistory) {
        let id = if new_session_id {
            Uuid::new_v4()
        } else {
            self.session.session_id
        };
        let history = self.session.history.lock().await.clone_with(options);
        (id, history)
    }
}

struct AgentTask {
    sub_id: String,
    handle: AbortHandle,
}

#[derive(Default)]
struct State {
    current_task: Option<AgentTask>,
}

pub(crate) struct Session {
    session_id: Uuid,
    client: ModelClient,
    registry: Arc<ToolRegistry>,
    tracker: Arc<FileTracker>,
    tx_event: Sender<Event>,
    cancel: CancellationToken,
    history: tokio::sync::Mutex<ConversationHistory>,
    config: Config,
    state: Mutex<State>,
}

impl Session {
    fn set_task(&self, task: AgentTask) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(previous) = state.current_task.take() {
                previous.handle.abort();
            }
            state.current_task = Some(task);
        }
    }

    fn remove_task(&self, sub_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state
                .current_task
                .as_ref()
                .is_some_and(|task| task.sub_id == sub_id)
            {
                state.current_task.take();
            }
        }
    }

    fn abort_task(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(task) = state.current_task.take() {
                task.handle.abort();
            }
        }
    }
}

async fn submission_loop(session: Arc<Session>, rx_sub: Receiver<Submission>) {
    while let Ok(submission) = rx_sub.recv().await {
        debug!(id = %submission.id, "submission");
        match submission.op {
            Op::UserInput { text } => {
                let handle = tokio::spawn(run_task(
                    Arc::clone(&session),
                    submission.id.clone(),
                    text,
                ))
                .abort_handle();
                session.set_task(AgentTask {
                    sub_id: submission.id,
                    handle,
                });
            }
            Op::Interrupt => {
                session.cancel.cancel();
                session.abort_task();
            }
        }
    }
    debug!("submission queue closed");
}

/// Outcome of a single turn.
enum TurnOutcome {
    /// The model invoked `completion` (or produced a schema-valid final
    /// answer); the task is done.
    Completed(String),
    /// More turns needed.
    Continue,
    /// Unrecoverable; carries the surfaced error message.
    Failed(String),
}

struct TurnCtx<'a> {
    client: &'a ModelClient,
    registry: &'a Arc<ToolRegistry>,
    tracker: &'a FileTracker,
    config: &'a Config,
    cancel: &'a CancellationToken,
    /// `(event sender, submission id)` — absent for delegate sub-agents.
    events: Option<(&'a Sender<Event>, &'a str)>,
}

impl TurnCtx<'_> {
    async fn emit(&self, msg: EventMsg) {
        if let Some((tx, id)) = self.events {
            tx.send(Event {
                id: id.to_string(),
                msg,
            })
            .await
            .ok();
        }
    }

    async fn background(&self, message: impl Into<String>) {
        self.emit(EventMsg::BackgroundEvent(BackgroundEventEvent {
            message: message.into(),
        }))
        .await;
    }
}

async fn run_task(session: Arc<Session>, sub_id: String, text: String) {
    let ctx = TurnCtx {
        client: &session.client,
        registry: &session.registry,
        tracker: &session.tracker,
        config: &session.config,
        cancel: &session.cancel,
        events: Some((&session.tx_event, &sub_id)),
    };
    ctx.emit(EventMsg::TaskStarted).await;
    session.history.lock().await.push_user(text);

    let mut corrections = 0u32;
    let mut completed: Option<String> = None;
    let mut failure: Option<String> = None;
    let mut iterations = 0u64;

    while iterations < session.config.max_iterations {
        iterations += 1;
        if session.cancel.is_cancelled() {
            failure = Some("interrupted".to_string());
            break;
        }
        match run_turn(&ctx, &session.history, &mut corrections).await {
            TurnOutcome::Completed(answer) => {
                completed = Some(answer);
                break;
            }
            TurnOutcome::Continue => {}
            TurnOutcome::Failed(message) => {
                failure = Some(message);
                break;
            }
        }
    }

    if completed.is_none() && failure.is_none() {
        ctx.background(format!(
            "iteration limit reached after {} turns",
            session.config.max_iterations
        ))
        .await;
    }

    session.remove_task(&sub_id);
    match failure {
        Some(message) => {
            info!("task error: {message}");
            ctx.emit(EventMsg::Error(ErrorEvent { message })).await;
        }
        None => {
            let last_agent_message = match completed {
                Some(answer) => Some(answer),
                None => session
                    .history
                    .lock()
                    .await
                    .last_assistant_message()
                    .map(str::to_string),
            };
            ctx.emit(EventMsg::TaskComplete(TaskCompleteEvent {
                last_agent_message,
            }))
            .await;
        }
    }
}

/// One provider call plus everything it triggers: compaction-and-retry on
/// overflow, tool dispatch, tracker updates, schema self-correction.
async fn run_turn(
    ctx: &TurnCtx<'_>,
    history: &tokio::sync::Mutex<ConversationHistory>,
    corrections: &mut u32,
) -> TurnOutcome {
    let messages = history.lock().await.messages().to_vec();
    let response = match ctx.client.complete(&messages, ctx.cancel).await {
        Ok(text) => text,
        Err(ScoutErr::ContextOverflow(detail)) => {
            debug!("context overflow: {detail}");
            let dropped = history
                .lock()
                .await
                .compact(ctx.config.keep_recent_segments);
            if dropped == 0 {
                return TurnOutcome::Failed(format!(
                    "context window exceeded and compaction cannot help: {detail}"
                ));
            }
            ctx.background(format!(
                "context overflow: compacted {dropped} messages, retrying"
            ))
            .await;
            let messages = history.lock().await.messages().to_vec();
            match ctx.client.complete(&messages, ctx.cancel).await {
                Ok(text) => text,
                Err(error) => return TurnOutcome::Failed(error.to_string()),
            }
        }
        Err(error) => return TurnOutcome::Failed(error.to_string()),
    };

    history.lock().await.push_assistant(response.clone());
    ctx.emit(EventMsg::AgentMessage(AgentMessageEvent {
        message: response.clone(),
    }))
    .await;

    let mut known = ctx.registry.known_tool_names();
    known.insert(COMPLETION_TOOL.to_string());
    let invocations = parse_tool_invocations(&response, &known);

    if let Some(completion) = invocations.iter().find(|i| i.name == COMPLETION_TOOL) {
        let answer = completion
            .param("result")
            .or_else(|| completion.param("answer"))
            .map(str::to_string)
            .unwrap_or_else(|| response.clone());
        return finalize(ctx, history, answer, corrections).await;
    }

    if invocations.is_empty() {
        if ctx.config.response_schema.is_some() {
            // A bare response may already be the final answer.
            return finalize(ctx, history, response, corrections).await;
        }
        history.lock().await.push_internal_reminder(TOOL_REMINDER);
        return TurnOutcome::Continue;
    }

    // Results append in call-emission order.
    for invocation in &invocations {
        ctx.emit(EventMsg::ToolCallBegin(ToolCallBeginEvent {
            tool: invocation.name.clone(),
            summary: summarize(invocation),
        }))
        .await;
        let output = ctx.registry.invoke(invocation, ctx.cancel).await;
        let ok = !(output.starts_with("Error:") || output.starts_with("Permission denied:"));
        if READ_STYLE_TOOLS.contains(&invocation.name.as_str()) {
            ctx.tracker.ingest_output(&output, ctx.registry.cwd());
        }
        history
            .lock()
            .await
            .push_tool_result(&invocation.name, &output);
        ctx.emit(EventMsg::ToolCallEnd(ToolCallEndEvent {
            tool: invocation.name.clone(),
            ok,
        }))
        .await;
    }
    TurnOutcome::Continue
}

/// Apply the response-schema gate to a candidate final answer, spending at
/// most one self-correction round.
async fn finalize(
    ctx: &TurnCtx<'_>,
    history: &tokio::sync::Mutex<ConversationHistory>,
    answer: String,
    corrections: &mut u32,
) -> TurnOutcome {
    let Some(schema) = &ctx.config.response_schema else {
        return TurnOutcome::Completed(answer);
    };
    match validate_response(&answer, schema) {
        Ok(()) => TurnOutcome::Completed(answer),
        Err(problem) => {
            if *corrections >= MAX_SCHEMA_CORRECTIONS {
                return TurnOutcome::Failed(format!(
                    "response failed schema validation after correction: {problem}"
                ));
            }
            *corrections += 1;
            warn!("schema validation failed: {problem}");
            history.lock().await.push_internal_reminder(format!(
                "{JSON_CORRECTION_PREFIX}: {problem}. Respond again with only the corrected JSON."
            ));
            TurnOutcome::Continue
        }
    }
}

/// Minimal response-contract validation: the answer must parse as JSON
/// and satisfy the schema's top-level `type` and `required` clauses.
fn validate_response(answer: &str, schema: &serde_json::Value) -> std::result::Result<(), String> {
    let candidate = extract_json_candidate(answer);
    let value: serde_json::Value =
        serde_json::from_str(candidate).map_err(|error| format!("not valid JSON: {error}"))?;

    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        let actual = match &value {
            serde_json::Value::Object(_) => "object",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Null => "null",
        };
        if expected != actual {
            return Err(format!("expected a JSON {expected}, got {actual}"));
        }
    }
    if let (Some(required), Some(object)) = (
        schema.get("required").and_then(|r| r.as_array()),
        value.as_object(),
    ) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(format!("missing required property '{key}'"));
            }
        }
    }
    Ok(())
}

/// Models often wrap JSON in markdown fences or prose; find the payload.
fn extract_json_candidate(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find(['{', '[']) {
        return trimmed[start..].trim();
    }
    trimmed
}

fn summarize(invocation: &ToolInvocation) -> String {
    let detail = invocation
        .param("command")
        .or_else(|| invocation.param("query"))
        .or_else(|| invocation.param("pattern"))
        .or_else(|| invocation.param("targets"))
        .or_else(|| invocation.param("task"))
        .unwrap_or_default();
    let mut summary: String = detail.chars().take(120).collect();
    if summary.len() < detail.len() {
        summary.push('…');
    }
    summary
}

/// Delegate tool: spawns a subordinate loop with a fresh conversation, the
/// same tool surface and allowed folders, and a halved iteration budget.
/// Holds a weak back-reference to the session, never ownership.
struct SubAgentRunner {
    session: Weak<Session>,
    depth: Arc<AtomicU64>,
}

const MAX_DELEGATE_DEPTH: u64 = 3;

impl DelegateRunner for SubAgentRunner {
    fn run(
        &self,
        task: String,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, std::result::Result<String, String>> {
        let Some(session) = self.session.upgrade() else {
            return async { Err("session is shutting down".to_string()) }.boxed();
        };
        let depth = Arc::clone(&self.depth);
        async move {
            if depth.fetch_add(1, Ordering::SeqCst) >= MAX_DELEGATE_DEPTH {
                depth.fetch_sub(1, Ordering::SeqCst);
                return Err(format!(
                    "delegate nesting limit reached ({MAX_DELEGATE_DEPTH})"
                ));
            }
            let result = run_sub_agent(&session, task, cancel).await;
            depth.fetch_sub(1, Ordering::SeqCst);
            result
        }
        .boxed()
    }
}

async fn run_sub_agent(
    session: &Session,
    task: String,
    cancel: CancellationToken,
) -> std::result::Result<String, String> {
    let mut sub_config = session.config.clone();
    sub_config.max_iterations = (session.config.max_iterations / 2).max(1);
    sub_config.response_schema = None;

    let history = tokio::sync::Mutex::new(ConversationHistory::new(
        session.config.instructions.clone(),
    ));
    history.lock().await.push_user(task);

    let ctx = TurnCtx {
        client: &session.client,
        registry: &session.registry,
        tracker: &session.tracker,
        config: &sub_config,
        cancel: &cancel,
        events: None,
    };

    let mut corrections = 0u32;
    for _ in 0..sub_config.max_iterations {
        if cancel.is_cancelled() {
            return Err("delegate interrupted".to_string());
        }
        match run_turn(&ctx, &history, &mut corrections).await {
            TurnOutcome::Completed(answer) => return Ok(answer),
            TurnOutcome::Continue => {}
            TurnOutcome::Failed(message) => return Err(message),
        }
    }
    history
        .lock()
        .await
        .last_assistant_message()
        .map(str::to_string)
        .ok_or_else(|| "delegate finished without an answer".to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn validates_type_and_required_properties() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["summary", "files"]
        });
        assert!(validate_response(r#"{"summary": "s", "files": []}"#, &schema).is_ok());
        assert!(validate_response(r#"{"summary": "s"}"#, &schema).is_err());
        assert!(validate_response("[1, 2]", &schema).is_err());
        assert!(validate_response("not json at all", &schema).is_err());
    }

    #[test]
    fn extracts_json_from_fences_and_prose() {
        assert_eq!(
            extract_json_candidate("Here you go:\n```json\n{\"a\": 1}\n```"),
            "{\"a\": 1}"
        );
        assert_eq!(
            extract_json_candidate("The answer is {\"a\": 1}"),
            "{\"a\": 1}"
        );
    }

    #[test]
    fn summaries_are_bounded() {
        let invocation = ToolInvocation {
            name: "bash".to_string(),
            params: [("command".to_string(), "x".repeat(500))].into_iter().collect(),
            raw: String::new(),
        };
        assert!(summarize(&invocation).chars().count() <= 121);
    }
}
