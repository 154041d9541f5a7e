//! Submission/event protocol between the agent session and its embedder.
//! The agent is a queue pair: submissions in, events out.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Unique id for correlating events back to this submission.
    pub id: String,
    pub op: Op,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Start (or replace) the running task with fresh user input.
    UserInput { text: String },
    /// Cooperatively cancel the running task.
    Interrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Submission id this event belongs to.
    pub id: String,
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    TaskStarted,
    AgentMessage(AgentMessageEvent),
    ToolCallBegin(ToolCallBeginEvent),
    ToolCallEnd(ToolCallEndEvent),
    /// Progress notes (retry waits, compaction) so the UI never looks
    /// frozen.
    BackgroundEvent(BackgroundEventEvent),
    Error(ErrorEvent),
    TaskComplete(TaskCompleteEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessageEvent {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallBeginEvent {
    pub tool: String,
    /// Short human-readable description (e.g. the command line).
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEndEvent {
    pub tool: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundEventEvent {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteEvent {
    pub last_agent_message: Option<String>,
}
