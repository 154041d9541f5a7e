//! Root of the `scout-core` library: the tool-execution core of the agent.
//!
//! The agent loop ([`agent`]) drives turns against a provider ([`client`]),
//! parses tool invocations out of assistant text ([`toolcall`]), dispatches
//! them through the registry ([`tools`]) — shell commands passing through
//! the `scout-cmdpolicy` gatekeeper and the executor ([`exec`]) — and
//! appends results to the compactable conversation history ([`history`]).
//! Plan scripts run in the sandboxed `scout-plan` runtime with the registry
//! as their tool host.

// All user-visible output goes through events or tracing, never stdio.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod exec;
mod flags;
pub mod history;
pub mod line_hash;
pub mod models;
pub mod protocol;
pub mod provider;
pub mod toolcall;
pub mod tools;
pub mod tracker;
pub mod util;

pub use agent::Agent;
pub use agent::COMPLETION_TOOL;
pub use client::ModelClient;
pub use config::Config;
pub use error::Result;
pub use error::ScoutErr;
pub use exec::ExecRequest;
pub use exec::ExecResult;
pub use exec::SpawnMode;
pub use history::CloneOptions;
pub use history::ConversationHistory;
pub use models::ChatMessage;
pub use models::Role;
pub use models::ToolInvocation;
pub use provider::ModelProviderInfo;
pub use provider::WireApi;
pub use provider::built_in_model_providers;
pub use toolcall::parse_tool_invocations;
pub use tools::CodeSearchBackend;
pub use tools::ToolRegistry;
pub use tracker::FileTracker;
pub use util::cancellation_on_sigint;
