use std::path::PathBuf;
use std::sync::Arc;

use scout_cmdpolicy::Policy;

use crate::provider::ModelProviderInfo;
use crate::provider::built_in_model_providers;

pub const DEFAULT_MAX_ITERATIONS: u64 = 30;
pub const DEFAULT_KEEP_RECENT_SEGMENTS: usize = 1;

/// Session configuration. Constructed once, then passed around immutably;
/// nothing here mutates at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub provider: ModelProviderInfo,
    pub fallback_provider: Option<ModelProviderInfo>,

    /// Session working root; relative tool paths resolve against this.
    pub cwd: PathBuf,
    /// Folders a child process may use as its working directory.
    pub allowed_roots: Vec<PathBuf>,

    pub allow_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub use_default_allow: bool,
    pub use_default_deny: bool,

    /// Turn budget per task.
    pub max_iterations: u64,
    /// Segments kept whole by the compactor (minimum 1).
    pub keep_recent_segments: usize,

    /// System instructions, message index 0 of every conversation.
    pub instructions: String,

    /// When set, the final answer must be valid JSON satisfying this
    /// schema; the agent gets one self-correction round.
    pub response_schema: Option<serde_json::Value>,

    /// Additional context-overflow phrasings beyond the built-in table.
    pub extra_overflow_markers: Vec<String>,

    pub plan: scout_plan::RuntimeOptions,
}

impl Config {
    pub fn new(cwd: PathBuf) -> Self {
        let providers = built_in_model_providers();
        let provider = providers
            .get("openai")
            .cloned()
            .unwrap_or(ModelProviderInfo {
                name: "OpenAI".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                env_key: Some("OPENAI_API_KEY".to_string()),
                wire_api: crate::provider::WireApi::Chat,
            });
        Self {
            model: "gpt-4.1".to_string(),
            provider,
            fallback_provider: None,
            allowed_roots: vec![cwd.clone()],
            cwd,
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            use_default_allow: true,
            use_default_deny: true,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            keep_recent_segments: DEFAULT_KEEP_RECENT_SEGMENTS,
            instructions: String::new(),
            response_schema: None,
            extra_overflow_markers: Vec::new(),
            plan: scout_plan::RuntimeOptions::default(),
        }
    }

    /// Build the permission policy this configuration describes.
    pub fn policy(&self) -> Arc<Policy> {
        let mut builder = Policy::builder()
            .allow(self.allow_patterns.iter().cloned())
            .deny(self.deny_patterns.iter().cloned());
        if !self.use_default_allow {
            builder = builder.without_default_allow();
        }
        if !self.use_default_deny {
            builder = builder.without_default_deny();
        }
        Arc::new(builder.build())
    }
}
