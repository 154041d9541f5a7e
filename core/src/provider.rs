use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::EnvVarError;
use crate::error::Result;
use crate::error::ScoutErr;

/// Wire protocol spoken to the provider. All built-in providers speak the
/// chat-completions SSE dialect; the enum leaves room for others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireApi {
    Chat,
}

/// One LLM service endpoint. The core treats providers as interchangeable
/// modulo their error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProviderInfo {
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the API key; `None` for keyless local
    /// providers.
    pub env_key: Option<String>,
    pub wire_api: WireApi,
}

impl ModelProviderInfo {
    /// Resolve the API key, or fail with instructions when it is required
    /// but unset.
    pub fn api_key(&self) -> Result<Option<String>> {
        let Some(env_key) = &self.env_key else {
            return Ok(None);
        };
        match std::env::var(env_key) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
            _ => Err(ScoutErr::EnvVar(EnvVarError {
                var: env_key.clone(),
                instructions: Some(format!(
                    "Set `{env_key}` to use the `{}` provider.",
                    self.name
                )),
            })),
        }
    }
}

pub fn built_in_model_providers() -> HashMap<String, ModelProviderInfo> {
    [
        (
            "openai",
            ModelProviderInfo {
                name: "OpenAI".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                env_key: Some("OPENAI_API_KEY".to_string()),
                wire_api: WireApi::Chat,
            },
        ),
        (
            "ollama",
            ModelProviderInfo {
                name: "Ollama".to_string(),
                base_url: "http://localhost:11434/v1".to_string(),
                env_key: None,
                wire_api: WireApi::Chat,
            },
        ),
    ]
    .into_iter()
    .map(|(id, provider)| (id.to_string(), provider))
    .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn built_in_providers_include_a_keyless_local_option() {
        let providers = built_in_model_providers();
        assert!(providers.contains_key("openai"));
        let ollama = providers.get("ollama").unwrap();
        assert!(ollama.env_key.is_none());
        assert!(ollama.api_key().unwrap().is_none());
    }
}
