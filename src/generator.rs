//! External collaborator clients
//!
//! The LLM script-generation service and the page-discovery service are
//! black boxes behind HTTP. Their output is untrusted: everything that
//! comes back goes through DSL/eval validation before it reaches a
//! caller or a database row.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::models::ScriptType;
use crate::preparator::ViewportSpec;
use crate::WorkerError;

/// What kind of script generation is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Instruction,
    Test,
}

#[derive(Debug, Serialize)]
pub struct GenerationRequest {
    pub page_url: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<ViewportSpec>,
    pub script_type: ScriptType,
    pub kind: GenerationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedScript {
    pub script: String,
    pub script_type: ScriptType,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPage {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPages {
    pub pages: Vec<DiscoveredPage>,
    #[serde(default)]
    pub total_found: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CollaboratorReply<T> {
    Ok(T),
    Err { error: String },
}

#[derive(Clone)]
pub struct ScriptGenerator {
    client: reqwest::Client,
    generator_url: Option<String>,
    discovery_url: Option<String>,
}

impl ScriptGenerator {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.generation_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            generator_url: config.generator_url.clone(),
            discovery_url: config.discovery_url.clone(),
        }
    }

    /// Ask the LLM collaborator for a script. The reply is raw; callers
    /// validate before using or persisting it.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedScript, WorkerError> {
        let base = self
            .generator_url
            .as_deref()
            .ok_or_else(|| WorkerError::Collaborator("no generator service configured".into()))?;

        debug!(
            "requesting {:?} {:?} script for {}",
            request.kind, request.script_type, request.page_url
        );
        let reply: CollaboratorReply<GeneratedScript> = self
            .client
            .post(format!("{base}/generate"))
            .json(request)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| WorkerError::Collaborator(e.to_string()))?
            .json()
            .await?;

        match reply {
            CollaboratorReply::Ok(script) => Ok(script),
            CollaboratorReply::Err { error } => Err(WorkerError::Collaborator(error)),
        }
    }

    pub async fn discover_pages(
        &self,
        domain: &str,
        max_pages: Option<u32>,
    ) -> Result<DiscoveredPages, WorkerError> {
        let base = self
            .discovery_url
            .as_deref()
            .ok_or_else(|| WorkerError::Collaborator("no discovery service configured".into()))?;

        let reply: CollaboratorReply<DiscoveredPages> = self
            .client
            .post(format!("{base}/discover"))
            .json(&serde_json::json!({ "domain": domain, "max_pages": max_pages }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| WorkerError::Collaborator(e.to_string()))?
            .json()
            .await?;

        match reply {
            CollaboratorReply::Ok(pages) => Ok(pages),
            CollaboratorReply::Err { error } => Err(WorkerError::Collaborator(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_generator_refuses() {
        let generator = ScriptGenerator::new(&Config::default());
        let request = GenerationRequest {
            page_url: "https://example.test/".to_string(),
            prompt: "accept the newsletter modal".to_string(),
            viewport: None,
            script_type: ScriptType::Actions,
            kind: GenerationKind::Instruction,
            session_id: None,
        };
        let err = tokio_test::block_on(generator.generate(&request)).unwrap_err();
        assert!(matches!(err, WorkerError::Collaborator(_)));
    }

    #[test]
    fn generated_script_deserializes() {
        let raw = r#"{"script": "{\"steps\":[]}", "script_type": "actions", "explanation": "x"}"#;
        let script: GeneratedScript = serde_json::from_str(raw).unwrap();
        assert_eq!(script.script_type, ScriptType::Actions);
        assert_eq!(script.explanation.as_deref(), Some("x"));
    }

    #[test]
    fn request_serializes_viewport_tag() {
        let request = GenerationRequest {
            page_url: "https://example.test/".to_string(),
            prompt: "p".to_string(),
            viewport: Some(ViewportSpec::Tag(crate::models::ViewportTag::Mobile)),
            script_type: ScriptType::Eval,
            kind: GenerationKind::Test,
            session_id: Some("s-1".to_string()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["viewport"], "mobile");
        assert_eq!(value["kind"], "test");
    }
}
