//! Outbound LLM client: generate -> validate -> repair loop against a
//! caller-supplied JSON schema (spec §4.10). Transport failures are
//! surfaced immediately as transient errors; only schema failures
//! consume the two-attempt repair budget.

use async_trait::async_trait;
use jsonschema::Validator;
use lw_core::PipelineError;
use serde_json::Value;

#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, PipelineError>;
}

#[derive(Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

pub struct ReqwestLlmTransport {
    http: reqwest::Client,
    cfg: LlmConfig,
}

impl ReqwestLlmTransport {
    pub fn new(http: reqwest::Client, cfg: LlmConfig) -> Self {
        Self { http, cfg }
    }
}

#[async_trait]
impl LlmTransport for ReqwestLlmTransport {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, PipelineError> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.cfg.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| PipelineError::transient("llm_http", err.to_string(), None))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_http_status("llm_http", status, body));
        }

        let parsed: Value = resp
            .json()
            .await
            .map_err(|err| PipelineError::transient("llm_http", err.to_string(), None))?;
        parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::transient("llm_http", "response missing choices[0].message.content", None))
    }
}

/// Strips a fenced ```json ... ``` (or bare ```...```) wrapper before
/// parsing, tolerating models that wrap their output in markdown.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_prefix.strip_suffix("```").unwrap_or(without_prefix).trim()
}

fn parse_json(raw: &str) -> Option<Value> {
    serde_json::from_str(strip_fence(raw)).ok()
}

/// Deterministic head+tail truncation for large inputs (meeting
/// transcripts). Keeps the first and last halves of the budget with an
/// elision marker between.
pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let marker = "\n...[truncated]...\n";
    let half = max_chars / 2;
    let chars: Vec<char> = input.chars().collect();
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    format!("{head}{marker}{tail}")
}

/// Object-safe facade over [`LlmClient`] so callers that need dynamic
/// dispatch (handlers holding an `Arc<dyn Extractor>`, swappable between
/// a real transport and a test double) don't need to be generic over
/// the transport type themselves.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, system_prompt: &str, user_prompt: &str, schema: &Value) -> Result<Value, PipelineError>;
}

pub struct LlmClient<T: LlmTransport = ReqwestLlmTransport> {
    transport: T,
}

#[async_trait]
impl<T: LlmTransport> Extractor for LlmClient<T> {
    async fn extract(&self, system_prompt: &str, user_prompt: &str, schema: &Value) -> Result<Value, PipelineError> {
        LlmClient::extract(self, system_prompt, user_prompt, schema).await
    }
}

impl<T: LlmTransport> LlmClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Runs the generate -> validate -> repair loop. `schema` is compiled
    /// once per call since it varies by caller (unlike the fixed schema
    /// this pattern is otherwise grounded on).
    pub async fn extract(&self, system_prompt: &str, user_prompt: &str, schema: &Value) -> Result<Value, PipelineError> {
        let compiled = Validator::new(schema)
            .map_err(|err| PipelineError::permanent("llm_schema_compile", err.to_string()))?;

        let first_raw = self.transport.complete(system_prompt, user_prompt).await?;
        if let Some(value) = parse_json(&first_raw) {
            if compiled.is_valid(&value) {
                return Ok(value);
            }
            let errors = validation_errors(&compiled, &value);
            return self.repair(system_prompt, &first_raw, &errors, &compiled).await;
        }
        self.repair(system_prompt, &first_raw, "output was not valid JSON", &compiled).await
    }

    async fn repair(
        &self,
        system_prompt: &str,
        previous_raw: &str,
        errors: &str,
        compiled: &Validator,
    ) -> Result<Value, PipelineError> {
        let repair_prompt = format!(
            "Your previous output failed schema validation.\n\nPrevious output:\n{previous_raw}\n\nValidation errors:\n{errors}\n\nReturn corrected JSON only, matching the schema exactly."
        );
        let second_raw = self.transport.complete(system_prompt, &repair_prompt).await?;
        match parse_json(&second_raw) {
            Some(value) if compiled.is_valid(&value) => Ok(value),
            _ => Err(PipelineError::permanent(
                "llm_schema_invalid",
                format!("output failed schema validation after repair attempt: {errors}"),
            )),
        }
    }
}

fn validation_errors(compiled: &Validator, value: &Value) -> String {
    compiled
        .iter_errors(value)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct ScriptedTransport {
        responses: Mutex<Vec<Result<String, PipelineError>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<String, PipelineError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, PipelineError> {
            *self.calls.lock().unwrap() += 1;
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        })
    }

    #[tokio::test]
    async fn extract_succeeds_on_first_valid_response() {
        let transport = ScriptedTransport::new(vec![Ok(r#"{"name":"Ada"}"#.to_string())]);
        let client = LlmClient::new(transport);
        let value = client.extract("sys", "user", &schema()).await.unwrap();
        assert_eq!(value["name"], "Ada");
    }

    #[tokio::test]
    async fn extract_repairs_after_one_invalid_response() {
        let transport = ScriptedTransport::new(vec![
            Ok(r#"{"wrong":1}"#.to_string()),
            Ok(r#"{"name":"Ada"}"#.to_string()),
        ]);
        let client = LlmClient::new(transport);
        let value = client.extract("sys", "user", &schema()).await.unwrap();
        assert_eq!(value["name"], "Ada");
    }

    #[tokio::test]
    async fn extract_fails_permanently_after_two_invalid_responses() {
        let transport = ScriptedTransport::new(vec![Ok("not json".to_string()), Ok("still not json".to_string())]);
        let client = LlmClient::new(transport);
        let err = client.extract("sys", "user", &schema()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Permanent { ref code, .. } if code == "llm_schema_invalid"));
    }

    #[tokio::test]
    async fn transport_error_is_surfaced_immediately_without_repair() {
        let transport = ScriptedTransport::new(vec![Err(PipelineError::transient("llm_http", "timeout", None))]);
        let calls = transport.calls.clone();
        let client = LlmClient::new(transport);
        let err = client.extract("sys", "user", &schema()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn truncate_keeps_head_and_tail_with_marker() {
        let input = "a".repeat(100);
        let out = truncate(&input, 20);
        assert!(out.contains("...[truncated]..."));
        assert!(out.starts_with("aaaaaaaaaa"));
    }

    #[test]
    fn truncate_is_noop_under_budget() {
        assert_eq!(truncate("short", 100), "short");
    }

    #[test]
    fn strip_fence_removes_json_code_block() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_fence(raw), "{\"a\":1}");
    }
}
