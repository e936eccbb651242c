//! Prompting the generative backend and parsing what it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::SynthesisError;
use crate::core::program::LANGUAGE_REFERENCE;
use crate::core::shape::Shape;
use crate::core::signature::{fingerprint, FingerprintLimits};
use crate::core::task::{ResolvedArgs, TaskDescription};
use crate::core::validator::Failure;

/// System instructions sent with every request.
pub const SYSTEM_PROMPT: &str = "You write small pure functions in a JSON expression language. \
Answer with a single JSON object {\"program\": PROGRAM, \"explanation\": str, \"complexity\": str} and nothing else.";

/// What the backend sees about one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSample {
    pub name: String,
    pub fingerprint: String,
    /// Truncated literal rendering of the triggering value.
    pub sample: String,
}

/// One request for a candidate implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub signature: String,
    /// Task prompt with placeholders shown by name.
    pub prompt: String,
    pub params: Vec<ParamSample>,
    pub shape: Option<String>,
    pub prior_failure: Option<Failure>,
    /// 1-based attempt number within the current call.
    pub attempt: u32,
}

fn truncate(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

impl SynthesisRequest {
    pub fn new(
        signature: impl Into<String>,
        task: &TaskDescription,
        args: &ResolvedArgs,
        shape: Option<&Shape>,
        limits: &FingerprintLimits,
        sample_chars: usize,
    ) -> Self {
        let params = args
            .iter()
            .map(|(name, value)| ParamSample {
                name: name.to_string(),
                fingerprint: fingerprint(value, limits),
                sample: truncate(value.to_string(), sample_chars),
            })
            .collect();
        Self {
            signature: signature.into(),
            prompt: task.display_with_names(),
            params,
            shape: shape.map(|s| s.to_string()),
            prior_failure: None,
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32, prior_failure: Option<Failure>) -> Self {
        self.attempt = attempt;
        self.prior_failure = prior_failure;
        self
    }

    /// Full user prompt: language reference, task, parameters, shape and feedback.
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(LANGUAGE_REFERENCE);
        prompt.push_str("\nTask: ");
        prompt.push_str(&self.prompt);
        prompt.push_str("\n\nParameters, in order:\n");
        if self.params.is_empty() {
            prompt.push_str("  (none)\n");
        }
        for param in &self.params {
            prompt.push_str(&format!(
                "  {}: {} (example: {})\n",
                param.name, param.fingerprint, param.sample
            ));
        }
        if let Some(shape) = &self.shape {
            prompt.push_str(&format!("\nThe result must have shape: {}\n", shape));
        }
        if let Some(failure) = &self.prior_failure {
            prompt.push_str(&format!(
                "\nA previous attempt was rejected ({}). Fix this: {}\n",
                failure.stage, failure.reason
            ));
        }
        prompt
    }
}

/// Generative backend. Returns raw response text.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn generate(&self, request: &SynthesisRequest) -> Result<String, SynthesisError>;
}

/// A parsed backend answer. Still untrusted.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Program JSON text.
    pub source: String,
    pub explanation: String,
    pub complexity: String,
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // Skip the info string (```json)
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Extracts a [`Candidate`] from backend text, tolerating Markdown fences and chatter
/// around the JSON object.
pub fn parse_response(text: &str) -> Result<Candidate, SynthesisError> {
    let body = strip_fences(text);
    let doc: serde_json::Value = match serde_json::from_str(body) {
        Ok(doc) => doc,
        Err(_) => {
            let object = extract_object(body)
                .ok_or_else(|| SynthesisError::Unparsable("no JSON object in response".to_string()))?;
            serde_json::from_str(object).map_err(|e| SynthesisError::Unparsable(e.to_string()))?
        }
    };

    let source = match doc.get("program") {
        Some(serde_json::Value::String(source)) => source.clone(),
        Some(program @ serde_json::Value::Object(_)) => program.to_string(),
        Some(_) => {
            return Err(SynthesisError::Unparsable(
                "'program' must be an object".to_string(),
            ));
        }
        None => return Err(SynthesisError::Unparsable("missing 'program'".to_string())),
    };
    let text_field = |name: &str| {
        doc.get(name)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Ok(Candidate {
        source,
        explanation: text_field("explanation"),
        complexity: text_field("complexity"),
    })
}

/// Calls the backend under a deadline and parses the answer.
#[derive(Clone)]
pub struct SynthesisClient {
    backend: Arc<dyn SynthesisBackend>,
    timeout: Duration,
}

impl SynthesisClient {
    pub fn new(backend: Arc<dyn SynthesisBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub async fn synthesize(&self, request: &SynthesisRequest) -> Result<Candidate, SynthesisError> {
        log::debug!(
            "Requesting candidate for {} (attempt {})",
            request.signature,
            request.attempt
        );
        let text = tokio::time::timeout(self.timeout, self.backend.generate(request))
            .await
            .map_err(|_| SynthesisError::Timeout(self.timeout))??;
        parse_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Binding;
    use crate::core::validator::FailureStage;
    use serde_json::json;

    fn request() -> SynthesisRequest {
        let task = TaskDescription::parse("merge {a} with {b} and sort").unwrap();
        let args = task
            .bind(&[
                Binding::positional(json!([["x", "y"]])),
                Binding::positional(json!([["z"]])),
            ])
            .unwrap();
        let shape: Shape = "list[str]".parse().unwrap();
        SynthesisRequest::new("abc", &task, &args, Some(&shape), &FingerprintLimits::default(), 8)
    }

    #[test]
    fn test_prompt_carries_params_shape_and_feedback() {
        let request = request().with_attempt(
            2,
            Some(Failure::new(FailureStage::Structural, "result is nested")),
        );
        let prompt = request.render_prompt();
        assert!(prompt.contains("merge {a} with {b} and sort"));
        assert!(prompt.contains("a: list[list[str]]"));
        assert!(prompt.contains("shape: list[str]"));
        assert!(prompt.contains("result is nested"));
        // Samples are truncated
        assert_eq!(request.params[0].sample, "[[\"x\",\"y...");
    }

    #[test]
    fn test_parse_fenced_response() {
        let text = "Here you go:\n```json\n{\"program\": {\"params\": [], \"body\": 1}, \"explanation\": \"one\", \"complexity\": \"O(1)\"}\n```\n";
        let candidate = parse_response(text).unwrap();
        assert_eq!(candidate.explanation, "one");
        assert_eq!(candidate.complexity, "O(1)");
        let program: serde_json::Value = serde_json::from_str(&candidate.source).unwrap();
        assert_eq!(program["body"], json!(1));
    }

    #[test]
    fn test_parse_with_chatter() {
        let text = "Sure! {\"program\": {\"params\": [], \"body\": 2}} Hope this helps.";
        assert!(parse_response(text).is_ok());
    }

    #[test]
    fn test_unparsable_responses() {
        assert!(matches!(parse_response("I cannot do that"), Err(SynthesisError::Unparsable(_))));
        assert!(matches!(
            parse_response("{\"explanation\": \"no program\"}"),
            Err(SynthesisError::Unparsable(_))
        ));
        assert!(matches!(parse_response("{\"program\": 3}"), Err(SynthesisError::Unparsable(_))));
    }

    struct Slow;

    #[async_trait]
    impl SynthesisBackend for Slow {
        async fn generate(&self, _request: &SynthesisRequest) -> Result<String, SynthesisError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_client_times_out() {
        let client = SynthesisClient::new(Arc::new(Slow), Duration::from_millis(10));
        let result = client.synthesize(&request()).await;
        assert_eq!(result, Err(SynthesisError::Timeout(Duration::from_millis(10))));
    }
}
