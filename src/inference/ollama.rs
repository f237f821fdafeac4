//! Ollama `/api/generate` client for a vision-language model.
//!
//! The HTTP client has no request timeout; a slow model is waited on until it
//! answers or the caller's cancellation token fires.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ActivityResult, DetectedObject, InferenceError, InferenceProvider};
use crate::config::InferenceConfig;

const PROMPT: &str = "Analyze the screen and extract user activity details.";

/// Longest raw response kept as the summary when structured parsing fails.
const FALLBACK_SUMMARY_CHARS: usize = 500;

const CONTENT_TYPES: &[&str] = &[
    "code", "web", "document", "video", "chat", "email", "image", "other",
];

const ACTIONS: &[&str] = &[
    "reading", "writing", "browsing", "coding", "editing", "watching", "chatting", "searching",
    "other",
];

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    format: Value,
    options: GenerateOptions,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GenerateOptions {
    temperature: f64,
    top_p: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    total_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// Fields the model is asked to fill in.
#[derive(Debug, Deserialize)]
struct StructuredActivity {
    activity_label: String,
    application: String,
    content_type: String,
    topic: String,
    action: String,
    summary: String,
    visible_text: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    detected_objects: Vec<DetectedObject>,
}

pub struct OllamaClient {
    client: Client,
    endpoint: String,
    model: String,
    options: GenerateOptions,
}

impl OllamaClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            options: GenerateOptions {
                temperature: config.temperature,
                top_p: config.top_p,
                num_predict: config.num_predict,
            },
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one analysis, surfacing the failure reason.
    pub async fn generate(
        &self,
        frames: &[Bytes],
        cancel: &CancellationToken,
    ) -> Result<ActivityResult, InferenceError> {
        let frame = select_frame(frames).ok_or(InferenceError::NoFrames)?;
        debug!(frames = frames.len(), model = %self.model, "sending frame to inference backend");

        let body = GenerateRequest {
            model: &self.model,
            prompt: PROMPT,
            images: vec![BASE64.encode(frame)],
            stream: false,
            format: response_schema(),
            options: self.options,
        };

        let url = format!("{}/api/generate", self.endpoint);
        let call = async {
            let resp = self.client.post(&url).json(&body).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(InferenceError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok::<_, InferenceError>(resp.json::<GenerateResponse>().await?)
        };

        let parsed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            r = call => r?,
        };

        if parsed.response.trim().is_empty() {
            return Err(InferenceError::EmptyResponse);
        }
        debug!(
            total_duration_ns = parsed.total_duration,
            response = %parsed.response,
            "inference backend responded"
        );

        Ok(parse_activity(&parsed.response))
    }

    /// Whether the backend is reachable and has the configured model pulled.
    pub async fn health_check(&self) -> Result<bool, InferenceError> {
        let url = format!("{}/api/tags", self.endpoint);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let tags: TagsResponse = resp.json().await?;
        let wanted = self.model.to_ascii_lowercase();
        let present = tags
            .models
            .iter()
            .any(|m| m.name.to_ascii_lowercase().contains(&wanted));

        if !present {
            let available: Vec<&str> = tags.models.iter().map(|m| m.name.as_str()).collect();
            warn!(model = %self.model, ?available, "model not found on inference backend");
        }
        Ok(present)
    }
}

#[async_trait::async_trait]
impl InferenceProvider for OllamaClient {
    async fn analyze(&self, frames: &[Bytes], cancel: &CancellationToken) -> Option<ActivityResult> {
        match self.generate(frames, cancel).await {
            Ok(result) => {
                info!(
                    activity = %result.activity_label,
                    confidence = result.confidence,
                    "inference complete"
                );
                Some(result)
            }
            Err(InferenceError::Cancelled) => {
                debug!("inference cancelled");
                None
            }
            Err(e) => {
                error!(error = %e, "inference failed");
                None
            }
        }
    }
}

/// Only one frame is sent to stay within the model's token budget; the
/// middle one best represents the clip.
fn select_frame(frames: &[Bytes]) -> Option<&Bytes> {
    frames.get(frames.len() / 2)
}

fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "activity_label": { "type": "string" },
            "application": { "type": "string" },
            "content_type": { "type": "string", "enum": CONTENT_TYPES },
            "topic": { "type": "string" },
            "action": { "type": "string", "enum": ACTIONS },
            "summary": { "type": "string" },
            "visible_text": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        },
        "required": [
            "activity_label", "summary", "confidence", "application",
            "content_type", "topic", "action", "visible_text"
        ]
    })
}

/// Turn the model's text into a result, falling back to a low-confidence
/// summary of the raw text when it is not the JSON we asked for.
fn parse_activity(content: &str) -> ActivityResult {
    match serde_json::from_str::<StructuredActivity>(content) {
        Ok(s) => ActivityResult {
            request_id: Uuid::nil(),
            processed_at: Utc::now(),
            activity_label: if s.activity_label.is_empty() {
                "Unknown".to_string()
            } else {
                s.activity_label
            },
            application: s.application,
            content_type: s.content_type,
            topic: s.topic,
            action: s.action,
            summary: s.summary,
            visible_text: s.visible_text,
            confidence: s.confidence,
            detected_objects: s.detected_objects,
            raw_response: Some(content.to_string()),
        }
        .normalized(),
        Err(e) => {
            warn!(error = %e, "structured response did not parse, keeping raw text");
            ActivityResult {
                request_id: Uuid::nil(),
                processed_at: Utc::now(),
                activity_label: "Activity".to_string(),
                application: String::new(),
                content_type: String::new(),
                topic: String::new(),
                action: String::new(),
                summary: truncate_summary(content),
                visible_text: String::new(),
                confidence: 0.5,
                detected_objects: Vec::new(),
                raw_response: Some(content.to_string()),
            }
        }
    }
}

fn truncate_summary(content: &str) -> String {
    if content.chars().count() > FALLBACK_SUMMARY_CHARS {
        let mut s: String = content.chars().take(FALLBACK_SUMMARY_CHARS).collect();
        s.push_str("...");
        s
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::{get, post}, Json, Router};

    const STRUCTURED: &str = r#"{
        "activity_label": "Writing Rust",
        "application": "code",
        "content_type": "code",
        "topic": "priority queues",
        "action": "coding",
        "summary": "Implementing a bounded queue",
        "visible_text": "pub struct PriorityQueue",
        "confidence": 0.87
    }"#;

    #[test]
    fn test_parse_structured_response() {
        let r = parse_activity(STRUCTURED);
        assert_eq!(r.activity_label, "Writing Rust");
        assert_eq!(r.content_type, "code");
        assert_eq!(r.action, "coding");
        assert!((r.confidence - 0.87).abs() < f64::EPSILON);
        assert_eq!(r.raw_response.as_deref(), Some(STRUCTURED));
    }

    #[test]
    fn test_parse_clamps_confidence() {
        let text = STRUCTURED.replace("0.87", "3.5");
        assert_eq!(parse_activity(&text).confidence, 1.0);
    }

    #[test]
    fn test_unstructured_falls_back_to_summary() {
        let r = parse_activity("The user is reading email.");
        assert_eq!(r.activity_label, "Activity");
        assert_eq!(r.summary, "The user is reading email.");
        assert_eq!(r.confidence, 0.5);
    }

    #[test]
    fn test_fallback_summary_truncated() {
        let long = "x".repeat(800);
        let r = parse_activity(&long);
        assert_eq!(r.summary.chars().count(), FALLBACK_SUMMARY_CHARS + 3);
        assert!(r.summary.ends_with("..."));
    }

    #[test]
    fn test_select_middle_frame() {
        let frames: Vec<Bytes> = (0u8..5).map(|i| Bytes::from(vec![i])).collect();
        assert_eq!(select_frame(&frames).unwrap()[0], 2);
        assert!(select_frame(&[]).is_none());
    }

    #[test]
    fn test_schema_requires_all_fields() {
        let schema = response_schema();
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 8);
        assert_eq!(schema["properties"]["action"]["enum"].as_array().unwrap().len(), ACTIONS.len());
    }

    async fn spawn_backend(generate_reply: Value) -> String {
        let app = Router::new()
            .route(
                "/api/generate",
                post(move |Json(body): Json<Value>| {
                    let reply = generate_reply.clone();
                    async move {
                        assert_eq!(body["stream"], false);
                        assert_eq!(body["images"].as_array().map(|a| a.len()), Some(1));
                        Json(reply)
                    }
                }),
            )
            .route(
                "/api/tags",
                get(|| async { Json(json!({ "models": [{ "name": "qwen2.5-vl:3b" }] })) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(endpoint: String) -> OllamaClient {
        OllamaClient::new(&InferenceConfig {
            endpoint,
            ..InferenceConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_generate_against_mock_backend() {
        let endpoint = spawn_backend(json!({ "response": STRUCTURED, "done": true })).await;
        let client = client_for(endpoint);

        let frames = vec![Bytes::from_static(b"jpeg-bytes")];
        let result = client
            .analyze(&frames, &CancellationToken::new())
            .await
            .expect("result");
        assert_eq!(result.topic, "priority queues");
        assert!(client.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_response_is_failure() {
        let endpoint = spawn_backend(json!({ "response": "", "done": true })).await;
        let client = client_for(endpoint);

        let frames = vec![Bytes::from_static(b"jpeg-bytes")];
        let err = client
            .generate(&frames, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_cancelled_before_reply() {
        let client = client_for("http://127.0.0.1:9".to_string());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let frames = vec![Bytes::from_static(b"jpeg-bytes")];
        let err = client.generate(&frames, &cancel).await.unwrap_err();
        assert!(matches!(err, InferenceError::Cancelled));
    }
}
