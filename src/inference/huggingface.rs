use crate::http::build_client;
use crate::prompts::{GenerationParams, Prompt, Task};
use crate::text::truncate_text;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co/models";
pub const DEFAULT_MODEL: &str = "mistralai/Mistral-7B-Instruct-v0.2";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
}

impl InferenceConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("HF_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            api_token: std::env::var("HF_API_TOKEN")
                .ok()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            model: std::env::var("HF_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            timeout_ms: std::env::var("INFERENCE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Fallback-only configuration: every call short-circuits to `None`.
    pub fn offline() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_token: None,
            model: DEFAULT_MODEL.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.model.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub struct InferenceClient {
    http: Client,
    config: InferenceConfig,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig) -> Self {
        Self::with_http(config, build_client())
    }

    pub fn with_http(config: InferenceConfig, http: Client) -> Self {
        Self { http, config }
    }

    pub fn has_credentials(&self) -> bool {
        self.config.api_token.is_some()
    }

    /// One attempt, no retries. See [`super::TextGeneration`] for how the
    /// `Ok(None)` / `Err` split is meant to be read.
    pub async fn infer(
        &self,
        task: Task,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<Option<String>, InferenceError> {
        let Some(token) = self.config.api_token.as_deref() else {
            debug!(target = "artisan.inference", %task, "no_api_token_using_fallback");
            return Ok(None);
        };

        let body = InferenceRequest {
            inputs: &prompt.inputs,
            parameters: prompt.parameters,
        };
        let request = self
            .http
            .post(self.config.endpoint())
            .bearer_auth(token)
            .json(&body);

        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|err| InferenceError::Http(err.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|err| InferenceError::Http(err.to_string()))?;
            Ok::<_, InferenceError>((status, text))
        };

        let (status, raw) = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    target = "artisan.inference",
                    %task,
                    timeout_ms = timeout.as_millis() as u64,
                    "inference_timeout_using_fallback"
                );
                return Ok(None);
            }
        };

        if !status.is_success() {
            warn!(
                target = "artisan.inference",
                %task,
                status = status.as_u16(),
                "inference_status_using_fallback"
            );
            return Ok(None);
        }

        let payload: InferenceResponse = serde_json::from_str(&raw).map_err(|err| {
            InferenceError::InvalidResponse(format!("{err}: {}", truncate_text(&raw, 120)))
        })?;

        match payload {
            InferenceResponse::Generated(items) => {
                let text = items
                    .into_iter()
                    .next()
                    .map(|item| item.generated_text.trim().to_string())
                    .filter(|text| !text.is_empty());
                if text.is_none() {
                    debug!(target = "artisan.inference", %task, "inference_empty_text");
                }
                Ok(text)
            }
            InferenceResponse::Failure { error } => {
                if error.contains("loading") {
                    warn!(target = "artisan.inference", %task, "model_loading_using_fallback");
                } else {
                    warn!(target = "artisan.inference", %task, error = %error, "inference_error_payload");
                }
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    parameters: GenerationParams,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Generated(Vec<GeneratedText>),
    Failure { error: String },
}

#[derive(Debug, Deserialize)]
struct GeneratedText {
    #[serde(default)]
    generated_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductDraft;
    use crate::prompts::{PromptExtra, build};
    use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::post};
    use serde_json::{Value, json};

    async fn spawn_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn client_for(base_url: String, token: Option<&str>) -> InferenceClient {
        let config = InferenceConfig {
            base_url,
            api_token: token.map(str::to_string),
            model: "artisan-test-model".into(),
            timeout_ms: 2_000,
        };
        let http = Client::builder().no_proxy().build().expect("client");
        InferenceClient::with_http(config, http)
    }

    fn story_prompt() -> Prompt {
        let draft = ProductDraft {
            name: "Ceramic Vase".into(),
            category: "Pottery & Ceramics".into(),
            description: "hand-thrown".into(),
            tags: vec![],
            price: 45.99,
        };
        build(Task::Story, &draft, &PromptExtra::default())
    }

    #[tokio::test]
    async fn missing_token_short_circuits() {
        // Port 9 is never contacted; a network attempt would surface as Err.
        let client = client_for("http://127.0.0.1:9".into(), None);
        let out = client
            .infer(Task::Story, &story_prompt(), Duration::from_millis(50))
            .await
            .expect("no error");
        assert!(out.is_none());
        assert!(!client.has_credentials());
    }

    #[tokio::test]
    async fn returns_generated_text_and_sends_bearer() {
        let router = Router::new().route(
            "/artisan-test-model",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let ok = auth == "Bearer hf-test"
                    && body["parameters"]["return_full_text"] == json!(false)
                    && body["parameters"]["max_new_tokens"] == json!(300)
                    && body["inputs"].as_str().unwrap_or_default().contains("Ceramic Vase");
                let text = if ok { "  A vase shaped by hand.  " } else { "bad request" };
                Json(json!([{ "generated_text": text }]))
            }),
        );
        let base = spawn_mock(router).await;
        let client = client_for(base, Some("hf-test"));
        let out = client
            .infer(Task::Story, &story_prompt(), Duration::from_secs(2))
            .await
            .expect("infer");
        assert_eq!(out.as_deref(), Some("A vase shaped by hand."));
    }

    #[tokio::test]
    async fn loading_model_is_none() {
        let router = Router::new().route(
            "/artisan-test-model",
            post(|| async { Json(json!({ "error": "Model artisan-test-model is currently loading" })) }),
        );
        let client = client_for(spawn_mock(router).await, Some("hf-test"));
        let out = client
            .infer(Task::Trend, &story_prompt(), Duration::from_secs(2))
            .await
            .expect("infer");
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_none() {
        let router = Router::new().route(
            "/artisan-test-model",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let client = client_for(spawn_mock(router).await, Some("hf-test"));
        let out = client
            .infer(Task::Price, &story_prompt(), Duration::from_secs(2))
            .await
            .expect("infer");
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_to_none() {
        let router = Router::new().route(
            "/artisan-test-model",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Json(json!([{ "generated_text": "too late" }]))
            }),
        );
        let client = client_for(spawn_mock(router).await, Some("hf-test"));
        let out = client
            .infer(Task::Story, &story_prompt(), Duration::from_millis(50))
            .await
            .expect("timeout is not an error");
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn empty_generation_is_none() {
        let router = Router::new().route(
            "/artisan-test-model",
            post(|| async { Json(json!([{ "generated_text": "   " }])) }),
        );
        let client = client_for(spawn_mock(router).await, Some("hf-test"));
        let out = client
            .infer(Task::Story, &story_prompt(), Duration::from_secs(2))
            .await
            .expect("infer");
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let router = Router::new().route("/artisan-test-model", post(|| async { "<html>oops</html>" }));
        let client = client_for(spawn_mock(router).await, Some("hf-test"));
        let err = client
            .infer(Task::Story, &story_prompt(), Duration::from_secs(2))
            .await
            .expect_err("should fail");
        assert!(matches!(err, InferenceError::InvalidResponse(_)));
    }

    #[test]
    fn endpoint_joins_base_and_model() {
        let config = InferenceConfig {
            base_url: "https://hf.example/models/".into(),
            ..InferenceConfig::offline()
        };
        assert_eq!(
            config.endpoint(),
            "https://hf.example/models/mistralai/Mistral-7B-Instruct-v0.2"
        );
    }
}
