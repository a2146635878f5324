use crate::fallback;
use crate::inference::{InferenceClient, InferenceConfig, TextGeneration};
use crate::models::{EnhanceResponse, ProductDraft, StageReport, TrendAssessment, WorkflowResult};
use crate::parser;
use crate::prompts::{self, PromptExtra, Task};
use serde_json::{Value, json};
use std::{env, future::Future, sync::Arc, time::Duration, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const PLACEHOLDER_IMAGE_URL: &str =
    "https://images.unsplash.com/photo-1586023492125-27b2c045efd7?w=400";

/// Message surfaced for faults that no stage fallback can absorb.
pub const GENERIC_FAILURE: &str = "unknown error";

/// Model lists shorter than this count as a parse miss.
pub const MIN_PARSED_ITEMS: usize = 3;
pub const MAX_LIST_ITEMS: usize = 5;

#[derive(Clone)]
pub struct Workflow {
    pub config: Arc<WorkflowConfig>,
    pub inference: Arc<dyn TextGeneration>,
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub stage_timeout: Duration,
    pub placeholder_image: String,
    pub image_allowlist: Option<Vec<String>>,
}

impl WorkflowConfig {
    pub fn from_env(stage_timeout: Duration) -> Self {
        Self {
            stage_timeout,
            placeholder_image: env::var("PLACEHOLDER_IMAGE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| PLACEHOLDER_IMAGE_URL.into()),
            image_allowlist: image_domain_allowlist(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_millis(crate::inference::huggingface::DEFAULT_TIMEOUT_MS),
            placeholder_image: PLACEHOLDER_IMAGE_URL.into(),
            image_allowlist: None,
        }
    }
}

impl Workflow {
    pub fn new(config: WorkflowConfig, inference: Arc<dyn TextGeneration>) -> Self {
        Self {
            config: Arc::new(config),
            inference,
        }
    }

    pub fn from_env() -> Self {
        let inference_config = InferenceConfig::from_env();
        let config = WorkflowConfig::from_env(inference_config.timeout());
        let client = InferenceClient::new(inference_config);
        if !client.has_credentials() {
            info!(
                target = "artisan.workflow",
                "HF_API_TOKEN not set; running with local fallbacks only"
            );
        }
        Self::new(config, Arc::new(client))
    }

    /// Fallback-only workflow; never touches the network.
    #[allow(dead_code)]
    pub fn offline() -> Self {
        Self::new(
            WorkflowConfig::default(),
            Arc::new(InferenceClient::new(InferenceConfig::offline())),
        )
    }

    /// Sanitizes and validates the draft, then returns it with the checked
    /// image URL. Stage endpoints share this entry check with `run`.
    pub fn prepare(
        &self,
        draft: &ProductDraft,
        image: Option<&str>,
    ) -> Result<(ProductDraft, Option<String>), WorkflowError> {
        let draft = draft.sanitized();
        draft
            .validate()
            .map_err(|field| WorkflowError::invalid_input("validate", field))?;
        let image = stages::check_image(image, self.config.image_allowlist.as_deref())?;
        Ok((draft, image))
    }

    /// Runs story → trend → price → image → recommendations. Each stage
    /// resolves to a model value or its fallback before the next starts, so
    /// the only errors are rejected input.
    pub async fn run(
        &self,
        draft: ProductDraft,
        image: Option<String>,
    ) -> Result<EnhanceResponse, WorkflowError> {
        let (draft, image) = self.prepare(&draft, image.as_deref())?;
        let run_id = format!("ENH-{}", Uuid::new_v4().simple());
        let timeout = self.config.stage_timeout;
        let inference = self.inference.as_ref();
        let mut reports = Vec::new();

        let story = self
            .capture_stage(
                "story",
                &mut reports,
                stages::story(inference, &draft, timeout),
            )
            .await;

        let trend = self
            .capture_stage(
                "trend",
                &mut reports,
                stages::trend(inference, &draft, timeout),
            )
            .await;

        let final_price = self
            .capture_stage(
                "price",
                &mut reports,
                stages::price(inference, &draft, trend.score, timeout),
            )
            .await;

        let final_image = self
            .capture_stage("image", &mut reports, async {
                stages::image(image.clone(), &self.config.placeholder_image)
            })
            .await;

        let actionable_tips = self
            .capture_stage(
                "recommendations",
                &mut reports,
                stages::recommendations(
                    inference,
                    &draft,
                    &story,
                    &trend,
                    final_price,
                    timeout,
                ),
            )
            .await;

        info!(
            target = "artisan.workflow",
            run_id = %run_id,
            trend_score = trend.score,
            final_price,
            tips = actionable_tips.len(),
            "workflow_completed"
        );

        Ok(EnhanceResponse {
            run_id,
            result: WorkflowResult {
                story,
                trend,
                final_price,
                final_image,
                actionable_tips,
            },
            stages: reports,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        reports: &mut Vec<StageReport>,
        fut: Fut,
    ) -> T
    where
        Fut: Future<Output = StageOutcome<T>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        if outcome.used_fallback {
            crate::metrics::fallback_used(name);
        }
        reports.push(StageReport::new(name, elapsed_ms, outcome.output));
        outcome.value
    }
}

fn image_domain_allowlist() -> Option<Vec<String>> {
    env::var("IMAGE_DOMAIN_ALLOWLIST")
        .ok()
        .map(|v| {
            v.split([',', ' ', '\n', '\t'])
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct WorkflowError {
    stage: &'static str,
    message: String,
    kind: WorkflowErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowErrorKind {
    InvalidInput,
    Internal,
}

impl WorkflowError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: WorkflowErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: WorkflowErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> WorkflowErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
    pub used_fallback: bool,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value, used_fallback: bool) -> Self {
        Self {
            value,
            output,
            used_fallback,
        }
    }
}

pub mod stages {
    use super::*;

    /// One inference attempt; transport faults collapse into `None`.
    async fn attempt(
        inference: &dyn TextGeneration,
        task: Task,
        prompt: &prompts::Prompt,
        timeout: Duration,
    ) -> Option<String> {
        match inference.infer(task, prompt, timeout).await {
            Ok(text) => text,
            Err(err) => {
                warn!(target = "artisan.inference", %task, error = %err, "inference_failed_using_fallback");
                None
            }
        }
    }

    fn source(from_model: bool) -> &'static str {
        if from_model { "model" } else { "fallback" }
    }

    pub async fn story(
        inference: &dyn TextGeneration,
        draft: &ProductDraft,
        timeout: Duration,
    ) -> StageOutcome<String> {
        let prompt = prompts::build(Task::Story, draft, &PromptExtra::default());
        let generated = attempt(inference, Task::Story, &prompt, timeout).await;
        let from_model = generated.is_some();
        let story = generated.unwrap_or_else(|| fallback::story(draft));
        StageOutcome::new(
            story.clone(),
            json!({
                "source": source(from_model),
                "words": story.split_whitespace().count(),
            }),
            !from_model,
        )
    }

    /// Score and recommendations fall back independently of each other.
    pub async fn trend(
        inference: &dyn TextGeneration,
        draft: &ProductDraft,
        timeout: Duration,
    ) -> StageOutcome<TrendAssessment> {
        let prompt = prompts::build(Task::Trend, draft, &PromptExtra::default());
        let generated = attempt(inference, Task::Trend, &prompt, timeout).await;

        let parsed_score = generated.as_deref().and_then(parser::parse_score);
        let parsed_list = generated
            .as_deref()
            .map(|text| parser::parse_list(text, MAX_LIST_ITEMS))
            .filter(|items| items.len() >= MIN_PARSED_ITEMS);

        let score_from_model = parsed_score.is_some();
        let list_from_model = parsed_list.is_some();
        let assessment = TrendAssessment {
            score: parsed_score
                .unwrap_or_else(|| fallback::trend_score_for_category(&draft.category)),
            recommendations: parsed_list
                .unwrap_or_else(|| fallback::marketing_recommendations(&draft.category)),
        };

        StageOutcome::new(
            assessment.clone(),
            json!({
                "score": assessment.score,
                "score_source": source(score_from_model),
                "recommendations": assessment.recommendations.len(),
                "recommendations_source": source(list_from_model),
            }),
            !(score_from_model && list_from_model),
        )
    }

    pub async fn price(
        inference: &dyn TextGeneration,
        draft: &ProductDraft,
        trend_score: f64,
        timeout: Duration,
    ) -> StageOutcome<f64> {
        let extra = PromptExtra {
            trend_score: Some(trend_score),
            ..Default::default()
        };
        let prompt = prompts::build(Task::Price, draft, &extra);
        let parsed = attempt(inference, Task::Price, &prompt, timeout)
            .await
            .as_deref()
            .and_then(parser::parse_price);

        let (price, origin) = match parsed {
            Some(value) => (value, "model"),
            None => {
                let optimized = fallback::price(draft.price, trend_score);
                if optimized.is_finite() && optimized > 0.0 {
                    (optimized, "fallback")
                } else {
                    (draft.price, "input")
                }
            }
        };

        StageOutcome::new(
            price,
            json!({
                "source": origin,
                "input_price": draft.price,
                "final_price": price,
                "display": crate::text::format_inr(price),
            }),
            parsed.is_none(),
        )
    }

    pub fn image(supplied: Option<String>, placeholder: &str) -> StageOutcome<String> {
        let (url, origin) = match supplied {
            Some(url) => (url, "supplied"),
            None => (placeholder.to_string(), "placeholder"),
        };
        StageOutcome::new(
            url.clone(),
            json!({ "source": origin, "url": url }),
            false,
        )
    }

    pub async fn recommendations(
        inference: &dyn TextGeneration,
        draft: &ProductDraft,
        story: &str,
        trend: &TrendAssessment,
        recommended_price: f64,
        timeout: Duration,
    ) -> StageOutcome<Vec<String>> {
        let extra = PromptExtra {
            story: Some(story),
            trend_score: Some(trend.score),
            recommended_price: Some(recommended_price),
            marketing_recommendations: &trend.recommendations,
        };
        let prompt = prompts::build(Task::Recommendations, draft, &extra);
        let parsed = attempt(inference, Task::Recommendations, &prompt, timeout)
            .await
            .map(|text| parser::parse_list(&text, MAX_LIST_ITEMS))
            .filter(|items| items.len() >= MIN_PARSED_ITEMS);

        let from_model = parsed.is_some();
        let tips = parsed.unwrap_or_else(|| {
            fallback::recommendations(&trend.recommendations, recommended_price)
        });
        StageOutcome::new(
            tips.clone(),
            json!({
                "source": source(from_model),
                "count": tips.len(),
            }),
            !from_model,
        )
    }

    /// Accepts only http(s) URLs, optionally restricted to allowlisted hosts.
    pub fn check_image(
        image: Option<&str>,
        allowlist: Option<&[String]>,
    ) -> Result<Option<String>, WorkflowError> {
        let Some(url) = image.map(str::trim).filter(|url| !url.is_empty()) else {
            return Ok(None);
        };
        let parsed = reqwest::Url::parse(url)
            .map_err(|_| WorkflowError::invalid_input("image", format!("invalid_image_url: {url}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(WorkflowError::invalid_input(
                "image",
                format!("unsupported_url_scheme: {url}"),
            ));
        }
        if let Some(allowed) = allowlist
            && let Some(host) = parsed.host_str()
            && !host_allowed(host, allowed)
        {
            return Err(WorkflowError::invalid_input(
                "image",
                format!("domain_not_allowed: {host}"),
            ));
        }
        Ok(Some(url.to_string()))
    }

    fn host_allowed(host: &str, allowed: &[String]) -> bool {
        let host = host.to_lowercase();
        allowed
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }
}
