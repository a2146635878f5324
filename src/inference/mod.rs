pub mod huggingface;

pub use huggingface::{InferenceClient, InferenceConfig, InferenceError};

use crate::prompts::{Prompt, Task};
use async_trait::async_trait;
use std::time::Duration;

/// The single I/O boundary of the enhancement workflow.
///
/// `Ok(None)` means "no usable text": no credential configured, timeout,
/// non-success status, or a model that is still loading. `Err` is reserved
/// for unexpected transport faults; callers treat it exactly like `None`.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    async fn infer(
        &self,
        task: Task,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<Option<String>, InferenceError>;
}

#[async_trait]
impl TextGeneration for InferenceClient {
    async fn infer(
        &self,
        task: Task,
        prompt: &Prompt,
        timeout: Duration,
    ) -> Result<Option<String>, InferenceError> {
        InferenceClient::infer(self, task, prompt, timeout).await
    }
}
