//! Prompt templates for the four model-backed workflow stages.

use crate::models::ProductDraft;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Story,
    Trend,
    Price,
    Recommendations,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Story => "story",
            Task::Trend => "trend",
            Task::Price => "price",
            Task::Recommendations => "recommendations",
        }
    }

    /// Sampling parameters per task. Price extraction runs cold to keep the
    /// answer a bare number; the story runs warmest.
    pub fn params(&self) -> GenerationParams {
        match self {
            Task::Story => GenerationParams::new(300, 0.7, 0.9),
            Task::Trend => GenerationParams::new(400, 0.5, 0.9),
            Task::Price => GenerationParams::new(50, 0.3, 0.9),
            Task::Recommendations => GenerationParams::new(400, 0.5, 0.9),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub return_full_text: bool,
}

impl GenerationParams {
    const fn new(max_new_tokens: u32, temperature: f32, top_p: f32) -> Self {
        Self {
            max_new_tokens,
            temperature,
            top_p,
            return_full_text: false,
        }
    }
}

/// A single instruction plus the sampling parameters it should be sent with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub inputs: String,
    pub parameters: GenerationParams,
}

/// Outputs of earlier stages that later prompts depend on.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptExtra<'a> {
    pub story: Option<&'a str>,
    pub trend_score: Option<f64>,
    pub recommended_price: Option<f64>,
    pub marketing_recommendations: &'a [String],
}

pub fn build(task: Task, draft: &ProductDraft, extra: &PromptExtra<'_>) -> Prompt {
    let instruction = match task {
        Task::Story => story_instruction(draft),
        Task::Trend => trend_instruction(draft),
        Task::Price => price_instruction(draft, extra.trend_score),
        Task::Recommendations => recommendations_instruction(draft, extra),
    };
    Prompt {
        inputs: format!("<s>[INST] {instruction} [/INST]"),
        parameters: task.params(),
    }
}

fn story_instruction(draft: &ProductDraft) -> String {
    format!(
        "Create a compelling product description for {name}, which is a {category}. \
         The product is described as: {description}. \
         Focus on the craftsmanship, uniqueness, and appeal to potential buyers. \
         Keep it under 200 words.",
        name = draft.name,
        category = draft.category,
        description = draft.description,
    )
}

fn trend_instruction(draft: &ProductDraft) -> String {
    format!(
        "Analyze the market trends for {category} products. \
         Consider factors like seasonal demand, target demographics, and current market interest. \
         Provide a trend score between 0 and 1 (where 1 is highest demand), \
         and 5 specific marketing recommendations for selling this type of product.",
        category = draft.category,
    )
}

fn price_instruction(draft: &ProductDraft, trend_score: Option<f64>) -> String {
    let trend = trend_score
        .map(|score| score.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "Recommend an optimal selling price for {name}, \
         a {category} product described as: {description}. \
         The current price is ₹{price}. \
         The market trend score is {trend}. \
         Consider factors like production costs, competitor pricing, and market demand. \
         Respond with only the recommended price as a number without any currency symbols or text.",
        name = draft.name,
        category = draft.category,
        description = draft.description,
        price = draft.price,
    )
}

fn recommendations_instruction(draft: &ProductDraft, extra: &PromptExtra<'_>) -> String {
    let story = extra.story.unwrap_or(draft.description.as_str());
    let trend = extra
        .trend_score
        .map(|score| score.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let price = extra.recommended_price.unwrap_or(draft.price);
    format!(
        "Based on the following product information, provide 5 actionable recommendations for the seller:\n\
         Product Story: {story}\n\
         Market Trend Score: {trend}\n\
         Recommended Price: ₹{price}\n\
         Existing Marketing Recommendations: {existing}\n\n\
         Provide 5 specific, actionable recommendations for the seller to improve their product listing and sales.\n\
         Format each recommendation on a new line starting with a dash (-).",
        existing = extra.marketing_recommendations.join("; "),
    )
}
