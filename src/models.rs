use crate::text::sanitize_input;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::HashSet;

/// Seller-entered product attributes, consumed once per workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductDraft {
    pub name: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub price: f64,
}

impl ProductDraft {
    /// Trims and strips markup characters from every text field. Empty and
    /// repeated tags are dropped, keeping the first occurrence.
    pub fn sanitized(&self) -> Self {
        let mut seen = HashSet::new();
        let tags = self
            .tags
            .iter()
            .map(|tag| sanitize_input(tag))
            .filter(|tag| !tag.is_empty())
            .filter(|tag| seen.insert(tag.to_lowercase()))
            .collect();
        Self {
            name: sanitize_input(&self.name),
            category: sanitize_input(&self.category),
            description: sanitize_input(&self.description),
            tags,
            price: self.price,
        }
    }

    /// Returns the first violated field, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.name.trim().is_empty() {
            return Err("missing_name");
        }
        if self.category.trim().is_empty() {
            return Err("missing_category");
        }
        if self.description.trim().is_empty() {
            return Err("missing_description");
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err("invalid_price");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendAssessment {
    pub score: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowResult {
    pub story: String,
    pub trend: TrendAssessment,
    pub final_price: f64,
    pub final_image: String,
    pub actionable_tips: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhanceRequest {
    #[serde(flatten)]
    pub draft: ProductDraft,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnhanceResponse {
    pub run_id: String,
    pub result: WorkflowResult,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> ProductDraft {
        ProductDraft {
            name: "  Ceramic <b>Vase</b> ".into(),
            category: "Pottery & Ceramics".into(),
            description: "hand-thrown".into(),
            tags: vec![
                "handmade".into(),
                " ".into(),
                "Handmade".into(),
                "vase".into(),
            ],
            price: 45.99,
        }
    }

    #[test]
    fn sanitized_strips_markup_and_dedupes_tags() {
        let clean = draft().sanitized();
        assert_eq!(clean.name, "Ceramic bVase/b");
        assert_eq!(clean.tags, vec!["handmade".to_string(), "vase".to_string()]);
        assert_eq!(clean.price, 45.99);
    }

    #[test]
    fn validate_reports_first_missing_field() {
        let mut d = draft().sanitized();
        assert!(d.validate().is_ok());
        d.description = "   ".into();
        assert_eq!(d.validate(), Err("missing_description"));
        d.name = String::new();
        assert_eq!(d.validate(), Err("missing_name"));
    }

    #[test]
    fn validate_rejects_non_positive_price() {
        let mut d = draft();
        d.price = 0.0;
        assert_eq!(d.validate(), Err("invalid_price"));
        d.price = f64::NAN;
        assert_eq!(d.validate(), Err("invalid_price"));
    }

    #[test]
    fn enhance_request_flattens_draft() {
        let raw = serde_json::json!({
            "name": "Vase",
            "category": "Home Decor",
            "description": "blue",
            "price": 12.5,
            "image": "https://example.com/v.jpg"
        });
        let req: EnhanceRequest = serde_json::from_value(raw).expect("parse");
        assert_eq!(req.draft.name, "Vase");
        assert!(req.draft.tags.is_empty());
        assert_eq!(req.image.as_deref(), Some("https://example.com/v.jpg"));
    }
}
