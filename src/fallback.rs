//! Deterministic stand-ins for every model-backed stage. No I/O.

use crate::models::{ProductDraft, TrendAssessment};

pub const DEFAULT_TREND_SCORE: f64 = 0.7;

pub const STORYTELLING_TIP: &str =
    "Focus on storytelling in your product description to connect with customers emotionally";

const CATEGORY_TRENDS: [(&str, f64); 8] = [
    ("textiles & fabrics", 0.8),
    ("pottery & ceramics", 0.7),
    ("jewelry & accessories", 0.9),
    ("wood & bamboo crafts", 0.6),
    ("metalwork", 0.5),
    ("paintings & art", 0.8),
    ("home decor", 0.7),
    ("leather goods", 0.6),
];

pub fn trend_score_for_category(category: &str) -> f64 {
    let key = category.trim().to_lowercase();
    CATEGORY_TRENDS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, score)| *score)
        .unwrap_or(DEFAULT_TREND_SCORE)
}

pub fn story(draft: &ProductDraft) -> String {
    format!(
        "Discover the beauty of authentic {category} with {name}. {description} \
         Each piece is carefully crafted with attention to detail, representing the rich tradition of local artisanship. \
         This unique creation combines traditional techniques with contemporary appeal, \
         making it a perfect addition to your collection or a thoughtful gift for someone special.",
        category = draft.category,
        name = draft.name,
        description = draft.description,
    )
}

pub fn marketing_recommendations(category: &str) -> Vec<String> {
    vec![
        format!(
            "Highlight the unique craftsmanship of your {}",
            category.trim().to_lowercase()
        ),
        "Target customers interested in authentic, handmade items".to_string(),
        "Use lifestyle imagery to show the product in use".to_string(),
        "Emphasize the story and cultural significance behind your product".to_string(),
        "Consider seasonal marketing opportunities for maximum appeal".to_string(),
    ]
}

pub fn trend(draft: &ProductDraft) -> TrendAssessment {
    TrendAssessment {
        score: trend_score_for_category(&draft.category),
        recommendations: marketing_recommendations(&draft.category),
    }
}

/// `price * (0.9 + 0.2 * trend_score)` rounded to cents: 0.90x at score 0,
/// 1.10x at score 1, linear in between.
pub fn price(input_price: f64, trend_score: f64) -> f64 {
    let multiplier = 0.9 + trend_score.clamp(0.0, 1.0) * 0.2;
    round_cents(input_price * multiplier)
}

/// First three marketing recommendations, a price announcement, and the
/// storytelling tip. Never padded.
pub fn recommendations(marketing: &[String], recommended_price: f64) -> Vec<String> {
    let mut tips: Vec<String> = marketing.iter().take(3).cloned().collect();
    tips.push(price_announcement(recommended_price));
    tips.push(STORYTELLING_TIP.to_string());
    tips
}

pub fn price_announcement(recommended_price: f64) -> String {
    format!("Consider pricing your product at ₹{recommended_price:.2} based on market analysis")
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
