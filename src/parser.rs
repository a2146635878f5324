//! Heuristic extraction of structured values from free-text model output.
//!
//! Nothing here fails: a miss is `None` or a short list, and the workflow
//! decides whether that triggers the fallback for the affected field.

use once_cell::sync::Lazy;
use regex::Regex;

static TREND_SCORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)trend\s*score.*?([0-9]*\.?[0-9]+)").expect("trend score regex")
});

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-•]|[0-9]+\.)").expect("list marker regex"));

static LEADING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]*\.?[0-9]+").expect("leading number regex"));

/// First number after the phrase "trend score", clamped to `[0, 1]`.
pub fn parse_score(text: &str) -> Option<f64> {
    let captures = TREND_SCORE.captures(text)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

/// Lines starting with `-`, `•` or `N.`, marker stripped, in source order.
pub fn parse_list(text: &str, max_items: usize) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            let marker = LIST_MARKER.find(line)?;
            let item = line[marker.end()..].trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .take(max_items)
        .collect()
}

/// Keeps digits and dots, then reads the longest leading number, so a
/// sentence-ending period after the amount is ignored.
pub fn parse_price(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    let value: f64 = LEADING_NUMBER.find(&digits)?.as_str().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}
