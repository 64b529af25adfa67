//! Lead quality heuristic written into the `AI Analysis` column.

use leadsync_core::RawRecord;
use serde_json::Value as JsonValue;

use crate::normalize::{field, text};

const WEBSITE_KEYS: &[&str] = &["website", "web", "domain"];
const REVIEW_COUNT_KEYS: &[&str] = &["reviewsCount", "reviews", "reviews_count"];
const RATING_KEYS: &[&str] = &["totalScore", "rating", "score"];
const CATEGORY_KEYS: &[&str] = &["categories", "categoryName", "category"];

pub const SOCIAL_KEYS: &[&str] = &[
    "facebook", "facebooks", "linkedIn", "linkedIns", "linkedin", "linkedins", "instagram",
    "instagrams", "twitter", "twitters", "youtube", "youtubes", "tiktok", "tiktoks",
];

pub const CATEGORY_KEYWORDS: &[&str] = &[
    "agency",
    "marketing",
    "consult",
    "software",
    "technology",
    "it ",
    "it services",
    "development",
    "web",
];

pub const MAX_SCORE: u8 = 10;

fn number(value: Option<&JsonValue>) -> f64 {
    match value {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(JsonValue::Bool(true)) => 1.0,
        _ => 0.0,
    }
}

fn present(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)) => false,
        Some(JsonValue::String(s)) => !s.trim().is_empty(),
        Some(JsonValue::Array(items)) => !items.is_empty(),
        Some(JsonValue::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
        Some(_) => true,
    }
}

fn category_text(record: &RawRecord) -> String {
    let mut parts = Vec::new();
    for key in CATEGORY_KEYS {
        match record.get(*key) {
            Some(JsonValue::Array(items)) => {
                parts.extend(items.iter().map(|item| match item.get("name") {
                    Some(name) => text(Some(name)),
                    None => text(Some(item)),
                }));
            }
            Some(other) => parts.push(text(Some(other))),
            None => {}
        }
    }
    parts.join(" ").to_lowercase()
}

/// Scores a scraped business from 0 to 10; an empty record scores the baseline of 2.
pub fn lead_score(record: &RawRecord) -> u8 {
    let mut score: i32 = 2;

    if !text(field(record, WEBSITE_KEYS)).trim().is_empty() {
        score += 2;
    }
    let reviews = number(field(record, REVIEW_COUNT_KEYS));
    if reviews >= 50.0 {
        score += 2;
    }
    if reviews >= 200.0 {
        score += 3;
    }
    if number(field(record, RATING_KEYS)) >= 4.5 {
        score += 1;
    }
    if SOCIAL_KEYS.iter().any(|key| present(record.get(*key))) {
        score += 1;
    }
    let categories = category_text(record);
    if CATEGORY_KEYWORDS.iter().any(|kw| categories.contains(kw)) {
        score += 2;
    }

    score.clamp(0, MAX_SCORE as i32) as u8
}
