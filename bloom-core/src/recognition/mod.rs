//! recognition — label/confidence records and result ranking
//!
//! Engines return an unordered list of [`Category`] scores. The analyzer ranks
//! them into at most [`MAX_RESULT_DISPLAY`] [`Recognition`] values, highest
//! confidence first.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

/// Maximum number of recognitions published per frame.
pub const MAX_RESULT_DISPLAY: usize = 3;

/// Raw `(label, score)` pair as produced by a classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub label: String,
    pub score: f32,
}

impl Category {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

/// A single prediction shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    label: String,
    confidence: f32,
}

impl Recognition {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Confidence as a fraction in `[0, 1]`.
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Confidence as a percentage with one decimal place, e.g. `"87.3%"`.
    pub fn percentage(&self) -> String {
        format!("{:.1}%", self.confidence * 100.0)
    }
}

impl fmt::Display for Recognition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.label, self.percentage())
    }
}

/// Sort `categories` by score (descending) and keep the best `max`.
///
/// The sort is stable, so equal scores keep engine order. NaN scores rank last.
pub fn rank(mut categories: Vec<Category>, max: usize) -> Vec<Recognition> {
    categories.sort_by(|a, b| descending(a.score, b.score));
    categories.truncate(max);
    categories
        .into_iter()
        .map(|c| Recognition::new(c.label, c.score))
        .collect()
}

fn descending(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}
