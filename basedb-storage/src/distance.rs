//! # Vector distance functions
//!
//! Scalar kernels for vector search. Cosine and dot product are
//! similarities (higher is closer); Euclidean and Manhattan are distances
//! (lower is closer). [`score`] folds both into "higher is better" and
//! [`within`] applies the query threshold in the metric's own direction.

use basedb_protocol::query::Distance;

#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

#[inline]
pub fn manhattan_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// dot(a,b) / (||a|| * ||b||); zero when either vector is zero.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// Raw metric value of `a` against `b`.
pub fn measure(distance: Distance, a: &[f32], b: &[f32]) -> f64 {
    (match distance {
        Distance::Cosine => cosine_similarity(a, b),
        Distance::DotProduct => dot_product(a, b),
        Distance::Euclidean => l2_distance(a, b),
        Distance::Manhattan => manhattan_distance(a, b),
    }) as f64
}

pub fn is_similarity(distance: Distance) -> bool {
    matches!(distance, Distance::Cosine | Distance::DotProduct)
}

/// Ranking score, higher is better.
pub fn score(distance: Distance, value: f64) -> f64 {
    if is_similarity(distance) {
        value
    } else {
        -value
    }
}

pub fn within(distance: Distance, value: f64, threshold: f64) -> bool {
    if is_similarity(distance) {
        value >= threshold
    } else {
        value <= threshold
    }
}
