//! Gap-aware numeric series primitives over `Option<f64>` columns.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Window placement for rolling statistics.
///
/// `Centered` looks ahead and is only valid over fully observed history.
/// `Trailing` uses the current and previous samples only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowMode {
    Centered,
    Trailing,
}

pub fn interpolate_linear(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = values.to_vec();
    let mut prev_known: Option<usize> = None;

    for idx in 0..values.len() {
        let Some(current) = values[idx] else {
            continue;
        };
        if let Some(prev) = prev_known {
            let gap = idx - prev;
            if gap > 1 {
                let start = values[prev].unwrap_or(current);
                let step = (current - start) / gap as f64;
                for (offset, slot) in out[prev + 1..idx].iter_mut().enumerate() {
                    *slot = Some(start + step * (offset + 1) as f64);
                }
            }
        }
        prev_known = Some(idx);
    }

    out
}

pub fn fill_boundaries(values: &[Option<f64>]) -> Vec<Option<f64>> {
    backward_fill(&forward_fill(values))
}

pub fn forward_fill<T: Clone>(values: &[Option<T>]) -> Vec<Option<T>> {
    let mut last: Option<T> = None;
    values
        .iter()
        .map(|value| {
            if value.is_some() {
                last = value.clone();
            }
            last.clone()
        })
        .collect()
}

pub fn backward_fill<T: Clone>(values: &[Option<T>]) -> Vec<Option<T>> {
    let mut next: Option<T> = None;
    let mut out: Vec<Option<T>> = values
        .iter()
        .rev()
        .map(|value| {
            if value.is_some() {
                next = value.clone();
            }
            next.clone()
        })
        .collect();
    out.reverse();
    out
}

/// Rolling median with partial windows at the edges (minimum one sample).
pub fn rolling_median(values: &[Option<f64>], window: usize, mode: WindowMode) -> Vec<Option<f64>> {
    let window = window.max(1);
    let (before, after) = match mode {
        WindowMode::Centered => (window / 2, (window - 1) / 2),
        WindowMode::Trailing => (window - 1, 0),
    };

    (0..values.len())
        .map(|idx| {
            let start = idx.saturating_sub(before);
            let end = (idx + after).min(values.len().saturating_sub(1));
            let mut samples: Vec<f64> = values[start..=end].iter().flatten().copied().collect();
            median(&mut samples)
        })
        .collect()
}

pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    let mut buffer: VecDeque<Option<f64>> = VecDeque::with_capacity(window);

    values
        .iter()
        .map(|value| {
            buffer.push_back(*value);
            while buffer.len() > window {
                buffer.pop_front();
            }
            if buffer.len() < window {
                return None;
            }
            let mut sum = 0.0;
            for sample in &buffer {
                sum += (*sample)?;
            }
            Some(sum / window as f64)
        })
        .collect()
}

/// Maximum over the `window` samples strictly after each row. Rows without a
/// full forward horizon are missing.
pub fn forward_max(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let n = values.len();
    (0..n)
        .map(|idx| {
            let end = idx.checked_add(window)?;
            if end >= n {
                return None;
            }
            values[idx + 1..=end]
                .iter()
                .try_fold(f64::NEG_INFINITY, |acc, sample| sample.map(|v| acc.max(v)))
        })
        .collect()
}

pub fn shift(values: &[Option<f64>], periods: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|idx| idx.checked_sub(periods).and_then(|src| values[src]))
        .collect()
}

pub fn diff(values: &[Option<f64>], periods: usize) -> Vec<Option<f64>> {
    let lagged = shift(values, periods);
    values
        .iter()
        .zip(lagged)
        .map(|(current, previous)| Some((*current)? - previous?))
        .collect()
}

fn median(samples: &mut [f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        Some((samples[mid - 1] + samples[mid]) / 2.0)
    } else {
        Some(samples[mid])
    }
}
