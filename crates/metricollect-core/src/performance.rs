//! Rolling drain-ratio history driving worker pool resizing.
//!
//! # Control Loop
//!
//! ```text
//! cycle ──► sample (drain or overload ratio) ──► history[5] ──► decide()
//!                                                   │
//!                                                   ├── avg < 0.40            → shrink by 1
//!                                                   ├── last ≥ 0.90 | avg > 0.80 → grow to size·max(avg,last)/0.70
//!                                                   └── otherwise             → hold
//! ```
//!
//! A sample below 1.0 is the fraction of the cycle the pool needed to drain
//! the queue; a sample above 1.0 means work was still pending when the next
//! cycle started.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of samples kept; decisions wait for a full history.
pub const HISTORY_LEN: usize = 5;

/// Average below which one worker is retired.
pub const SHRINK_BELOW: f64 = 0.40;

/// Average above which the pool grows.
pub const GROW_AVERAGE_ABOVE: f64 = 0.80;

/// Most recent sample at or above which the pool grows.
pub const GROW_LAST_AT_LEAST: f64 = 0.90;

/// Utilisation the grown pool is sized for.
pub const GROW_TARGET_RATIO: f64 = 0.70;

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ScalingDecision {
    Hold,
    /// Retire exactly one worker.
    Shrink,
    /// Grow the pool to `target` workers.
    Grow { target: usize },
}

/// Bounded history of per-cycle performance samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMonitor {
    history: VecDeque<f64>,
}

impl PerformanceMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample rounded to two decimals, evicting the oldest beyond
    /// [`HISTORY_LEN`]. Returns the stored value.
    pub fn record(&mut self, sample: f64) -> f64 {
        let rounded = round2(sample);
        self.history.push_back(rounded);
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
        rounded
    }

    /// Mean of the history, only once it holds [`HISTORY_LEN`] samples.
    #[must_use]
    pub fn average(&self) -> Option<f64> {
        if self.history.len() < HISTORY_LEN {
            return None;
        }
        Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
    }

    #[must_use]
    pub fn last(&self) -> Option<f64> {
        self.history.back().copied()
    }

    #[must_use]
    pub fn samples(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Decide how to resize a pool of `current` workers bounded by
    /// `[min, max]`.
    #[must_use]
    pub fn decide(&self, current: usize, min: usize, max: usize) -> ScalingDecision {
        let (Some(average), Some(last)) = (self.average(), self.last()) else {
            return ScalingDecision::Hold;
        };

        if average < SHRINK_BELOW && current > min {
            return ScalingDecision::Shrink;
        }

        if (last >= GROW_LAST_AT_LEAST || average > GROW_AVERAGE_ABOVE) && current < max {
            let scaled = current as f64 * (average.max(last) / GROW_TARGET_RATIO);
            let target = (scaled as usize).min(max);
            if target > current {
                return ScalingDecision::Grow { target };
            }
        }

        ScalingDecision::Hold
    }
}

/// Sample for a cycle whose working set was empty: how much of the previous
/// cycle the pool needed before the queue drained.
#[must_use]
pub fn drain_ratio(busy: Duration, frequency: Duration) -> f64 {
    busy.as_secs_f64() / frequency.as_secs_f64()
}

/// Sample for a cycle that started with `pending` of `total` ids still
/// outstanding.
#[must_use]
pub fn overload_ratio(total: usize, pending: usize) -> f64 {
    total as f64 / (total.saturating_sub(pending) + 1) as f64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
