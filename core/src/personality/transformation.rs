// Transformation tracker — daily shift buckets and the promotion rule
//
// Every signal lands in the bucket for its day as (signal - phase_origin).
// A promotion needs a run of consecutive qualifying days that all point the
// same way, mostly driven by the user, with authenticity intact throughout.

use super::profile::{Dimension, DIMENSIONS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DAY_MS: u64 = 86_400_000;

/// Consecutive qualifying days needed before a promotion
pub const PROMOTION_MIN_DAYS: usize = 30;

pub const MIN_USER_RATIO: f64 = 0.6;
pub const MIN_AUTHENTICITY: f64 = 0.5;
pub const MIN_CONFIDENCE: f64 = 0.7;

/// L2 norm a day's mean shift needs to count
pub const MIN_DAILY_SHIFT: f64 = 0.05;

/// Cosine similarity a day needs against the run's mean shift
pub const MIN_DAY_SIMILARITY: f64 = 0.8;

const MAX_TRACKED_DAYS: usize = 120;

pub fn day_index(now_ms: u64) -> u64 {
    now_ms / DAY_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DayBucket {
    shift_sum: [f64; DIMENSIONS],
    counts: [u32; DIMENSIONS],
    signals: u32,
    user_signals: u32,
    min_authenticity: f64,
}

impl DayBucket {
    fn new() -> Self {
        Self {
            shift_sum: [0.0; DIMENSIONS],
            counts: [0; DIMENSIONS],
            signals: 0,
            user_signals: 0,
            min_authenticity: 1.0,
        }
    }

    fn mean_shift(&self) -> [f64; DIMENSIONS] {
        let mut out = [0.0; DIMENSIONS];
        for (i, o) in out.iter_mut().enumerate() {
            if self.counts[i] > 0 {
                *o = self.shift_sum[i] / self.counts[i] as f64;
            }
        }
        out
    }
}

fn norm(v: &[f64; DIMENSIONS]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn cosine(a: &[f64; DIMENSIONS], b: &[f64; DIMENSIONS]) -> f64 {
    let denom = norm(a) * norm(b);
    if denom == 0.0 {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>() / denom
}

/// Where the trailing run stands right now
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub days: usize,
    pub user_ratio: f64,
    pub consistency: f64,
    pub min_authenticity: f64,
    pub mean_shift: [f64; DIMENSIONS],
}

impl RunStatus {
    pub fn confidence(&self) -> f64 {
        0.5 * self.consistency + 0.5 * self.user_ratio
    }

    fn empty() -> Self {
        Self {
            days: 0,
            user_ratio: 0.0,
            consistency: 0.0,
            min_authenticity: 1.0,
            mean_shift: [0.0; DIMENSIONS],
        }
    }
}

/// A shift that met every promotion criterion
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub days: usize,
    pub mean_shift: [f64; DIMENSIONS],
    pub user_ratio: f64,
    pub consistency: f64,
    pub confidence: f64,
}

impl Promotion {
    /// Human-readable trigger naming the strongest moving dimensions
    pub fn describe(&self) -> String {
        let mut ranked: Vec<(Dimension, f64)> = Dimension::ALL
            .iter()
            .map(|d| (*d, self.mean_shift[d.index()]))
            .filter(|(_, s)| s.abs() > f64::EPSILON)
            .collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));

        let leading: Vec<String> = ranked
            .iter()
            .take(2)
            .map(|(d, s)| format!("{} {:+.2}", d, s))
            .collect();

        format!(
            "{}-day sustained shift ({}), {:.0}% user-driven, confidence {:.2}",
            self.days,
            leading.join(", "),
            self.user_ratio * 100.0,
            self.confidence
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformationTracker {
    days: BTreeMap<u64, DayBucket>,
}

impl TransformationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one signal's shift from the phase origin
    pub fn record(&mut self, day: u64, dim: Dimension, shift: f64, from_user: bool, authenticity: f64) {
        let bucket = self.days.entry(day).or_insert_with(DayBucket::new);
        bucket.shift_sum[dim.index()] += shift;
        bucket.counts[dim.index()] += 1;
        bucket.signals += 1;
        if from_user {
            bucket.user_signals += 1;
        }
        bucket.min_authenticity = bucket.min_authenticity.min(authenticity);

        while self.days.len() > MAX_TRACKED_DAYS {
            self.days.pop_first();
        }
    }

    /// The run of qualifying days ending at the most recent tracked day
    pub fn status(&self) -> RunStatus {
        let mut shifts: Vec<[f64; DIMENSIONS]> = Vec::new();
        let mut sum = [0.0; DIMENSIONS];
        let mut signals = 0u32;
        let mut user_signals = 0u32;
        let mut min_authenticity: f64 = 1.0;
        let mut prev_day: Option<u64> = None;

        for (day, bucket) in self.days.iter().rev() {
            if let Some(prev) = prev_day {
                if day + 1 != prev {
                    break;
                }
            }

            let shift = bucket.mean_shift();
            if norm(&shift) < MIN_DAILY_SHIFT || bucket.min_authenticity < MIN_AUTHENTICITY {
                break;
            }
            if !shifts.is_empty() {
                let mean = sum.map(|s| s / shifts.len() as f64);
                if cosine(&shift, &mean) < MIN_DAY_SIMILARITY {
                    break;
                }
            }

            for (s, v) in sum.iter_mut().zip(shift.iter()) {
                *s += v;
            }
            shifts.push(shift);
            signals += bucket.signals;
            user_signals += bucket.user_signals;
            min_authenticity = min_authenticity.min(bucket.min_authenticity);
            prev_day = Some(*day);
        }

        if shifts.is_empty() {
            return RunStatus::empty();
        }

        let mean_shift = sum.map(|s| s / shifts.len() as f64);
        let consistency =
            shifts.iter().map(|s| cosine(s, &mean_shift)).sum::<f64>() / shifts.len() as f64;
        let user_ratio = if signals == 0 {
            0.0
        } else {
            user_signals as f64 / signals as f64
        };

        RunStatus {
            days: shifts.len(),
            user_ratio,
            consistency,
            min_authenticity,
            mean_shift,
        }
    }

    /// A promotion, if the trailing run meets every criterion
    pub fn evaluate(&self) -> Option<Promotion> {
        let status = self.status();
        let confidence = status.confidence();

        if status.days < PROMOTION_MIN_DAYS
            || status.user_ratio < MIN_USER_RATIO
            || status.min_authenticity < MIN_AUTHENTICITY
            || confidence < MIN_CONFIDENCE
        {
            return None;
        }

        Some(Promotion {
            days: status.days,
            mean_shift: status.mean_shift,
            user_ratio: status.user_ratio,
            consistency: status.consistency,
            confidence,
        })
    }

    pub fn reset(&mut self) {
        self.days.clear();
    }

    pub fn tracked_days(&self) -> usize {
        self.days.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(tracker: &mut TransformationTracker, days: u64, user_share: u32) {
        for day in 0..days {
            for i in 0..10 {
                tracker.record(day, Dimension::NoveltySeeking, 0.2, i < user_share, 0.9);
            }
        }
    }

    #[test]
    fn test_short_run_does_not_promote() {
        let mut tracker = TransformationTracker::new();
        steady(&mut tracker, 29, 8);
        assert_eq!(tracker.status().days, 29);
        assert!(tracker.evaluate().is_none());
    }

    #[test]
    fn test_long_user_driven_run_promotes() {
        let mut tracker = TransformationTracker::new();
        steady(&mut tracker, 31, 8);
        let promotion = tracker.evaluate().unwrap();
        assert_eq!(promotion.days, 31);
        assert!((promotion.user_ratio - 0.8).abs() < 1e-9);
        assert!((promotion.consistency - 1.0).abs() < 1e-9);
        assert!((promotion.mean_shift[Dimension::NoveltySeeking.index()] - 0.2).abs() < 1e-9);
        assert!(promotion.describe().contains("novelty_seeking"));
    }

    #[test]
    fn test_peer_driven_run_does_not_promote() {
        let mut tracker = TransformationTracker::new();
        steady(&mut tracker, 40, 5);
        assert!(tracker.evaluate().is_none());
    }

    #[test]
    fn test_gap_breaks_run() {
        let mut tracker = TransformationTracker::new();
        steady(&mut tracker, 20, 8);
        for day in 21..40 {
            tracker.record(day, Dimension::NoveltySeeking, 0.2, true, 0.9);
        }
        assert_eq!(tracker.status().days, 19);
    }

    #[test]
    fn test_direction_change_breaks_run() {
        let mut tracker = TransformationTracker::new();
        steady(&mut tracker, 20, 8);
        for day in 20..25 {
            tracker.record(day, Dimension::CrowdTolerance, -0.2, true, 0.9);
        }
        assert_eq!(tracker.status().days, 5);
    }

    #[test]
    fn test_low_authenticity_breaks_run() {
        let mut tracker = TransformationTracker::new();
        steady(&mut tracker, 31, 8);
        tracker.record(30, Dimension::NoveltySeeking, 0.2, false, 0.4);
        assert!(tracker.evaluate().is_none());
    }

    #[test]
    fn test_small_shift_does_not_qualify() {
        let mut tracker = TransformationTracker::new();
        for day in 0..35 {
            tracker.record(day, Dimension::NoveltySeeking, 0.01, true, 1.0);
        }
        assert_eq!(tracker.status().days, 0);
        assert!(tracker.evaluate().is_none());
    }

    #[test]
    fn test_bounded_history_and_reset() {
        let mut tracker = TransformationTracker::new();
        for day in 0..(MAX_TRACKED_DAYS as u64 + 10) {
            tracker.record(day, Dimension::NoveltySeeking, 0.2, true, 1.0);
        }
        assert_eq!(tracker.tracked_days(), MAX_TRACKED_DAYS);
        tracker.reset();
        assert_eq!(tracker.tracked_days(), 0);
    }
}
