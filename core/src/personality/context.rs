// Situational context — time-of-day bucket plus nearby peer density

use std::collections::HashMap;
use std::fmt;

/// How far back advertisers count toward density
pub const DENSITY_WINDOW_MS: u64 = 5 * 60 * 1000;

const HOUR_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeBucket {
    /// Bucket for a unix-millis timestamp, UTC
    pub fn at(now_ms: u64) -> Self {
        match (now_ms / HOUR_MS) % 24 {
            5..=11 => TimeBucket::Morning,
            12..=16 => TimeBucket::Afternoon,
            17..=21 => TimeBucket::Evening,
            _ => TimeBucket::Night,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeBucket::Morning => "morning",
            TimeBucket::Afternoon => "afternoon",
            TimeBucket::Evening => "evening",
            TimeBucket::Night => "night",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Density {
    Quiet,
    Busy,
    Crowded,
}

impl Density {
    pub fn from_count(peers: usize) -> Self {
        match peers {
            0..=2 => Density::Quiet,
            3..=9 => Density::Busy,
            _ => Density::Crowded,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Density::Quiet => "quiet",
            Density::Busy => "busy",
            Density::Crowded => "crowded",
        }
    }
}

/// Context key such as `evening-busy`
pub fn context_key(time: TimeBucket, density: Density) -> String {
    format!("{}-{}", time.as_str(), density.as_str())
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Density {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distinct advertisers seen recently, keyed by their rotating hint
#[derive(Debug, Default)]
pub struct DensityTracker {
    last_seen: HashMap<String, u64>,
}

impl DensityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, hint: &str, now: u64) {
        self.last_seen.insert(hint.to_string(), now);
    }

    /// Advertisers seen within the window; older sightings are forgotten
    pub fn count(&mut self, now: u64) -> usize {
        self.last_seen
            .retain(|_, seen| now.saturating_sub(*seen) <= DENSITY_WINDOW_MS);
        self.last_seen.len()
    }

    pub fn density(&mut self, now: u64) -> Density {
        Density::from_count(self.count(now))
    }

    pub fn context(&mut self, now: u64) -> String {
        let density = self.density(now);
        context_key(TimeBucket::at(now), density)
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}
