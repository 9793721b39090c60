// Insight derivation — turn one scored exchange into bounded learning steps

use crate::personality::{Dimension, DimensionVector, LearningInsight};

/// Below this compatibility nothing is learned from the peer
pub const MIN_COMPATIBILITY: f64 = 0.35;

/// Smallest per-dimension gap worth learning from
pub const MIN_GAP: f64 = 0.05;

pub const MAX_INSIGHTS: usize = 3;

/// Up to `MAX_INSIGHTS` dimensions with the widest gaps, each pulling toward
/// the peer's value with the compatibility as weight
pub fn derive_insights(
    local: &DimensionVector,
    peer: &DimensionVector,
    compatibility: f64,
) -> Vec<LearningInsight> {
    if !compatibility.is_finite() || compatibility < MIN_COMPATIBILITY {
        return Vec::new();
    }
    let weight = compatibility.min(1.0);

    let mut gaps: Vec<(Dimension, f64)> = Dimension::ALL
        .iter()
        .map(|d| (*d, (peer.get(*d) - local.get(*d)).abs()))
        .filter(|(_, gap)| *gap >= MIN_GAP)
        .collect();
    // widest first; ties keep dimension order
    gaps.sort_by(|a, b| b.1.total_cmp(&a.1));

    gaps.into_iter()
        .take(MAX_INSIGHTS)
        .map(|(dimension, _)| LearningInsight {
            dimension,
            signal: peer.get(dimension),
            weight,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_with(pairs: &[(Dimension, f64)]) -> DimensionVector {
        let mut v = DimensionVector::neutral();
        for (d, value) in pairs {
            v.set(*d, *value);
        }
        v
    }

    #[test]
    fn test_low_compatibility_learns_nothing() {
        let peer = peer_with(&[(Dimension::NoveltySeeking, 0.9)]);
        assert!(derive_insights(&DimensionVector::neutral(), &peer, 0.34).is_empty());
        assert!(derive_insights(&DimensionVector::neutral(), &peer, f64::NAN).is_empty());
    }

    #[test]
    fn test_widest_gaps_capped_at_three() {
        let peer = peer_with(&[
            (Dimension::NoveltySeeking, 0.95),
            (Dimension::CrowdTolerance, 0.1),
            (Dimension::EnergyPreference, 0.7),
            (Dimension::ValueOrientation, 0.6),
            (Dimension::CurationTendency, 0.52),
        ]);
        let insights = derive_insights(&DimensionVector::neutral(), &peer, 0.8);

        let dims: Vec<Dimension> = insights.iter().map(|i| i.dimension).collect();
        assert_eq!(
            dims,
            vec![
                Dimension::NoveltySeeking,
                Dimension::CrowdTolerance,
                Dimension::EnergyPreference
            ]
        );
        assert_eq!(insights[1].signal, 0.1);
        assert!(insights.iter().all(|i| i.weight == 0.8));
    }

    #[test]
    fn test_small_gaps_ignored() {
        let peer = peer_with(&[(Dimension::CurationTendency, 0.53)]);
        assert!(derive_insights(&DimensionVector::neutral(), &peer, 0.9).is_empty());
    }
}
