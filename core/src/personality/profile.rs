// Personality profile — core vector, contextual layers, closed life phases

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Number of behavioral dimensions
pub const DIMENSIONS: usize = 12;

/// Neutral starting value on every dimension
pub const NEUTRAL: f64 = 0.5;

/// Blend weight a freshly created contextual layer starts with
pub const DEFAULT_BLEND_WEIGHT: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dimension {
    ExplorationEagerness,
    CommunityOrientation,
    AuthenticityPreference,
    SocialDiscoveryStyle,
    TemporalFlexibility,
    LocationAdventurousness,
    CurationTendency,
    TrustNetworkReliance,
    EnergyPreference,
    NoveltySeeking,
    ValueOrientation,
    CrowdTolerance,
}

impl Dimension {
    pub const ALL: [Dimension; DIMENSIONS] = [
        Dimension::ExplorationEagerness,
        Dimension::CommunityOrientation,
        Dimension::AuthenticityPreference,
        Dimension::SocialDiscoveryStyle,
        Dimension::TemporalFlexibility,
        Dimension::LocationAdventurousness,
        Dimension::CurationTendency,
        Dimension::TrustNetworkReliance,
        Dimension::EnergyPreference,
        Dimension::NoveltySeeking,
        Dimension::ValueOrientation,
        Dimension::CrowdTolerance,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Dimension::ExplorationEagerness => "exploration_eagerness",
            Dimension::CommunityOrientation => "community_orientation",
            Dimension::AuthenticityPreference => "authenticity_preference",
            Dimension::SocialDiscoveryStyle => "social_discovery_style",
            Dimension::TemporalFlexibility => "temporal_flexibility",
            Dimension::LocationAdventurousness => "location_adventurousness",
            Dimension::CurationTendency => "curation_tendency",
            Dimension::TrustNetworkReliance => "trust_network_reliance",
            Dimension::EnergyPreference => "energy_preference",
            Dimension::NoveltySeeking => "novelty_seeking",
            Dimension::ValueOrientation => "value_orientation",
            Dimension::CrowdTolerance => "crowd_tolerance",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_lowercase();
        Dimension::ALL
            .into_iter()
            .find(|d| d.name() == wanted)
            .ok_or_else(|| format!("Unknown dimension: {}", s))
    }
}

/// One value per dimension, each kept in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionVector([f64; DIMENSIONS]);

impl DimensionVector {
    pub fn neutral() -> Self {
        Self([NEUTRAL; DIMENSIONS])
    }

    /// Build from raw values, clamping each into [0, 1]
    pub fn from_values(values: [f64; DIMENSIONS]) -> Self {
        let mut v = Self(values);
        v.clamp_all();
        v
    }

    pub fn get(&self, dim: Dimension) -> f64 {
        self.0[dim.index()]
    }

    pub fn set(&mut self, dim: Dimension, value: f64) {
        self.0[dim.index()] = clamp_unit(value);
    }

    pub fn values(&self) -> &[f64; DIMENSIONS] {
        &self.0
    }

    fn clamp_all(&mut self) {
        for v in self.0.iter_mut() {
            *v = clamp_unit(*v);
        }
    }

    /// Add a signed offset per dimension, clamping the result
    pub fn offset_by(&self, delta: &[f64; DIMENSIONS]) -> Self {
        let mut out = [0.0; DIMENSIONS];
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.0[i] + delta[i];
        }
        Self::from_values(out)
    }

    /// Mean absolute difference across all dimensions
    pub fn mean_abs_diff(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
            / DIMENSIONS as f64
    }

    /// 1 - mean absolute difference, in [0, 1]
    pub fn similarity(&self, other: &Self) -> f64 {
        1.0 - self.mean_abs_diff(other)
    }
}

impl Default for DimensionVector {
    fn default() -> Self {
        Self::neutral()
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        NEUTRAL
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Situation-specific adaptation layered over the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualLayer {
    /// Where external influence wanted this context to go
    pub adapted: DimensionVector,
    /// How strongly `adapted` colours the effective vector in this context
    pub blend_weight: f64,
    /// Influence clamped off the core, per dimension
    pub remainder: [f64; DIMENSIONS],
}

impl ContextualLayer {
    pub fn new(base: DimensionVector) -> Self {
        Self {
            adapted: base,
            blend_weight: DEFAULT_BLEND_WEIGHT,
            remainder: [0.0; DIMENSIONS],
        }
    }

    pub fn remainder(&self, dim: Dimension) -> f64 {
        self.remainder[dim.index()]
    }
}

/// A closed period of the user's life, kept forever once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifePhase {
    pub id: String,
    /// Core as it stood when the phase closed
    pub core: DimensionVector,
    pub started_at: u64,
    pub closed_at: u64,
    /// What caused the promotion
    pub trigger: String,
}

impl LifePhase {
    pub fn close(core: DimensionVector, started_at: u64, closed_at: u64, trigger: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            core,
            started_at,
            closed_at,
            trigger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityProfile {
    pub core: DimensionVector,
    /// Core when the current phase opened; drift is measured from here
    pub phase_origin: DimensionVector,
    pub phase_started_at: u64,
    pub contextual_layers: BTreeMap<String, ContextualLayer>,
    pub evolution_timeline: Vec<LifePhase>,
    pub confidence: f64,
    pub authenticity: f64,
    pub updated_at: u64,
}

impl PersonalityProfile {
    pub fn neutral(now: u64) -> Self {
        Self {
            core: DimensionVector::neutral(),
            phase_origin: DimensionVector::neutral(),
            phase_started_at: now,
            contextual_layers: BTreeMap::new(),
            evolution_timeline: Vec::new(),
            confidence: 0.5,
            authenticity: 1.0,
            updated_at: now,
        }
    }

    /// Layer for `context`, created from the current core on first use
    pub fn layer_mut(&mut self, context: &str) -> &mut ContextualLayer {
        let core = self.core;
        self.contextual_layers
            .entry(context.to_string())
            .or_insert_with(|| ContextualLayer::new(core))
    }

    pub fn layer(&self, context: &str) -> Option<&ContextualLayer> {
        self.contextual_layers.get(context)
    }

    /// Core blended with the context's layer
    pub fn effective(&self, context: &str) -> DimensionVector {
        match self.contextual_layers.get(context) {
            Some(layer) => {
                let w = layer.blend_weight.clamp(0.0, 1.0);
                let mut out = [0.0; DIMENSIONS];
                for (i, o) in out.iter_mut().enumerate() {
                    *o = self.core.values()[i] * (1.0 - w) + layer.adapted.values()[i] * w;
                }
                DimensionVector::from_values(out)
            }
            None => self.core,
        }
    }
}

impl Default for PersonalityProfile {
    fn default() -> Self {
        Self::neutral(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_names_roundtrip() {
        for dim in Dimension::ALL {
            assert_eq!(dim.name().parse::<Dimension>().unwrap(), dim);
        }
        assert_eq!(
            "Novelty-Seeking".parse::<Dimension>().unwrap(),
            Dimension::NoveltySeeking
        );
        assert!("charisma".parse::<Dimension>().is_err());
    }

    #[test]
    fn test_vector_clamps() {
        let mut v = DimensionVector::neutral();
        v.set(Dimension::CrowdTolerance, 1.7);
        assert_eq!(v.get(Dimension::CrowdTolerance), 1.0);
        v.set(Dimension::CrowdTolerance, -0.2);
        assert_eq!(v.get(Dimension::CrowdTolerance), 0.0);
        v.set(Dimension::CrowdTolerance, f64::NAN);
        assert_eq!(v.get(Dimension::CrowdTolerance), NEUTRAL);
    }

    #[test]
    fn test_similarity() {
        let a = DimensionVector::neutral();
        assert_eq!(a.similarity(&a), 1.0);
        let b = DimensionVector::from_values([1.0; DIMENSIONS]);
        assert!((a.similarity(&b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_neutral_defaults() {
        let profile = PersonalityProfile::neutral(5);
        assert_eq!(profile.core, DimensionVector::neutral());
        assert_eq!(profile.confidence, 0.5);
        assert_eq!(profile.authenticity, 1.0);
        assert!(profile.evolution_timeline.is_empty());
    }

    #[test]
    fn test_effective_blends_layer() {
        let mut profile = PersonalityProfile::neutral(0);
        let layer = profile.layer_mut("evening-busy");
        layer.adapted.set(Dimension::EnergyPreference, 1.0);
        layer.blend_weight = 0.5;

        let eff = profile.effective("evening-busy");
        assert!((eff.get(Dimension::EnergyPreference) - 0.75).abs() < 1e-12);
        assert_eq!(profile.effective("morning-quiet"), profile.core);
    }
}
