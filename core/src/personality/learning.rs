// Drift-resistant update rules
//
// new = old * (1 - rate) + signal * rate, with a per-source rate. Peer and
// network updates may change a dimension by at most DRIFT_CEILING per step
// and may not carry it further than DRIFT_CEILING from the phase origin.
// The band always contains the current value, so external influence never
// undoes what the user moved. Whatever was cut off is parked in the current
// context layer.

use super::profile::{clamp_unit, Dimension, PersonalityProfile};
use serde::{Deserialize, Serialize};

/// Maximum distance external influence may pull a dimension from the phase origin
pub const DRIFT_CEILING: f64 = 0.30;

/// Authenticity EMA weight per user action (pulls toward 1)
pub const AUTHENTICITY_USER_WEIGHT: f64 = 0.02;

/// Authenticity EMA weight per external signal (pulls toward 0)
pub const AUTHENTICITY_EXTERNAL_WEIGHT: f64 = 0.01;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSource {
    /// Something the user did directly
    UserAction,
    PeerExchange,
    NetworkAggregate,
    /// Affects only the current context layer
    Contextual,
}

impl SignalSource {
    pub fn rate(self) -> f64 {
        match self {
            SignalSource::UserAction => 0.10,
            SignalSource::PeerExchange => 0.03,
            SignalSource::NetworkAggregate => 0.02,
            SignalSource::Contextual => 0.05,
        }
    }

    pub fn is_user(self) -> bool {
        self == SignalSource::UserAction
    }
}

/// One bounded learning step derived from a peer exchange
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningInsight {
    pub dimension: Dimension,
    /// Value the peer holds on this dimension
    pub signal: f64,
    /// Scales the peer rate, in [0, 1]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied {
        dimension: Dimension,
        value: f64,
    },
    /// Routine drift clamping; `remainder` went to the context layer
    Clamped {
        dimension: Dimension,
        value: f64,
        remainder: f64,
    },
    /// Only the context layer moved
    LayerOnly {
        dimension: Dimension,
        context: String,
        value: f64,
    },
}

impl UpdateOutcome {
    pub fn dimension(&self) -> Dimension {
        match self {
            UpdateOutcome::Applied { dimension, .. }
            | UpdateOutcome::Clamped { dimension, .. }
            | UpdateOutcome::LayerOnly { dimension, .. } => *dimension,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            UpdateOutcome::Applied { value, .. }
            | UpdateOutcome::Clamped { value, .. }
            | UpdateOutcome::LayerOnly { value, .. } => *value,
        }
    }

    /// Short human-readable form for connection records and logs
    pub fn summary(&self) -> String {
        match self {
            UpdateOutcome::Applied { dimension, value } => format!("{} -> {:.3}", dimension, value),
            UpdateOutcome::Clamped {
                dimension,
                value,
                remainder,
            } => format!("{} -> {:.3} (clamped, {:+.3} held)", dimension, value, remainder),
            UpdateOutcome::LayerOnly {
                dimension,
                context,
                value,
            } => format!("{}@{} -> {:.3}", dimension, context, value),
        }
    }
}

pub fn blend(old: f64, signal: f64, rate: f64) -> f64 {
    old * (1.0 - rate) + signal * rate
}

/// Apply an externally proposed value through the drift ceiling
pub fn guard_drift(
    profile: &mut PersonalityProfile,
    dim: Dimension,
    proposed: f64,
    context: &str,
) -> UpdateOutcome {
    let proposed = clamp_unit(proposed);
    let old = profile.core.get(dim);
    let origin = profile.phase_origin.get(dim);

    let step = (proposed - old).clamp(-DRIFT_CEILING, DRIFT_CEILING);
    let low = (origin - DRIFT_CEILING).min(old);
    let high = (origin + DRIFT_CEILING).max(old);
    let applied = clamp_unit((old + step).clamp(low, high));

    if (proposed - applied).abs() <= EPSILON {
        profile.core.set(dim, proposed);
        return UpdateOutcome::Applied {
            dimension: dim,
            value: proposed,
        };
    }

    let remainder = proposed - applied;

    let layer = profile.layer_mut(context);
    layer.remainder[dim.index()] += remainder;
    layer.adapted.set(dim, proposed);
    profile.core.set(dim, applied);

    UpdateOutcome::Clamped {
        dimension: dim,
        value: applied,
        remainder,
    }
}

/// Apply one signal from `source`. `weight` scales the source rate.
pub fn apply_signal(
    profile: &mut PersonalityProfile,
    dim: Dimension,
    signal: f64,
    source: SignalSource,
    weight: f64,
    context: &str,
) -> UpdateOutcome {
    let signal = clamp_unit(signal);
    let rate = source.rate() * weight.clamp(0.0, 1.0);

    match source {
        SignalSource::UserAction => {
            let value = clamp_unit(blend(profile.core.get(dim), signal, rate));
            profile.core.set(dim, value);
            UpdateOutcome::Applied {
                dimension: dim,
                value,
            }
        }
        SignalSource::PeerExchange | SignalSource::NetworkAggregate => {
            let proposed = blend(profile.core.get(dim), signal, rate);
            guard_drift(profile, dim, proposed, context)
        }
        SignalSource::Contextual => {
            let layer = profile.layer_mut(context);
            let value = clamp_unit(blend(layer.adapted.get(dim), signal, rate));
            layer.adapted.set(dim, value);
            UpdateOutcome::LayerOnly {
                dimension: dim,
                context: context.to_string(),
                value,
            }
        }
    }
}

/// Move authenticity toward 1 for user actions and toward 0 otherwise
pub fn update_authenticity(profile: &mut PersonalityProfile, source: SignalSource) {
    profile.authenticity = if source.is_user() {
        blend(profile.authenticity, 1.0, AUTHENTICITY_USER_WEIGHT)
    } else {
        blend(profile.authenticity, 0.0, AUTHENTICITY_EXTERNAL_WEIGHT)
    };
}
