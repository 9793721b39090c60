// Personality model — the local user's long-lived behavioral profile
//
// All mutation goes through `PersonalityModel`, which applies a batch of
// signals to a copy of the state, persists it, and only then swaps it in.
// A failure anywhere in the batch leaves the model untouched.

pub mod context;
pub mod learning;
pub mod profile;
pub mod store;
pub mod transformation;

pub use context::{context_key, Density, DensityTracker, TimeBucket};
pub use learning::{LearningInsight, SignalSource, UpdateOutcome, DRIFT_CEILING};
pub use profile::{
    ContextualLayer, Dimension, DimensionVector, LifePhase, PersonalityProfile, DIMENSIONS,
};
pub use store::ProfileStore;
pub use transformation::{Promotion, RunStatus, TransformationTracker};

use crate::store::{StorageBackend, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Signal must be a number in [0, 1], got {0}")]
    InvalidSignal(f64),
    #[error("Weight must be a number in [0, 1], got {0}")]
    InvalidWeight(f64),
}

#[derive(Clone)]
struct ModelState {
    profile: PersonalityProfile,
    tracker: TransformationTracker,
}

impl ModelState {
    /// One signal: update rule, authenticity, tracker, possible promotion
    fn step(
        &mut self,
        dim: Dimension,
        signal: f64,
        source: SignalSource,
        weight: f64,
        context: &str,
        now: u64,
    ) -> UpdateOutcome {
        let outcome = learning::apply_signal(&mut self.profile, dim, signal, source, weight, context);
        self.after_signal(dim, signal, source, now);
        outcome
    }

    fn after_signal(&mut self, dim: Dimension, signal: f64, source: SignalSource, now: u64) {
        learning::update_authenticity(&mut self.profile, source);

        let shift = signal - self.profile.phase_origin.get(dim);
        self.tracker.record(
            transformation::day_index(now),
            dim,
            shift,
            source.is_user(),
            self.profile.authenticity,
        );

        if let Some(promotion) = self.tracker.evaluate() {
            self.promote(promotion, now);
        }
        self.profile.updated_at = now;
    }

    fn promote(&mut self, promotion: Promotion, now: u64) {
        let trigger = promotion.describe();
        let profile = &mut self.profile;

        profile.evolution_timeline.push(LifePhase::close(
            profile.core,
            profile.phase_started_at,
            now,
            trigger.clone(),
        ));
        profile.core = profile.phase_origin.offset_by(&promotion.mean_shift);
        profile.phase_origin = profile.core;
        profile.phase_started_at = now;
        profile.confidence = promotion.confidence;
        self.tracker.reset();

        info!(
            "Life phase closed ({} on record): {}",
            profile.evolution_timeline.len(),
            trigger
        );
    }
}

pub struct PersonalityModel {
    state: Mutex<ModelState>,
    store: ProfileStore,
}

impl PersonalityModel {
    /// Neutral model that is never persisted
    pub fn in_memory(now: u64) -> Self {
        Self {
            state: Mutex::new(ModelState {
                profile: PersonalityProfile::neutral(now),
                tracker: TransformationTracker::new(),
            }),
            store: ProfileStore::memory(),
        }
    }

    /// Load the stored profile, or start neutral if there is none
    pub fn open(backend: Arc<dyn StorageBackend>, now: u64) -> Result<Self, ModelError> {
        let store = ProfileStore::persistent(backend);
        let profile = store.load_profile(now)?;
        let tracker = store.load_tracker()?;
        debug!(
            "Loaded profile: {} life phases, confidence {:.2}",
            profile.evolution_timeline.len(),
            profile.confidence
        );
        Ok(Self {
            state: Mutex::new(ModelState { profile, tracker }),
            store,
        })
    }

    pub fn profile(&self) -> PersonalityProfile {
        self.state.lock().profile.clone()
    }

    pub fn run_status(&self) -> RunStatus {
        self.state.lock().tracker.status()
    }

    /// Direct user behavior; never clamped
    pub fn record_user_action(
        &self,
        dim: Dimension,
        signal: f64,
        now: u64,
    ) -> Result<UpdateOutcome, ModelError> {
        check_unit(signal, ModelError::InvalidSignal)?;
        self.commit(|state| {
            Ok(state.step(dim, signal, SignalSource::UserAction, 1.0, "", now))
        })
    }

    pub fn apply_network_signal(
        &self,
        dim: Dimension,
        signal: f64,
        context: &str,
        now: u64,
    ) -> Result<UpdateOutcome, ModelError> {
        check_unit(signal, ModelError::InvalidSignal)?;
        self.commit(|state| {
            Ok(state.step(dim, signal, SignalSource::NetworkAggregate, 1.0, context, now))
        })
    }

    /// Adjust only the layer for `context`
    pub fn apply_contextual(
        &self,
        dim: Dimension,
        signal: f64,
        context: &str,
        now: u64,
    ) -> Result<UpdateOutcome, ModelError> {
        check_unit(signal, ModelError::InvalidSignal)?;
        self.commit(|state| {
            Ok(state.step(dim, signal, SignalSource::Contextual, 1.0, context, now))
        })
    }

    /// Push an externally proposed value straight through the drift guard
    pub fn apply_peer_proposal(
        &self,
        dim: Dimension,
        proposed: f64,
        context: &str,
        now: u64,
    ) -> Result<UpdateOutcome, ModelError> {
        check_unit(proposed, ModelError::InvalidSignal)?;
        self.commit(|state| {
            let outcome = learning::guard_drift(&mut state.profile, dim, proposed, context);
            state.after_signal(dim, proposed, SignalSource::PeerExchange, now);
            Ok(outcome)
        })
    }

    /// Apply every insight from one exchange, or none of them
    pub fn apply_insights(
        &self,
        insights: &[LearningInsight],
        context: &str,
        now: u64,
    ) -> Result<Vec<UpdateOutcome>, ModelError> {
        for insight in insights {
            check_unit(insight.signal, ModelError::InvalidSignal)?;
            check_unit(insight.weight, ModelError::InvalidWeight)?;
        }
        if insights.is_empty() {
            return Ok(Vec::new());
        }

        self.commit(|state| {
            Ok(insights
                .iter()
                .map(|insight| {
                    state.step(
                        insight.dimension,
                        insight.signal,
                        SignalSource::PeerExchange,
                        insight.weight,
                        context,
                        now,
                    )
                })
                .collect())
        })
    }

    /// Best similarity between `peer` and any closed life phase
    pub fn historical_resonance(&self, peer: &DimensionVector) -> Option<f64> {
        self.state
            .lock()
            .profile
            .evolution_timeline
            .iter()
            .map(|phase| phase.core.similarity(peer))
            .max_by(|a, b| a.total_cmp(b))
    }

    fn commit<T>(
        &self,
        f: impl FnOnce(&mut ModelState) -> Result<T, ModelError>,
    ) -> Result<T, ModelError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.store.save(&next.profile, &next.tracker)?;
        *state = next;
        Ok(out)
    }
}

fn check_unit(value: f64, err: fn(f64) -> ModelError) -> Result<(), ModelError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(err(value))
    }
}
