// Attune Core — offline profile exchange and drift-resistant learning
//
// Two devices in radio range swap a small anonymized profile, score it, and
// each evolves its own long-lived model from what it learned. No network.
#![allow(clippy::empty_line_after_doc_comments)]

pub mod frame;
pub mod orchestrator;
pub mod personality;
pub mod service;
pub mod store;
pub mod transport;

pub use frame::{
    ControlFrame, Frame, FrameError, MessageFrame, ReadResponseFrame, SenderId, DEFAULT_MAX_CHUNK,
};
pub use orchestrator::{
    AnonymizedPayload, Anonymizer, Collaborators, CompatibilityScorer, ConnectionOrchestrator,
    OrchestratorConfig, OrchestratorError, PrivacyLevel, QuantizingAnonymizer,
    VectorSimilarityScorer,
};
pub use personality::{
    Dimension, DimensionVector, LearningInsight, LifePhase, ModelError, PersonalityModel,
    PersonalityProfile, UpdateOutcome,
};
pub use service::{
    load_or_create_node_id, AdvertiseMode, ExchangeService, ServiceConfig, ServiceError,
    ServiceState, ServiceStats,
};
pub use store::{
    ConnectionRecord, DeliveryOutcome, DeliveryPipeline, InboundMessage, MemoryStorage,
    SledStorage, StorageBackend, StoreError,
};
pub use transport::{LoopbackAir, LoopbackRadio, RadioError};

/// Install the default tracing subscriber (idempotent)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Current time in unix milliseconds
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }

    #[test]
    fn test_unix_millis_advances() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(a > 1_600_000_000_000);
        assert!(b >= a);
    }
}
