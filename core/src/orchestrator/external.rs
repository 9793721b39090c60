// External collaborators — anonymization and compatibility scoring
//
// The orchestrator only sees these traits. The reference implementations
// below make the core runnable end to end without the production formulas.

use super::OrchestratorError;
use crate::personality::{Dimension, DimensionVector, PersonalityProfile, DIMENSIONS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Upper bound on an anonymized payload
pub const MAX_PAYLOAD_LEN: usize = 256;

const PAYLOAD_VERSION: u8 = 0x01;
const PAYLOAD_LEN: usize = 2 + DIMENSIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrivacyLevel {
    Low,
    #[default]
    Standard,
    High,
}

impl PrivacyLevel {
    /// Distinct values each dimension may take on the wire
    pub fn levels(self) -> u16 {
        match self {
            PrivacyLevel::Low => 256,
            PrivacyLevel::Standard => 16,
            PrivacyLevel::High => 4,
        }
    }

    fn code(self) -> u8 {
        match self {
            PrivacyLevel::Low => 0,
            PrivacyLevel::Standard => 1,
            PrivacyLevel::High => 2,
        }
    }
}

impl std::fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivacyLevel::Low => write!(f, "low"),
            PrivacyLevel::Standard => write!(f, "standard"),
            PrivacyLevel::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for PrivacyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(PrivacyLevel::Low),
            "standard" => Ok(PrivacyLevel::Standard),
            "high" => Ok(PrivacyLevel::High),
            other => Err(format!("Unknown privacy level: {}", other)),
        }
    }
}

/// Bounded anonymized profile plus its content signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymizedPayload {
    bytes: Vec<u8>,
    signature: String,
}

impl AnonymizedPayload {
    pub fn new(bytes: Vec<u8>) -> Result<Self, OrchestratorError> {
        if bytes.len() > MAX_PAYLOAD_LEN {
            return Err(OrchestratorError::PayloadTooLarge(bytes.len()));
        }
        let signature = hex::encode(blake3::hash(&bytes).as_bytes());
        Ok(Self { bytes, signature })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex blake3 of the bytes; safe to log and to store
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn short_signature(&self) -> &str {
        &self.signature[..12]
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Anonymizer: Send + Sync {
    async fn anonymize(
        &self,
        profile: &PersonalityProfile,
        level: PrivacyLevel,
    ) -> Result<AnonymizedPayload, OrchestratorError>;

    /// Recover an approximate vector from a peer payload, if the format is known
    fn decode_vector(&self, payload: &AnonymizedPayload) -> Option<DimensionVector>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompatibilityScorer: Send + Sync {
    /// Compatibility in [0, 1]
    async fn score(
        &self,
        ours: &AnonymizedPayload,
        theirs: &AnonymizedPayload,
    ) -> Result<f64, OrchestratorError>;
}

/// Quantizes each core dimension to one byte, coarsened by privacy level.
///
/// Layout: `[version][privacy][12 x quantized value]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizingAnonymizer;

impl QuantizingAnonymizer {
    pub fn encode(vector: &DimensionVector, level: PrivacyLevel) -> Vec<u8> {
        let steps = f64::from(level.levels() - 1);
        let mut out = Vec::with_capacity(PAYLOAD_LEN);
        out.push(PAYLOAD_VERSION);
        out.push(level.code());
        for dim in Dimension::ALL {
            let bucket = (vector.get(dim) * steps).round();
            out.push(((bucket / steps) * 255.0).round() as u8);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<DimensionVector> {
        if bytes.len() != PAYLOAD_LEN || bytes[0] != PAYLOAD_VERSION {
            return None;
        }
        let mut values = [0.0; DIMENSIONS];
        for (v, b) in values.iter_mut().zip(&bytes[2..]) {
            *v = f64::from(*b) / 255.0;
        }
        Some(DimensionVector::from_values(values))
    }
}

#[async_trait]
impl Anonymizer for QuantizingAnonymizer {
    async fn anonymize(
        &self,
        profile: &PersonalityProfile,
        level: PrivacyLevel,
    ) -> Result<AnonymizedPayload, OrchestratorError> {
        AnonymizedPayload::new(Self::encode(&profile.core, level))
    }

    fn decode_vector(&self, payload: &AnonymizedPayload) -> Option<DimensionVector> {
        Self::decode(payload.bytes())
    }
}

/// 1 - mean absolute difference of the decoded vectors; 0 when either side
/// cannot be decoded
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorSimilarityScorer;

#[async_trait]
impl CompatibilityScorer for VectorSimilarityScorer {
    async fn score(
        &self,
        ours: &AnonymizedPayload,
        theirs: &AnonymizedPayload,
    ) -> Result<f64, OrchestratorError> {
        Ok(
            match (
                QuantizingAnonymizer::decode(ours.bytes()),
                QuantizingAnonymizer::decode(theirs.bytes()),
            ) {
                (Some(a), Some(b)) => a.similarity(&b),
                _ => 0.0,
            },
        )
    }
}
