// Connection orchestrator — discovery to learning, one peer at a time
//
// discover -> anonymize -> exchange over the radio -> score -> derive
// insights -> apply through the drift guard -> record the connection.
// Each peer address has at most one exchange in flight; distinct peers run
// as independent tasks.

pub mod external;
pub mod insights;

pub use external::{
    AnonymizedPayload, Anonymizer, CompatibilityScorer, PrivacyLevel, QuantizingAnonymizer,
    VectorSimilarityScorer, MAX_PAYLOAD_LEN,
};
pub use insights::{derive_insights, MAX_INSIGHTS, MIN_COMPATIBILITY, MIN_GAP};

use crate::frame::SenderId;
use crate::personality::{Density, DensityTracker, ModelError, PersonalityModel};
use crate::store::{ConnectionLog, ConnectionRecord, DedupCache, StorageBackend, StoreError};
use crate::transport::ble::scanner::DEFAULT_BACKOFF_MS;
use crate::transport::{
    ble::{Admission, ServiceData},
    CentralClient, ExchangeError, GattPeripheral, ScanGate, ScanResult,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LEARNED_PREFIX: &[u8] = b"learned:";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Exchange with {0} already in flight")]
    ExchangeInFlight(String),
    #[error("Anonymized payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Anonymization failed: {0}")]
    Anonymize(String),
    #[error("Scoring failed: {0}")]
    Scoring(String),
    #[error("Exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub privacy_level: PrivacyLevel,
    /// Per-address connect backoff
    pub backoff_ms: u64,
    /// How long a learned-from payload suppresses re-learning
    pub learned_ttl_ms: u64,
    pub connection_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            privacy_level: PrivacyLevel::default(),
            backoff_ms: DEFAULT_BACKOFF_MS,
            learned_ttl_ms: crate::store::dedup::DEFAULT_DEDUP_TTL_MS,
            connection_capacity: crate::store::connections::DEFAULT_CONNECTION_CAPACITY,
        }
    }
}

/// The two external collaborators the orchestrator consults
#[derive(Clone)]
pub struct Collaborators {
    pub anonymizer: Arc<dyn Anonymizer>,
    pub scorer: Arc<dyn CompatibilityScorer>,
}

impl Collaborators {
    /// Quantizing anonymizer and vector-similarity scorer
    pub fn reference() -> Self {
        Self {
            anonymizer: Arc::new(QuantizingAnonymizer),
            scorer: Arc::new(VectorSimilarityScorer),
        }
    }
}

/// Releases an address's in-flight marker when dropped
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    address: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.address);
    }
}

pub struct ConnectionOrchestrator {
    node_id: SenderId,
    central: Arc<CentralClient>,
    peripheral: Arc<GattPeripheral>,
    model: Arc<PersonalityModel>,
    collaborators: Collaborators,
    privacy_level: PrivacyLevel,
    connections: Arc<ConnectionLog>,
    learned: Mutex<DedupCache>,
    gate: Mutex<ScanGate>,
    density: Mutex<DensityTracker>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    next_message_id: AtomicU32,
    connection_tx: broadcast::Sender<ConnectionRecord>,
}

impl ConnectionOrchestrator {
    pub fn new(
        node_id: SenderId,
        central: Arc<CentralClient>,
        peripheral: Arc<GattPeripheral>,
        model: Arc<PersonalityModel>,
        collaborators: Collaborators,
        backend: Arc<dyn StorageBackend>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        let learned = DedupCache::open(
            backend.clone(),
            LEARNED_PREFIX,
            config.learned_ttl_ms,
            crate::unix_millis(),
        )?;
        let connections = Arc::new(ConnectionLog::open(backend, config.connection_capacity)?);
        let (connection_tx, _) = broadcast::channel(64);

        Ok(Self {
            node_id,
            central,
            peripheral,
            model,
            collaborators,
            privacy_level: config.privacy_level,
            connections,
            learned: Mutex::new(learned),
            gate: Mutex::new(ScanGate::new(config.backoff_ms)),
            density: Mutex::new(DensityTracker::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(HashMap::new()),
            next_message_id: AtomicU32::new(rand::random()),
            connection_tx,
        })
    }

    pub fn node_id(&self) -> &SenderId {
        &self.node_id
    }

    pub fn model(&self) -> &Arc<PersonalityModel> {
        &self.model
    }

    pub fn connections(&self) -> &Arc<ConnectionLog> {
        &self.connections
    }

    pub fn central(&self) -> &Arc<CentralClient> {
        &self.central
    }

    pub fn peripheral(&self) -> &Arc<GattPeripheral> {
        &self.peripheral
    }

    /// How crowded the surroundings look from recent advertisements
    pub fn density(&self, now: u64) -> Density {
        self.density.lock().density(now)
    }

    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionRecord> {
        self.connection_tx.subscribe()
    }

    /// Anonymize the current profile and serve it on the profile stream.
    /// Called before every exchange and after every change learned from one.
    pub async fn enqueue_local_profile(&self) -> Result<AnonymizedPayload, OrchestratorError> {
        let profile = self.model.profile();
        let payload = self
            .collaborators
            .anonymizer
            .anonymize(&profile, self.privacy_level)
            .await?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(OrchestratorError::PayloadTooLarge(payload.len()));
        }

        self.peripheral.publish_profile(payload.bytes().to_vec()).await;
        debug!(
            "Local profile enqueued ({} bytes, {})",
            payload.len(),
            payload.short_signature()
        );
        Ok(payload)
    }

    /// Feed one advertisement through density tracking and the connect gate;
    /// admitted peers get an exchange task
    pub fn handle_scan_result(self: &Arc<Self>, result: &ScanResult) -> Admission {
        if let Some(data) = ServiceData::parse(&result.service_data) {
            self.density
                .lock()
                .observe(&data.hint_hex(), result.timestamp);
        }

        let admission = self.gate.lock().admit(result, result.timestamp);
        if !matches!(admission, Admission::Attempt(_)) {
            return admission;
        }

        let guard = match self.claim(&result.address) {
            Ok(guard) => guard,
            Err(e) => {
                debug!("Skipping {}: {}", result.address, e);
                return admission;
            }
        };

        let this = Arc::clone(self);
        let address = result.address.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.run_exchange(&address).await {
                warn!("Exchange with {} abandoned: {}", address, e);
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(result.address.clone(), handle);
        admission
    }

    /// Run one exchange with `address` on the caller's task
    pub async fn exchange_with(&self, address: &str) -> Result<ConnectionRecord, OrchestratorError> {
        let _guard = self.claim(address)?;
        self.run_exchange(address).await
    }

    fn claim(&self, address: &str) -> Result<InFlightGuard, OrchestratorError> {
        if !self.in_flight.lock().insert(address.to_string()) {
            return Err(OrchestratorError::ExchangeInFlight(address.to_string()));
        }
        Ok(InFlightGuard {
            set: self.in_flight.clone(),
            address: address.to_string(),
        })
    }

    async fn run_exchange(&self, address: &str) -> Result<ConnectionRecord, OrchestratorError> {
        let local = self.enqueue_local_profile().await?;

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let report = self
            .central
            .exchange(address, &self.node_id, message_id, local.bytes())
            .await?;
        if !report.acknowledged {
            debug!("{} has not acknowledged message {} yet", address, message_id);
        }

        self.process_peer_payload(report.peer_payload, crate::unix_millis())
            .await
    }

    /// Score a peer payload, learn from it once per TTL window, and record
    /// the connection
    pub async fn process_peer_payload(
        &self,
        bytes: Vec<u8>,
        now: u64,
    ) -> Result<ConnectionRecord, OrchestratorError> {
        let peer = AnonymizedPayload::new(bytes)?;
        let local = self.enqueue_local_profile().await?;

        let compatibility = self.collaborators.scorer.score(&local, &peer).await?;
        if !compatibility.is_finite() {
            return Err(OrchestratorError::Scoring(format!(
                "non-finite compatibility {}",
                compatibility
            )));
        }
        let compatibility = compatibility.clamp(0.0, 1.0);
        let peer_vector = self.collaborators.anonymizer.decode_vector(&peer);
        let context = self.density.lock().context(now);

        let already_learned = self.learned.lock().is_fresh(peer.signature(), now);
        let applied = match (&peer_vector, already_learned) {
            (Some(vector), false) => {
                let core = self.model.profile().core;
                let insights = derive_insights(&core, vector, compatibility);
                let outcomes = self.model.apply_insights(&insights, &context, now)?;
                self.learned.lock().insert(peer.signature(), now)?;
                if !outcomes.is_empty() {
                    if let Err(e) = self.enqueue_local_profile().await {
                        warn!("Republishing profile after learning failed: {}", e);
                    }
                }
                outcomes.iter().map(|o| o.summary()).collect()
            }
            (None, _) => {
                debug!("Peer payload {} has no decodable vector", peer.short_signature());
                Vec::new()
            }
            (Some(_), true) => {
                debug!("Already learned from {} recently", peer.short_signature());
                Vec::new()
            }
        };

        let historical_resonance = peer_vector
            .as_ref()
            .and_then(|v| self.model.historical_resonance(v));

        let record = ConnectionRecord {
            peer_signature: peer.signature().to_string(),
            compatibility,
            historical_resonance,
            context,
            insights: applied,
            recorded_at: now,
        };
        self.connections.push(record.clone())?;
        let _ = self.connection_tx.send(record.clone());

        info!(
            "Connection {}: compatibility {:.2}, {} insight(s)",
            peer.short_signature(),
            compatibility,
            record.insights.len()
        );
        Ok(record)
    }

    /// Exchanges currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Wait for every spawned exchange to finish
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        futures::future::join_all(handles).await;
    }

    /// Abort spawned exchanges and forget transient state
    pub fn abort_all(&self) {
        for (address, task) in self.tasks.lock().drain() {
            if !task.is_finished() {
                debug!("Aborting exchange with {}", address);
            }
            task.abort();
        }
        self.in_flight.lock().clear();
        self.gate.lock().clear();
        self.density.lock().clear();
        self.central.clear_partials();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DEFAULT_MAX_CHUNK, STREAM_PROFILE};
    use crate::personality::{Dimension, DimensionVector};
    use crate::store::{AckStore, DeliveryPipeline, InboxStore, MemoryStorage};
    use crate::transport::{BeaconBuilder, LoopbackAir};
    use external::{MockAnonymizer, MockCompatibilityScorer};
    use std::time::Duration;

    const NODE: &str = "7a1c5f7e-0000-4000-8000-000000000001";

    fn orchestrator(collaborators: Collaborators) -> Arc<ConnectionOrchestrator> {
        orchestrator_with(collaborators, OrchestratorConfig::default())
    }

    fn orchestrator_with(
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Arc<ConnectionOrchestrator> {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let air = LoopbackAir::new();
        let radio = air.radio("self");
        let acks = Arc::new(AckStore::open(backend.clone(), 64).unwrap());
        let inbox = Arc::new(InboxStore::open(backend.clone(), 64).unwrap());
        let pipeline = Arc::new(
            DeliveryPipeline::open(backend.clone(), acks, inbox, 60_000, 600_000, 0).unwrap(),
        );
        let (inbound_tx, _) = broadcast::channel(8);
        let peripheral = Arc::new(GattPeripheral::new(
            radio.clone(),
            pipeline,
            BeaconBuilder::new(NODE),
            DEFAULT_MAX_CHUNK,
            inbound_tx,
        ));
        let central = Arc::new(CentralClient::new(
            radio,
            DEFAULT_MAX_CHUNK,
            Duration::from_secs(5),
        ));
        Arc::new(
            ConnectionOrchestrator::new(
                SenderId::new(NODE).unwrap(),
                central,
                peripheral,
                Arc::new(PersonalityModel::in_memory(0)),
                collaborators,
                backend,
                config,
            )
            .unwrap(),
        )
    }

    fn peer_payload(novelty: f64) -> Vec<u8> {
        let mut v = DimensionVector::neutral();
        v.set(Dimension::NoveltySeeking, novelty);
        QuantizingAnonymizer::encode(&v, PrivacyLevel::Low)
    }

    #[tokio::test]
    async fn test_learns_once_per_payload() {
        let orch = orchestrator(Collaborators::reference());
        let mut events = orch.subscribe_connections();

        let first = orch.process_peer_payload(peer_payload(0.9), 1_000).await.unwrap();
        assert_eq!(first.insights.len(), 1);
        assert!(first.compatibility > 0.9);
        assert_eq!(first.historical_resonance, None);
        let after_first = orch.model().profile().core;
        assert!(after_first.get(Dimension::NoveltySeeking) > 0.5);

        let second = orch.process_peer_payload(peer_payload(0.9), 2_000).await.unwrap();
        assert!(second.insights.is_empty());
        assert_eq!(orch.model().profile().core, after_first);

        assert_eq!(orch.connections().len(), 2);
        assert_eq!(events.recv().await.unwrap(), first);
        assert_eq!(events.recv().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_record_is_redacted() {
        let orch = orchestrator(Collaborators::reference());
        let bytes = peer_payload(0.2);
        let record = orch.process_peer_payload(bytes.clone(), 0).await.unwrap();
        assert_eq!(
            record.peer_signature,
            hex::encode(blake3::hash(&bytes).as_bytes())
        );
        assert_eq!(record.context, "night-quiet");
    }

    #[tokio::test]
    async fn test_low_compatibility_leaves_model_unchanged() {
        let mut scorer = MockCompatibilityScorer::new();
        scorer.expect_score().returning(|_, _| Ok(0.1));
        let orch = orchestrator(Collaborators {
            anonymizer: Arc::new(QuantizingAnonymizer),
            scorer: Arc::new(scorer),
        });

        let record = orch.process_peer_payload(peer_payload(1.0), 0).await.unwrap();
        assert!(record.insights.is_empty());
        assert_eq!(orch.model().profile().core, DimensionVector::neutral());
    }

    #[tokio::test]
    async fn test_anonymizer_failure_aborts_exchange() {
        let mut anonymizer = MockAnonymizer::new();
        anonymizer
            .expect_anonymize()
            .returning(|_, _| Err(OrchestratorError::Anonymize("budget exhausted".into())));
        anonymizer.expect_decode_vector().returning(|_| None);
        let orch = orchestrator(Collaborators {
            anonymizer: Arc::new(anonymizer),
            scorer: Arc::new(VectorSimilarityScorer),
        });

        assert!(matches!(
            orch.process_peer_payload(peer_payload(1.0), 0).await,
            Err(OrchestratorError::Anonymize(_))
        ));
        assert!(orch.connections().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_peer_payload_rejected() {
        let orch = orchestrator(Collaborators::reference());
        assert!(matches!(
            orch.process_peer_payload(vec![0; MAX_PAYLOAD_LEN + 1], 0).await,
            Err(OrchestratorError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_one_exchange_in_flight_per_peer() {
        let orch = orchestrator(Collaborators::reference());
        let _held = orch.claim("peer-a").unwrap();
        assert_eq!(orch.in_flight(), 1);

        assert!(matches!(
            orch.exchange_with("peer-a").await,
            Err(OrchestratorError::ExchangeInFlight(_))
        ));
        // a different peer is not blocked by the marker
        assert!(matches!(
            orch.exchange_with("peer-b").await,
            Err(OrchestratorError::Exchange(_))
        ));
        assert_eq!(orch.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_scan_gate_backoff_and_abort() {
        let orch = orchestrator(Collaborators::reference());
        let data = ServiceData::new(true, true, [1, 2, 3, 4]).encode().to_vec();
        let result = ScanResult {
            address: "peer-a".into(),
            rssi: -60,
            service_data: data,
            timestamp: 1_000,
        };

        assert!(matches!(
            orch.handle_scan_result(&result),
            Admission::Attempt(_)
        ));
        assert!(matches!(
            orch.handle_scan_result(&result),
            Admission::BackingOff { .. }
        ));

        orch.join_all().await;
        assert_eq!(orch.in_flight(), 0);
        orch.abort_all();
        assert!(matches!(
            orch.handle_scan_result(&result),
            Admission::Attempt(_)
        ));
        orch.abort_all();
    }

    #[tokio::test]
    async fn test_scorer_failure_aborts_without_learning() {
        let mut scorer = MockCompatibilityScorer::new();
        scorer
            .expect_score()
            .returning(|_, _| Err(OrchestratorError::Scoring("model offline".into())));
        let orch = orchestrator(Collaborators {
            anonymizer: Arc::new(QuantizingAnonymizer),
            scorer: Arc::new(scorer),
        });

        assert!(matches!(
            orch.process_peer_payload(peer_payload(1.0), 0).await,
            Err(OrchestratorError::Scoring(_))
        ));
        assert_eq!(orch.model().profile().core, DimensionVector::neutral());
        assert!(orch.connections().is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_score_rejected() {
        let mut scorer = MockCompatibilityScorer::new();
        scorer.expect_score().returning(|_, _| Ok(f64::NAN));
        let orch = orchestrator(Collaborators {
            anonymizer: Arc::new(QuantizingAnonymizer),
            scorer: Arc::new(scorer),
        });
        let mut events = orch.subscribe_connections();

        assert!(matches!(
            orch.process_peer_payload(peer_payload(1.0), 0).await,
            Err(OrchestratorError::Scoring(_))
        ));
        assert_eq!(orch.model().profile().core, DimensionVector::neutral());
        assert!(orch.connections().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_served_profile_follows_learning() {
        let orch = orchestrator_with(
            Collaborators::reference(),
            OrchestratorConfig {
                privacy_level: PrivacyLevel::Low,
                ..Default::default()
            },
        );
        let before = orch.enqueue_local_profile().await.unwrap();
        assert_eq!(
            orch.peripheral().served_stream(STREAM_PROFILE),
            Some(before.bytes().to_vec())
        );

        let record = orch.process_peer_payload(peer_payload(1.0), 1_000).await.unwrap();
        assert_eq!(record.insights.len(), 1);

        let served = orch.peripheral().served_stream(STREAM_PROFILE).unwrap();
        assert_ne!(served, before.bytes().to_vec());
        let expected = QuantizingAnonymizer::encode(&orch.model().profile().core, PrivacyLevel::Low);
        assert_eq!(served, expected);
    }
}
