//! Exchange service — lifecycle owner for one Attune node
//!
//! Platform code (or the CLI simulation) builds an `ExchangeService` around a
//! storage backend and the two radio roles, calls `start()`, and listens on
//! the inbound and connection streams. `stop()` tears everything transient
//! down before returning.

use crate::frame::{SenderId, DEFAULT_MAX_CHUNK};
use crate::orchestrator::{
    AnonymizedPayload, Collaborators, ConnectionOrchestrator, OrchestratorConfig,
    OrchestratorError, PrivacyLevel,
};
use crate::personality::{Density, ModelError, PersonalityModel};
use crate::store::{
    AckStore, ConnectionRecord, DeliveryPipeline, InboundMessage, InboxStore, StorageBackend,
    StoreError,
};
use crate::transport::ble::{
    BatteryState, BeaconBuilder, BleScanConfig, BleScanner, CentralClient, CentralRadio,
    GattPeripheral, PeripheralRadio, ScanResult, ATTUNE_SERVICE_UUID,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest BLE attribute value
const MAX_ATTRIBUTE_LEN: usize = 512;

const NODE_ID_KEY: &[u8] = b"node:id";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Service in invalid state: {0}")]
    InvalidState(String),

    #[error("BLE unavailable on this device")]
    TransportUnavailable,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How the node advertises itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    /// Connectable, dropping to presence-only when the area is crowded
    #[default]
    Auto,
    Connectable,
    PresenceOnly,
}

impl AdvertiseMode {
    /// Whether to accept connections given the surrounding density
    pub fn connectable(self, density: Density) -> bool {
        match self {
            AdvertiseMode::Auto => density != Density::Crowded,
            AdvertiseMode::Connectable => true,
            AdvertiseMode::PresenceOnly => false,
        }
    }
}

impl std::fmt::Display for AdvertiseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdvertiseMode::Auto => write!(f, "auto"),
            AdvertiseMode::Connectable => write!(f, "connectable"),
            AdvertiseMode::PresenceOnly => write!(f, "presence_only"),
        }
    }
}

impl std::str::FromStr for AdvertiseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(AdvertiseMode::Auto),
            "connectable" => Ok(AdvertiseMode::Connectable),
            "presence_only" | "presence" => Ok(AdvertiseMode::PresenceOnly),
            other => Err(format!("Unknown advertise mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Payload bytes per frame
    pub max_chunk: usize,
    /// Bound on one whole exchange
    pub exchange_timeout_ms: u64,
    /// Per-address connect backoff
    pub backoff_ms: u64,
    pub scan: BleScanConfig,
    pub beacon_rotation_secs: u64,
    pub advertise_mode: AdvertiseMode,
    pub privacy_level: PrivacyLevel,
    pub reassembly_idle_ms: u64,
    pub dedup_ttl_ms: u64,
    pub ack_capacity: usize,
    pub inbox_capacity: usize,
    pub connection_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_chunk: DEFAULT_MAX_CHUNK,
            exchange_timeout_ms: crate::transport::ble::central::DEFAULT_EXCHANGE_TIMEOUT_MS,
            backoff_ms: crate::transport::ble::scanner::DEFAULT_BACKOFF_MS,
            scan: BleScanConfig::default(),
            beacon_rotation_secs: crate::transport::ble::DEFAULT_BEACON_ROTATION_SECS,
            advertise_mode: AdvertiseMode::default(),
            privacy_level: PrivacyLevel::default(),
            reassembly_idle_ms: crate::store::reassembly::DEFAULT_REASSEMBLY_IDLE_MS,
            dedup_ttl_ms: crate::store::dedup::DEFAULT_DEDUP_TTL_MS,
            ack_capacity: crate::store::ack::DEFAULT_ACK_CAPACITY,
            inbox_capacity: crate::store::inbox::DEFAULT_INBOX_CAPACITY,
            connection_capacity: crate::store::connections::DEFAULT_CONNECTION_CAPACITY,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        let max_frame_payload = MAX_ATTRIBUTE_LEN - crate::frame::MessageFrame::V2_HEADER_LEN;
        if self.max_chunk == 0 || self.max_chunk > max_frame_payload {
            return Err(ServiceError::InvalidConfig(format!(
                "max_chunk must be in 1..={}",
                max_frame_payload
            )));
        }
        if self.exchange_timeout_ms == 0 {
            return Err(ServiceError::InvalidConfig(
                "exchange_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.beacon_rotation_secs == 0 {
            return Err(ServiceError::InvalidConfig(
                "beacon_rotation_secs must be > 0".to_string(),
            ));
        }
        if self.reassembly_idle_ms == 0 || self.dedup_ttl_ms == 0 {
            return Err(ServiceError::InvalidConfig(
                "reassembly and dedup windows must be > 0".to_string(),
            ));
        }
        if self.ack_capacity == 0 || self.inbox_capacity == 0 || self.connection_capacity == 0 {
            return Err(ServiceError::InvalidConfig(
                "store capacities must be > 0".to_string(),
            ));
        }
        self.scan
            .validate()
            .map_err(|e| ServiceError::InvalidConfig(e.to_string()))
    }
}

// ============================================================================
// STATE & STATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub state: ServiceState,
    pub uptime_secs: u64,
    pub inbox_len: usize,
    pub acks_len: usize,
    pub connections_len: usize,
    pub pending_reassemblies: usize,
    pub exchanges_in_flight: usize,
    pub duty_cycle_percent: u8,
    pub scan_mode: String,
}

// ============================================================================
// EXCHANGE SERVICE
// ============================================================================

pub struct ExchangeService {
    config: ServiceConfig,
    state: RwLock<ServiceState>,
    node_id: SenderId,
    pipeline: Arc<DeliveryPipeline>,
    peripheral: Arc<GattPeripheral>,
    central_radio: Arc<dyn CentralRadio>,
    orchestrator: Arc<ConnectionOrchestrator>,
    scanner: Arc<Mutex<BleScanner>>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    started_at: RwLock<Option<u64>>,
}

impl ExchangeService {
    pub fn new(
        config: ServiceConfig,
        backend: Arc<dyn StorageBackend>,
        peripheral_radio: Arc<dyn PeripheralRadio>,
        central_radio: Arc<dyn CentralRadio>,
        collaborators: Collaborators,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let now = crate::unix_millis();

        let node_id = load_or_create_node_id(backend.as_ref())?;
        let sender = SenderId::new(&node_id)
            .map_err(|e| ServiceError::InvalidConfig(format!("stored node id: {}", e)))?;

        let acks = Arc::new(AckStore::open(backend.clone(), config.ack_capacity)?);
        let inbox = Arc::new(InboxStore::open(backend.clone(), config.inbox_capacity)?);
        let pipeline = Arc::new(DeliveryPipeline::open(
            backend.clone(),
            acks,
            inbox,
            config.reassembly_idle_ms,
            config.dedup_ttl_ms,
            now,
        )?);

        let beacon = BeaconBuilder::new(node_id.clone())
            .with_rotation_period(config.beacon_rotation_secs)
            .map_err(|e| ServiceError::InvalidConfig(e.to_string()))?;
        let (inbound_tx, _) = broadcast::channel(64);
        let peripheral = Arc::new(GattPeripheral::new(
            peripheral_radio,
            pipeline.clone(),
            beacon,
            config.max_chunk,
            inbound_tx.clone(),
        ));
        let central = Arc::new(CentralClient::new(
            central_radio.clone(),
            config.max_chunk,
            Duration::from_millis(config.exchange_timeout_ms),
        ));

        let model = Arc::new(PersonalityModel::open(backend.clone(), now)?);
        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            sender.clone(),
            central,
            peripheral.clone(),
            model,
            collaborators,
            backend,
            OrchestratorConfig {
                privacy_level: config.privacy_level,
                backoff_ms: config.backoff_ms,
                learned_ttl_ms: config.dedup_ttl_ms,
                connection_capacity: config.connection_capacity,
            },
        )?);

        let scanner = BleScanner::new(config.scan.clone(), BatteryState::Good)
            .map_err(|e| ServiceError::InvalidConfig(e.to_string()))?;

        info!("Exchange service created for node {}", node_id);
        Ok(Self {
            config,
            state: RwLock::new(ServiceState::Stopped),
            node_id: sender,
            pipeline,
            peripheral,
            central_radio,
            orchestrator,
            scanner: Arc::new(Mutex::new(scanner)),
            inbound_tx,
            scan_task: Mutex::new(None),
            started_at: RwLock::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        self.node_id.as_str()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn model(&self) -> &Arc<PersonalityModel> {
        self.orchestrator.model()
    }

    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator> {
        &self.orchestrator
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.pipeline
    }

    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }

    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionRecord> {
        self.orchestrator.subscribe_connections()
    }

    /// Re-anonymize the current profile and serve it to peers
    pub async fn enqueue_local_profile(&self) -> Result<AnonymizedPayload, ServiceError> {
        Ok(self.orchestrator.enqueue_local_profile().await?)
    }

    /// Re-evaluate connectable vs presence-only advertising now
    pub async fn refresh_advertise_mode(&self) -> bool {
        apply_advertise_mode(
            self.config.advertise_mode,
            &self.orchestrator,
            crate::unix_millis(),
        )
        .await
    }

    /// Feed the battery level into the scan duty cycle
    pub fn set_battery(&self, percent: u8, charging: bool) {
        let state = if charging {
            BatteryState::Charging
        } else {
            BatteryState::from_percentage(percent)
        };
        let mut scanner = self.scanner.lock();
        scanner.set_battery_state(state);
        debug!(
            "Battery {}% (charging: {}), scan mode {} at {}%",
            percent,
            charging,
            scanner.mode(),
            scanner.duty_cycle()
        );
    }

    /// Start advertising, serving and scanning
    ///
    /// Transitions: Stopped -> Starting -> Running. Fails without side
    /// effects when the radio is unavailable.
    pub async fn start(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.state.write();
            if *state != ServiceState::Stopped {
                return Err(ServiceError::InvalidState(format!(
                    "Cannot start from {} state",
                    *state
                )));
            }
            *state = ServiceState::Starting;
        }

        if let Err(e) = self.bring_up().await {
            *self.state.write() = ServiceState::Stopped;
            return Err(e);
        }

        *self.started_at.write() = Some(crate::unix_millis());
        *self.state.write() = ServiceState::Running;
        info!("Exchange service running as {}", self.node_id.as_str());
        Ok(())
    }

    async fn bring_up(&self) -> Result<(), ServiceError> {
        // the profile stream must exist before the first advertisement
        self.orchestrator.enqueue_local_profile().await?;
        apply_advertise_mode(
            self.config.advertise_mode,
            &self.orchestrator,
            crate::unix_millis(),
        )
        .await;
        if !self.peripheral.start().await {
            return Err(ServiceError::TransportUnavailable);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self.central_radio.start_scan(ATTUNE_SERVICE_UUID, tx.clone()).await {
            warn!("Failed to start scanning: {}", e);
            self.peripheral.stop().await;
            return Err(ServiceError::TransportUnavailable);
        }
        self.scanner.lock().start_scanning(crate::unix_millis());

        let task = tokio::spawn(scan_loop(
            self.config.advertise_mode,
            self.orchestrator.clone(),
            self.peripheral.clone(),
            self.central_radio.clone(),
            self.scanner.clone(),
            tx,
            rx,
        ));
        *self.scan_task.lock() = Some(task);
        Ok(())
    }

    /// Stop everything and clear transient state
    ///
    /// Cursors, reassembly buffers, retained partial reads and in-flight
    /// markers are cleared and spawned tasks aborted before this returns, even
    /// when the radio refuses to stop.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.state.write();
            if *state != ServiceState::Running {
                return Err(ServiceError::InvalidState(format!(
                    "Cannot stop from {} state",
                    *state
                )));
            }
            *state = ServiceState::Stopping;
        }

        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        self.orchestrator.abort_all();
        self.orchestrator.central().disconnect_all().await;
        self.pipeline.clear_transient();
        self.scanner.lock().stop_scanning(crate::unix_millis());

        let mut radio_ok = true;
        if let Err(e) = self.central_radio.stop_scan().await {
            warn!("Failed to stop scanning: {}", e);
            radio_ok = false;
        }
        if !self.peripheral.stop().await {
            radio_ok = false;
        }

        *self.started_at.write() = None;
        *self.state.write() = ServiceState::Stopped;
        info!("Exchange service stopped");

        if radio_ok {
            Ok(())
        } else {
            Err(ServiceError::TransportUnavailable)
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let uptime_secs = self
            .started_at
            .read()
            .map(|started| crate::unix_millis().saturating_sub(started) / 1000)
            .unwrap_or(0);
        let scanner = self.scanner.lock();

        ServiceStats {
            state: self.state(),
            uptime_secs,
            inbox_len: self.pipeline.inbox().len(),
            acks_len: self.pipeline.acks().len(),
            connections_len: self.orchestrator.connections().len(),
            pending_reassemblies: self.pipeline.pending_reassemblies(),
            exchanges_in_flight: self.orchestrator.in_flight(),
            duty_cycle_percent: scanner.duty_cycle(),
            scan_mode: scanner.mode().to_string(),
        }
    }
}

/// Alternate scan windows and pauses per the duty cycle, handing every
/// advertisement to the orchestrator. Runs until aborted.
async fn scan_loop(
    advertise_mode: AdvertiseMode,
    orchestrator: Arc<ConnectionOrchestrator>,
    peripheral: Arc<GattPeripheral>,
    radio: Arc<dyn CentralRadio>,
    scanner: Arc<Mutex<BleScanner>>,
    tx: mpsc::UnboundedSender<ScanResult>,
    mut rx: mpsc::UnboundedReceiver<ScanResult>,
) {
    loop {
        let (window_ms, pause_ms) = {
            let s = scanner.lock();
            (s.scan_duration_ms(), s.pause_duration_ms())
        };

        let window = tokio::time::sleep(Duration::from_millis(window_ms.max(1)));
        tokio::pin!(window);
        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Some(result) => {
                        orchestrator.handle_scan_result(&result);
                    }
                    None => return,
                },
                _ = &mut window => break,
            }
        }

        let now = crate::unix_millis();
        apply_advertise_mode(advertise_mode, &orchestrator, now).await;
        peripheral.refresh_advertisement(now).await;
        if pause_ms == 0 {
            continue;
        }

        if let Err(e) = radio.stop_scan().await {
            debug!("Pausing scan failed: {}", e);
        }
        if let Err(e) = scanner.lock().pause_scanning(crate::unix_millis()) {
            debug!("Scanner pause: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;

        if let Err(e) = radio.start_scan(ATTUNE_SERVICE_UUID, tx.clone()).await {
            warn!("Resuming scan failed: {}", e);
        }
        scanner.lock().start_scanning(crate::unix_millis());
    }
}

async fn apply_advertise_mode(
    mode: AdvertiseMode,
    orchestrator: &ConnectionOrchestrator,
    now: u64,
) -> bool {
    let connectable = mode.connectable(orchestrator.density(now));
    orchestrator.peripheral().set_connectable(connectable).await
}

/// The node's persistent 36-character id, created on first use
pub fn load_or_create_node_id(backend: &dyn StorageBackend) -> Result<String, StoreError> {
    if let Some(bytes) = backend.get(NODE_ID_KEY)? {
        if let Ok(id) = String::from_utf8(bytes) {
            return Ok(id);
        }
        warn!("Stored node id is not UTF-8, generating a new one");
    }
    let id = Uuid::new_v4().to_string();
    backend.put(NODE_ID_KEY, id.as_bytes())?;
    backend.flush()?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use crate::transport::ble::{Admission, ServiceData};
    use crate::transport::LoopbackAir;

    fn service(air: &Arc<LoopbackAir>, address: &str) -> ExchangeService {
        service_with(air, address, ServiceConfig::default())
    }

    fn service_with(air: &Arc<LoopbackAir>, address: &str, config: ServiceConfig) -> ExchangeService {
        let radio = air.radio(address);
        ExchangeService::new(
            config,
            Arc::new(MemoryStorage::new()),
            radio.clone(),
            radio,
            Collaborators::reference(),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(ServiceConfig::default().validate().is_ok());

        let config = ServiceConfig {
            max_chunk: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ServiceError::InvalidConfig(_))
        ));

        let config = ServiceConfig {
            max_chunk: 457,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            inbox_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip_with_defaults() {
        let config: ServiceConfig = serde_json::from_str(r#"{"max_chunk": 120}"#).unwrap();
        assert_eq!(config.max_chunk, 120);
        assert_eq!(config.dedup_ttl_ms, ServiceConfig::default().dedup_ttl_ms);
    }

    #[test]
    fn test_node_id_is_stable() {
        let backend = MemoryStorage::new();
        let first = load_or_create_node_id(&backend).unwrap();
        assert_eq!(first.len(), 36);
        assert_eq!(load_or_create_node_id(&backend).unwrap(), first);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let air = LoopbackAir::new();
        let svc = service(&air, "node-a");
        assert_eq!(svc.state(), ServiceState::Stopped);

        svc.start().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Running);
        assert!(air.advertisement("node-a").is_some());
        assert!(matches!(
            svc.start().await,
            Err(ServiceError::InvalidState(_))
        ));

        svc.stop().await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert!(air.advertisement("node-a").is_none());
        assert_eq!(svc.stats().exchanges_in_flight, 0);
        assert!(matches!(svc.stop().await, Err(ServiceError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_unavailable_radio_fails_cleanly() {
        let air = LoopbackAir::new();
        let svc = service(&air, "node-a");
        air.set_available("node-a", false);

        assert!(matches!(
            svc.start().await,
            Err(ServiceError::TransportUnavailable)
        ));
        assert_eq!(svc.state(), ServiceState::Stopped);

        air.set_available("node-a", true);
        svc.start().await.unwrap();
        air.set_available("node-a", false);
        assert!(matches!(
            svc.stop().await,
            Err(ServiceError::TransportUnavailable)
        ));
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_battery_changes_duty_cycle() {
        let air = LoopbackAir::new();
        let svc = service(&air, "node-a");
        assert_eq!(svc.stats().duty_cycle_percent, 50);
        svc.set_battery(10, false);
        assert_eq!(svc.stats().duty_cycle_percent, 5);
        svc.set_battery(10, true);
        assert_eq!(svc.stats().scan_mode, "Aggressive");
    }

    fn scan_of(air: &LoopbackAir, address: &str) -> ScanResult {
        ScanResult {
            address: address.to_string(),
            rssi: -60,
            service_data: air.advertisement(address).unwrap(),
            timestamp: crate::unix_millis(),
        }
    }

    #[test]
    fn test_advertise_mode_policy() {
        assert!(AdvertiseMode::Auto.connectable(Density::Busy));
        assert!(!AdvertiseMode::Auto.connectable(Density::Crowded));
        assert!(AdvertiseMode::Connectable.connectable(Density::Crowded));
        assert!(!AdvertiseMode::PresenceOnly.connectable(Density::Quiet));
        assert_eq!("presence_only".parse(), Ok(AdvertiseMode::PresenceOnly));
        assert!("sometimes".parse::<AdvertiseMode>().is_err());
    }

    #[tokio::test]
    async fn test_presence_only_node_is_skipped_by_peers() {
        let air = LoopbackAir::new();
        let quiet = service_with(
            &air,
            "node-a",
            ServiceConfig {
                advertise_mode: AdvertiseMode::PresenceOnly,
                ..Default::default()
            },
        );
        let peer = service(&air, "node-b");

        quiet.start().await.unwrap();
        let data = ServiceData::parse(&air.advertisement("node-a").unwrap()).unwrap();
        assert!(!data.is_connectable());
        assert!(data.has_profile());

        assert!(matches!(
            peer.orchestrator().handle_scan_result(&scan_of(&air, "node-a")),
            Admission::NotConnectable
        ));
        quiet.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_crowded_area_switches_to_presence_only() {
        let air = LoopbackAir::new();
        let svc = service(&air, "node-a");
        svc.start().await.unwrap();
        assert!(ServiceData::parse(&air.advertisement("node-a").unwrap())
            .unwrap()
            .is_connectable());

        for i in 0..10u8 {
            let result = ScanResult {
                address: format!("crowd-{}", i),
                rssi: -70,
                service_data: ServiceData::new(false, true, [i, 0, 0, 1]).encode().to_vec(),
                timestamp: crate::unix_millis(),
            };
            svc.orchestrator().handle_scan_result(&result);
        }
        assert!(svc.refresh_advertise_mode().await);
        assert!(!ServiceData::parse(&air.advertisement("node-a").unwrap())
            .unwrap()
            .is_connectable());

        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_stalled_exchange_session() {
        let air = LoopbackAir::new();
        let peer = service(&air, "node-b");
        peer.start().await.unwrap();

        let svc = service(&air, "node-a");
        air.stall_reads("node-a", true);
        svc.start().await.unwrap();

        for _ in 0..200 {
            if !air.connections("node-a").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(air.connections("node-a"), vec!["node-b".to_string()]);

        svc.stop().await.unwrap();
        assert!(air.connections("node-a").is_empty());
        assert_eq!(svc.orchestrator().central().open_sessions(), 0);
        assert_eq!(svc.stats().exchanges_in_flight, 0);

        peer.stop().await.unwrap();
    }
}
