// Platform radio bridge
//
// The actual BLE stack lives in platform code (Kotlin/Swift) or, for tests and
// the CLI simulation, in the in-process loopback. The core only talks to these
// traits.

use super::RadioError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One advertisement seen by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Transport address of the advertiser
    pub address: String,
    /// RSSI in dBm
    pub rssi: i8,
    /// Raw service data blob for our service UUID
    pub service_data: Vec<u8>,
    /// When this was received (unix millis)
    pub timestamp: u64,
}

/// Callbacks the platform GATT server invokes for our service.
///
/// Called on the platform's callback thread; implementations must not block
/// on async work.
pub trait GattRequestHandler: Send + Sync {
    /// A central read the read characteristic; returns the value to serve
    fn on_read(&self, peer: &str) -> Vec<u8>;

    /// A central wrote the write characteristic
    fn on_write(&self, peer: &str, value: &[u8]);

    /// A central disconnected
    fn on_disconnected(&self, peer: &str);
}

/// Peripheral (advertiser / GATT server) side of the radio
#[async_trait]
pub trait PeripheralRadio: Send + Sync {
    /// Whether the radio is present, enabled and permitted
    async fn is_available(&self) -> bool;

    async fn start_advertising(
        &self,
        service_uuid: Uuid,
        service_data: &[u8],
    ) -> Result<(), RadioError>;

    async fn stop_advertising(&self) -> Result<(), RadioError>;

    /// Register the GATT service (one read and one write characteristic)
    async fn open_gatt_server(
        &self,
        service_uuid: Uuid,
        handler: Arc<dyn GattRequestHandler>,
    ) -> Result<(), RadioError>;

    async fn close_gatt_server(&self) -> Result<(), RadioError>;
}

/// Central (scanner / GATT client) side of the radio
#[async_trait]
pub trait CentralRadio: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Start scanning for `service_uuid`; results are pushed into `results`
    async fn start_scan(
        &self,
        service_uuid: Uuid,
        results: mpsc::UnboundedSender<ScanResult>,
    ) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn connect(&self, address: &str) -> Result<(), RadioError>;

    /// Write the peer's write characteristic
    async fn write(&self, address: &str, value: &[u8]) -> Result<(), RadioError>;

    /// Read the peer's read characteristic
    async fn read(&self, address: &str) -> Result<Vec<u8>, RadioError>;

    async fn disconnect(&self, address: &str) -> Result<(), RadioError>;
}
