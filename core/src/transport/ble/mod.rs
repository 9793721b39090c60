/// BLE transport for Attune profile exchange
///
/// - **beacon**: advertisement service data with a rotating node hint
/// - **bridge**: platform radio traits (peripheral and central roles)
/// - **gatt**: peripheral role, an explicit reducer over GATT callbacks
/// - **central**: central role, chunked stream reads and message writes
/// - **scanner**: duty cycle management and per-address connect backoff
/// - **loopback**: in-process radio used by tests and the CLI simulation
///
/// Platform code owns the actual BLE hardware; everything here is testable
/// without it.

pub mod beacon;
pub mod bridge;
pub mod central;
pub mod gatt;
pub mod loopback;
pub mod scanner;

pub use beacon::{
    BeaconBuilder, BeaconError, ServiceData, DEFAULT_BEACON_ROTATION_SECS, FLAG_CONNECTABLE,
    FLAG_HAS_PROFILE,
};
pub use bridge::{CentralRadio, GattRequestHandler, PeripheralRadio, ScanResult};
pub use central::{CentralClient, ExchangeError, ExchangeReport};
pub use gatt::{GattPeripheral, PeripheralEffect, PeripheralEvent, PeripheralState};
pub use loopback::{LoopbackAir, LoopbackRadio};
pub use scanner::{
    Admission, BatteryState, BleScanConfig, BleScanner, DutyCycleManager, ScanGate, ScannerError,
    ScannerState,
};

use thiserror::Error;
use uuid::Uuid;

/// Attune GATT service
pub const ATTUNE_SERVICE_UUID: Uuid = Uuid::from_u128(0xA77E_0001_5c3b_4e0e_9a61_7d2c_1f00_0001);

/// Read characteristic: serves read-response windows
pub const READ_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xA77E_0002_5c3b_4e0e_9a61_7d2c_1f00_0001);

/// Write characteristic: accepts control and message frames
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xA77E_0003_5c3b_4e0e_9a61_7d2c_1f00_0001);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    #[error("BLE unavailable on this device")]
    TransportUnavailable,
    #[error("Peer not found: {0}")]
    PeerNotFound(String),
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("GATT operation failed: {0}")]
    OperationFailed(String),
}
