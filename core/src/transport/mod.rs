// Transport module — short-range radio link

pub mod ble;

pub use ble::{
    BeaconBuilder, CentralClient, CentralRadio, ExchangeError, ExchangeReport, GattPeripheral,
    GattRequestHandler, LoopbackAir, LoopbackRadio, PeripheralRadio, RadioError, ScanGate,
    ScanResult, ServiceData, ATTUNE_SERVICE_UUID,
};
