/// BLE scanning: battery-aware duty cycle and connect admission
///
/// The scanner alternates scan windows and pauses inside a fixed interval;
/// the window share follows the battery state. Every advertisement that comes
/// back goes through `ScanGate`, which skips non-connectable advertisers and
/// allows at most one connection attempt per address per backoff window.

use super::beacon::ServiceData;
use super::bridge::ScanResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// Default per-address backoff between connection attempts
pub const DEFAULT_BACKOFF_MS: u64 = 30_000;

/// Scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BleScanConfig {
    /// Full scan cycle (window + pause) in milliseconds
    pub scan_interval_ms: u64,
    /// Duty cycle override (0-100); `None` follows the battery state
    pub duty_cycle_percent: Option<u8>,
}

impl Default for BleScanConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 4_000,
            duty_cycle_percent: None,
        }
    }
}

impl BleScanConfig {
    pub fn new(scan_interval_ms: u64) -> Result<Self, ScannerError> {
        let config = Self {
            scan_interval_ms,
            duty_cycle_percent: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Pin the duty cycle regardless of battery state
    pub fn with_duty_cycle(mut self, percent: u8) -> Result<Self, ScannerError> {
        if percent == 0 || percent > 100 {
            return Err(ScannerError::InvalidDutyCycle);
        }
        self.duty_cycle_percent = Some(percent);
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.scan_interval_ms == 0 {
            return Err(ScannerError::InvalidScanConfig(
                "Scan interval must be > 0".to_string(),
            ));
        }
        if matches!(self.duty_cycle_percent, Some(p) if p == 0 || p > 100) {
            return Err(ScannerError::InvalidDutyCycle);
        }
        Ok(())
    }
}

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    Idle,
    Scanning,
    /// Between scan windows
    Paused,
}

/// Battery state for duty cycle management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryState {
    Charging,
    /// Above 50%
    Good,
    /// 21-50%
    Low,
    /// 20% and below
    Critical,
}

impl BatteryState {
    pub fn from_percentage(percent: u8) -> Self {
        match percent {
            0..=20 => BatteryState::Critical,
            21..=50 => BatteryState::Low,
            _ => BatteryState::Good,
        }
    }
}

/// Maps battery state to a scan duty cycle
pub struct DutyCycleManager {
    battery_state: BatteryState,
}

impl DutyCycleManager {
    pub fn new(battery_state: BatteryState) -> Self {
        Self { battery_state }
    }

    pub fn set_battery_state(&mut self, state: BatteryState) {
        self.battery_state = state;
    }

    pub fn battery_state(&self) -> BatteryState {
        self.battery_state
    }

    pub fn recommended_duty_cycle(&self) -> u8 {
        match self.battery_state {
            BatteryState::Charging => 90,
            BatteryState::Good => 50,
            BatteryState::Low => 20,
            BatteryState::Critical => 5,
        }
    }

    pub fn mode_description(&self) -> &'static str {
        match self.battery_state {
            BatteryState::Charging => "Aggressive",
            BatteryState::Good => "Standard",
            BatteryState::Low => "Reduced",
            BatteryState::Critical => "Minimal",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Invalid scan configuration: {0}")]
    InvalidScanConfig(String),
    #[error("Invalid duty cycle")]
    InvalidDutyCycle,
    #[error("Scanner not scanning")]
    NotScanning,
}

/// Duty-cycled scanner state
pub struct BleScanner {
    state: ScannerState,
    config: BleScanConfig,
    duty_cycle: DutyCycleManager,
    last_state_change: u64,
}

impl BleScanner {
    pub fn new(config: BleScanConfig, battery_state: BatteryState) -> Result<Self, ScannerError> {
        config.validate()?;
        Ok(Self {
            state: ScannerState::Idle,
            config,
            duty_cycle: DutyCycleManager::new(battery_state),
            last_state_change: 0,
        })
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn config(&self) -> &BleScanConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.state != ScannerState::Idle
    }

    /// Begin (or resume) a scan window
    pub fn start_scanning(&mut self, now: u64) {
        if self.state != ScannerState::Scanning {
            self.state = ScannerState::Scanning;
            self.last_state_change = now;
        }
    }

    /// End the current scan window
    pub fn pause_scanning(&mut self, now: u64) -> Result<(), ScannerError> {
        match self.state {
            ScannerState::Scanning => {
                self.state = ScannerState::Paused;
                self.last_state_change = now;
                Ok(())
            }
            _ => Err(ScannerError::NotScanning),
        }
    }

    pub fn stop_scanning(&mut self, now: u64) {
        if self.state != ScannerState::Idle {
            self.state = ScannerState::Idle;
            self.last_state_change = now;
        }
    }

    pub fn set_battery_state(&mut self, state: BatteryState) {
        self.duty_cycle.set_battery_state(state);
    }

    pub fn duty_cycle(&self) -> u8 {
        self.config
            .duty_cycle_percent
            .unwrap_or_else(|| self.duty_cycle.recommended_duty_cycle())
    }

    pub fn mode(&self) -> &'static str {
        if self.config.duty_cycle_percent.is_some() {
            "Fixed"
        } else {
            self.duty_cycle.mode_description()
        }
    }

    pub fn scan_duration_ms(&self) -> u64 {
        (self.config.scan_interval_ms * self.duty_cycle() as u64) / 100
    }

    pub fn pause_duration_ms(&self) -> u64 {
        self.config.scan_interval_ms - self.scan_duration_ms()
    }

    pub fn time_since_state_change_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_state_change)
    }
}

/// Why an advertisement did or did not lead to a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead and connect
    Attempt(ServiceData),
    /// Service data missing or of an unknown version
    Unrecognized,
    NotConnectable,
    /// Attempted recently; retry allowed after `remaining_ms`
    BackingOff { remaining_ms: u64 },
}

/// Per-address connect admission with a fixed backoff window
pub struct ScanGate {
    backoff_ms: u64,
    last_attempt: HashMap<String, u64>,
}

impl ScanGate {
    pub fn new(backoff_ms: u64) -> Self {
        Self {
            backoff_ms,
            last_attempt: HashMap::new(),
        }
    }

    /// Decide whether to connect to the advertiser. An `Attempt` result
    /// starts the address's backoff window.
    pub fn admit(&mut self, result: &ScanResult, now: u64) -> Admission {
        let Some(data) = ServiceData::parse(&result.service_data) else {
            return Admission::Unrecognized;
        };
        if !data.is_connectable() {
            return Admission::NotConnectable;
        }

        if let Some(&last) = self.last_attempt.get(&result.address) {
            let elapsed = now.saturating_sub(last);
            if elapsed < self.backoff_ms {
                trace!("{} backing off for {}ms", result.address, self.backoff_ms - elapsed);
                return Admission::BackingOff {
                    remaining_ms: self.backoff_ms - elapsed,
                };
            }
        }

        self.last_attempt.insert(result.address.clone(), now);
        self.prune(now);
        Admission::Attempt(data)
    }

    fn prune(&mut self, now: u64) {
        let window = self.backoff_ms;
        self.last_attempt
            .retain(|_, &mut last| now.saturating_sub(last) < window);
    }

    pub fn clear(&mut self) {
        self.last_attempt.clear();
    }

    pub fn tracked(&self) -> usize {
        self.last_attempt.len()
    }
}

impl Default for ScanGate {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(address: &str, connectable: bool) -> ScanResult {
        ScanResult {
            address: address.to_string(),
            rssi: -60,
            service_data: ServiceData::new(connectable, true, [1, 2, 3, 4])
                .encode()
                .to_vec(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_scan_config_default_valid() {
        let config = BleScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.duty_cycle_percent, None);
    }

    #[test]
    fn test_scan_config_rejects_zero_interval() {
        assert!(BleScanConfig::new(0).is_err());
    }

    #[test]
    fn test_scan_config_duty_cycle_bounds() {
        assert!(BleScanConfig::default().with_duty_cycle(75).is_ok());
        assert!(BleScanConfig::default().with_duty_cycle(101).is_err());
        assert!(BleScanConfig::default().with_duty_cycle(0).is_err());
    }

    #[test]
    fn test_battery_state_from_percentage() {
        assert_eq!(BatteryState::from_percentage(10), BatteryState::Critical);
        assert_eq!(BatteryState::from_percentage(20), BatteryState::Critical);
        assert_eq!(BatteryState::from_percentage(35), BatteryState::Low);
        assert_eq!(BatteryState::from_percentage(50), BatteryState::Low);
        assert_eq!(BatteryState::from_percentage(100), BatteryState::Good);
    }

    #[test]
    fn test_duty_cycle_by_battery() {
        let cases = [
            (BatteryState::Charging, 90, "Aggressive"),
            (BatteryState::Good, 50, "Standard"),
            (BatteryState::Low, 20, "Reduced"),
            (BatteryState::Critical, 5, "Minimal"),
        ];
        for (state, duty, mode) in cases {
            let manager = DutyCycleManager::new(state);
            assert_eq!(manager.recommended_duty_cycle(), duty);
            assert_eq!(manager.mode_description(), mode);
        }
    }

    #[test]
    fn test_scan_window_follows_battery() {
        let mut scanner = BleScanner::new(BleScanConfig::new(1000).unwrap(), BatteryState::Good)
            .unwrap();
        assert_eq!(scanner.scan_duration_ms(), 500);
        assert_eq!(scanner.pause_duration_ms(), 500);

        scanner.set_battery_state(BatteryState::Critical);
        assert_eq!(scanner.scan_duration_ms(), 50);
        assert_eq!(scanner.pause_duration_ms(), 950);
    }

    #[test]
    fn test_fixed_duty_cycle_overrides_battery() {
        let config = BleScanConfig::new(1000).unwrap().with_duty_cycle(100).unwrap();
        let scanner = BleScanner::new(config, BatteryState::Critical).unwrap();
        assert_eq!(scanner.scan_duration_ms(), 1000);
        assert_eq!(scanner.mode(), "Fixed");
    }

    #[test]
    fn test_scanner_state_transitions() {
        let mut scanner = BleScanner::new(BleScanConfig::default(), BatteryState::Good).unwrap();
        assert_eq!(scanner.state(), ScannerState::Idle);
        assert!(scanner.pause_scanning(0).is_err());

        scanner.start_scanning(10);
        assert_eq!(scanner.state(), ScannerState::Scanning);
        scanner.pause_scanning(20).unwrap();
        assert_eq!(scanner.state(), ScannerState::Paused);
        assert_eq!(scanner.time_since_state_change_ms(25), 5);

        scanner.stop_scanning(30);
        assert!(!scanner.is_active());
    }

    #[test]
    fn test_gate_skips_non_connectable() {
        let mut gate = ScanGate::default();
        assert_eq!(gate.admit(&advert("a", false), 0), Admission::NotConnectable);
        assert_eq!(gate.tracked(), 0);
    }

    #[test]
    fn test_gate_skips_unrecognized() {
        let mut gate = ScanGate::default();
        let mut result = advert("a", true);
        result.service_data = vec![0x09, 0x01];
        assert_eq!(gate.admit(&result, 0), Admission::Unrecognized);
    }

    #[test]
    fn test_gate_one_attempt_per_window() {
        let mut gate = ScanGate::new(30_000);
        assert!(matches!(gate.admit(&advert("a", true), 1_000), Admission::Attempt(_)));
        assert_eq!(
            gate.admit(&advert("a", true), 11_000),
            Admission::BackingOff {
                remaining_ms: 20_000
            }
        );
        // Other addresses are independent
        assert!(matches!(gate.admit(&advert("b", true), 11_000), Admission::Attempt(_)));
        assert!(matches!(gate.admit(&advert("a", true), 31_000), Admission::Attempt(_)));
    }
}
