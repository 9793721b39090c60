// Loopback radio — an in-process "air" shared by simulated nodes
//
// Each node gets a `LoopbackRadio` implementing both radio roles. Writes and
// reads are routed straight into the target node's GATT handler, with the
// caller's address as the peer. Used by the integration tests and by the CLI
// simulation.

use super::bridge::{CentralRadio, GattRequestHandler, PeripheralRadio, ScanResult};
use super::RadioError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

const LOOPBACK_RSSI: i8 = -50;

struct NodeSlot {
    available: bool,
    advertising: Option<Vec<u8>>,
    handler: Option<Arc<dyn GattRequestHandler>>,
    scanner: Option<mpsc::UnboundedSender<ScanResult>>,
    /// Peripherals this node is connected to as a central
    connections: HashSet<String>,
    /// Reads this node may still perform as a central; `None` is unlimited
    read_budget: Option<usize>,
    /// Reads by this node never complete
    stalled: bool,
}

impl Default for NodeSlot {
    fn default() -> Self {
        Self {
            available: true,
            advertising: None,
            handler: None,
            scanner: None,
            connections: HashSet::new(),
            read_budget: None,
            stalled: false,
        }
    }
}

#[derive(Default)]
pub struct LoopbackAir {
    nodes: Mutex<HashMap<String, NodeSlot>>,
}

impl LoopbackAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Radio for the node at `address`, registering it if new
    pub fn radio(self: &Arc<Self>, address: &str) -> Arc<LoopbackRadio> {
        self.nodes.lock().entry(address.to_string()).or_default();
        Arc::new(LoopbackRadio {
            air: self.clone(),
            address: address.to_string(),
        })
    }

    /// Simulate the radio being switched off or permission being revoked
    pub fn set_available(&self, address: &str, available: bool) {
        let mut nodes = self.nodes.lock();
        let slot = nodes.entry(address.to_string()).or_default();
        slot.available = available;
        if !available {
            slot.connections.clear();
        }
    }

    /// Fail every read by `address` after `reads` more successful ones
    pub fn fail_reads_after(&self, address: &str, reads: Option<usize>) {
        self.nodes
            .lock()
            .entry(address.to_string())
            .or_default()
            .read_budget = reads;
    }

    /// Make every read by `address` hang until the caller gives up
    pub fn stall_reads(&self, address: &str, stalled: bool) {
        self.nodes
            .lock()
            .entry(address.to_string())
            .or_default()
            .stalled = stalled;
    }

    /// Peripherals `address` is connected to as a central
    pub fn connections(&self, address: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .nodes
            .lock()
            .get(address)
            .map(|slot| slot.connections.iter().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Current advertisement of `address`, if it is advertising
    pub fn advertisement(&self, address: &str) -> Option<Vec<u8>> {
        self.nodes
            .lock()
            .get(address)
            .and_then(|slot| slot.advertising.clone())
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.nodes.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Deliver every current advertisement to every scanning node, as a
    /// periodic advertising interval would
    pub fn readvertise(&self) {
        let nodes = self.nodes.lock();
        let adverts: Vec<(String, Vec<u8>)> = nodes
            .iter()
            .filter(|(_, slot)| slot.available)
            .filter_map(|(addr, slot)| slot.advertising.clone().map(|data| (addr.clone(), data)))
            .collect();

        for (scanner_addr, slot) in nodes.iter() {
            let Some(tx) = &slot.scanner else { continue };
            if !slot.available {
                continue;
            }
            for (addr, data) in &adverts {
                if addr != scanner_addr {
                    let _ = tx.send(scan_result(addr, data));
                }
            }
        }
    }

    fn handler_for(&self, central: &str, target: &str) -> Result<Arc<dyn GattRequestHandler>, RadioError> {
        let nodes = self.nodes.lock();
        let me = nodes.get(central).ok_or(RadioError::TransportUnavailable)?;
        if !me.available {
            return Err(RadioError::TransportUnavailable);
        }
        if !me.connections.contains(target) {
            return Err(RadioError::NotConnected(target.to_string()));
        }
        let peer = nodes
            .get(target)
            .filter(|slot| slot.available)
            .ok_or_else(|| RadioError::PeerNotFound(target.to_string()))?;
        peer.handler
            .clone()
            .ok_or_else(|| RadioError::NotConnected(target.to_string()))
    }
}

fn scan_result(address: &str, data: &[u8]) -> ScanResult {
    ScanResult {
        address: address.to_string(),
        rssi: LOOPBACK_RSSI,
        service_data: data.to_vec(),
        timestamp: crate::unix_millis(),
    }
}

pub struct LoopbackRadio {
    air: Arc<LoopbackAir>,
    address: String,
}

impl LoopbackRadio {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn with_slot<T>(&self, f: impl FnOnce(&mut NodeSlot) -> T) -> T {
        let mut nodes = self.air.nodes.lock();
        f(nodes.entry(self.address.clone()).or_default())
    }

    fn ensure_available(&self) -> Result<(), RadioError> {
        if self.with_slot(|slot| slot.available) {
            Ok(())
        } else {
            Err(RadioError::TransportUnavailable)
        }
    }
}

#[async_trait]
impl PeripheralRadio for LoopbackRadio {
    async fn is_available(&self) -> bool {
        self.with_slot(|slot| slot.available)
    }

    async fn start_advertising(
        &self,
        _service_uuid: Uuid,
        service_data: &[u8],
    ) -> Result<(), RadioError> {
        self.ensure_available()?;
        self.with_slot(|slot| slot.advertising = Some(service_data.to_vec()));

        // Scanners hear the new advertisement straight away
        let nodes = self.air.nodes.lock();
        for (addr, slot) in nodes.iter() {
            if addr == &self.address || !slot.available {
                continue;
            }
            if let Some(tx) = &slot.scanner {
                let _ = tx.send(scan_result(&self.address, service_data));
            }
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        self.ensure_available()?;
        self.with_slot(|slot| slot.advertising = None);
        Ok(())
    }

    async fn open_gatt_server(
        &self,
        _service_uuid: Uuid,
        handler: Arc<dyn GattRequestHandler>,
    ) -> Result<(), RadioError> {
        self.ensure_available()?;
        self.with_slot(|slot| slot.handler = Some(handler));
        Ok(())
    }

    async fn close_gatt_server(&self) -> Result<(), RadioError> {
        self.ensure_available()?;
        self.with_slot(|slot| slot.handler = None);
        Ok(())
    }
}

#[async_trait]
impl CentralRadio for LoopbackRadio {
    async fn is_available(&self) -> bool {
        self.with_slot(|slot| slot.available)
    }

    async fn start_scan(
        &self,
        _service_uuid: Uuid,
        results: mpsc::UnboundedSender<ScanResult>,
    ) -> Result<(), RadioError> {
        self.ensure_available()?;
        self.with_slot(|slot| slot.scanner = Some(results));
        self.air.readvertise();
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.ensure_available()?;
        self.with_slot(|slot| slot.scanner = None);
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<(), RadioError> {
        self.ensure_available()?;
        let reachable = self
            .air
            .nodes
            .lock()
            .get(address)
            .is_some_and(|slot| slot.available && slot.handler.is_some());
        if !reachable {
            return Err(RadioError::PeerNotFound(address.to_string()));
        }
        self.with_slot(|slot| slot.connections.insert(address.to_string()));
        trace!("{} connected to {}", self.address, address);
        Ok(())
    }

    async fn write(&self, address: &str, value: &[u8]) -> Result<(), RadioError> {
        let handler = self.air.handler_for(&self.address, address)?;
        handler.on_write(&self.address, value);
        Ok(())
    }

    async fn read(&self, address: &str) -> Result<Vec<u8>, RadioError> {
        let handler = self.air.handler_for(&self.address, address)?;
        if self.with_slot(|slot| slot.stalled) {
            std::future::pending::<()>().await;
        }
        let allowed = self.with_slot(|slot| match slot.read_budget.as_mut() {
            Some(0) => false,
            Some(budget) => {
                *budget -= 1;
                true
            }
            None => true,
        });
        if !allowed {
            return Err(RadioError::OperationFailed("read failed".to_string()));
        }
        Ok(handler.on_read(&self.address))
    }

    async fn disconnect(&self, address: &str) -> Result<(), RadioError> {
        let was_connected = self.with_slot(|slot| slot.connections.remove(address));
        if was_connected {
            let handler = self
                .air
                .nodes
                .lock()
                .get(address)
                .and_then(|slot| slot.handler.clone());
            if let Some(handler) = handler {
                handler.on_disconnected(&self.address);
            }
        }
        Ok(())
    }
}
