/// GATT peripheral role for Attune exchange
///
/// One service with a read and a write characteristic. Centrals write a
/// `ControlFrame` to select a stream and offset, then read the read
/// characteristic to get one `ReadResponseFrame` window of that stream.
/// Message frames written to the write characteristic go to the delivery
/// pipeline.
///
/// Platform callbacks are funnelled through `PeripheralState::apply`, a plain
/// reducer from callback events to effects, so the protocol logic is testable
/// without a radio.

use super::beacon::{BeaconBuilder, ServiceData};
use super::bridge::{GattRequestHandler, PeripheralRadio};
use super::{RadioError, ATTUNE_SERVICE_UUID};
use crate::frame::{Frame, MessageFrame, ReadResponseFrame, STREAM_ACKS, STREAM_PROFILE};
use crate::store::{DeliveryOutcome, DeliveryPipeline, InboundMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Callback events from the platform GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    Read { peer: String },
    Write { peer: String, value: Vec<u8> },
    Disconnected { peer: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEffect {
    /// Value to hand back from the read callback
    Respond(Vec<u8>),
    /// Message chunk for the delivery pipeline, keyed by sender
    Deliver { sender: String, frame: MessageFrame },
    /// Write that is neither a control frame nor a message frame
    Rejected { peer: String, len: usize },
}

/// Stream position a peer selected with its last control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    pub stream_id: u8,
    pub offset: u32,
}

impl Default for ReadCursor {
    fn default() -> Self {
        Self {
            stream_id: STREAM_PROFILE,
            offset: 0,
        }
    }
}

pub struct PeripheralState {
    max_chunk: usize,
    /// Streams served to every peer
    streams: HashMap<u8, Vec<u8>>,
    /// Streams addressed to one sender key
    peer_streams: HashMap<(String, u8), Vec<u8>>,
    cursors: HashMap<String, ReadCursor>,
    /// Transport address -> v2 sender id learned from its message frames
    senders: HashMap<String, String>,
}

impl PeripheralState {
    pub fn new(max_chunk: usize) -> Self {
        Self {
            max_chunk,
            streams: HashMap::new(),
            peer_streams: HashMap::new(),
            cursors: HashMap::new(),
            senders: HashMap::new(),
        }
    }

    pub fn apply(&mut self, event: PeripheralEvent) -> Vec<PeripheralEffect> {
        match event {
            PeripheralEvent::Read { peer } => vec![PeripheralEffect::Respond(self.read(&peer))],
            PeripheralEvent::Write { peer, value } => self.write(peer, &value),
            PeripheralEvent::Disconnected { peer } => {
                self.cursors.remove(&peer);
                self.senders.remove(&peer);
                Vec::new()
            }
        }
    }

    fn read(&self, peer: &str) -> Vec<u8> {
        let cursor = self.cursor(peer);
        let key = (self.sender_key(peer), cursor.stream_id);
        let stream = self
            .peer_streams
            .get(&key)
            .or_else(|| self.streams.get(&cursor.stream_id))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        match ReadResponseFrame::window(cursor.stream_id, stream, cursor.offset, self.max_chunk) {
            Ok(frame) => frame.encode(),
            Err(e) => {
                warn!("Cannot serve stream {} to {}: {}", cursor.stream_id, peer, e);
                Vec::new()
            }
        }
    }

    fn write(&mut self, peer: String, value: &[u8]) -> Vec<PeripheralEffect> {
        match Frame::parse(value) {
            Some(Frame::Control(control)) => {
                debug!(
                    "{} selected stream {} at offset {}",
                    peer, control.stream_id, control.offset
                );
                self.cursors.insert(
                    peer,
                    ReadCursor {
                        stream_id: control.stream_id,
                        offset: control.offset,
                    },
                );
                Vec::new()
            }
            Some(Frame::Message(frame)) => {
                let sender = match &frame.sender {
                    Some(id) => {
                        self.senders.insert(peer, id.as_str().to_string());
                        id.as_str().to_string()
                    }
                    None => peer,
                };
                vec![PeripheralEffect::Deliver { sender, frame }]
            }
            Some(Frame::ReadResponse(_)) | None => vec![PeripheralEffect::Rejected {
                peer,
                len: value.len(),
            }],
        }
    }

    /// Key acknowledgements are filed under for this peer: its v2 sender id
    /// once seen, its transport address otherwise
    pub fn sender_key(&self, peer: &str) -> String {
        self.senders
            .get(peer)
            .cloned()
            .unwrap_or_else(|| peer.to_string())
    }

    pub fn cursor(&self, peer: &str) -> ReadCursor {
        self.cursors.get(peer).copied().unwrap_or_default()
    }

    pub fn set_stream(&mut self, stream_id: u8, data: Vec<u8>) {
        self.streams.insert(stream_id, data);
    }

    pub fn set_peer_stream(&mut self, sender_key: &str, stream_id: u8, data: Vec<u8>) {
        self.peer_streams
            .insert((sender_key.to_string(), stream_id), data);
    }

    pub fn stream(&self, stream_id: u8) -> Option<&[u8]> {
        self.streams.get(&stream_id).map(Vec::as_slice)
    }

    pub fn has_stream(&self, stream_id: u8) -> bool {
        self.streams.get(&stream_id).is_some_and(|s| !s.is_empty())
    }

    /// Forget per-peer state; shared streams stay published
    pub fn clear(&mut self) {
        self.cursors.clear();
        self.senders.clear();
        self.peer_streams.clear();
    }
}

/// Adapts the reducer to the platform callback interface
struct PeripheralHandler {
    state: Mutex<PeripheralState>,
    pipeline: Arc<DeliveryPipeline>,
    inbound_tx: broadcast::Sender<InboundMessage>,
}

impl PeripheralHandler {
    fn dispatch(&self, event: PeripheralEvent) -> Option<Vec<u8>> {
        let effects = {
            let mut state = self.state.lock();
            if let PeripheralEvent::Read { peer } = &event {
                let key = state.sender_key(peer);
                let acks = self.pipeline.acks().stream_for(&key);
                state.set_peer_stream(&key, STREAM_ACKS, acks);
            }
            state.apply(event)
        };

        let mut response = None;
        for effect in effects {
            match effect {
                PeripheralEffect::Respond(bytes) => response = Some(bytes),
                PeripheralEffect::Deliver { sender, frame } => self.deliver(&sender, &frame),
                PeripheralEffect::Rejected { peer, len } => {
                    debug!("Ignoring unrecognized {}-byte write from {}", len, peer)
                }
            }
        }
        response
    }

    fn deliver(&self, sender: &str, frame: &MessageFrame) {
        match self.pipeline.accept(sender, frame, crate::unix_millis()) {
            Ok(DeliveryOutcome::Delivered(message)) => {
                // No subscribers is fine
                let _ = self.inbound_tx.send(message);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to store chunk from {}: {}", sender, e),
        }
    }
}

impl GattRequestHandler for PeripheralHandler {
    fn on_read(&self, peer: &str) -> Vec<u8> {
        self.dispatch(PeripheralEvent::Read {
            peer: peer.to_string(),
        })
        .unwrap_or_default()
    }

    fn on_write(&self, peer: &str, value: &[u8]) {
        self.dispatch(PeripheralEvent::Write {
            peer: peer.to_string(),
            value: value.to_vec(),
        });
    }

    fn on_disconnected(&self, peer: &str) {
        self.dispatch(PeripheralEvent::Disconnected {
            peer: peer.to_string(),
        });
    }
}

/// Peripheral role: advertises the service and serves the GATT server
pub struct GattPeripheral {
    radio: Arc<dyn PeripheralRadio>,
    handler: Arc<PeripheralHandler>,
    beacon: BeaconBuilder,
    /// Cleared for presence-only advertising
    connectable: AtomicBool,
    /// Service data currently on air; `None` when stopped
    advertised: Mutex<Option<ServiceData>>,
}

impl GattPeripheral {
    pub fn new(
        radio: Arc<dyn PeripheralRadio>,
        pipeline: Arc<DeliveryPipeline>,
        beacon: BeaconBuilder,
        max_chunk: usize,
        inbound_tx: broadcast::Sender<InboundMessage>,
    ) -> Self {
        Self {
            radio,
            handler: Arc::new(PeripheralHandler {
                state: Mutex::new(PeripheralState::new(max_chunk)),
                pipeline,
                inbound_tx,
            }),
            beacon,
            connectable: AtomicBool::new(true),
            advertised: Mutex::new(None),
        }
    }

    fn service_data(&self, now: u64) -> ServiceData {
        let has_profile = self.handler.state.lock().has_stream(STREAM_PROFILE);
        self.beacon.build(self.is_connectable(), has_profile, now)
    }

    pub fn is_connectable(&self) -> bool {
        self.connectable.load(Ordering::SeqCst)
    }

    /// Switch between full connectable exchange and presence-only
    /// broadcast. Re-advertises straight away when running.
    pub async fn set_connectable(&self, connectable: bool) -> bool {
        if self.connectable.swap(connectable, Ordering::SeqCst) == connectable {
            return true;
        }
        info!(
            "Advertising {}",
            if connectable { "connectable" } else { "presence only" }
        );
        if !self.is_running() {
            return true;
        }
        self.refresh_advertisement(crate::unix_millis()).await
    }

    /// Open the GATT server and start advertising. Returns false (and logs)
    /// when the radio is unavailable or refuses.
    pub async fn start(&self) -> bool {
        if !self.radio.is_available().await {
            warn!("Cannot start peripheral: {}", RadioError::TransportUnavailable);
            return false;
        }

        if let Err(e) = self
            .radio
            .open_gatt_server(ATTUNE_SERVICE_UUID, self.handler.clone())
            .await
        {
            warn!("Failed to open GATT server: {}", e);
            return false;
        }

        let data = self.service_data(crate::unix_millis());
        if let Err(e) = self
            .radio
            .start_advertising(ATTUNE_SERVICE_UUID, &data.encode())
            .await
        {
            warn!("Failed to start advertising: {}", e);
            if let Err(e) = self.radio.close_gatt_server().await {
                debug!("Closing GATT server after failed start: {}", e);
            }
            return false;
        }

        *self.advertised.lock() = Some(data);
        info!("Peripheral started (hint {})", data.hint_hex());
        true
    }

    /// Stop advertising and close the GATT server. Per-peer cursors are
    /// cleared even when the radio reports a failure.
    pub async fn stop(&self) -> bool {
        self.handler.state.lock().clear();
        let was_running = self.advertised.lock().take().is_some();

        if !self.radio.is_available().await {
            warn!("Cannot stop peripheral: {}", RadioError::TransportUnavailable);
            return false;
        }

        let mut ok = true;
        if let Err(e) = self.radio.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
            ok = false;
        }
        if let Err(e) = self.radio.close_gatt_server().await {
            warn!("Failed to close GATT server: {}", e);
            ok = false;
        }
        if was_running {
            info!("Peripheral stopped");
        }
        ok
    }

    pub fn is_running(&self) -> bool {
        self.advertised.lock().is_some()
    }

    /// Publish our anonymized profile payload on the profile stream
    pub async fn publish_profile(&self, payload: Vec<u8>) {
        self.handler.state.lock().set_stream(STREAM_PROFILE, payload);
        self.refresh_advertisement(crate::unix_millis()).await;
    }

    /// Re-advertise if the flags or the rotating hint changed
    pub async fn refresh_advertisement(&self, now: u64) -> bool {
        let current = match *self.advertised.lock() {
            Some(data) => data,
            None => return false,
        };
        let next = self.service_data(now);
        if next == current {
            return true;
        }

        if let Err(e) = self.radio.stop_advertising().await {
            debug!("Stop before re-advertise failed: {}", e);
        }
        match self
            .radio
            .start_advertising(ATTUNE_SERVICE_UUID, &next.encode())
            .await
        {
            Ok(()) => {
                let mut advertised = self.advertised.lock();
                if advertised.is_some() {
                    *advertised = Some(next);
                }
                debug!("Advertisement refreshed (hint {})", next.hint_hex());
                true
            }
            Err(e) => {
                warn!("Failed to refresh advertisement: {}", e);
                false
            }
        }
    }

    pub fn cursor(&self, peer: &str) -> ReadCursor {
        self.handler.state.lock().cursor(peer)
    }

    /// Bytes currently served on a shared stream
    pub fn served_stream(&self, stream_id: u8) -> Option<Vec<u8>> {
        self.handler.state.lock().stream(stream_id).map(<[u8]>::to_vec)
    }

    /// Callback interface handed to the platform GATT server
    pub fn request_handler(&self) -> Arc<dyn GattRequestHandler> {
        self.handler.clone()
    }
}
