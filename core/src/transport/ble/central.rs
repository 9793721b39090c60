/// GATT central role for Attune exchange
///
/// Reads a peer's logical stream window by window: write a `ControlFrame`
/// selecting (stream, offset), read one `ReadResponseFrame`, repeat at the new
/// offset until the declared total is reached. Reads per stream are strictly
/// sequential. If the declared total changes mid-read the read restarts from
/// zero.
///
/// Bytes received before a failure are retained per (address, stream) and the
/// next attempt resumes from there.
///
/// Open sessions are tracked so an exchange dropped mid-flight (an aborted
/// task) can still be disconnected with `disconnect_all`.

use super::bridge::CentralRadio;
use super::RadioError;
use crate::frame::{
    ControlFrame, FrameError, MessageFrame, ReadResponseFrame, SenderId, STREAM_ACKS,
    STREAM_PROFILE,
};
use crate::store::Acknowledgement;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default bound on one whole exchange
pub const DEFAULT_EXCHANGE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Exchange timed out")]
    Timeout,
}

/// Result of a completed exchange with one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReport {
    pub address: String,
    /// Peer's profile stream
    pub peer_payload: Vec<u8>,
    /// Id our payload was pushed under
    pub message_id: u32,
    /// Whether the peer's ack stream already lists our message
    pub acknowledged: bool,
}

#[derive(Debug, Clone)]
struct PartialRead {
    total_len: u32,
    data: Vec<u8>,
}

pub struct CentralClient {
    radio: Arc<dyn CentralRadio>,
    max_chunk: usize,
    exchange_timeout: Duration,
    partials: Mutex<HashMap<(String, u8), PartialRead>>,
    sessions: Mutex<HashSet<String>>,
}

impl CentralClient {
    pub fn new(radio: Arc<dyn CentralRadio>, max_chunk: usize, exchange_timeout: Duration) -> Self {
        Self {
            radio,
            max_chunk,
            exchange_timeout,
            partials: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn radio(&self) -> &Arc<dyn CentralRadio> {
        &self.radio
    }

    /// Read a whole stream from a connected peer
    pub async fn fetch_stream(&self, address: &str, stream_id: u8) -> Result<Vec<u8>, ExchangeError> {
        let key = (address.to_string(), stream_id);
        let mut partial = self.partials.lock().remove(&key);
        if let Some(p) = &partial {
            debug!(
                "Resuming stream {} from {} at offset {}",
                stream_id,
                address,
                p.data.len()
            );
        }

        loop {
            let offset = partial.as_ref().map(|p| p.data.len()).unwrap_or(0) as u32;
            self.radio
                .write(address, &ControlFrame::new(stream_id, offset).encode())
                .await?;
            let raw = self.radio.read(address).await?;
            let response = ReadResponseFrame::decode(&raw).ok_or_else(|| {
                ExchangeError::Malformed(format!("{}-byte read is not a read response", raw.len()))
            })?;
            if response.stream_id != stream_id {
                return Err(ExchangeError::Malformed(format!(
                    "asked for stream {}, got {}",
                    stream_id, response.stream_id
                )));
            }

            let previous_total = partial.as_ref().map(|p| p.total_len);
            if previous_total.is_some_and(|total| total != response.total_len) {
                debug!(
                    "Stream {} from {} changed length {:?} -> {}, restarting",
                    stream_id, address, previous_total, response.total_len
                );
                partial = None;
                self.partials.lock().remove(&key);
                if response.offset != 0 {
                    continue;
                }
            }
            let current = partial.get_or_insert_with(|| PartialRead {
                total_len: response.total_len,
                data: Vec::new(),
            });

            if response.offset as usize != current.data.len() {
                return Err(ExchangeError::Malformed(format!(
                    "asked for offset {}, got {}",
                    current.data.len(),
                    response.offset
                )));
            }

            current.data.extend_from_slice(&response.payload);
            if current.data.len() >= current.total_len as usize {
                let data = std::mem::take(&mut current.data);
                self.partials.lock().remove(&key);
                debug!("Read stream {} from {} ({} bytes)", stream_id, address, data.len());
                return Ok(data);
            }
            if response.payload.is_empty() {
                return Err(ExchangeError::Malformed(
                    "empty window before end of stream".to_string(),
                ));
            }
            self.partials.lock().insert(key.clone(), current.clone());
        }
    }

    /// Push a payload to a connected peer as v2 message chunks, one at a time
    pub async fn send_message(
        &self,
        address: &str,
        sender: &SenderId,
        message_id: u32,
        payload: &[u8],
    ) -> Result<(), ExchangeError> {
        for frame in MessageFrame::chunk(message_id, Some(sender), payload, self.max_chunk)? {
            self.radio.write(address, &frame.encode()).await?;
        }
        debug!(
            "Sent message {} to {} ({} bytes)",
            message_id,
            address,
            payload.len()
        );
        Ok(())
    }

    /// Connect, read the peer's profile, push ours, check the ack, disconnect.
    /// The whole sequence is bounded by the exchange timeout.
    pub async fn exchange(
        &self,
        address: &str,
        sender: &SenderId,
        message_id: u32,
        our_payload: &[u8],
    ) -> Result<ExchangeReport, ExchangeError> {
        if !self.radio.is_available().await {
            return Err(RadioError::TransportUnavailable.into());
        }

        self.sessions.lock().insert(address.to_string());
        let result = tokio::time::timeout(
            self.exchange_timeout,
            self.exchange_inner(address, sender, message_id, our_payload),
        )
        .await;

        self.sessions.lock().remove(address);
        if let Err(e) = self.radio.disconnect(address).await {
            debug!("Disconnect from {} failed: {}", address, e);
        }

        match result {
            Ok(Ok(report)) => {
                info!(
                    "Exchanged with {} ({} bytes in, acked: {})",
                    address,
                    report.peer_payload.len(),
                    report.acknowledged
                );
                Ok(report)
            }
            Ok(Err(e)) => {
                warn!("Exchange with {} failed: {}", address, e);
                Err(e)
            }
            Err(_) => {
                warn!("Exchange with {} timed out", address);
                Err(ExchangeError::Timeout)
            }
        }
    }

    async fn exchange_inner(
        &self,
        address: &str,
        sender: &SenderId,
        message_id: u32,
        our_payload: &[u8],
    ) -> Result<ExchangeReport, ExchangeError> {
        self.radio.connect(address).await?;
        let peer_payload = self.fetch_stream(address, STREAM_PROFILE).await?;
        self.send_message(address, sender, message_id, our_payload)
            .await?;

        let acks = self.fetch_stream(address, STREAM_ACKS).await?;
        let acknowledged = Acknowledgement::decode_stream(&acks)
            .iter()
            .any(|(id, msg)| id == sender.as_str() && *msg == message_id);

        Ok(ExchangeReport {
            address: address.to_string(),
            peer_payload,
            message_id,
            acknowledged,
        })
    }

    /// Bytes retained from an interrupted read
    pub fn retained(&self, address: &str, stream_id: u8) -> usize {
        self.partials
            .lock()
            .get(&(address.to_string(), stream_id))
            .map(|p| p.data.len())
            .unwrap_or(0)
    }

    pub fn clear_partials(&self) {
        self.partials.lock().clear();
    }

    /// Peers with an exchange session currently open
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Disconnect every session left open by an exchange that never finished
    pub async fn disconnect_all(&self) {
        let open: Vec<String> = self.sessions.lock().drain().collect();
        for address in open {
            debug!("Releasing session with {}", address);
            if let Err(e) = self.radio.disconnect(&address).await {
                debug!("Disconnect from {} failed: {}", address, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_MAX_CHUNK;
    use crate::transport::ble::bridge::{GattRequestHandler, PeripheralRadio};
    use crate::transport::ble::gatt::{PeripheralEvent, PeripheralEffect, PeripheralState};
    use crate::transport::ble::loopback::LoopbackAir;
    use crate::transport::ble::ATTUNE_SERVICE_UUID;

    /// Serves fixed streams through the real reducer; the profile stream can
    /// be swapped between reads
    struct StreamServer {
        state: Mutex<PeripheralState>,
        reads: Mutex<usize>,
        swap_after: Option<(usize, Vec<u8>)>,
    }

    impl StreamServer {
        fn new(profile: Vec<u8>, max_chunk: usize) -> Arc<Self> {
            Self::with_swap(profile, max_chunk, None)
        }

        fn with_swap(
            profile: Vec<u8>,
            max_chunk: usize,
            swap_after: Option<(usize, Vec<u8>)>,
        ) -> Arc<Self> {
            let mut state = PeripheralState::new(max_chunk);
            state.set_stream(STREAM_PROFILE, profile);
            Arc::new(Self {
                state: Mutex::new(state),
                reads: Mutex::new(0),
                swap_after,
            })
        }
    }

    impl GattRequestHandler for StreamServer {
        fn on_read(&self, peer: &str) -> Vec<u8> {
            let mut reads = self.reads.lock();
            *reads += 1;
            let mut state = self.state.lock();
            if let Some((after, replacement)) = &self.swap_after {
                if *reads == after + 1 {
                    state.set_stream(STREAM_PROFILE, replacement.clone());
                }
            }
            match state
                .apply(PeripheralEvent::Read {
                    peer: peer.to_string(),
                })
                .pop()
            {
                Some(PeripheralEffect::Respond(bytes)) => bytes,
                _ => Vec::new(),
            }
        }

        fn on_write(&self, peer: &str, value: &[u8]) {
            self.state.lock().apply(PeripheralEvent::Write {
                peer: peer.to_string(),
                value: value.to_vec(),
            });
        }

        fn on_disconnected(&self, _peer: &str) {}
    }

    async fn serve(air: &Arc<LoopbackAir>, address: &str, handler: Arc<StreamServer>) {
        air.radio(address)
            .open_gatt_server(ATTUNE_SERVICE_UUID, handler)
            .await
            .unwrap();
    }

    fn client(air: &Arc<LoopbackAir>, address: &str, max_chunk: usize) -> CentralClient {
        CentralClient::new(
            air.radio(address),
            max_chunk,
            Duration::from_millis(DEFAULT_EXCHANGE_TIMEOUT_MS),
        )
    }

    #[tokio::test]
    async fn test_fetch_stream_in_windows() {
        let air = LoopbackAir::new();
        let profile: Vec<u8> = (0..=255u8).collect();
        serve(&air, "peer", StreamServer::new(profile.clone(), 100)).await;

        let central = client(&air, "me", DEFAULT_MAX_CHUNK);
        central.radio().connect("peer").await.unwrap();
        assert_eq!(central.fetch_stream("peer", STREAM_PROFILE).await.unwrap(), profile);
        assert_eq!(central.retained("peer", STREAM_PROFILE), 0);
    }

    #[tokio::test]
    async fn test_fetch_empty_stream() {
        let air = LoopbackAir::new();
        serve(&air, "peer", StreamServer::new(Vec::new(), 100)).await;

        let central = client(&air, "me", DEFAULT_MAX_CHUNK);
        central.radio().connect("peer").await.unwrap();
        assert!(central.fetch_stream("peer", 0x42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_length_change_restarts_from_zero() {
        let air = LoopbackAir::new();
        let first = vec![1u8; 30];
        let second = vec![2u8; 25];
        serve(
            &air,
            "peer",
            StreamServer::with_swap(first, 10, Some((1, second.clone()))),
        )
        .await;

        let central = client(&air, "me", DEFAULT_MAX_CHUNK);
        central.radio().connect("peer").await.unwrap();
        assert_eq!(central.fetch_stream("peer", STREAM_PROFILE).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_interrupted_read_resumes() {
        let air = LoopbackAir::new();
        let profile: Vec<u8> = (0..50u8).collect();
        serve(&air, "peer", StreamServer::new(profile.clone(), 10)).await;
        air.fail_reads_after("me", Some(2));

        let central = client(&air, "me", DEFAULT_MAX_CHUNK);
        central.radio().connect("peer").await.unwrap();
        assert!(central.fetch_stream("peer", STREAM_PROFILE).await.is_err());
        assert_eq!(central.retained("peer", STREAM_PROFILE), 20);

        air.fail_reads_after("me", None);
        assert_eq!(central.fetch_stream("peer", STREAM_PROFILE).await.unwrap(), profile);
        assert_eq!(central.retained("peer", STREAM_PROFILE), 0);
    }

    #[tokio::test]
    async fn test_exchange_unavailable_radio() {
        let air = LoopbackAir::new();
        let central = client(&air, "me", DEFAULT_MAX_CHUNK);
        air.set_available("me", false);
        let sender = SenderId::new("me").unwrap();
        assert_eq!(
            central.exchange("peer", &sender, 1, b"x").await,
            Err(ExchangeError::Radio(RadioError::TransportUnavailable))
        );
    }

    #[tokio::test]
    async fn test_exchange_unknown_peer_fails() {
        let air = LoopbackAir::new();
        let central = client(&air, "me", DEFAULT_MAX_CHUNK);
        let sender = SenderId::new("me").unwrap();
        assert!(matches!(
            central.exchange("nobody", &sender, 1, b"x").await,
            Err(ExchangeError::Radio(RadioError::PeerNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_aborted_exchange_session_released() {
        let air = LoopbackAir::new();
        serve(&air, "peer", StreamServer::new(vec![7; 20], 10)).await;
        air.stall_reads("me", true);

        let central = Arc::new(client(&air, "me", DEFAULT_MAX_CHUNK));
        let task = {
            let central = central.clone();
            tokio::spawn(async move {
                let sender = SenderId::new("me").unwrap();
                let _ = central.exchange("peer", &sender, 1, b"x").await;
            })
        };

        for _ in 0..100 {
            if !air.connections("me").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(air.connections("me"), vec!["peer".to_string()]);

        task.abort();
        let _ = task.await;
        assert_eq!(central.open_sessions(), 1);
        assert_eq!(air.connections("me"), vec!["peer".to_string()]);

        central.disconnect_all().await;
        assert_eq!(central.open_sessions(), 0);
        assert!(air.connections("me").is_empty());
    }
}
