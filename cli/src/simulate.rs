// Loopback simulation — several full nodes sharing one in-process air
//
// Every node gets its own in-memory storage and a profile nudged by a few
// random user actions, so the crowd is not uniform. The air re-broadcasts
// advertisements once a second, like a real advertising interval.

use anyhow::{Context, Result};
use attune_core::{
    Collaborators, ConnectionRecord, Dimension, DimensionVector, ExchangeService, LoopbackAir,
    MemoryStorage, ServiceConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

const SEED_ACTIONS: usize = 12;

pub struct SimulationEvent {
    pub node: String,
    pub record: ConnectionRecord,
}

pub struct NodeSummary {
    pub address: String,
    pub inbox_len: usize,
    pub connections_len: usize,
    /// Mean absolute change of the core vector over the run
    pub drift: f64,
}

pub struct SimulationReport {
    pub events: Vec<SimulationEvent>,
    pub nodes: Vec<NodeSummary>,
}

fn seed_profile(svc: &ExchangeService) -> Result<()> {
    for i in 0..SEED_ACTIONS {
        let dim = Dimension::ALL[rand::random::<usize>() % Dimension::ALL.len()];
        svc.model()
            .record_user_action(dim, rand::random::<f64>(), i as u64)
            .context("Failed to seed profile")?;
    }
    Ok(())
}

fn forward(
    address: String,
    mut rx: broadcast::Receiver<ConnectionRecord>,
    tx: mpsc::UnboundedSender<SimulationEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) => {
                    let event = SimulationEvent {
                        node: address.clone(),
                        record,
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("{} dropped {} connection events", address, n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

pub async fn run(config: ServiceConfig, nodes: usize, seconds: u64) -> Result<SimulationReport> {
    let air = LoopbackAir::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut services = Vec::with_capacity(nodes);
    let mut forwarders = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let address = format!("sim-{}", i);
        let radio = air.radio(&address);
        let svc = ExchangeService::new(
            config.clone(),
            Arc::new(MemoryStorage::new()),
            radio.clone(),
            radio,
            Collaborators::reference(),
        )?;
        seed_profile(&svc)?;
        let start_core = svc.model().profile().core;
        forwarders.push(forward(address.clone(), svc.subscribe_connections(), tx.clone()));
        services.push((address, svc, start_core));
    }
    drop(tx);

    for (address, svc, _) in &services {
        svc.start()
            .await
            .with_context(|| format!("Failed to start {}", address))?;
    }
    info!("{} simulated nodes running", services.len());

    let mut events = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            Some(event) = rx.recv() => events.push(event),
            _ = ticker.tick() => air.readvertise(),
            _ = &mut deadline => break,
        }
    }

    let mut summaries = Vec::with_capacity(services.len());
    for (address, svc, start_core) in &services {
        svc.orchestrator().join_all().await;
        if let Err(e) = svc.stop().await {
            debug!("Stopping {}: {}", address, e);
        }
        let end_core: DimensionVector = svc.model().profile().core;
        summaries.push(NodeSummary {
            address: address.clone(),
            inbox_len: svc.pipeline().inbox().len(),
            connections_len: svc.orchestrator().connections().len(),
            drift: start_core.mean_abs_diff(&end_core),
        });
    }
    for task in forwarders {
        task.abort();
    }
    // records that landed while the nodes were winding down
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    Ok(SimulationReport {
        events,
        nodes: summaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_three_nodes_meet_each_other() {
        let report = run(ServiceConfig::default(), 3, 2).await.unwrap();

        assert_eq!(report.nodes.len(), 3);
        // every ordered pair exchanges once inside the backoff window
        assert_eq!(report.events.len(), 6);
        for node in &report.nodes {
            assert_eq!(node.connections_len, 2);
            assert_eq!(node.inbox_len, 2);
            assert!(node.drift.is_finite());
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = ServiceConfig {
            max_chunk: 0,
            ..Default::default()
        };
        assert!(run(config, 2, 1).await.is_err());
    }
}
