//! # Prometheus Metrics
//!
//! Chain, peer and gossip gauges for the node, served at `/metrics` when
//! `[stats].metrics_listen` is set.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::sync::{broadcast, watch};

use pod_protocol::chain::events::TOPIC_NEW_TAIL_BLOCK;
use pod_protocol::chain::{Blockchain, Event};
use pod_protocol::crypto::{Address, Hash};
use pod_protocol::network::NetService;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub chain_height: IntGauge,
    pub lib_height: IntGauge,
    pub connected_peers: IntGauge,
    pub minted_blocks_total: IntCounter,
    pub received_messages_total: IntCounter,
    pub dropped_messages_total: IntCounter,
}

fn register<T: Collector + Clone + 'static>(registry: &Registry, metric: T) -> prometheus::Result<T> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("pod".into()), None)?;
        Ok(Self {
            chain_height: register(
                &registry,
                IntGauge::new("chain_height", "Height of the canonical tail")?,
            )?,
            lib_height: register(
                &registry,
                IntGauge::new("lib_height", "Height of the latest irreversible block")?,
            )?,
            connected_peers: register(
                &registry,
                IntGauge::new("connected_peers", "Established P2P streams")?,
            )?,
            minted_blocks_total: register(
                &registry,
                IntCounter::new("minted_blocks_total", "Blocks minted by this node that became tail")?,
            )?,
            received_messages_total: register(
                &registry,
                IntCounter::new("received_messages_total", "Messages handed to the dispatcher")?,
            )?,
            dropped_messages_total: register(
                &registry,
                IntCounter::new("dropped_messages_total", "Messages dropped on full queues")?,
            )?,
            registry,
        })
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn sample(&self, chain: &Blockchain, net: &NetService) {
        self.chain_height.set(chain.tail().height() as i64);
        self.lib_height.set(chain.lib().height() as i64);
        self.connected_peers.set(net.peer_count() as i64);
        // Counters only move forward: top them up to the dispatcher totals.
        let received = net.dispatcher().received();
        self.received_messages_total
            .inc_by(received.saturating_sub(self.received_messages_total.get()));
        let dropped = net.dispatcher().dropped();
        self.dropped_messages_total
            .inc_by(dropped.saturating_sub(self.dropped_messages_total.get()));
    }

    fn count_if_minted(&self, chain: &Blockchain, event: &Event, miner: Option<Address>) {
        let Some(miner) = miner else { return };
        if event.topic != TOPIC_NEW_TAIL_BLOCK {
            return;
        }
        let hash = serde_json::from_str::<serde_json::Value>(&event.data)
            .ok()
            .and_then(|v| v.get("hash").and_then(|h| h.as_str()).map(str::to_owned))
            .and_then(|h| Hash::from_hex(&h).ok());
        if let Some(Ok(Some(block))) = hash.map(|h| chain.get_block(&h)) {
            if block.proposer() == miner {
                self.minted_blocks_total.inc();
            }
        }
    }

    /// Refresh gauges periodically and count our own tail blocks until
    /// `quit` flips.
    pub async fn run(
        self: Arc<Self>,
        chain: Arc<Blockchain>,
        net: Arc<NetService>,
        miner: Option<Address>,
        mut quit: watch::Receiver<bool>,
    ) {
        let mut events = chain.events().subscribe();
        let mut tick = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = tick.tick() => self.sample(&chain, &net),
                event = events.recv() => match event {
                    Ok(event) => self.count_if_minted(&chain, &event, miner),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "metrics lagged behind chain events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_with_prefix() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.chain_height.set(42);
        metrics.minted_blocks_total.inc();
        let body = metrics.encode().unwrap();
        assert!(body.contains("pod_chain_height 42"));
        assert!(body.contains("pod_minted_blocks_total 1"));
    }
}
