//! Round-robin send balancer over the overlay identity pool.
//!
//! Each overlay identity has its own throughput ceiling, so sends are spread
//! across the whole pool. Every send is a detached task; failures are logged
//! and dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use novon_core::overlay::{sub_address, Payload, SendConfig};

use crate::transport::OverlayClient;

/// Fire-and-forget fan-out used by the stream and chat paths.
pub trait Broadcaster: Send + Sync {
    /// One send to many destinations through a single pool member.
    fn multicast(&self, addresses: Arc<[String]>, payload: Payload);

    /// Redundant send to one destination over every virtual route.
    fn unicast(&self, address: &str, payload: Payload);
}

pub struct ClientBalancer {
    clients: Vec<Arc<dyn OverlayClient>>,
    counter: AtomicUsize,
    /// Virtual routes per unicast destination.
    sub_clients: usize,
}

impl ClientBalancer {
    pub fn new(clients: Vec<Arc<dyn OverlayClient>>, sub_clients: usize) -> Self {
        Self {
            clients,
            counter: AtomicUsize::new(0),
            sub_clients: sub_clients.max(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.clients.len()
    }

    /// Members that still hold an overlay connection.
    pub fn connected_count(&self) -> usize {
        self.clients.iter().filter(|c| !c.is_closed()).count()
    }

    /// Wait until every pool member is connected or `limit` passes,
    /// logging progress as members come up. Returns the connected count.
    pub async fn wait_ready(&self, limit: Duration) -> usize {
        let total = self.clients.len();
        let mut pending: FuturesUnordered<_> = self
            .clients
            .iter()
            .map(|c| {
                let c = c.clone();
                async move { c.ready().await }
            })
            .collect();
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        let mut connected = 0;
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(true) => {
                        connected += 1;
                        tracing::info!(connected, total, "overlay client connected");
                    }
                    Some(false) => tracing::warn!("overlay client closed before connecting"),
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(connected, total, "gave up waiting for overlay clients");
                    break;
                }
            }
        }
        connected
    }

    /// Next live pool member in round-robin order. `None` when every
    /// member is closed or the pool is empty.
    pub fn next_client(&self) -> Option<Arc<dyn OverlayClient>> {
        let n = self.clients.len();
        for _ in 0..n {
            let idx = self.counter.fetch_add(1, Ordering::Relaxed) % n;
            let client = &self.clients[idx];
            if !client.is_closed() {
                return Some(client.clone());
            }
        }
        None
    }

    fn dispatch(&self, destinations: Vec<String>, payload: Payload, config: SendConfig) {
        let Some(client) = self.next_client() else {
            tracing::warn!(destinations = destinations.len(), "no live overlay client, send dropped");
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = client.send(&destinations, payload, config).await {
                tracing::warn!(
                    destinations = destinations.len(),
                    error = %e,
                    "overlay send failed"
                );
            }
        });
    }
}

impl Broadcaster for ClientBalancer {
    fn multicast(&self, addresses: Arc<[String]>, payload: Payload) {
        if addresses.is_empty() {
            return;
        }
        self.dispatch(addresses.to_vec(), payload, SendConfig::default());
    }

    fn unicast(&self, address: &str, payload: Payload) {
        for k in 0..self.sub_clients {
            self.dispatch(
                vec![sub_address(k, address)],
                payload.clone(),
                SendConfig::default(),
            );
        }
    }
}
