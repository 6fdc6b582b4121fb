//! Periodic service statistics emission.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::trace;

use crate::service::Service;

/// Point-in-time counters for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Connections accepted since startup.
    pub total_clients_accepted: u64,
    /// Clients currently connected.
    pub open_connections: u64,
}

/// Snapshots the service's counters.
#[must_use]
pub fn gather_stats(service: &Service) -> ServiceStats {
    ServiceStats {
        total_clients_accepted: service.connections_accepted(),
        open_connections: service.open_connections(),
    }
}

/// Emits stats at trace level every `interval` until the service stops.
pub async fn stats_loop(service: Arc<Service>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick of a tokio interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = service.cancel_token().cancelled() => break,
            _ = ticker.tick() => {
                let stats = gather_stats(&service);
                let Ok(json) = serde_json::to_string(&stats) else {
                    continue;
                };
                trace!(service = %service.name(), stats = %json, "periodic stats");
            },
        }
    }

    trace!("exiting stats loop");
}
