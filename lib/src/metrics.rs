use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health and usage counters for a single DHT node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeMetrics {
    /// Contacts currently held in the routing table.
    pub routing_table_size: usize,

    /// Records held in the node's datastore.
    pub local_records: u64,

    /// Keys this node knows providers for.
    pub provider_keys: u64,

    /// Iterative lookups started by this node.
    pub lookups: u64,

    /// Lookups that reached no peer at all.
    pub failed_lookups: u64,

    /// Requests answered on behalf of other peers.
    pub requests_served: u64,

    /// The percentage of successful outbound RPCs.
    pub operation_success_rate: f64,

    /// Moving average of outbound RPC latency.
    #[serde(with = "humantime_serde")]
    pub operation_latency: Duration,
}

impl NodeMetrics {
    // Weight of the newest sample in the moving averages
    const SMOOTHING: f64 = 0.2;

    pub fn record_rpc(&mut self, success: bool, latency: Duration) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.operation_success_rate =
            self.operation_success_rate * (1.0 - Self::SMOOTHING) + outcome * Self::SMOOTHING;
        if success {
            let previous = self.operation_latency.as_secs_f64();
            let next = previous * (1.0 - Self::SMOOTHING) + latency.as_secs_f64() * Self::SMOOTHING;
            self.operation_latency = Duration::from_secs_f64(next);
        }
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            routing_table_size: 0,
            local_records: 0,
            provider_keys: 0,
            lookups: 0,
            failed_lookups: 0,
            requests_served: 0,
            operation_success_rate: 1.0, // Assume 100% success initially
            operation_latency: Duration::from_millis(0),
        }
    }
}
