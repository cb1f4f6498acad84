use serde::{Deserialize, Serialize};

use crate::types::Duration;

/// A simulated host: a named machine with cores, a per-core flop rate, and ram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub cores: u64,
    /// per-core compute speed in flop/s
    pub flop_rate: f64,
    /// ram in bytes
    #[serde(default)]
    pub ram: f64,
}

/// Transfer-delay model for mailbox messages.
///
/// Delay = `latency + payload_bytes / bandwidth`. The defaults (zero latency,
/// unbounded bandwidth) make message passing instantaneous in simulated time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub latency: f64,
    /// bytes per second; `None` means unbounded
    #[serde(default)]
    pub bandwidth: Option<f64>,
}

impl NetworkConfig {
    pub fn transfer_delay(&self, payload_bytes: u64) -> Duration {
        let bw = match self.bandwidth {
            Some(bw) if bw > 0.0 => payload_bytes as f64 / bw,
            _ => 0.0,
        };
        Duration(self.latency + bw)
    }
}
