use serde::{Deserialize, Serialize};

/// Periodic liveness message published on the `heartbeat` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    /// Current LED command in `c,w,r,g,b` form.
    pub state: String,
    pub timestamp: String,
}
