use serde::{Deserialize, Serialize};

/// 3x-UI wraps every API response as `{ success, msg, obj }`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    pub obj: Option<T>,
}

/// An inbound listener as reported by `GET /panel/api/inbounds`,
/// including per-client traffic counters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInbound {
    pub id: i64,
    #[serde(default)]
    pub remark: String,
    pub protocol: String,
    pub port: i64,
    pub enable: bool,
    #[serde(default)]
    pub client_stats: Vec<ClientTraffic>,
}

impl RemoteInbound {
    /// Display tag for the local mirror; 3x-UI remarks are optional.
    pub fn tag(&self) -> String {
        if self.remark.is_empty() {
            format!("inbound-{}", self.port)
        } else {
            self.remark.clone()
        }
    }
}

/// Per-client counters. `expiry_time` is unix millis (0 = never),
/// `total` is the byte quota (0 = unlimited).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTraffic {
    pub id: i64,
    pub inbound_id: i64,
    pub enable: bool,
    pub email: String,
    pub up: i64,
    pub down: i64,
    pub expiry_time: i64,
    pub total: i64,
}

impl ClientTraffic {
    pub fn used(&self) -> i64 {
        self.up + self.down
    }
}

/// Client payload for addClient/updateClient. Serialized into the
/// JSON-string `settings` field 3x-UI expects. `total_gb` is bytes
/// despite the wire name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    pub id: String,
    pub email: String,
    pub enable: bool,
    #[serde(rename = "totalGB")]
    pub total_gb: i64,
    pub expiry_time: i64,
    pub limit_ip: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

/// Subset of `GET /panel/api/server/status` we act on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: MemStat,
    #[serde(default)]
    pub uptime: i64,
    #[serde(default)]
    pub tcp_count: i64,
    #[serde(default)]
    pub udp_count: i64,
    #[serde(default)]
    pub xray: XrayStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemStat {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrayStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub version: String,
}
