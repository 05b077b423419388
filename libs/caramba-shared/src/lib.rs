use serde::{Deserialize, Serialize};

pub mod panel {
    use super::*;
    use std::fmt;
    use std::str::FromStr;

    /// Point-in-time server status reported by a node's panel.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct PanelStatus {
        pub cpu_pct: f64,
        pub mem_pct: f64,
        pub disk_pct: f64,
        pub connections: u32,
        pub uptime_secs: u64,
    }

    /// Panel-side address of one subscriber binding: the inbound it lives in
    /// plus the client id inside that inbound.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BindingRef {
        pub inbound_id: i64,
        pub client_id: String,
    }

    impl BindingRef {
        pub fn new(inbound_id: i64, client_id: impl Into<String>) -> Self {
            Self {
                inbound_id,
                client_id: client_id.into(),
            }
        }
    }

    impl fmt::Display for BindingRef {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}", self.inbound_id, self.client_id)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct InvalidBindingRef(pub String);

    impl fmt::Display for InvalidBindingRef {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "invalid binding reference: {:?}", self.0)
        }
    }

    impl std::error::Error for InvalidBindingRef {}

    impl FromStr for BindingRef {
        type Err = InvalidBindingRef;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let (inbound, client) = s
                .split_once(':')
                .ok_or_else(|| InvalidBindingRef(s.to_string()))?;
            let inbound_id = inbound
                .trim()
                .parse::<i64>()
                .map_err(|_| InvalidBindingRef(s.to_string()))?;
            let client = client.trim();
            if client.is_empty() {
                return Err(InvalidBindingRef(s.to_string()));
            }
            Ok(Self::new(inbound_id, client))
        }
    }

    /// Desired state of a binding, used for both create and update.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct BindingSpec {
        pub inbound_id: i64,
        pub client_id: String,
        /// Human label; panels require it to be unique per inbound.
        pub email: String,
        /// 0 means unlimited.
        pub traffic_limit_bytes: i64,
        /// Unix millis, 0 means never.
        pub expiry_time_ms: i64,
        pub enable: bool,
    }

    impl BindingSpec {
        pub fn binding_ref(&self) -> BindingRef {
            BindingRef::new(self.inbound_id, self.client_id.clone())
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Binding {
        pub binding_ref: BindingRef,
        pub email: String,
        pub enable: bool,
        pub traffic_limit_bytes: i64,
        pub expiry_time_ms: i64,
    }

    impl From<&BindingSpec> for Binding {
        fn from(spec: &BindingSpec) -> Self {
            Self {
                binding_ref: spec.binding_ref(),
                email: spec.email.clone(),
                enable: spec.enable,
                traffic_limit_bytes: spec.traffic_limit_bytes,
                expiry_time_ms: spec.expiry_time_ms,
            }
        }
    }
}

/// Raw shapes of the 3x-ui style panel HTTP API.
pub mod api {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct Envelope<T> {
        pub success: bool,
        #[serde(default)]
        pub msg: String,
        pub obj: Option<T>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct Usage {
        #[serde(default)]
        pub current: u64,
        #[serde(default)]
        pub total: u64,
    }

    impl Usage {
        pub fn percent(&self) -> f64 {
            if self.total == 0 {
                return 0.0;
            }
            (self.current as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
        }
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ServerStatus {
        #[serde(default)]
        pub cpu: f64,
        #[serde(default)]
        pub mem: Usage,
        #[serde(default)]
        pub disk: Usage,
        #[serde(default)]
        pub tcp_count: u32,
        #[serde(default)]
        pub uptime: u64,
    }

    impl From<ServerStatus> for panel::PanelStatus {
        fn from(raw: ServerStatus) -> Self {
            Self {
                cpu_pct: raw.cpu.clamp(0.0, 100.0),
                mem_pct: raw.mem.percent(),
                disk_pct: raw.disk.percent(),
                connections: raw.tcp_count,
                uptime_secs: raw.uptime,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct Inbound {
        pub id: i64,
        #[serde(default)]
        pub remark: String,
        /// JSON document encoded as a string, holding `clients`.
        #[serde(default)]
        pub settings: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Client {
        pub id: String,
        #[serde(default)]
        pub email: String,
        #[serde(default = "default_enable")]
        pub enable: bool,
        #[serde(rename = "totalGB", default)]
        pub total_bytes: i64,
        #[serde(default)]
        pub expiry_time: i64,
    }

    fn default_enable() -> bool {
        true
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    pub struct InboundSettings {
        #[serde(default)]
        pub clients: Vec<Client>,
    }

    impl Inbound {
        pub fn clients(&self) -> Result<Vec<Client>, serde_json::Error> {
            if self.settings.trim().is_empty() {
                return Ok(Vec::new());
            }
            let settings: InboundSettings = serde_json::from_str(&self.settings)?;
            Ok(settings.clients)
        }

        pub fn bindings(&self) -> Result<Vec<panel::Binding>, serde_json::Error> {
            Ok(self
                .clients()?
                .into_iter()
                .map(|c| panel::Binding {
                    binding_ref: panel::BindingRef::new(self.id, c.id),
                    email: c.email,
                    enable: c.enable,
                    traffic_limit_bytes: c.total_bytes,
                    expiry_time_ms: c.expiry_time,
                })
                .collect())
        }
    }

    impl From<&panel::BindingSpec> for Client {
        fn from(spec: &panel::BindingSpec) -> Self {
            Self {
                id: spec.client_id.clone(),
                email: spec.email.clone(),
                enable: spec.enable,
                total_bytes: spec.traffic_limit_bytes,
                expiry_time: spec.expiry_time_ms,
            }
        }
    }

    /// Body of `settings` for add/update client calls.
    pub fn client_settings(spec: &panel::BindingSpec) -> Result<String, serde_json::Error> {
        serde_json::to_string(&InboundSettings {
            clients: vec![Client::from(spec)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::api::{Envelope, Inbound, ServerStatus};
    use super::panel::{BindingRef, PanelStatus};

    #[test]
    fn binding_ref_round_trips_through_text() {
        let r: BindingRef = "7:5f1c-aa".parse().unwrap();
        assert_eq!(r, BindingRef::new(7, "5f1c-aa"));
        assert_eq!(r.to_string(), "7:5f1c-aa");
    }

    #[test]
    fn binding_ref_rejects_garbage() {
        assert!("nocolon".parse::<BindingRef>().is_err());
        assert!("x:abc".parse::<BindingRef>().is_err());
        assert!("3:".parse::<BindingRef>().is_err());
    }

    #[test]
    fn server_status_maps_usage_to_percent() {
        let raw = r#"{"success":true,"msg":"","obj":{"cpu":12.5,"mem":{"current":512,"total":1024},"disk":{"current":1,"total":4},"tcpCount":33,"uptime":99}}"#;
        let env: Envelope<ServerStatus> = serde_json::from_str(raw).unwrap();
        assert!(env.success);
        let status = PanelStatus::from(env.obj.unwrap());
        assert_eq!(status.cpu_pct, 12.5);
        assert_eq!(status.mem_pct, 50.0);
        assert_eq!(status.disk_pct, 25.0);
        assert_eq!(status.connections, 33);
    }

    #[test]
    fn inbound_settings_yield_bindings() {
        let inbound = Inbound {
            id: 3,
            remark: "reality".to_string(),
            settings: r#"{"clients":[{"id":"u-1","email":"sub-1","totalGB":1000,"expiryTime":0}]}"#
                .to_string(),
        };
        let bindings = inbound.bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].binding_ref, BindingRef::new(3, "u-1"));
        assert!(bindings[0].enable);
        assert_eq!(bindings[0].traffic_limit_bytes, 1000);
    }
}
