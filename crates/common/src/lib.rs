use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label used for the primary port of a reservation.
pub const MAIN_LABEL: &str = "main";

/// Schema version written with every current-format record.
pub const RECORD_VERSION: &str = "2.0.0";

/// A preferred port for one named label.
///
/// Accepts both a bare number (or `null`) and the object form `{ "hint": 3100 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortHint {
    Bare(Option<u16>),
    Object {
        #[serde(default)]
        hint: Option<u16>,
    },
}

impl PortHint {
    /// The hinted port, treating `0` as "no preference".
    pub fn port(&self) -> Option<u16> {
        let hint = match self {
            PortHint::Bare(hint) => *hint,
            PortHint::Object { hint } => *hint,
        };
        hint.filter(|port| *port != 0)
    }
}

impl Default for PortHint {
    fn default() -> Self {
        PortHint::Bare(None)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<BTreeMap<String, PortHint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Lease duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateResponse {
    /// Primary port, present for every request shape so single-port clients keep working.
    pub port: u16,
    /// Full label map, only for named or count requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<BTreeMap<String, u16>>,
    pub lease: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub name: Option<String>,
    /// Older clients send this as `portName`.
    #[serde(default, alias = "portName", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub name: Option<String>,
}

/// One row of `GET /list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationEntry {
    pub name: String,
    pub port: u16,
    pub ports: BTreeMap<String, u16>,
    pub expires_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub alive: bool,
    pub version: String,
}

/// Body of `GET /ports/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortsResponse {
    pub name: String,
    pub ports: BTreeMap<String, u16>,
    pub expires_at: DateTime<Utc>,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Picks the primary port of a label map: `main` if present, otherwise the first label.
pub fn primary_port(ports: &BTreeMap<String, u16>) -> Option<u16> {
    ports
        .get(MAIN_LABEL)
        .or_else(|| ports.values().next())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_hint_accepts_bare_and_object_forms() {
        let parsed: BTreeMap<String, PortHint> = serde_json::from_str(
            r#"{"main": {"hint": 3100}, "api": {}, "ws": 3102, "admin": null}"#,
        )
        .unwrap();

        assert_eq!(parsed["main"].port(), Some(3100));
        assert_eq!(parsed["api"].port(), None);
        assert_eq!(parsed["ws"].port(), Some(3102));
        assert_eq!(parsed["admin"].port(), None);
    }

    #[test]
    fn zero_hint_means_no_preference() {
        assert_eq!(PortHint::Bare(Some(0)).port(), None);
        assert_eq!(PortHint::Object { hint: Some(0) }.port(), None);
    }

    #[test]
    fn primary_port_prefers_main() {
        let mut ports = BTreeMap::new();
        ports.insert("api".to_string(), 3001);
        ports.insert("main".to_string(), 3005);
        assert_eq!(primary_port(&ports), Some(3005));

        ports.remove("main");
        assert_eq!(primary_port(&ports), Some(3001));
        assert_eq!(primary_port(&BTreeMap::new()), None);
    }

    #[test]
    fn single_port_response_omits_map() {
        let resp = AllocateResponse { port: 3000, ports: None, lease: 600 };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("ports").is_none());
        assert_eq!(json["port"], 3000);
    }

    #[test]
    fn release_accepts_port_name_alias() {
        let req: ReleaseRequest =
            serde_json::from_str(r#"{"name": "svc", "portName": "api"}"#).unwrap();
        assert_eq!(req.name.as_deref(), Some("svc"));
        assert_eq!(req.label.as_deref(), Some("api"));

        let req: ReleaseRequest = serde_json::from_str(r#"{"name": "svc"}"#).unwrap();
        assert_eq!(req.label, None);
    }
}
