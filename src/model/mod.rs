//! Core data model
//!
//! ## Contents
//!
//! - `CameraIdentity` / `CameraDescriptor` - the retained `/info` payload plus
//!   the identity 5-tuple parsed from the topic (topic is authoritative)
//! - `AnalyticEvent` - the uniform event record drivers emit
//! - `ConnectionState` / `StatusUpdate` - per-worker connectivity tracking
//!
//! Descriptor JSON field names match the wire format consumed by operators;
//! event field names match the downstream consumers (PascalCase legacy).

pub mod analytics;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity 5-tuple naming a camera on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CameraIdentity {
    pub tenant: String,
    pub building: String,
    pub floor: String,
    pub device_type: String,
    pub device_id: String,
}

impl CameraIdentity {
    /// Composite key used by the supervisor tables
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.tenant, self.building, self.floor, self.device_type, self.device_id
        )
    }
}

impl std::fmt::Display for CameraIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.tenant, self.building, self.floor, self.device_type, self.device_id
        )
    }
}

/// Camera descriptor: identity + connectivity + vendor tags + media routing
///
/// Deserialized from the retained `/info` payload; identity fields are then
/// overwritten from the topic and `normalize()` applies defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CameraDescriptor {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analytics: Vec<String>,
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rtsp_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub central_host: String,
    #[serde(default)]
    pub central_srt_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub central_path: String,
    #[serde(default)]
    pub record_enabled: bool,
    #[serde(default)]
    pub record_retention_minutes: i64,
    #[serde(default)]
    pub pre_roll_seconds: i64,

    // Identity, enriched by the supervisor from the /info topic
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub building: String,
    #[serde(default)]
    pub floor: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub device_id: String,

    /// Shard responsible for this camera (e.g. "shard-1", "hq-east")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shard: String,
}

impl CameraDescriptor {
    pub fn identity(&self) -> CameraIdentity {
        CameraIdentity {
            tenant: self.tenant.clone(),
            building: self.building.clone(),
            floor: self.floor.clone(),
            device_type: self.device_type.clone(),
            device_id: self.device_id.clone(),
        }
    }

    /// Overwrite identity fields from the topic (topic is authoritative)
    pub fn set_identity(&mut self, identity: &CameraIdentity) {
        self.tenant = identity.tenant.clone();
        self.building = identity.building.clone();
        self.floor = identity.floor.clone();
        self.device_type = identity.device_type.clone();
        self.device_id = identity.device_id.clone();
    }

    /// Trim string fields, apply routing defaults, clamp the recording policy
    /// and derive `record_enabled`.
    pub fn normalize(&mut self) {
        self.rtsp_url = self.rtsp_url.trim().to_string();
        self.proxy_path = self.proxy_path.trim().to_string();
        self.central_host = self.central_host.trim().to_string();
        self.central_path = self.central_path.trim().to_string();

        if self.proxy_path.is_empty() {
            let mut default_proxy = self.device_id.trim().to_string();
            if default_proxy.is_empty() {
                default_proxy = format!(
                    "{}_{}_{}_{}",
                    self.tenant, self.building, self.floor, self.device_id
                )
                .trim_matches('_')
                .to_string();
            }
            self.proxy_path = default_proxy;
        }
        if self.central_path.is_empty() {
            self.central_path = central_path_for(&self.identity());
        }

        if self.record_retention_minutes < 0 {
            tracing::warn!(
                device_id = %self.device_id,
                "invalid record_retention_minutes, clamping to 0"
            );
            self.record_retention_minutes = 0;
        }
        self.record_enabled = self.record_retention_minutes > 0;

        if self.pre_roll_seconds < 0 {
            tracing::warn!(
                device_id = %self.device_id,
                "invalid pre_roll_seconds, clamping to 0"
            );
            self.pre_roll_seconds = 0;
        }
    }

    /// True when the descriptor names an analytic, case-insensitively
    pub fn has_analytic(&self, name: &str) -> bool {
        self.analytics.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Default central path: `tenant/building/deviceId`, slash-joined, lowercased
pub fn central_path_for(identity: &CameraIdentity) -> String {
    [&identity.tenant, &identity.building, &identity.device_id]
        .iter()
        .map(|part| part.trim().trim_matches('/').to_lowercase())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Connectivity with the camera, published for external consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Online,
    Offline,
    NotEstablished,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Online => "online",
            ConnectionState::Offline => "offline",
            ConnectionState::NotEstablished => "not_established",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity transition reported by a driver
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub state: ConnectionState,
    pub reason: String,
}

/// Uniform analytic event record
///
/// Field names follow the legacy wire format. `raw_snapshot` never leaves the
/// process; `snapshot_b64` is stripped before any bus publish.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalyticEvent {
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "EventID")]
    pub event_id: String,
    #[serde(rename = "CameraIP")]
    pub camera_ip: String,
    #[serde(rename = "CameraName")]
    pub camera_name: String,
    #[serde(rename = "AnalyticType")]
    pub analytic_type: String,

    #[serde(rename = "Tenant", default, skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    #[serde(rename = "Building", default, skip_serializing_if = "String::is_empty")]
    pub building: String,
    #[serde(rename = "Floor", default, skip_serializing_if = "String::is_empty")]
    pub floor: String,
    #[serde(rename = "DeviceType", default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    #[serde(rename = "DeviceID", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,

    /// Per-event metadata (score, channel, vendor raw text, ...)
    #[serde(rename = "Meta", default)]
    pub meta: HashMap<String, serde_json::Value>,

    /// Public snapshot URL in the object store
    #[serde(rename = "SnapshotURL", default, skip_serializing_if = "String::is_empty")]
    pub snapshot_url: String,

    /// Base64 snapshot for in-process engines; never published
    #[serde(rename = "SnapshotB64", default, skip_serializing_if = "String::is_empty")]
    pub snapshot_b64: String,

    /// Raw snapshot bytes, in-process only
    #[serde(skip)]
    pub raw_snapshot: Vec<u8>,
}

impl AnalyticEvent {
    /// Skeleton event carrying the camera context of `descriptor`
    pub fn for_camera(descriptor: &CameraDescriptor, analytic_type: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: String::new(),
            camera_ip: descriptor.ip.clone(),
            camera_name: descriptor.name.clone(),
            analytic_type: analytic_type.to_string(),
            tenant: descriptor.tenant.clone(),
            building: descriptor.building.clone(),
            floor: descriptor.floor.clone(),
            device_type: descriptor.device_type.clone(),
            device_id: descriptor.device_id.clone(),
            ..Default::default()
        }
    }

    /// Copy for publication: raw bytes and base64 removed
    pub fn stripped(&self) -> Self {
        let mut out = self.clone();
        out.snapshot_b64 = String::new();
        out.raw_snapshot = Vec::new();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CameraIdentity {
        CameraIdentity {
            tenant: "acme".into(),
            building: "hq".into(),
            floor: "1".into(),
            device_type: "ipcam".into(),
            device_id: "cam-001".into(),
        }
    }

    #[test]
    fn test_descriptor_defaults() {
        let mut desc: CameraDescriptor = serde_json::from_str(
            r#"{"manufacturer":"vendorX","model":"any","ip":"10.0.0.10","enabled":true}"#,
        )
        .unwrap();
        desc.set_identity(&identity());
        desc.normalize();
        assert_eq!(desc.proxy_path, "cam-001");
        assert_eq!(desc.central_path, "acme/hq/cam-001");
        assert!(!desc.record_enabled);
    }

    #[test]
    fn test_central_path_lowercases_and_trims() {
        let id = CameraIdentity {
            tenant: " Acme ".into(),
            building: "HQ".into(),
            floor: "1".into(),
            device_type: "ipcam".into(),
            device_id: "/Cam-001/".into(),
        };
        assert_eq!(central_path_for(&id), "acme/hq/cam-001");
    }

    #[test]
    fn test_record_enabled_follows_retention() {
        let mut desc = CameraDescriptor {
            record_retention_minutes: 5,
            ..Default::default()
        };
        desc.set_identity(&identity());
        desc.normalize();
        assert!(desc.record_enabled);

        desc.record_retention_minutes = -3;
        desc.normalize();
        assert_eq!(desc.record_retention_minutes, 0);
        assert!(!desc.record_enabled);
    }

    #[test]
    fn test_descriptor_equality_detects_analytics_change() {
        let mut a = CameraDescriptor::default();
        a.analytics = vec!["faceCapture".into()];
        let mut b = a.clone();
        assert_eq!(a, b);
        b.analytics = vec!["faceCapture".into(), "CrossLineDetection".into()];
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_stripped_drops_base64_and_raw() {
        let evt = AnalyticEvent {
            snapshot_b64: "abcd".into(),
            raw_snapshot: vec![1, 2, 3],
            snapshot_url: "http://store/snap.jpg".into(),
            ..Default::default()
        };
        let out = evt.stripped();
        assert!(out.snapshot_b64.is_empty());
        assert!(out.raw_snapshot.is_empty());
        assert_eq!(out.snapshot_url, "http://store/snap.jpg");

        let json = serde_json::to_string(&out).unwrap();
        assert!(!json.contains("SnapshotB64"));
        assert!(json.contains("SnapshotURL"));
    }

    #[test]
    fn test_connection_state_wire_format() {
        let json = serde_json::to_string(&ConnectionState::NotEstablished).unwrap();
        assert_eq!(json, "\"not_established\"");
        let parsed: ConnectionState = serde_json::from_str("\"online\"").unwrap();
        assert_eq!(parsed, ConnectionState::Online);
    }
}
