//! Camera drivers
//!
//! ## Responsibilities
//!
//! - `CameraDriver` - the contract every vendor driver satisfies: drive the
//!   device until cancelled, emitting uniform events on the channel
//! - optional capabilities (status reporting, active-analytics introspection)
//!   exposed as default trait methods the supervisor calls unconditionally
//! - `DriverRegistry` - `manufacturer:model` lookup with `manufacturer:any`
//!   fallback, built once at startup and handed to the supervisor
//!
//! Non-fatal device errors are retried inside `run` with a 5-second backoff;
//! `run` returns only on cancellation.

pub mod dahua;
pub mod digest;
pub mod hikvision;

use crate::error::{Error, Result};
use crate::model::{AnalyticEvent, CameraDescriptor, StatusUpdate};
use crate::storage::SnapshotStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Delay between reconnect attempts after a device failure
pub const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

/// Deadline for one snapshot upload to the object store
pub const SNAPSHOT_UPLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Callback receiving connection-state transitions
pub type StatusHandler = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Vendor driver contract
#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// Drive the device until `cancel` fires. Emits events on `events`; the
    /// channel closes when the last sender drops on return.
    async fn run(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<AnalyticEvent>,
    ) -> Result<()>;

    /// Optional capability: receive connectivity transitions
    fn set_status_handler(&self, _handler: StatusHandler) {}

    /// Optional capability: the analytics the driver actually subscribed to
    fn active_analytics(&self) -> Option<Vec<String>> {
        None
    }
}

impl std::fmt::Debug for dyn CameraDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn CameraDriver")
    }
}

/// Factory building a driver for a descriptor
pub type DriverFactory = Arc<
    dyn Fn(&CameraDescriptor, Option<Arc<dyn SnapshotStore>>) -> Result<Arc<dyn CameraDriver>>
        + Send
        + Sync,
>;

/// Registry: `normalize(manufacturer):normalize(model)` -> factory.
/// Populated at process start, never mutated afterwards.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in vendor driver
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register("hikvision", "any", Arc::new(|descriptor, store| {
            Ok(Arc::new(hikvision::HikvisionDriver::new(descriptor.clone(), store)?)
                as Arc<dyn CameraDriver>)
        }));
        registry.register("dahua", "any", Arc::new(|descriptor, store| {
            Ok(Arc::new(dahua::DahuaDriver::new(descriptor.clone(), store)?)
                as Arc<dyn CameraDriver>)
        }));
        registry
    }

    pub fn register(&mut self, manufacturer: &str, model: &str, factory: DriverFactory) {
        let key = format!("{}:{}", normalize(manufacturer), normalize(model));
        self.factories.insert(key, factory);
    }

    /// Exact `manufacturer:model` lookup, then `manufacturer:any` fallback
    pub fn get(
        &self,
        descriptor: &CameraDescriptor,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Arc<dyn CameraDriver>> {
        let exact = format!(
            "{}:{}",
            normalize(&descriptor.manufacturer),
            normalize(&descriptor.model)
        );
        if let Some(factory) = self.factories.get(&exact) {
            return factory(descriptor, store);
        }
        let fallback = format!("{}:any", normalize(&descriptor.manufacturer));
        if let Some(factory) = self.factories.get(&fallback) {
            return factory(descriptor, store);
        }
        Err(Error::DriverNotFound {
            manufacturer: descriptor.manufacturer.clone(),
            model: descriptor.model.clone(),
        })
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin_drivers()
    }
}

/// Lowercase and strip space/dash/underscore
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Deterministic object-store key for an event snapshot:
/// `<tenant>/<building>/<floor>/<deviceType>/<deviceId>/<analytic>/<yyyy>/<mm>/<dd>/<eventId>_<unixnanos>.jpg`
pub fn snapshot_key(descriptor: &CameraDescriptor, event: &AnalyticEvent) -> String {
    let ts: DateTime<Utc> = event.timestamp;
    format!(
        "{}/{}/{}/{}/{}/{}/{:04}/{:02}/{:02}/{}_{}.jpg",
        safe_path(&descriptor.tenant, "default"),
        safe_path(&descriptor.building, "building"),
        safe_path(&descriptor.floor, "floor"),
        safe_path(&descriptor.device_type, "device"),
        safe_path(&descriptor.device_id, "id"),
        safe_path(&event.analytic_type, "analytic"),
        ts.format("%Y"),
        ts.format("%m"),
        ts.format("%d"),
        event.event_id,
        ts.timestamp_nanos_opt().unwrap_or_default(),
    )
}

fn safe_path(value: &str, def: &str) -> String {
    let value = value.trim();
    let value = if value.is_empty() { def } else { value };
    value.to_lowercase().replace(' ', "_").replace('/', "-")
}

/// HTTP base URL for a device: scheme from the TLS flag, optional port
pub fn device_base_url(descriptor: &CameraDescriptor) -> String {
    let scheme = if descriptor.use_tls { "https" } else { "http" };
    if descriptor.port != 0 {
        format!("{}://{}:{}", scheme, descriptor.ip, descriptor.port)
    } else {
        format!("{}://{}", scheme, descriptor.ip)
    }
}

/// reqwest client for a device; `use_tls` always accepts invalid certs
/// (vendor cameras on internal networks ship self-signed certs).
pub fn device_http_client(descriptor: &CameraDescriptor) -> Result<reqwest::Client> {
    let mut builder =
        reqwest::Client::builder().connect_timeout(std::time::Duration::from_secs(10));
    if descriptor.use_tls {
        builder = builder.danger_accept_invalid_certs(true);
        tracing::info!(
            camera = %descriptor.name,
            ip = %descriptor.ip,
            "insecure TLS enabled for device"
        );
    }
    builder.build().map_err(Error::Http)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(manufacturer: &str, model: &str) -> CameraDescriptor {
        CameraDescriptor {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            ip: "10.0.0.10".to_string(),
            device_id: "cam-001".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Hik Vision"), "hikvision");
        assert_eq!(normalize("DS-2CD_A"), "ds2cda");
    }

    #[test]
    fn test_registry_any_fallback() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert!(registry.get(&descriptor("Hikvision", "DS-2CD"), None).is_ok());
        assert!(registry.get(&descriptor("dahua", "IPC-HFW"), None).is_ok());
    }

    #[test]
    fn test_registry_unknown_vendor() {
        let registry = DriverRegistry::with_builtin_drivers();
        let err = registry.get(&descriptor("acme", "x1"), None).unwrap_err();
        assert!(matches!(err, Error::DriverNotFound { .. }));
    }

    #[test]
    fn test_snapshot_key_shape() {
        let mut desc = descriptor("hikvision", "any");
        desc.tenant = "Acme".to_string();
        desc.building = "HQ 1".to_string();
        desc.floor = "2".to_string();
        desc.device_type = "ipcam".to_string();
        let mut evt = AnalyticEvent::for_camera(&desc, "faceCapture");
        evt.event_id = "ev-1".to_string();
        evt.timestamp = chrono::DateTime::parse_from_rfc3339("2026-03-04T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let key = snapshot_key(&desc, &evt);
        assert!(key.starts_with("acme/hq_1/2/ipcam/cam-001/facecapture/2026/03/04/ev-1_"));
        assert!(key.ends_with(".jpg"));
    }

    #[test]
    fn test_device_base_url() {
        let mut desc = descriptor("dahua", "any");
        assert_eq!(device_base_url(&desc), "http://10.0.0.10");
        desc.port = 8443;
        desc.use_tls = true;
        assert_eq!(device_base_url(&desc), "https://10.0.0.10:8443");
    }
}
