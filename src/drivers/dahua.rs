//! Dahua eventManager driver
//!
//! Attaches to `/cgi-bin/eventManager.cgi?action=attach&codes=[...]` and
//! parses the `Key=Value;` text parts of the multipart stream. Only codes the
//! descriptor requested (validated against the known table, `ALL`/`*`
//! expanding to everything) produce events, and only on `action=Start`.
//! Each event triggers a one-shot snapshot fetch from the device.
//!
//! This driver implements both optional capabilities: connection-state
//! reporting and active-analytics introspection.

use crate::drivers::{
    device_base_url, device_http_client, digest, snapshot_key, CameraDriver, StatusHandler,
    RECONNECT_BACKOFF, SNAPSHOT_UPLOAD_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::model::analytics::{code_known, requests_all, DAHUA_EVENT_TYPES};
use crate::model::{AnalyticEvent, CameraDescriptor, ConnectionState, StatusUpdate};
use crate::storage::SnapshotStore;
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use reqwest::Method;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct DahuaDriver {
    descriptor: CameraDescriptor,
    client: reqwest::Client,
    store: Option<Arc<dyn SnapshotStore>>,
    status_handler: Mutex<Option<StatusHandler>>,
}

impl DahuaDriver {
    pub fn new(
        descriptor: CameraDescriptor,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self> {
        let client = device_http_client(&descriptor)?;
        Ok(Self {
            descriptor,
            client,
            store,
            status_handler: Mutex::new(None),
        })
    }

    fn notify_status(&self, update: StatusUpdate) {
        let handler = self.status_handler.lock().ok().and_then(|g| g.clone());
        if let Some(handler) = handler {
            handler(update);
        }
    }

    /// Event codes to attach, from the descriptor's analytics:
    /// - `ALL`/`*` selects every known code
    /// - otherwise only codes present in the known table survive
    /// - nothing valid falls back to `FaceDetection`
    fn selected_event_codes(&self) -> Vec<String> {
        if requests_all(&self.descriptor.analytics) {
            tracing::info!(
                device_id = %self.descriptor.device_id,
                "subscribing to all known dahua event codes"
            );
            return DAHUA_EVENT_TYPES.iter().map(|s| s.to_string()).collect();
        }

        let mut selected = Vec::new();
        for requested in &self.descriptor.analytics {
            let name = requested.trim();
            if name.is_empty() {
                continue;
            }
            if code_known(DAHUA_EVENT_TYPES, name) {
                selected.push(name.to_string());
            } else {
                tracing::warn!(
                    device_id = %self.descriptor.device_id,
                    analytic = %name,
                    "unsupported analytic, skipping"
                );
            }
        }

        if selected.is_empty() {
            tracing::info!(
                device_id = %self.descriptor.device_id,
                "no valid analytics requested, falling back to FaceDetection"
            );
            selected.push("FaceDetection".to_string());
        }
        selected
    }

    async fn run_once(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::Sender<AnalyticEvent>,
    ) -> Result<()> {
        let codes = self.selected_event_codes();
        let codes_joined = codes.join(",");
        self.notify_status(StatusUpdate {
            state: ConnectionState::Connecting,
            reason: "opening event stream".to_string(),
        });

        let allowed: HashSet<String> = codes
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let url = format!(
            "{}/cgi-bin/eventManager.cgi?action=attach&codes=[{}]&heartbeat=5",
            device_base_url(&self.descriptor),
            codes_joined
        );

        let response = match digest::request_with_digest(
            &self.client,
            Method::GET,
            &url,
            &self.descriptor.username,
            &self.descriptor.password,
            None,
            None,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                self.notify_status(StatusUpdate {
                    state: ConnectionState::NotEstablished,
                    reason: e.to_string(),
                });
                return Err(Error::Device(format!("eventManager attach error: {}", e)));
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            self.notify_status(StatusUpdate {
                state: ConnectionState::NotEstablished,
                reason: body.clone(),
            });
            return Err(Error::Device(format!(
                "eventManager status {}: {}",
                status, body
            )));
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = match multer::parse_boundary(&content_type) {
            Ok(b) => b,
            Err(e) => {
                self.notify_status(StatusUpdate {
                    state: ConnectionState::NotEstablished,
                    reason: format!("invalid Content-Type {:?}", content_type),
                });
                return Err(Error::Device(format!(
                    "invalid Content-Type {:?}: {}",
                    content_type, e
                )));
            }
        };

        self.notify_status(StatusUpdate {
            state: ConnectionState::Online,
            reason: format!("subscribed to [{}]", codes_joined),
        });

        let mut multipart = multer::Multipart::new(response.bytes_stream(), boundary);

        loop {
            let field = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                field = multipart.next_field() => field,
            };
            let field = match field {
                Ok(Some(f)) => f,
                Ok(None) => {
                    self.notify_status(StatusUpdate {
                        state: ConnectionState::Offline,
                        reason: "stream ended".to_string(),
                    });
                    return Err(Error::Device("stream ended".to_string()));
                }
                Err(e) => {
                    self.notify_status(StatusUpdate {
                        state: ConnectionState::Offline,
                        reason: e.to_string(),
                    });
                    return Err(Error::Device(format!("error reading part: {}", e)));
                }
            };

            let part_type = field
                .content_type()
                .map(|m| m.to_string())
                .unwrap_or_default();
            if !(part_type.is_empty() || part_type.starts_with("text/plain")) {
                continue;
            }

            let data = match field.bytes().await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "error reading text part");
                    continue;
                }
            };
            let body = String::from_utf8_lossy(&data);

            let Some(mut event) = self.parse_event(&body, &allowed) else {
                continue;
            };

            // Snapshot: one-shot fetch from the device; the event stays valid
            // without it.
            match self.fetch_snapshot(cancel).await {
                Ok((image, image_type)) if !image.is_empty() => {
                    if let Some(store) = &self.store {
                        let key = snapshot_key(&self.descriptor, &event);
                        match tokio::time::timeout(
                            SNAPSHOT_UPLOAD_TIMEOUT,
                            store.save_snapshot(&key, &image, &image_type),
                        )
                        .await
                        {
                            Ok(Ok(url)) => event.snapshot_url = url,
                            Ok(Err(e)) => {
                                tracing::warn!(error = %e, "snapshot upload failed")
                            }
                            Err(_) => tracing::warn!("snapshot upload timed out"),
                        }
                    }
                    event.snapshot_b64 =
                        base64::engine::general_purpose::STANDARD.encode(&image);
                    event.raw_snapshot = image;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "snapshot fetch failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = events.send(event) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Parse a `Code=...;action=...;...` part. Returns None for codes outside
    /// the allowed set and for non-Start actions.
    fn parse_event(&self, body: &str, allowed: &HashSet<String>) -> Option<AnalyticEvent> {
        let code = extract_kv(body, "Code").or_else(|| extract_kv(body, "code"))?;
        if !allowed.contains(&code.trim().to_lowercase()) {
            return None;
        }

        let action = extract_kv(body, "action").unwrap_or_default();
        if !action.is_empty() && !action.eq_ignore_ascii_case("Start") {
            return None;
        }

        let mut event = AnalyticEvent::for_camera(&self.descriptor, &code);
        event.timestamp = Utc::now();
        event.event_id = format!(
            "dahua-{}",
            event.timestamp.timestamp_nanos_opt().unwrap_or_default()
        );
        event.meta.insert("raw".into(), body.into());
        event.meta.insert("code".into(), code.into());
        event.meta.insert("action".into(), action.into());
        Some(event)
    }

    /// One-shot snapshot from the device. Most models expose
    /// `/cgi-bin/snapshot.cgi?channel=1`.
    async fn fetch_snapshot(&self, cancel: &CancellationToken) -> Result<(Vec<u8>, String)> {
        let url = format!(
            "{}/cgi-bin/snapshot.cgi?channel=1",
            device_base_url(&self.descriptor)
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok((Vec::new(), String::new())),
            response = digest::request_with_digest(
                &self.client,
                Method::GET,
                &url,
                &self.descriptor.username,
                &self.descriptor.password,
                None,
                None,
            ) => response?,
        };

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Device(format!("snapshot status {}: {}", status, body)));
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();

        let image = response.bytes().await?.to_vec();
        if image.is_empty() {
            return Err(Error::Device("empty snapshot".to_string()));
        }
        Ok((image, content_type))
    }
}

#[async_trait]
impl CameraDriver for DahuaDriver {
    async fn run(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<AnalyticEvent>,
    ) -> Result<()> {
        tracing::info!(
            camera = %self.descriptor.name,
            ip = %self.descriptor.ip,
            "starting dahua driver"
        );

        loop {
            match self.run_once(&cancel, &events).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    tracing::warn!(
                        camera = %self.descriptor.name,
                        error = %e,
                        "driver error, retrying in 5s"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                    }
                }
            }
        }
    }

    fn set_status_handler(&self, handler: StatusHandler) {
        if let Ok(mut guard) = self.status_handler.lock() {
            *guard = Some(handler);
        }
    }

    fn active_analytics(&self) -> Option<Vec<String>> {
        Some(self.selected_event_codes())
    }
}

/// Extract `Key=Value` from Dahua's `;`-separated event text
fn extract_kv(body: &str, key: &str) -> Option<String> {
    let needle = format!("{}=", key);
    let start = body.find(&needle)?;
    let rest = &body[start + needle.len()..];
    let value = match rest.find(';') {
        Some(end) => &rest[..end],
        None => rest,
    };
    Some(value.trim().to_string())
}
