//! Hikvision ISAPI driver
//!
//! Subscribes to `/ISAPI/Event/notification/subscribeEvent` with an XML body
//! listing the requested analytics, then consumes the multipart response
//! stream: JSON/XML parts carry events, image parts carry the snapshot for
//! the preceding event. Snapshots are uploaded to the object store and also
//! attached as raw bytes + base64 for the engine pipeline.

use crate::drivers::{
    device_base_url, device_http_client, digest, snapshot_key, CameraDriver,
    RECONNECT_BACKOFF, SNAPSHOT_UPLOAD_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::model::analytics::{code_known, HIKVISION_EVENT_TYPES};
use crate::model::{AnalyticEvent, CameraDescriptor};
use crate::storage::SnapshotStore;
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct HikvisionDriver {
    descriptor: CameraDescriptor,
    client: reqwest::Client,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl HikvisionDriver {
    pub fn new(
        descriptor: CameraDescriptor,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self> {
        let client = device_http_client(&descriptor)?;
        Ok(Self {
            descriptor,
            client,
            store,
        })
    }

    /// Analytics to subscribe: requested codes validated against the known
    /// table, falling back to `faceCapture` when nothing valid remains.
    fn selected_event_types(&self) -> Vec<String> {
        let mut selected = Vec::new();
        for requested in &self.descriptor.analytics {
            let name = requested.trim();
            if name.is_empty() {
                continue;
            }
            if code_known(HIKVISION_EVENT_TYPES, name) {
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
                "no valid analytics requested, falling back to faceCapture"
            );
            selected.push("faceCapture".to_string());
        }
        selected
    }

    /// subscribeEvent body: `eventMode=list` with one `<Event>` per analytic
    fn build_subscribe_xml(&self) -> Vec<u8> {
        let mut body = String::new();
        body.push_str(r#"<SubscribeEvent xmlns="http://www.isapi.org/ver20/XMLSchema">"#);
        body.push_str("<format>json</format>");
        body.push_str("<heartbeat>30</heartbeat>");
        body.push_str("<eventMode>list</eventMode>");
        body.push_str("<EventList>");
        for event_type in self.selected_event_types() {
            body.push_str("<Event><type>");
            body.push_str(&event_type);
            body.push_str("</type><channels>1</channels></Event>");
        }
        body.push_str("</EventList>");
        body.push_str("</SubscribeEvent>");
        body.into_bytes()
    }

    async fn run_once(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::Sender<AnalyticEvent>,
    ) -> Result<()> {
        let url = format!(
            "{}/ISAPI/Event/notification/subscribeEvent",
            device_base_url(&self.descriptor)
        );
        let response = digest::request_with_digest(
            &self.client,
            Method::POST,
            &url,
            &self.descriptor.username,
            &self.descriptor.password,
            Some("application/xml"),
            Some(self.build_subscribe_xml()),
        )
        .await?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Device(format!(
                "subscribeEvent status {}: {}",
                status, body
            )));
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = multer::parse_boundary(&content_type)
            .map_err(|e| Error::Device(format!("invalid Content-Type {:?}: {}", content_type, e)))?;

        tracing::info!(
            camera = %self.descriptor.name,
            ip = %self.descriptor.ip,
            "subscribed event stream"
        );

        let mut multipart = multer::Multipart::new(response.bytes_stream(), boundary);

        // The event part arrives first, its snapshot image part follows.
        let mut pending_event: Option<AnalyticEvent> = None;

        loop {
            let field = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                field = multipart.next_field() => field,
            };
            let field = match field {
                Ok(Some(f)) => f,
                Ok(None) => return Err(Error::Device("stream ended".to_string())),
                Err(e) => return Err(Error::Device(format!("error reading part: {}", e))),
            };

            let part_type = field
                .content_type()
                .map(|m| m.to_string())
                .unwrap_or_default();

            if part_type.starts_with("application/json") {
                let data = match field.bytes().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading json part");
                        continue;
                    }
                };
                match self.parse_json_event(&data) {
                    Ok(event) => pending_event = Some(event),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            raw = %String::from_utf8_lossy(&data),
                            "json event parse error"
                        );
                    }
                }
                continue;
            }

            if part_type.starts_with("application/xml") || part_type.starts_with("text/xml") {
                let data = match field.bytes().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading xml part");
                        continue;
                    }
                };
                match self.parse_xml_event(&String::from_utf8_lossy(&data)) {
                    Ok(event) => pending_event = Some(event),
                    Err(e) => tracing::warn!(error = %e, "xml event parse error"),
                }
                continue;
            }

            if part_type.starts_with("image/") {
                let image = match field.bytes().await {
                    Ok(d) => d.to_vec(),
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading image part");
                        continue;
                    }
                };

                let Some(mut event) = pending_event.take() else {
                    tracing::debug!("image part without pending event, discarding");
                    continue;
                };

                if let Some(store) = &self.store {
                    let key = snapshot_key(&self.descriptor, &event);
                    match tokio::time::timeout(
                        SNAPSHOT_UPLOAD_TIMEOUT,
                        store.save_snapshot(&key, &image, &part_type),
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

                // Engines need the pixels even when the store is private.
                event.snapshot_b64 = base64::engine::general_purpose::STANDARD.encode(&image);
                event.raw_snapshot = image;

                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = events.send(event) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
                continue;
            }

            // Other part types: heartbeat filler, ignored.
        }
    }

    fn parse_json_event(&self, data: &[u8]) -> Result<AnalyticEvent> {
        let raw: serde_json::Value = serde_json::from_slice(data)?;

        let event_type = raw
            .get("eventType")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let analytic = if event_type.is_empty() {
            "unknown".to_string()
        } else {
            event_type.clone()
        };

        let mut event = AnalyticEvent::for_camera(&self.descriptor, &analytic);
        event.timestamp = parse_event_time(raw.get("dateTime").and_then(|v| v.as_str()));
        event.event_id = json_event_id(&raw, event.timestamp);

        event.meta.insert("eventType".into(), raw.get("eventType").cloned().unwrap_or_default());
        event.meta.insert(
            "eventDescription".into(),
            raw.get("eventDescription").cloned().unwrap_or_default(),
        );
        event.meta.insert("eventState".into(), raw.get("eventState").cloned().unwrap_or_default());
        event.meta.insert("channelID".into(), raw.get("channelID").cloned().unwrap_or_default());
        event.meta.insert(
            "channelName".into(),
            raw.get("channelName").cloned().unwrap_or_default(),
        );

        if event_type == "faceCapture" {
            let (faces_count, best_score) = face_capture_stats(&raw);
            event.meta.insert("facesCount".into(), faces_count.into());
            event.meta.insert("bestScore".into(), best_score.into());
        }

        Ok(event)
    }

    fn parse_xml_event(&self, xml: &str) -> Result<AnalyticEvent> {
        let event_type = extract_xml_value(xml, "eventType").unwrap_or_default();
        let analytic = if event_type.is_empty() {
            "unknown".to_string()
        } else {
            event_type.clone()
        };

        let mut event = AnalyticEvent::for_camera(&self.descriptor, &analytic);
        event.timestamp = parse_event_time(extract_xml_value(xml, "dateTime").as_deref());
        event.event_id = format!(
            "xml-{}",
            event.timestamp.timestamp_nanos_opt().unwrap_or_default()
        );

        event.meta.insert("eventType".into(), event_type.into());
        event.meta.insert(
            "eventDescription".into(),
            extract_xml_value(xml, "eventDescription").unwrap_or_default().into(),
        );
        event.meta.insert(
            "eventState".into(),
            extract_xml_value(xml, "eventState").unwrap_or_default().into(),
        );
        event.meta.insert(
            "channelID".into(),
            extract_xml_value(xml, "channelID")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or_default()
                .into(),
        );
        event.meta.insert(
            "channelName".into(),
            extract_xml_value(xml, "channelName").unwrap_or_default().into(),
        );

        Ok(event)
    }
}

#[async_trait]
impl CameraDriver for HikvisionDriver {
    async fn run(
        &self,
        cancel: CancellationToken,
        events: mpsc::Sender<AnalyticEvent>,
    ) -> Result<()> {
        tracing::info!(
            camera = %self.descriptor.name,
            ip = %self.descriptor.ip,
            "starting hikvision driver"
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
}

fn parse_event_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn json_event_id(raw: &serde_json::Value, timestamp: DateTime<Utc>) -> String {
    for key in ["uid", "eventID"] {
        if let Some(id) = raw.get(key).and_then(|v| v.as_str()) {
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    format!("json-{}", timestamp.timestamp_nanos_opt().unwrap_or_default())
}

/// Best face score and total face count across the faceCapture list
fn face_capture_stats(raw: &serde_json::Value) -> (i64, f64) {
    let mut faces_count = 0i64;
    let mut best_score = 0f64;
    if let Some(captures) = raw.get("faceCapture").and_then(|v| v.as_array()) {
        for capture in captures {
            if let Some(faces) = capture.get("faces").and_then(|v| v.as_array()) {
                faces_count += faces.len() as i64;
                for face in faces {
                    if let Some(score) = face.get("faceScore").and_then(|v| v.as_f64()) {
                        if score > best_score {
                            best_score = score;
                        }
                    }
                }
            }
        }
    }
    (faces_count, best_score)
}

/// Extract `<tag>value</tag>`, tolerating namespace prefixes (`<ns:tag>`)
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    for open in [format!("<{}>", tag), format!(":{}>", tag)] {
        if let Some(start) = xml.find(open.as_str()) {
            let after = &xml[start + open.len()..];
            if let Some(end) = after.find("</") {
                return Some(after[..end].trim().to_string());
            }
        }
    }
    None
}
