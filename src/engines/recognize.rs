//! Face-recognition engine
//!
//! Adapts the external recognition service to the `Engine` contract. On a
//! face event (`faceCapture` from Hikvision, `FaceDetection` from Dahua) the
//! engine submits the snapshot and, when the service matched a registered
//! person, derives one `faceRecognized` event carrying the match metadata
//! under `ff_*` keys. No match, no face, or any backend failure derives
//! nothing.

use crate::engines::Engine;
use crate::error::{Error, Result};
use crate::model::AnalyticEvent;
use crate::state::env_string;
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;

/// Deadline for downloading a snapshot by URL when no bytes are attached
const SNAPSHOT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Recognition backend response (stated contract)
#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    matched: bool,
    #[serde(default)]
    card_id: Option<i64>,
    #[serde(default)]
    person_name: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    person_photo_url: String,
}

pub struct FaceRecognizeEngine {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl FaceRecognizeEngine {
    /// Enabled only when `FACE_API_URL` is set
    pub fn from_env() -> Option<Self> {
        let base_url = env_string("FACE_API_URL", "");
        if base_url.is_empty() {
            tracing::info!("FACE_API_URL not set, face recognition disabled");
            return None;
        }
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "face recognition http client init failed");
                return None;
            }
        };
        tracing::info!(base_url = %base_url, "face recognition engine enabled");
        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: std::env::var("FACE_API_TOKEN").unwrap_or_default(),
        })
    }

    /// Snapshot bytes: raw first, then base64, then the public URL
    async fn load_snapshot(&self, event: &AnalyticEvent) -> Option<Vec<u8>> {
        if !event.raw_snapshot.is_empty() {
            return Some(event.raw_snapshot.clone());
        }
        if !event.snapshot_b64.is_empty() {
            match base64::engine::general_purpose::STANDARD.decode(&event.snapshot_b64) {
                Ok(data) => return Some(data),
                Err(e) => tracing::warn!(error = %e, "snapshot base64 decode failed"),
            }
        }
        if !event.snapshot_url.is_empty() {
            let response = self
                .client
                .get(&event.snapshot_url)
                .timeout(SNAPSHOT_FETCH_TIMEOUT)
                .send()
                .await;
            match response {
                Ok(r) if r.status().is_success() => match r.bytes().await {
                    Ok(bytes) => return Some(bytes.to_vec()),
                    Err(e) => tracing::warn!(error = %e, "snapshot url read failed"),
                },
                Ok(r) => {
                    tracing::warn!(status = %r.status(), "snapshot url fetch failed")
                }
                Err(e) => tracing::warn!(error = %e, "snapshot url fetch failed"),
            }
        }
        None
    }

    async fn recognize(&self, image: &[u8]) -> Result<RecognitionResponse> {
        let payload = serde_json::json!({
            "image_b64": base64::engine::general_purpose::STANDARD.encode(image),
        });
        let mut request = self
            .client
            .post(format!("{}/recognize", self.base_url))
            .json(&payload);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "recognition backend status {}: {}",
                status, body
            )));
        }
        response.json().await.map_err(Error::Http)
    }
}

#[async_trait]
impl Engine for FaceRecognizeEngine {
    fn name(&self) -> &str {
        "findface"
    }

    fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    async fn process(&self, event: AnalyticEvent) -> Result<Vec<AnalyticEvent>> {
        let analytic = event.analytic_type.trim().to_lowercase();
        if analytic != "facecapture" && analytic != "facedetection" {
            return Ok(Vec::new());
        }

        let Some(image) = self.load_snapshot(&event).await else {
            tracing::debug!(
                event_id = %event.event_id,
                "face event without snapshot, skipping recognition"
            );
            return Ok(Vec::new());
        };

        let result = self.recognize(&image).await?;
        if !result.matched {
            return Ok(Vec::new());
        }

        let mut recognized = event.clone();
        recognized.analytic_type = "faceRecognized".to_string();
        recognized
            .meta
            .insert("ff_event_id".into(), result.event_id.clone().into());
        recognized.meta.insert("ff_matched".into(), true.into());
        recognized
            .meta
            .insert("ff_card_id".into(), result.card_id.unwrap_or_default().into());
        recognized
            .meta
            .insert("ff_person_name".into(), result.person_name.clone().into());
        recognized
            .meta
            .insert("ff_confidence".into(), result.confidence.into());
        if !result.person_photo_url.is_empty() {
            recognized
                .meta
                .insert("ff_person_photo_url".into(), result.person_photo_url.clone().into());
        }

        tracing::info!(
            event_id = %result.event_id,
            person = %result.person_name,
            confidence = result.confidence,
            "faceRecognized"
        );
        Ok(vec![recognized])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FaceRecognizeEngine {
        FaceRecognizeEngine {
            client: reqwest::Client::new(),
            base_url: "http://findface:8000".to_string(),
            token: String::new(),
        }
    }

    #[tokio::test]
    async fn test_non_face_event_ignored() {
        let e = engine();
        let event = AnalyticEvent {
            analytic_type: "CrossLineDetection".to_string(),
            ..Default::default()
        };
        let out = e.process(event).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_face_event_without_snapshot_skipped() {
        let e = engine();
        let event = AnalyticEvent {
            analytic_type: "faceCapture".to_string(),
            ..Default::default()
        };
        let out = e.process(event).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_load_snapshot_prefers_raw_bytes() {
        let e = engine();
        let event = AnalyticEvent {
            analytic_type: "faceCapture".to_string(),
            raw_snapshot: vec![1, 2, 3],
            snapshot_b64: base64::engine::general_purpose::STANDARD.encode([9, 9]),
            ..Default::default()
        };
        assert_eq!(e.load_snapshot(&event).await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_load_snapshot_decodes_base64() {
        let e = engine();
        let event = AnalyticEvent {
            analytic_type: "faceCapture".to_string(),
            snapshot_b64: base64::engine::general_purpose::STANDARD.encode([4, 5, 6]),
            ..Default::default()
        };
        assert_eq!(e.load_snapshot(&event).await, Some(vec![4, 5, 6]));
    }
}
