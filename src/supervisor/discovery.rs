//! Home Assistant MQTT discovery
//!
//! Cameras that feed the face-recognition engine get a set of retained
//! discovery configs under `homeassistant/<component>/<object>/config`, so
//! recognition events show up as entities without manual dashboard work.
//! Retained so the entities survive a restart of this service.

use super::Supervisor;
use crate::error::{Error, Result};
use crate::model::CameraDescriptor;

impl Supervisor {
    /// Publish the discovery entity set for one camera. Only cameras that
    /// produce face events matter: that is what the recognition engine
    /// consumes to derive `faceRecognized`.
    pub(crate) async fn publish_ha_discovery(&self, descriptor: &CameraDescriptor) -> Result<()> {
        if !self.engines.has("findface") {
            return Ok(());
        }
        if !(descriptor.has_analytic("faceCapture") || descriptor.has_analytic("FaceDetection")) {
            return Ok(());
        }

        let slug = slug_for_camera(descriptor);
        let device_id = format!("cambus_camera_{}", slug);
        let event_topic = self.event_topic(descriptor, "faceRecognized");

        let device = serde_json::json!({
            "identifiers": [device_id],
            "name": format!(
                "Camera {} ({} {}, {})",
                descriptor.device_id, descriptor.building, descriptor.floor, descriptor.tenant
            ),
            "manufacturer": descriptor.manufacturer,
            "model": descriptor.model,
        });
        let origin = serde_json::json!({"name": "cam-bus"});

        let binary_sensor = serde_json::json!({
            "name": format!("FaceRecognized {}", descriptor.device_id),
            "unique_id": format!("{}_face_recognized", slug),
            "state_topic": event_topic,
            "value_template": "{% if value_json.AnalyticType == 'faceRecognized' and value_json.Meta.eventState == 'active' %}ON{% else %}OFF{% endif %}",
            "payload_on": "ON",
            "payload_off": "OFF",
            "expire_after": 10,
            "json_attributes_topic": event_topic,
            "device": device.clone(),
            "origin": origin.clone(),
        });
        self.publish_discovery_config("binary_sensor", &format!("{}_face_recognized", slug), &binary_sensor)
            .await?;

        let person = serde_json::json!({
            "name": format!("Face Recognition Person {}", descriptor.device_id),
            "unique_id": format!("{}_face_person", slug),
            "state_topic": event_topic,
            "value_template": "{{ value_json.Meta.ff_person_name }}",
            "icon": "mdi:account",
            "device": device.clone(),
            "origin": origin.clone(),
        });
        self.publish_discovery_config("sensor", &format!("{}_face_person", slug), &person)
            .await?;

        let message = serde_json::json!({
            "name": format!("Face Recognition Msg {}", descriptor.device_id),
            "unique_id": format!("{}_face_message", slug),
            "state_topic": event_topic,
            "value_template": "Recognized person: {{ value_json.Meta.ff_person_name }}",
            "icon": "mdi:account-badge",
            "device": device.clone(),
            "origin": origin.clone(),
        });
        self.publish_discovery_config("sensor", &format!("{}_face_message", slug), &message)
            .await?;

        let confidence = serde_json::json!({
            "name": format!("Face Recognition Confidence {}", descriptor.device_id),
            "unique_id": format!("{}_face_confidence", slug),
            "state_topic": event_topic,
            "value_template": "{{ (value_json.Meta.ff_confidence * 100) | round(1) }}",
            "unit_of_measurement": "%",
            "icon": "mdi:shield-half-full",
            "device": device.clone(),
            "origin": origin.clone(),
        });
        self.publish_discovery_config("sensor", &format!("{}_face_confidence", slug), &confidence)
            .await?;

        let time = serde_json::json!({
            "name": format!("Face Recognition Time {}", descriptor.device_id),
            "unique_id": format!("{}_face_time", slug),
            "state_topic": event_topic,
            "device_class": "timestamp",
            "value_template": "{{ as_datetime(value_json.Timestamp) }}",
            "device": device.clone(),
            "origin": origin.clone(),
        });
        self.publish_discovery_config("sensor", &format!("{}_face_time", slug), &time)
            .await?;

        let snapshot = serde_json::json!({
            "name": format!("Face Snapshot {}", descriptor.device_id),
            "unique_id": format!("{}_face_snapshot", slug),
            "url_topic": event_topic,
            "url_template": "{{ value_json.SnapshotURL }}",
            "device": device.clone(),
            "origin": origin.clone(),
        });
        self.publish_discovery_config("image", &format!("{}_face_snapshot", slug), &snapshot)
            .await?;

        let db_photo = serde_json::json!({
            "name": format!("Face DB Photo {}", descriptor.device_id),
            "unique_id": format!("{}_face_db_photo", slug),
            "url_topic": event_topic,
            "url_template": "{{ value_json.Meta.ff_person_photo_url }}",
            "device": device.clone(),
            "origin": origin.clone(),
        });
        self.publish_discovery_config("image", &format!("{}_face_db_photo", slug), &db_photo)
            .await?;

        Ok(())
    }

    async fn publish_discovery_config(
        &self,
        component: &str,
        object_id: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        let topic = format!("homeassistant/{}/{}/config", component, object_id);
        let payload = serde_json::to_vec(config)?;
        self.bus
            .publish(&topic, 1, true, &payload)
            .await
            .map_err(|e| Error::Bus(format!("publish discovery {}: {}", topic, e)))?;
        tracing::debug!(component = %component, topic = %topic, "published HA discovery");
        Ok(())
    }
}

/// Entity slug: lowercase identity with separators flattened
fn slug_for_camera(descriptor: &CameraDescriptor) -> String {
    format!(
        "cambus_{}_{}_{}_{}",
        descriptor.tenant, descriptor.building, descriptor.floor, descriptor.device_id
    )
    .to_lowercase()
    .replace([' ', '-'], "_")
}
