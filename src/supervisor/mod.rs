//! Supervisor
//!
//! ## Responsibilities
//!
//! - Subscribe to the descriptor (`.../info`) and control (`.../uplink/+`)
//!   topics and materialize per-camera workers from retained descriptors
//! - Reconcile on every descriptor publish: tombstones and `enabled=false`
//!   tear the worker down, changed configurations restart it, identical ones
//!   are ignored
//! - Fan each worker's events out to the bus and through the engine
//!   pipeline, in driver-emission order per camera
//! - Publish periodic camera and per-building collector status (retained)
//! - Republish uplink status updates on the owning camera's topic
//! - Keep the media-router config in sync with the camera set
//!
//! The single mutex guards the camera and worker tables; publishes and hook
//! callbacks always run outside it.

pub mod discovery;
pub mod worker;

use crate::drivers::DriverRegistry;
use crate::engines::EngineManager;
use crate::error::{Error, Result};
use crate::mediamtx::MediaConfigGenerator;
use crate::model::{
    central_path_for, AnalyticEvent, CameraDescriptor, CameraIdentity, ConnectionState,
    StatusUpdate,
};
use crate::mqtt::EventBus;
use crate::state::AppConfig;
use crate::storage::SnapshotStore;
use crate::uplink::{UplinkManager, UplinkRequest, UplinkStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use worker::{WorkerRecord, WorkerSnapshot};

/// Driver event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Tables {
    cameras: HashMap<String, CameraDescriptor>,
    workers: HashMap<String, WorkerRecord>,
}

pub struct Supervisor {
    bus: Arc<dyn EventBus>,
    base_topic: String,
    shard: String,
    status_interval: Duration,
    engines: Arc<EngineManager>,
    uplink: Option<Arc<UplinkManager>>,
    registry: Arc<DriverRegistry>,
    store: Option<Arc<dyn SnapshotStore>>,
    generators: Vec<Arc<MediaConfigGenerator>>,
    tables: Mutex<Tables>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn EventBus>,
        config: &AppConfig,
        engines: Arc<EngineManager>,
        uplink: Option<Arc<UplinkManager>>,
        registry: Arc<DriverRegistry>,
        store: Option<Arc<dyn SnapshotStore>>,
        generators: Vec<Arc<MediaConfigGenerator>>,
    ) -> Arc<Self> {
        if config.shard.is_empty() {
            tracing::info!("CAMBUS_SHARD not set, this instance serves all shards");
        } else {
            tracing::info!(shard = %config.shard, "shard configured");
        }

        let supervisor = Arc::new(Self {
            bus,
            base_topic: config.base_topic.trim_end_matches('/').to_string(),
            shard: config.shard.clone(),
            status_interval: config.status_interval,
            engines,
            uplink,
            registry,
            store,
            generators,
            tables: Mutex::new(Tables {
                cameras: HashMap::new(),
                workers: HashMap::new(),
            }),
        });
        supervisor.register_uplink_status_hook();
        supervisor
    }

    /// Forward uplink status updates to the owning camera's status topic
    fn register_uplink_status_hook(self: &Arc<Self>) {
        let Some(uplink) = &self.uplink else {
            return;
        };
        let supervisor = self.clone();
        uplink.set_status_hook(Arc::new(move |status| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor.handle_uplink_status(status).await;
            });
        }));
    }

    /// Subscribe and serve until cancelled, then tear everything down.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let info_filter = format!("{}/+/+/+/+/+/info", self.base_topic);
        tracing::info!(filter = %info_filter, "subscribing to descriptor topic");
        let handler_self = self.clone();
        self.bus
            .subscribe(
                &info_filter,
                1,
                Arc::new(move |topic, payload| {
                    let supervisor = handler_self.clone();
                    Box::pin(async move {
                        supervisor.handle_info(&topic, &payload).await;
                    })
                }),
            )
            .await?;

        let uplink_filter = format!("{}/+/+/+/+/+/uplink/+", self.base_topic);
        tracing::info!(filter = %uplink_filter, "subscribing to uplink control topic");
        let handler_self = self.clone();
        self.bus
            .subscribe(
                &uplink_filter,
                1,
                Arc::new(move |topic, payload| {
                    let supervisor = handler_self.clone();
                    Box::pin(async move {
                        supervisor.handle_uplink_message(&topic, &payload).await;
                    })
                }),
            )
            .await?;

        if !self.status_interval.is_zero() {
            let status_self = self.clone();
            let status_cancel = cancel.clone();
            tokio::spawn(async move {
                status_self.run_status_loop(status_cancel).await;
            });
        }

        cancel.cancelled().await;
        tracing::info!("supervisor cancelled, stopping all workers");
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(self: &Arc<Self>) {
        {
            let mut tables = self.tables.lock().await;
            for (key, worker) in tables.workers.drain() {
                tracing::info!(key = %key, "stopping camera worker");
                worker.cancel.cancel();
            }
            tables.cameras.clear();
        }
        if let Some(uplink) = &self.uplink {
            uplink.stop_all().await;
        }
        self.refresh_media_config().await;
    }

    /// Identity from the topic suffix after the base. `extra` is the number
    /// of segments after the identity (1 for `info`, 2 for `uplink/<action>`).
    fn identity_from_topic(&self, topic: &str, extra: usize) -> Option<CameraIdentity> {
        let base_len = self.base_topic.split('/').count();
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < base_len + 5 + extra {
            return None;
        }
        Some(CameraIdentity {
            tenant: parts[base_len].to_string(),
            building: parts[base_len + 1].to_string(),
            floor: parts[base_len + 2].to_string(),
            device_type: parts[base_len + 3].to_string(),
            device_id: parts[base_len + 4].to_string(),
        })
    }

    /// Descriptor-topic handler. Safe against concurrent entry.
    pub async fn handle_info(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let Some(identity) = self.identity_from_topic(topic, 1) else {
            tracing::warn!(topic = %topic, "invalid info topic");
            return;
        };

        let trimmed = trim_payload(payload);
        if trimmed.is_empty() || trimmed == b"null" {
            tracing::info!(camera = %identity, "camera removed via tombstone");
            let mut descriptor = CameraDescriptor::default();
            descriptor.set_identity(&identity);
            self.cleanup_camera(&descriptor).await;
            return;
        }

        let mut descriptor: CameraDescriptor = match serde_json::from_slice(payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    error = %e,
                    payload = %String::from_utf8_lossy(&payload[..payload.len().min(256)]),
                    "invalid descriptor JSON, dropping"
                );
                return;
            }
        };

        // The topic names the camera; payload identity fields are ignored.
        descriptor.set_identity(&identity);
        descriptor.normalize();

        let key = identity.key();
        if !descriptor.enabled {
            tracing::info!(key = %key, "camera disabled via descriptor, stopping worker");
            self.cleanup_camera(&descriptor).await;
            return;
        }

        {
            let mut tables = self.tables.lock().await;
            tables.cameras.insert(key.clone(), descriptor.clone());
        }

        if let Some(uplink) = &self.uplink {
            if !descriptor.central_host.is_empty() {
                let mut request = UplinkRequest {
                    camera_id: descriptor.device_id.clone(),
                    proxy_path: descriptor.proxy_path.clone(),
                    central_host: descriptor.central_host.clone(),
                    central_srt_port: descriptor.central_srt_port,
                    central_path: descriptor.central_path.clone(),
                    ttl_seconds: 0,
                };
                request.normalize();
                if let Err(e) = uplink.start(request).await {
                    tracing::warn!(camera_id = %descriptor.device_id, error = %e, "uplink start failed");
                }
            } else {
                uplink.stop_by_camera(&descriptor).await;
            }
        }

        if let Err(e) = self.publish_ha_discovery(&descriptor).await {
            tracing::warn!(key = %key, error = %e, "discovery publish failed");
        }

        self.start_or_update_camera(descriptor).await;
    }

    /// Control-topic handler (`.../uplink/{start|stop}`)
    pub async fn handle_uplink_message(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        let Some(identity) = self.identity_from_topic(topic, 2) else {
            tracing::warn!(topic = %topic, "invalid uplink topic");
            return;
        };
        let action = topic.rsplit('/').next().unwrap_or_default().to_lowercase();

        let mut request: UplinkRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "invalid uplink payload, dropping");
                return;
            }
        };
        request.normalize();
        if action == "start" && request.central_path.is_empty() {
            if !request.proxy_path.is_empty() {
                request.central_path = request.proxy_path.trim_matches('/').to_string();
            } else {
                request.central_path = central_path_for(&identity);
            }
        }
        if let Err(e) = request.validate() {
            tracing::warn!(topic = %topic, error = %e, "invalid uplink request");
            return;
        }

        let Some(uplink) = &self.uplink else {
            return;
        };
        match action.as_str() {
            "start" => {
                if let Err(e) = uplink.start(request.clone()).await {
                    tracing::warn!(camera_id = %request.camera_id, error = %e, "uplink start failed");
                }
            }
            "stop" => {
                if let Err(e) = uplink.stop(request.clone()).await {
                    tracing::warn!(camera_id = %request.camera_id, error = %e, "uplink stop failed");
                }
            }
            other => {
                tracing::warn!(action = %other, "unknown uplink action");
            }
        }
    }

    /// Uplink status hook body: locate the owning descriptor (by cameraId,
    /// else by normalized centralPath) and republish. The publish happens
    /// with no lock held.
    pub async fn handle_uplink_status(self: &Arc<Self>, status: UplinkStatus) {
        let descriptor = {
            let tables = self.tables.lock().await;
            let normalized_central = status.central_path.trim().trim_matches('/');
            tables
                .cameras
                .values()
                .find(|camera| {
                    (!status.camera_id.is_empty()
                        && camera.device_id.eq_ignore_ascii_case(&status.camera_id))
                        || (!normalized_central.is_empty()
                            && camera.central_path.trim().trim_matches('/') == normalized_central)
                })
                .cloned()
        };

        let Some(descriptor) = descriptor else {
            tracing::warn!(
                camera_id = %status.camera_id,
                central_path = %status.central_path,
                state = %status.state,
                "uplink status without matching camera"
            );
            return;
        };

        let topic = self.uplink_status_topic(&descriptor);
        let payload = match serde_json::to_vec(&status) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "uplink status marshal failed");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&topic, 1, false, &payload).await {
            tracing::warn!(topic = %topic, error = %e, "uplink status publish failed");
        }
    }

    /// Start a worker, restart it when its configuration changed, ignore
    /// byte-identical descriptors.
    async fn start_or_update_camera(self: &Arc<Self>, descriptor: CameraDescriptor) {
        let key = descriptor.identity().key();
        let mut should_refresh = false;

        {
            let mut tables = self.tables.lock().await;

            if let Some(existing) = tables.workers.get(&key) {
                if existing.descriptor == descriptor {
                    tracing::info!(key = %key, "camera already running with same config, ignoring");
                    return;
                }
                tracing::info!(key = %key, "camera config changed, restarting worker");
                existing.cancel.cancel();
                tables.workers.remove(&key);
                should_refresh = true;
            }

            let driver = match self.registry.get(&descriptor, self.store.clone()) {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "no driver for camera");
                    drop(tables);
                    self.schedule_media_refresh();
                    return;
                }
            };

            let cancel = CancellationToken::new();
            let (event_tx, event_rx) = mpsc::channel::<AnalyticEvent>(EVENT_CHANNEL_CAPACITY);
            let analytics = match driver.active_analytics() {
                Some(active) if !active.is_empty() => active,
                _ => descriptor.analytics.clone(),
            };

            let record = WorkerRecord::new(descriptor.clone(), cancel.clone(), analytics);
            tables.workers.insert(key.clone(), record);
            should_refresh = true;

            let status_self = self.clone();
            let status_key = key.clone();
            driver.set_status_handler(Arc::new(move |update| {
                let supervisor = status_self.clone();
                let key = status_key.clone();
                tokio::spawn(async move {
                    supervisor.update_worker_status(&key, update).await;
                });
            }));

            tracing::info!(
                key = %key,
                manufacturer = %descriptor.manufacturer,
                model = %descriptor.model,
                shard = %descriptor.shard,
                "starting camera worker"
            );

            // Task A: drive the device. Dropping event_tx on return closes
            // the channel and ends Task B.
            let driver_self = self.clone();
            let driver_key = key.clone();
            let driver_cancel = cancel.clone();
            tokio::spawn(async move {
                match driver.run(driver_cancel.clone(), event_tx).await {
                    Ok(()) => tracing::info!(key = %driver_key, "driver ended gracefully"),
                    Err(e) => {
                        tracing::warn!(key = %driver_key, error = %e, "driver ended with error")
                    }
                }
                // A cancelled token means the record was already replaced or
                // removed; only a self-terminated driver reports offline.
                if !driver_cancel.is_cancelled() {
                    driver_self
                        .update_worker_status(
                            &driver_key,
                            StatusUpdate {
                                state: ConnectionState::Offline,
                                reason: "event stream ended".to_string(),
                            },
                        )
                        .await;
                }
                driver_cancel.cancel();
            });

            // Task B: fan events out to the bus and the engine pipeline.
            let fanout_self = self.clone();
            let fanout_key = key.clone();
            let fanout_descriptor = descriptor.clone();
            tokio::spawn(async move {
                fanout_self
                    .run_event_fanout(fanout_key, fanout_descriptor, event_rx)
                    .await;
            });
        }

        if should_refresh {
            self.schedule_media_refresh();
        }
    }

    /// Task B body: original event first, then its derivations, in order.
    async fn run_event_fanout(
        self: &Arc<Self>,
        key: String,
        descriptor: CameraDescriptor,
        mut events: mpsc::Receiver<AnalyticEvent>,
    ) {
        while let Some(event) = events.recv().await {
            self.touch_worker(&key).await;

            let stripped = event.stripped();
            let topic = self.event_topic(&descriptor, &stripped.analytic_type);
            match serde_json::to_vec(&stripped) {
                Ok(payload) => {
                    if let Err(e) = self.bus.publish(&topic, 1, false, &payload).await {
                        tracing::warn!(key = %key, topic = %topic, error = %e, "event publish failed");
                    } else {
                        tracing::debug!(
                            key = %key,
                            topic = %topic,
                            event_id = %event.event_id,
                            "event published"
                        );
                    }
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "event marshal failed"),
            }

            if self.engines.is_enabled() {
                let derived = self.engines.process_all(&event).await;
                for derived_event in derived {
                    let out = derived_event.stripped();
                    let out_topic = self.event_topic(&descriptor, &out.analytic_type);
                    match serde_json::to_vec(&out) {
                        Ok(payload) => {
                            if let Err(e) = self.bus.publish(&out_topic, 1, false, &payload).await {
                                tracing::warn!(
                                    key = %key,
                                    topic = %out_topic,
                                    error = %e,
                                    "derived event publish failed"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "derived event marshal failed")
                        }
                    }
                }
            }
        }
        tracing::debug!(key = %key, "event fan-out ended");
    }

    /// Tombstone/disable path: cancel the worker, forget the camera, stop its
    /// uplinks, reconcile the media config.
    async fn cleanup_camera(self: &Arc<Self>, descriptor: &CameraDescriptor) {
        let key = descriptor.identity().key();
        let stored = {
            let mut tables = self.tables.lock().await;
            if let Some(worker) = tables.workers.remove(&key) {
                tracing::info!(key = %key, "stopping camera worker");
                worker.cancel.cancel();
            }
            tables.cameras.remove(&key)
        };

        if let Some(uplink) = &self.uplink {
            // The stored descriptor carries the real uplink paths; the
            // tombstone payload only has the identity.
            let target = stored.as_ref().unwrap_or(descriptor);
            uplink.stop_by_camera(target).await;
        }
        self.schedule_media_refresh();
    }

    async fn touch_worker(&self, key: &str) {
        let mut tables = self.tables.lock().await;
        if let Some(worker) = tables.workers.get_mut(key) {
            let now = Utc::now();
            worker.last_event_at = Some(now);
            if worker.status != ConnectionState::Online {
                worker.status = ConnectionState::Online;
                worker.status_since = now;
                worker.status_reason = String::new();
            }
            worker.ever_connected = true;
        }
    }

    async fn update_worker_status(&self, key: &str, update: StatusUpdate) {
        let mut tables = self.tables.lock().await;
        if let Some(worker) = tables.workers.get_mut(key) {
            worker.status = update.state;
            worker.status_reason = update.reason;
            worker.status_since = Utc::now();
            if update.state == ConnectionState::Online {
                worker.ever_connected = true;
            }
        }
    }

    async fn snapshot_workers(&self) -> Vec<WorkerSnapshot> {
        let tables = self.tables.lock().await;
        tables.workers.values().map(|w| w.snapshot()).collect()
    }

    async fn snapshot_cameras(&self) -> Vec<CameraDescriptor> {
        let tables = self.tables.lock().await;
        tables.cameras.values().cloned().collect()
    }

    fn schedule_media_refresh(self: &Arc<Self>) {
        if self.generators.is_empty() {
            return;
        }
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.refresh_media_config().await;
        });
    }

    async fn refresh_media_config(self: &Arc<Self>) {
        if self.generators.is_empty() {
            return;
        }
        let cameras = self.snapshot_cameras().await;
        for generator in &self.generators {
            if let Err(e) = generator.sync(&cameras).await {
                tracing::warn!(error = %e, "media config sync failed");
            }
        }
    }

    async fn run_status_loop(self: Arc<Self>, cancel: CancellationToken) {
        let hostname = sysinfo::System::host_name().unwrap_or_default();
        let mut system = sysinfo::System::new();
        let pid = sysinfo::get_current_pid().ok();

        tracing::info!(interval_secs = self.status_interval.as_secs(), "status loop started");
        let mut ticker = tokio::time::interval(self.status_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("status loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let (cpu, memory_percent, rss) = sample_process_metrics(&mut system, pid);
                    self.publish_statuses(&hostname, cpu, memory_percent, rss).await;
                }
            }
        }
    }

    /// One status cycle: per-camera status plus one collector status per
    /// (tenant, building).
    pub async fn publish_statuses(
        self: &Arc<Self>,
        hostname: &str,
        cpu_percent: f64,
        memory_percent: f64,
        memory_rss_bytes: u64,
    ) {
        let workers = self.snapshot_workers().await;
        if workers.is_empty() {
            return;
        }

        let mut buildings: HashMap<(String, String), usize> = HashMap::new();
        for snapshot in &workers {
            *buildings
                .entry((
                    snapshot.descriptor.tenant.clone(),
                    snapshot.descriptor.building.clone(),
                ))
                .or_insert(0) += 1;

            if let Err(e) = self.publish_camera_status(snapshot).await {
                tracing::warn!(
                    device_id = %snapshot.descriptor.device_id,
                    error = %e,
                    "camera status publish failed"
                );
            }
        }

        for ((tenant, building), camera_count) in buildings {
            if let Err(e) = self
                .publish_collector_status(
                    &tenant,
                    &building,
                    hostname,
                    camera_count,
                    cpu_percent,
                    memory_percent,
                    memory_rss_bytes,
                )
                .await
            {
                tracing::warn!(
                    tenant = %tenant,
                    building = %building,
                    error = %e,
                    "collector status publish failed"
                );
            }
        }
    }

    async fn publish_camera_status(&self, snapshot: &WorkerSnapshot) -> Result<()> {
        let descriptor = &snapshot.descriptor;
        let mut payload = serde_json::json!({
            "tenant": descriptor.tenant,
            "building": descriptor.building,
            "floor": descriptor.floor,
            "device_type": descriptor.device_type,
            "device_id": descriptor.device_id,
            "status": snapshot.status.as_str(),
            "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        });
        let object = payload.as_object_mut().expect("status payload is an object");
        if let Some(last_event_at) = snapshot.last_event_at {
            object.insert(
                "last_event_at".to_string(),
                last_event_at
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                    .into(),
            );
        }
        if !descriptor.shard.is_empty() {
            object.insert("shard".to_string(), descriptor.shard.clone().into());
        }
        object.insert(
            "status_since".to_string(),
            snapshot
                .status_since
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                .into(),
        );
        if !snapshot.status_reason.is_empty() {
            object.insert(
                "status_reason".to_string(),
                snapshot.status_reason.clone().into(),
            );
        }
        if !descriptor.analytics.is_empty() {
            object.insert(
                "analytics_configured".to_string(),
                descriptor.analytics.clone().into(),
            );
        }
        if !snapshot.analytics.is_empty() {
            object.insert(
                "analytics_active".to_string(),
                snapshot.analytics.clone().into(),
            );
        }
        if snapshot.ever_connected {
            object.insert("ever_connected".to_string(), true.into());
        }

        let topic = self.camera_status_topic(descriptor);
        self.bus
            .publish(&topic, 1, true, &serde_json::to_vec(&payload)?)
            .await
            .map_err(|e| Error::Bus(format!("publish camera status to {}: {}", topic, e)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_collector_status(
        &self,
        tenant: &str,
        building: &str,
        hostname: &str,
        cameras: usize,
        cpu_percent: f64,
        memory_percent: f64,
        memory_rss_bytes: u64,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "collector": "cam-bus",
            "status": "online",
            "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "hostname": hostname,
            "shard": self.shard,
            "cameras": cameras,
            "cpu_percent": cpu_percent,
            "memory_percent": memory_percent,
            "memory_rss_bytes": memory_rss_bytes,
        });

        let topic = self.collector_status_topic(tenant, building);
        self.bus
            .publish(&topic, 1, true, &serde_json::to_vec(&payload)?)
            .await
            .map_err(|e| Error::Bus(format!("publish collector status to {}: {}", topic, e)))
    }

    fn event_topic(&self, descriptor: &CameraDescriptor, analytic_type: &str) -> String {
        let analytic = analytic_type.trim();
        let analytic = if analytic.is_empty() { "unknown" } else { analytic };
        format!(
            "{}/{}/{}/{}/{}/{}/{}/events",
            self.base_topic,
            descriptor.tenant,
            descriptor.building,
            descriptor.floor,
            descriptor.device_type,
            descriptor.device_id,
            analytic
        )
    }

    fn camera_status_topic(&self, descriptor: &CameraDescriptor) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}/status",
            self.base_topic,
            descriptor.tenant,
            descriptor.building,
            descriptor.floor,
            descriptor.device_type,
            descriptor.device_id
        )
    }

    fn collector_status_topic(&self, tenant: &str, building: &str) -> String {
        format!("{}/{}/{}/collector/status", self.base_topic, tenant, building)
    }

    fn uplink_status_topic(&self, descriptor: &CameraDescriptor) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}/uplink/status",
            self.base_topic,
            descriptor.tenant,
            descriptor.building,
            descriptor.floor,
            descriptor.device_type,
            descriptor.device_id
        )
    }

    /// Worker-table size (status/debug)
    pub async fn worker_count(&self) -> usize {
        self.tables.lock().await.workers.len()
    }
}

fn trim_payload(payload: &[u8]) -> &[u8] {
    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &payload[start..end]
}

fn sample_process_metrics(
    system: &mut sysinfo::System,
    pid: Option<sysinfo::Pid>,
) -> (f64, f64, u64) {
    let Some(pid) = pid else {
        return (0.0, 0.0, 0);
    };
    system.refresh_memory();
    system.refresh_process(pid);
    let total_memory = system.total_memory();
    match system.process(pid) {
        Some(process) => {
            let rss = process.memory();
            let memory_percent = if total_memory > 0 {
                rss as f64 / total_memory as f64 * 100.0
            } else {
                0.0
            };
            (process.cpu_usage() as f64, memory_percent, rss)
        }
        None => (0.0, 0.0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{CameraDriver, StatusHandler};
    use crate::engines::Engine;
    use crate::error::Result as CrateResult;
    use crate::mqtt::MessageHandler;
    use crate::uplink::launcher::{LaunchRequest, Launcher, ProcessStatus};
    use crate::uplink::UplinkConfig;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockBus {
        published: StdMutex<Vec<(String, bool, Vec<u8>)>>,
    }

    impl MockBus {
        fn topics(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(t, _, _)| t.clone())
                .collect()
        }

        fn payload_for(&self, topic_suffix: &str) -> Option<Vec<u8>> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .find(|(t, _, _)| t.ends_with(topic_suffix))
                .map(|(_, _, p)| p.clone())
        }
    }

    #[async_trait]
    impl EventBus for MockBus {
        async fn publish(
            &self,
            topic: &str,
            _qos: u8,
            retained: bool,
            payload: &[u8],
        ) -> CrateResult<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), retained, payload.to_vec()));
            Ok(())
        }

        async fn subscribe(
            &self,
            _filter: &str,
            _qos: u8,
            _handler: MessageHandler,
        ) -> CrateResult<()> {
            Ok(())
        }
    }

    /// Driver emitting fixed events, then waiting for cancellation
    struct ScriptedDriver {
        events: Vec<AnalyticEvent>,
    }

    #[async_trait]
    impl CameraDriver for ScriptedDriver {
        async fn run(
            &self,
            cancel: CancellationToken,
            events: mpsc::Sender<AnalyticEvent>,
        ) -> CrateResult<()> {
            for event in &self.events {
                if events.send(event.clone()).await.is_err() {
                    return Ok(());
                }
            }
            cancel.cancelled().await;
            Ok(())
        }

        fn set_status_handler(&self, _handler: StatusHandler) {}
    }

    struct DerivingEngine;

    #[async_trait]
    impl Engine for DerivingEngine {
        fn name(&self) -> &str {
            "deriver"
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn process(&self, event: AnalyticEvent) -> CrateResult<Vec<AnalyticEvent>> {
            if event.analytic_type != "faceCapture" {
                return Ok(Vec::new());
            }
            let mut derived = event.clone();
            derived.analytic_type = "faceRecognized".to_string();
            Ok(vec![derived])
        }
    }

    #[derive(Default)]
    struct CountingLauncher {
        starts: StdMutex<usize>,
        stops: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Launcher for CountingLauncher {
        async fn start(&self, _request: &LaunchRequest) -> CrateResult<String> {
            *self.starts.lock().unwrap() += 1;
            Ok("pid-1".to_string())
        }
        async fn stop(&self, name: &str) -> CrateResult<()> {
            self.stops.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn inspect(&self, _name: &str) -> CrateResult<ProcessStatus> {
            Ok(ProcessStatus {
                state: "running".to_string(),
                exit_code: 0,
                error: String::new(),
            })
        }
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        bus: Arc<MockBus>,
        launcher: Arc<CountingLauncher>,
        driver_builds: Arc<StdMutex<usize>>,
    }

    fn fixture_with_engines(engines: Vec<Arc<dyn Engine>>) -> Fixture {
        let bus = Arc::new(MockBus::default());
        let launcher = Arc::new(CountingLauncher::default());
        let uplink = UplinkManager::new(
            UplinkConfig {
                mode: "container".to_string(),
                central_host: "central.local".to_string(),
                central_srt_port: 8890,
                proxy_rtsp_base: "rtsp://localhost:8554".to_string(),
                always_on: false,
                always_on_paths: Vec::new(),
                ignore: false,
                reconcile_interval: Duration::from_secs(15),
                srt: Default::default(),
            },
            launcher.clone(),
        );

        let driver_builds = Arc::new(StdMutex::new(0));
        let builds = driver_builds.clone();
        let mut registry = DriverRegistry::new();
        registry.register(
            "vendorx",
            "any",
            Arc::new(move |descriptor, _store| {
                *builds.lock().unwrap() += 1;
                let event = {
                    let mut event = AnalyticEvent::for_camera(descriptor, "faceCapture");
                    event.event_id = "ev-1".to_string();
                    event.snapshot_b64 = "c2VjcmV0".to_string();
                    event
                };
                Ok(Arc::new(ScriptedDriver {
                    events: vec![event],
                }) as Arc<dyn CameraDriver>)
            }),
        );

        let config = AppConfig {
            base_topic: "security-vision/cameras".to_string(),
            shard: String::new(),
            status_interval: Duration::from_secs(30),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_client_id: "test".to_string(),
        };

        let supervisor = Supervisor::new(
            bus.clone(),
            &config,
            Arc::new(EngineManager::new(engines, Duration::from_secs(1))),
            Some(uplink),
            Arc::new(registry),
            None,
            Vec::new(),
        );

        Fixture {
            supervisor,
            bus,
            launcher,
            driver_builds,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_engines(vec![Arc::new(DerivingEngine)])
    }

    const INFO_TOPIC: &str = "security-vision/cameras/acme/hq/1/ipcam/cam-001/info";

    fn descriptor_payload() -> Vec<u8> {
        serde_json::json!({
            "manufacturer": "vendorX",
            "model": "any",
            "ip": "10.0.0.10",
            "username": "u",
            "password": "p",
            "enabled": true,
            "analytics": ["faceCapture"],
            "proxy_path": "cam-001",
        })
        .to_string()
        .into_bytes()
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_descriptor_creates_one_worker() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;
        assert_eq!(f.supervisor.worker_count().await, 1);
        assert_eq!(*f.driver_builds.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_identical_descriptor_ignored() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;
        assert_eq!(f.supervisor.worker_count().await, 1);
        assert_eq!(*f.driver_builds.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_changed_descriptor_restarts_worker() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;

        let mut changed: serde_json::Value =
            serde_json::from_slice(&descriptor_payload()).unwrap();
        changed["ip"] = "10.0.0.99".into();
        f.supervisor
            .handle_info(INFO_TOPIC, changed.to_string().as_bytes())
            .await;

        assert_eq!(f.supervisor.worker_count().await, 1);
        assert_eq!(*f.driver_builds.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tombstone_removes_worker() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;
        assert_eq!(f.supervisor.worker_count().await, 1);

        f.supervisor.handle_info(INFO_TOPIC, b"").await;
        assert_eq!(f.supervisor.worker_count().await, 0);

        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;
        f.supervisor.handle_info(INFO_TOPIC, b"null").await;
        assert_eq!(f.supervisor.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_descriptor_acts_as_tombstone() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;

        let mut disabled: serde_json::Value =
            serde_json::from_slice(&descriptor_payload()).unwrap();
        disabled["enabled"] = false.into();
        f.supervisor
            .handle_info(INFO_TOPIC, disabled.to_string().as_bytes())
            .await;
        assert_eq!(f.supervisor.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_json_dropped() {
        let f = fixture();
        f.supervisor.handle_info(INFO_TOPIC, b"{not json").await;
        assert_eq!(f.supervisor.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_event_fanout_order_and_stripping() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;

        let bus = f.bus.clone();
        wait_for(|| {
            bus.topics()
                .iter()
                .any(|t| t.ends_with("/faceRecognized/events"))
        })
        .await;

        let topics = f.bus.topics();
        let original = topics
            .iter()
            .position(|t| t.ends_with("/faceCapture/events"))
            .unwrap();
        let derived = topics
            .iter()
            .position(|t| t.ends_with("/faceRecognized/events"))
            .unwrap();
        assert!(original < derived, "original must publish before derivation");

        // P10: no published payload carries the snapshot base64.
        let payload = f.bus.payload_for("/faceCapture/events").unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(!text.contains("SnapshotB64"));
        assert!(text.contains("\"Tenant\":\"acme\""));

        let derived_payload = f.bus.payload_for("/faceRecognized/events").unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&derived_payload).unwrap();
        assert_eq!(parsed["Tenant"], "acme");
        assert_eq!(parsed["DeviceID"], "cam-001");
    }

    #[tokio::test]
    async fn test_descriptor_with_central_host_starts_uplink() {
        let f = fixture();
        let mut payload: serde_json::Value = serde_json::from_slice(&descriptor_payload()).unwrap();
        payload["central_host"] = "central.local".into();
        payload["central_srt_port"] = 8890.into();
        f.supervisor
            .handle_info(INFO_TOPIC, payload.to_string().as_bytes())
            .await;
        assert_eq!(*f.launcher.starts.lock().unwrap(), 1);

        // Tombstone stops the uplink again.
        f.supervisor.handle_info(INFO_TOPIC, b"").await;
        assert_eq!(f.launcher.stops.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uplink_control_messages() {
        let f = fixture();
        let start_topic = "security-vision/cameras/acme/hq/1/ipcam/cam-001/uplink/start";
        let request = serde_json::json!({
            "cameraId": "cam-001",
            "centralHost": "c",
            "centralSrtPort": 8890,
            "centralPath": "acme/hq/cam-001",
        });
        f.supervisor
            .handle_uplink_message(start_topic, request.to_string().as_bytes())
            .await;
        f.supervisor
            .handle_uplink_message(start_topic, request.to_string().as_bytes())
            .await;
        assert_eq!(*f.launcher.starts.lock().unwrap(), 1);

        let stop_topic = "security-vision/cameras/acme/hq/1/ipcam/cam-001/uplink/stop";
        f.supervisor
            .handle_uplink_message(stop_topic, request.to_string().as_bytes())
            .await;
        assert!(f.launcher.stops.lock().unwrap().is_empty());
        f.supervisor
            .handle_uplink_message(stop_topic, request.to_string().as_bytes())
            .await;
        assert_eq!(f.launcher.stops.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uplink_start_defaults_central_path_from_topic() {
        let f = fixture();
        let start_topic = "security-vision/cameras/acme/hq/1/ipcam/cam-009/uplink/start";
        let request = serde_json::json!({"cameraId": "cam-009", "centralHost": "c"});
        f.supervisor
            .handle_uplink_message(start_topic, request.to_string().as_bytes())
            .await;
        assert_eq!(*f.launcher.starts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_publishing() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;

        f.supervisor
            .publish_statuses("host-1", 12.5, 3.2, 1024)
            .await;

        let status_payload = f.bus.payload_for("/cam-001/status").unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&status_payload).unwrap();
        assert_eq!(parsed["tenant"], "acme");
        assert_eq!(parsed["device_id"], "cam-001");
        assert!(parsed["status"].is_string());

        let collector = f.bus.payload_for("collector/status").unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&collector).unwrap();
        assert_eq!(parsed["collector"], "cam-bus");
        assert_eq!(parsed["cameras"], 1);
        assert_eq!(parsed["hostname"], "host-1");

        // Both statuses are retained.
        let retained: Vec<bool> = f
            .bus
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t.ends_with("/status"))
            .map(|(_, r, _)| *r)
            .collect();
        assert!(retained.iter().all(|r| *r));
    }

    #[tokio::test]
    async fn test_uplink_status_republished_for_known_camera() {
        let f = fixture();
        f.supervisor
            .handle_info(INFO_TOPIC, &descriptor_payload())
            .await;

        f.supervisor
            .handle_uplink_status(UplinkStatus {
                camera_id: "cam-001".to_string(),
                central_path: "acme/hq/cam-001".to_string(),
                container_name: "cam-bus-uplink-acme-hq-cam-001".to_string(),
                state: "exited".to_string(),
                exit_code: 1,
                error: "boom".to_string(),
                timestamp: Utc::now(),
            })
            .await;

        let payload = f.bus.payload_for("/uplink/status").unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["state"], "exited");
        assert_eq!(parsed["exitCode"], 1);
        assert_eq!(parsed["error"], "boom");
    }

    #[tokio::test]
    async fn test_unknown_driver_keeps_camera_without_worker() {
        let f = fixture();
        let payload = serde_json::json!({
            "manufacturer": "unknownVendor",
            "model": "x",
            "ip": "10.0.0.10",
            "enabled": true,
        });
        f.supervisor
            .handle_info(INFO_TOPIC, payload.to_string().as_bytes())
            .await;
        assert_eq!(f.supervisor.worker_count().await, 0);
        // The camera stays known for media-config purposes.
        assert_eq!(f.supervisor.snapshot_cameras().await.len(), 1);
    }
}
