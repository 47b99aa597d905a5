//! Uplink manager
//!
//! ## Responsibilities
//!
//! - Keep exactly one external republisher per stream alive while anyone
//!   wants it: ref-counted Start/Stop keyed by `centralPath` (falling back to
//!   `cameraId`), payload-identical Starts coalesce, changed payloads restart
//!   the process
//! - TTL: a single-shot timer force-stops the entry when no Start refreshed
//!   it in time
//! - Reconciliation: periodically inspect every known process and reap the
//!   ones that died behind our back, emitting their observed state
//! - Always-on mode (global or per-path): stops become no-ops
//! - Ignore mode: another system owns the republishers, the manager is a pure
//!   status observer
//!
//! The status hook is always invoked outside the manager mutex.

pub mod launcher;
pub mod srt;

use crate::error::{Error, Result};
use crate::state::{env_bool, env_duration_secs, env_string, env_u16};
use chrono::{DateTime, Utc};
use launcher::{
    container_name_for_central_path, ContainerLauncher, LaunchRequest, Launcher, MediamtxLauncher,
};
use serde::{Deserialize, Serialize};
use srt::{build_srt_url_candidates, SrtSettings, DEFAULT_SRT_PORT};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Uplink request from the control topic or the supervisor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UplinkRequest {
    pub camera_id: String,
    pub proxy_path: String,
    pub central_host: String,
    pub central_srt_port: u16,
    pub central_path: String,
    pub ttl_seconds: i64,
}

impl UplinkRequest {
    pub fn normalize(&mut self) {
        self.camera_id = self.camera_id.trim().to_string();
        self.proxy_path = self.proxy_path.trim().to_string();
        self.central_host = self.central_host.trim().to_string();
        self.central_path = self.central_path.trim().to_string();
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera_id.is_empty() {
            return Err(Error::UplinkInvalid("cameraId required".to_string()));
        }
        Ok(())
    }

    /// Entry key: centralPath when set, else cameraId
    pub fn key(&self) -> String {
        let central = self.central_path.trim().trim_matches('/');
        if central.is_empty() {
            self.camera_id.clone()
        } else {
            central.to_string()
        }
    }
}

/// Payload equality for coalescing (TTL refreshes are not payload changes)
fn same_payload(a: &UplinkRequest, b: &UplinkRequest) -> bool {
    a.camera_id == b.camera_id
        && a.proxy_path == b.proxy_path
        && a.central_host == b.central_host
        && normalize_port(a.central_srt_port) == normalize_port(b.central_srt_port)
        && a.central_path == b.central_path
}

fn normalize_port(port: u16) -> u16 {
    if port == 0 {
        DEFAULT_SRT_PORT
    } else {
        port
    }
}

/// Status update emitted through the hook
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkStatus {
    pub camera_id: String,
    pub central_path: String,
    pub container_name: String,
    pub state: String,
    pub exit_code: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Hook receiving status updates (invoked without the manager mutex held)
pub type StatusHook = Arc<dyn Fn(UplinkStatus) + Send + Sync>;

struct UplinkProcess {
    request: UplinkRequest,
    container_name: String,
    process_id: String,
    state: String,
    start_count: u64,
    stop_count: u64,
    always_on: bool,
    ttl_timer: Option<JoinHandle<()>>,
}

impl UplinkProcess {
    fn abort_ttl(&mut self) {
        if let Some(timer) = self.ttl_timer.take() {
            timer.abort();
        }
    }
}

/// Environment-derived uplink settings
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// container | mediamtx | central-pull
    pub mode: String,
    pub central_host: String,
    pub central_srt_port: u16,
    pub proxy_rtsp_base: String,
    pub always_on: bool,
    pub always_on_paths: Vec<String>,
    pub ignore: bool,
    pub reconcile_interval: Duration,
    pub srt: SrtSettings,
}

impl UplinkConfig {
    pub fn from_env() -> Self {
        let mode = env_string("UPLINK_MODE", "container").trim().to_lowercase();
        let ignore = env_bool("IGNORE_UPLINK", false) || mode == "central-pull";
        Self {
            mode,
            central_host: env_string("UPLINK_CENTRAL_HOST", ""),
            central_srt_port: env_u16("UPLINK_CENTRAL_SRT_PORT", DEFAULT_SRT_PORT),
            proxy_rtsp_base: env_string("UPLINK_PROXY_RTSP_BASE", "rtsp://localhost:8554")
                .trim_end_matches('/')
                .to_string(),
            always_on: env_bool("UPLINK_ALWAYS_ON", false),
            always_on_paths: env_string("UPLINK_ALWAYS_ON_PATHS", "")
                .split(',')
                .map(|s| s.trim().trim_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            ignore,
            reconcile_interval: env_duration_secs("UPLINK_RECONCILE_INTERVAL_SECONDS", 15),
            srt: SrtSettings::from_env(),
        }
    }
}

/// Reference-counted supervisor of republisher processes
pub struct UplinkManager {
    config: UplinkConfig,
    launcher: Arc<dyn Launcher>,
    uplinks: Mutex<HashMap<String, UplinkProcess>>,
    status_hook: std::sync::Mutex<Option<StatusHook>>,
}

impl UplinkManager {
    pub fn new(config: UplinkConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            uplinks: Mutex::new(HashMap::new()),
            status_hook: std::sync::Mutex::new(None),
        })
    }

    /// Manager with the launcher implied by `UPLINK_MODE`
    pub fn from_env() -> Arc<Self> {
        let config = UplinkConfig::from_env();
        let launcher: Arc<dyn Launcher> = match config.mode.as_str() {
            "mediamtx" | "central-pull" => Arc::new(MediamtxLauncher),
            _ => Arc::new(ContainerLauncher::from_env()),
        };
        tracing::info!(
            mode = %config.mode,
            ignore = config.ignore,
            always_on = config.always_on,
            "uplink manager configured"
        );
        Self::new(config, launcher)
    }

    pub fn set_status_hook(&self, hook: StatusHook) {
        if let Ok(mut guard) = self.status_hook.lock() {
            *guard = Some(hook);
        }
    }

    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    fn emit_status(&self, status: UplinkStatus) {
        let hook = self.status_hook.lock().ok().and_then(|g| g.clone());
        if let Some(hook) = hook {
            hook(status);
        }
    }

    fn status_for(&self, process: &UplinkProcess, state: &str, error: &str) -> UplinkStatus {
        UplinkStatus {
            camera_id: process.request.camera_id.clone(),
            central_path: process.request.central_path.clone(),
            container_name: process.container_name.clone(),
            state: state.to_string(),
            exit_code: 0,
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn always_on_for(&self, central_path: &str) -> bool {
        if self.config.always_on {
            return true;
        }
        let normalized = central_path.trim().trim_matches('/');
        self.config
            .always_on_paths
            .iter()
            .any(|p| p == normalized)
    }

    /// Ensure a republisher for `request` is running, ref-counting repeats.
    pub async fn start(self: &Arc<Self>, mut request: UplinkRequest) -> Result<()> {
        if self.config.ignore {
            tracing::debug!(camera_id = %request.camera_id, "ignore mode, start is a no-op");
            return Ok(());
        }

        request.normalize();
        if request.proxy_path.is_empty() {
            request.proxy_path = request.camera_id.clone();
        }
        if request.central_path.is_empty() {
            request.central_path = request.proxy_path.trim_matches('/').to_string();
        }
        if request.central_host.is_empty() {
            request.central_host = self.config.central_host.clone();
        }
        if request.central_srt_port == 0 {
            request.central_srt_port = self.config.central_srt_port;
        }

        request.validate()?;
        if request.proxy_path.is_empty() {
            return Err(Error::UplinkInvalid("proxyPath required".to_string()));
        }
        if request.central_host.is_empty() {
            return Err(Error::UplinkInvalid("centralHost required".to_string()));
        }
        if request.central_path.is_empty() {
            return Err(Error::UplinkInvalid("centralPath required".to_string()));
        }

        let key = request.key();
        let mut emissions: Vec<UplinkStatus> = Vec::new();
        let result = {
            let mut uplinks = self.uplinks.lock().await;

            let coalesced = match uplinks.get_mut(&key) {
                Some(existing) if same_payload(&existing.request, &request) => {
                    existing.start_count += 1;
                    tracing::info!(
                        key = %key,
                        start_count = existing.start_count,
                        "uplink already running, refreshing TTL"
                    );
                    let ttl = request.ttl_seconds;
                    existing.request.ttl_seconds = ttl;
                    self.schedule_ttl(existing, &key, ttl);
                    true
                }
                _ => false,
            };
            if coalesced {
                return Ok(());
            }

            if let Some(mut old) = uplinks.remove(&key) {
                tracing::info!(key = %key, "uplink payload changed, restarting");
                old.abort_ttl();
                if let Err(e) = self.launcher.stop(&old.container_name).await {
                    tracing::warn!(key = %key, error = %e, "stop before restart failed");
                }
                emissions.push(self.status_for(&old, "stopped", "restarting with new payload"));
            }

            let container_name = container_name_for_central_path(&key);
            let proxy_url = format!(
                "{}/{}",
                self.config.proxy_rtsp_base,
                request.proxy_path.trim_start_matches('/')
            );
            let candidates = build_srt_url_candidates(
                &request.central_host,
                request.central_srt_port,
                &request.central_path,
                &self.config.srt,
            );
            let Some(srt_url) = candidates.first().cloned() else {
                return Err(Error::UplinkInvalid(format!(
                    "no usable srt url for host={:?} path={:?}",
                    request.central_host, request.central_path
                )));
            };

            let launch = LaunchRequest {
                name: container_name.clone(),
                proxy_url,
                srt_url: srt_url.clone(),
            };
            match self.launcher.start(&launch).await {
                Ok(process_id) => {
                    let always_on = self.always_on_for(&request.central_path);
                    let mut process = UplinkProcess {
                        request: request.clone(),
                        container_name,
                        process_id,
                        state: "running".to_string(),
                        start_count: 1,
                        stop_count: 0,
                        always_on,
                        ttl_timer: None,
                    };
                    let ttl = request.ttl_seconds;
                    self.schedule_ttl(&mut process, &key, ttl);
                    emissions.push(self.status_for(&process, "running", ""));
                    tracing::info!(
                        key = %key,
                        process_id = %process.process_id,
                        srt_url = %srt_url,
                        "uplink started"
                    );
                    uplinks.insert(key.clone(), process);
                    Ok(())
                }
                Err(e) => {
                    let status = UplinkStatus {
                        camera_id: request.camera_id.clone(),
                        central_path: request.central_path.clone(),
                        container_name: launch.name.clone(),
                        state: "error".to_string(),
                        exit_code: 0,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    };
                    emissions.push(status);
                    Err(e)
                }
            }
        };

        for status in emissions {
            self.emit_status(status);
        }
        result
    }

    /// Decrement the reference count; terminate when it reaches zero.
    pub async fn stop(self: &Arc<Self>, mut request: UplinkRequest) -> Result<()> {
        if self.config.ignore {
            tracing::debug!(camera_id = %request.camera_id, "ignore mode, stop is a no-op");
            return Ok(());
        }
        request.normalize();
        if request.central_path.is_empty() {
            request.central_path = request.proxy_path.trim_matches('/').to_string();
        }
        let key = request.key();
        self.stop_key(&key, "stop command", false).await
    }

    /// Force-stop every entry bound to this camera. Candidate keys:
    /// centralPath, proxyPath, deviceId.
    pub async fn stop_by_camera(self: &Arc<Self>, descriptor: &crate::model::CameraDescriptor) {
        if self.config.ignore {
            return;
        }
        let mut keys: Vec<String> = Vec::new();
        for candidate in [
            descriptor.central_path.trim().trim_matches('/'),
            descriptor.proxy_path.trim().trim_matches('/'),
            descriptor.device_id.trim(),
        ] {
            if !candidate.is_empty() && !keys.iter().any(|k| k == candidate) {
                keys.push(candidate.to_string());
            }
        }
        for key in keys {
            match self.stop_key(&key, "camera removed", true).await {
                Ok(()) => {}
                Err(Error::UplinkInvalid(_)) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "stop by camera failed")
                }
            }
        }
    }

    /// Stop everything (shutdown path). Always-on entries stop too.
    pub async fn stop_all(self: &Arc<Self>) {
        if self.config.ignore {
            return;
        }
        let keys: Vec<String> = {
            let uplinks = self.uplinks.lock().await;
            uplinks.keys().cloned().collect()
        };
        for key in keys {
            if let Err(e) = self.force_stop_key(&key, "shutdown").await {
                tracing::warn!(key = %key, error = %e, "shutdown stop failed");
            }
        }
    }

    async fn stop_key(self: &Arc<Self>, key: &str, reason: &str, force: bool) -> Result<()> {
        let mut emission: Option<UplinkStatus> = None;
        let result = {
            let mut uplinks = self.uplinks.lock().await;

            let keep_alive = match uplinks.get_mut(key) {
                None => {
                    return Err(Error::UplinkInvalid(format!("uplink {} not running", key)));
                }
                Some(process) if process.always_on && !force => {
                    tracing::debug!(key = %key, "always-on uplink, stop is a no-op");
                    true
                }
                Some(process) if !force => {
                    // Clamp: replayed stops must not underflow future starts.
                    if process.stop_count < process.start_count {
                        process.stop_count += 1;
                    }
                    if process.stop_count < process.start_count {
                        tracing::info!(
                            key = %key,
                            start_count = process.start_count,
                            stop_count = process.stop_count,
                            "uplink has outstanding starters, keeping alive"
                        );
                        true
                    } else {
                        false
                    }
                }
                Some(_) => false,
            };
            if keep_alive {
                return Ok(());
            }

            let mut process = uplinks.remove(key).expect("entry exists");
            process.abort_ttl();
            tracing::info!(key = %key, reason = %reason, "stopping uplink");
            let stop_result = self.launcher.stop(&process.container_name).await;
            emission = Some(self.status_for(&process, "stopped", reason));
            stop_result
        };

        if let Some(status) = emission {
            self.emit_status(status);
        }
        result
    }

    async fn force_stop_key(self: &Arc<Self>, key: &str, reason: &str) -> Result<()> {
        match self.stop_key(key, reason, true).await {
            Err(Error::UplinkInvalid(_)) => Ok(()),
            other => other,
        }
    }

    /// Arm (or re-arm) the single-shot TTL timer. Non-positive TTL and
    /// always-on entries run without one.
    fn schedule_ttl(self: &Arc<Self>, process: &mut UplinkProcess, key: &str, ttl_seconds: i64) {
        process.abort_ttl();
        if ttl_seconds <= 0 || process.always_on {
            return;
        }
        let manager = self.clone();
        let key = key.to_string();
        process.ttl_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ttl_seconds as u64)).await;
            if let Err(e) = manager.stop_key(&key, "ttl expired", true).await {
                tracing::debug!(key = %key, error = %e, "ttl stop skipped");
            }
        }));
    }

    /// Reconcile loop: inspect every entry, publish the observed state and
    /// reap entries whose process is no longer running.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.reconcile_interval.is_zero() {
            tracing::info!("uplink reconcile disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("uplink reconcile loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
            }
        }
    }

    /// One reconcile pass (factored out for the loop and for tests)
    pub async fn reconcile_once(self: &Arc<Self>) {
        let entries: Vec<(String, String, UplinkRequest)> = {
            let uplinks = self.uplinks.lock().await;
            uplinks
                .iter()
                .map(|(key, p)| (key.clone(), p.container_name.clone(), p.request.clone()))
                .collect()
        };

        for (key, container_name, request) in entries {
            let observed = match self.launcher.inspect(&container_name).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "uplink inspect failed");
                    launcher::ProcessStatus {
                        state: "unknown".to_string(),
                        exit_code: 0,
                        error: e.to_string(),
                    }
                }
            };

            self.emit_status(UplinkStatus {
                camera_id: request.camera_id.clone(),
                central_path: request.central_path.clone(),
                container_name: container_name.clone(),
                state: observed.state.clone(),
                exit_code: observed.exit_code,
                error: observed.error.clone(),
                timestamp: Utc::now(),
            });

            let mut uplinks = self.uplinks.lock().await;
            if observed.state == "running" {
                if let Some(process) = uplinks.get_mut(&key) {
                    process.state = observed.state;
                }
                continue;
            }
            tracing::warn!(
                key = %key,
                state = %observed.state,
                exit_code = observed.exit_code,
                "uplink process not running, reaping"
            );
            if let Some(process) = uplinks.get_mut(&key) {
                if process.container_name == container_name {
                    process.abort_ttl();
                    uplinks.remove(&key);
                }
            }
        }
    }

    /// Snapshot of running entry keys (status/debug)
    pub async fn active_keys(&self) -> Vec<String> {
        let uplinks = self.uplinks.lock().await;
        uplinks.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockState {
        starts: Vec<LaunchRequest>,
        stops: Vec<String>,
        inspect_result: Option<launcher::ProcessStatus>,
    }

    #[derive(Default)]
    struct MockLauncher {
        state: StdMutex<MockState>,
    }

    #[async_trait::async_trait]
    impl Launcher for MockLauncher {
        async fn start(&self, request: &LaunchRequest) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.starts.push(request.clone());
            Ok(format!("pid-{}", state.starts.len()))
        }

        async fn stop(&self, name: &str) -> Result<()> {
            self.state.lock().unwrap().stops.push(name.to_string());
            Ok(())
        }

        async fn inspect(&self, _name: &str) -> Result<launcher::ProcessStatus> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .inspect_result
                .clone()
                .unwrap_or(launcher::ProcessStatus {
                    state: "running".to_string(),
                    exit_code: 0,
                    error: String::new(),
                }))
        }
    }

    fn test_config() -> UplinkConfig {
        UplinkConfig {
            mode: "container".to_string(),
            central_host: "central.local".to_string(),
            central_srt_port: 8890,
            proxy_rtsp_base: "rtsp://localhost:8554".to_string(),
            always_on: false,
            always_on_paths: Vec::new(),
            ignore: false,
            reconcile_interval: Duration::from_secs(15),
            srt: SrtSettings::default(),
        }
    }

    fn manager_with_mock() -> (Arc<UplinkManager>, Arc<MockLauncher>) {
        let launcher = Arc::new(MockLauncher::default());
        let manager = UplinkManager::new(test_config(), launcher.clone());
        (manager, launcher)
    }

    fn request() -> UplinkRequest {
        UplinkRequest {
            camera_id: "cam-001".to_string(),
            central_host: "c".to_string(),
            central_srt_port: 8890,
            central_path: "acme/hq/cam-001".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refcount_start_twice_stop_twice() {
        let (manager, launcher) = manager_with_mock();

        manager.start(request()).await.unwrap();
        manager.start(request()).await.unwrap();
        assert_eq!(launcher.state.lock().unwrap().starts.len(), 1);

        manager.stop(request()).await.unwrap();
        assert!(launcher.state.lock().unwrap().stops.is_empty());
        assert_eq!(manager.active_keys().await.len(), 1);

        manager.stop(request()).await.unwrap();
        assert_eq!(launcher.state.lock().unwrap().stops.len(), 1);
        assert!(manager.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_beyond_start_count_clamps() {
        let (manager, _launcher) = manager_with_mock();
        manager.start(request()).await.unwrap();
        manager.stop(request()).await.unwrap();
        // Entry is gone; further stops report not-running.
        assert!(manager.stop(request()).await.is_err());
        // A fresh start works with a clean count.
        manager.start(request()).await.unwrap();
        assert_eq!(manager.active_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_payload_restarts() {
        let (manager, launcher) = manager_with_mock();
        manager.start(request()).await.unwrap();

        let mut changed = request();
        changed.central_host = "other-central".to_string();
        manager.start(changed).await.unwrap();

        let state = launcher.state.lock().unwrap();
        assert_eq!(state.starts.len(), 2);
        assert_eq!(state.stops.len(), 1);
    }

    #[tokio::test]
    async fn test_shared_central_path_coalesces() {
        let (manager, launcher) = manager_with_mock();
        manager.start(request()).await.unwrap();

        let mut second_camera = request();
        second_camera.camera_id = "cam-002".to_string();
        // Same centralPath, different cameraId: payload differs, so the
        // manager restarts the single shared entry rather than adding one.
        manager.start(second_camera).await.unwrap();

        assert_eq!(manager.active_keys().await.len(), 1);
        assert_eq!(launcher.state.lock().unwrap().starts.len(), 2);
    }

    #[tokio::test]
    async fn test_status_hook_running_and_stopped() {
        let (manager, _launcher) = manager_with_mock();
        let seen: Arc<StdMutex<Vec<UplinkStatus>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        manager.set_status_hook(Arc::new(move |status| {
            sink.lock().unwrap().push(status);
        }));

        manager.start(request()).await.unwrap();
        manager.stop(request()).await.unwrap();

        let states: Vec<String> = seen.lock().unwrap().iter().map(|s| s.state.clone()).collect();
        assert_eq!(states, vec!["running", "stopped"]);
    }

    #[tokio::test]
    async fn test_reconcile_reaps_exited_process() {
        let (manager, launcher) = manager_with_mock();
        let seen: Arc<StdMutex<Vec<UplinkStatus>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        manager.set_status_hook(Arc::new(move |status| {
            sink.lock().unwrap().push(status);
        }));

        manager.start(request()).await.unwrap();
        launcher.state.lock().unwrap().inspect_result = Some(launcher::ProcessStatus {
            state: "exited".to_string(),
            exit_code: 1,
            error: "boom".to_string(),
        });

        manager.reconcile_once().await;

        assert!(manager.active_keys().await.is_empty());
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.state, "exited");
        assert_eq!(last.exit_code, 1);
        assert_eq!(last.error, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_stops_entry() {
        let (manager, launcher) = manager_with_mock();
        let mut req = request();
        req.ttl_seconds = 30;
        manager.start(req).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert!(manager.active_keys().await.is_empty());
        assert_eq!(launcher.state.lock().unwrap().stops.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refreshes_ttl() {
        let (manager, _launcher) = manager_with_mock();
        let mut req = request();
        req.ttl_seconds = 30;
        manager.start(req.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        manager.start(req).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;

        // 40s elapsed but the second start re-armed the timer at t=20s.
        assert_eq!(manager.active_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ignore_mode_noops() {
        let launcher = Arc::new(MockLauncher::default());
        let mut config = test_config();
        config.ignore = true;
        let manager = UplinkManager::new(config, launcher.clone());

        manager.start(request()).await.unwrap();
        manager.stop(request()).await.unwrap();
        assert!(launcher.state.lock().unwrap().starts.is_empty());
    }

    #[tokio::test]
    async fn test_always_on_path_ignores_stop() {
        let launcher = Arc::new(MockLauncher::default());
        let mut config = test_config();
        config.always_on_paths = vec!["acme/hq/cam-001".to_string()];
        let manager = UplinkManager::new(config, launcher.clone());

        manager.start(request()).await.unwrap();
        manager.stop(request()).await.unwrap();
        assert!(launcher.state.lock().unwrap().stops.is_empty());
        assert_eq!(manager.active_keys().await.len(), 1);

        // Shutdown still terminates it.
        manager.stop_all().await;
        assert!(manager.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_by_camera_matches_candidate_keys() {
        let (manager, launcher) = manager_with_mock();
        manager.start(request()).await.unwrap();

        let mut descriptor = crate::model::CameraDescriptor {
            device_id: "cam-001".to_string(),
            central_path: "acme/hq/cam-001".to_string(),
            proxy_path: "cam-001".to_string(),
            ..Default::default()
        };
        descriptor.tenant = "acme".to_string();
        manager.stop_by_camera(&descriptor).await;

        assert!(manager.active_keys().await.is_empty());
        assert_eq!(launcher.state.lock().unwrap().stops.len(), 1);
    }

    #[tokio::test]
    async fn test_start_applies_defaults() {
        let (manager, launcher) = manager_with_mock();
        let req = UplinkRequest {
            camera_id: "cam-009".to_string(),
            ..Default::default()
        };
        manager.start(req).await.unwrap();

        let state = launcher.state.lock().unwrap();
        let launch = &state.starts[0];
        assert_eq!(launch.proxy_url, "rtsp://localhost:8554/cam-009");
        assert!(launch.srt_url.starts_with("srt://central.local:8890?"));
        assert!(launch.srt_url.contains("streamid=publish%3Acam-009"));
    }

    #[tokio::test]
    async fn test_start_without_camera_id_fails() {
        let (manager, _launcher) = manager_with_mock();
        let err = manager.start(UplinkRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::UplinkInvalid(_)));
    }

    #[test]
    fn test_request_key_prefers_central_path() {
        let mut req = request();
        assert_eq!(req.key(), "acme/hq/cam-001");
        req.central_path = String::new();
        assert_eq!(req.key(), "cam-001");
    }
}
