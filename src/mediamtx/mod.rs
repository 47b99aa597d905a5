//! Media-router config generator
//!
//! ## Responsibilities
//!
//! - Translate the active camera set into the media router's declarative
//!   YAML config (path set + recording policy)
//! - Apply diffs to the running router through its admin API, falling back to
//!   a SIGHUP reload when only a PID is configured
//!
//! Two modes share the same reconciliation primitive:
//!
//! - **proxy** (`MTX_PROXY_*`): paths keyed by `proxyPath`, sourced from the
//!   camera RTSP URLs; optionally `runOnReady` republishes to the central
//!   gateway when the router owns the republishers
//! - **central-pull** (`MTX_CENTRAL_*`): paths keyed by `centralPath`,
//!   sourced from the proxy router, preserving operator-managed defaults in
//!   the existing file
//!
//! Sync is idempotent: identical camera sets produce byte-identical YAML and
//! no admin-API traffic on the second pass.

use crate::error::{Error, Result};
use crate::model::{central_path_for, CameraDescriptor};
use crate::state::{env_bool, env_string};
use crate::uplink::srt::{build_srt_url_candidates, SrtSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// Recording retention ceiling
const MAX_RECORD_DELETE_AFTER: Duration = Duration::from_secs(10 * 60);
const DEFAULT_PROXY_RTSP_BASE: &str = "rtsp://localhost:8554";
/// Admin API deadline
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Media-router YAML config (the subset this service owns)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaConfig {
    #[serde(rename = "rtspAddress", default, skip_serializing_if = "String::is_empty")]
    pub rtsp_address: String,
    #[serde(default)]
    pub hls: bool,
    #[serde(default)]
    pub webrtc: bool,
    #[serde(default)]
    pub api: bool,
    #[serde(rename = "apiAddress", default, skip_serializing_if = "String::is_empty")]
    pub api_address: String,
    #[serde(
        rename = "authInternalUsers",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub auth_internal_users: Vec<AuthInternalUser>,
    #[serde(rename = "pathDefaults", default)]
    pub path_defaults: PathDefaults,
    #[serde(default)]
    pub paths: BTreeMap<String, PathSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PathDefaults {
    #[serde(rename = "record", default)]
    pub record: bool,
    #[serde(rename = "recordPath", default)]
    pub record_path: String,
    #[serde(rename = "recordFormat", default)]
    pub record_format: String,
    #[serde(rename = "recordPartDuration", default)]
    pub record_part_duration: String,
    #[serde(rename = "recordSegmentDuration", default)]
    pub record_segment_duration: String,
    #[serde(rename = "recordDeleteAfter", default)]
    pub record_delete_after: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PathSpec {
    #[serde(rename = "source", default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(rename = "sourceOnDemand", default)]
    pub source_on_demand: bool,
    #[serde(rename = "runOnReady", default, skip_serializing_if = "String::is_empty")]
    pub run_on_ready: String,
    #[serde(rename = "runOnReadyRestart", default, skip_serializing_if = "std::ops::Not::not")]
    pub run_on_ready_restart: bool,
    #[serde(rename = "record", default, skip_serializing_if = "Option::is_none")]
    pub record: Option<bool>,
    #[serde(
        rename = "recordDeleteAfter",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub record_delete_after: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AuthInternalUser {
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pass: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<AuthPermission>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AuthPermission {
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// Global section of the admin-API patch
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GlobalPatch {
    rtsp_address: String,
    hls: bool,
    webrtc: bool,
    api: bool,
    api_address: String,
    auth_internal_users: Vec<AuthInternalUser>,
}

/// Generator settings (one instance per managed router)
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub path: PathBuf,
    pub reload_pid: i32,
    pub api_base_url: String,
    pub reload_auth_user: String,
    pub reload_auth_pass: String,
    pub reload_auth_token: String,
    pub api_user: String,
    pub api_pass: String,
    pub record_delete_after: Duration,
    pub republish_on_ready: bool,
    pub proxy_rtsp_base: String,
    pub ignore_uplink: bool,
    pub default_central_host: String,
    pub use_central_paths: bool,
    pub source_from_proxy: bool,
    pub preserve_defaults: bool,
    pub srt: SrtSettings,
}

pub struct MediaConfigGenerator {
    config: GeneratorConfig,
    client: reqwest::Client,
    sync_lock: Mutex<()>,
}

impl MediaConfigGenerator {
    /// Proxy-mode generator from `MTX_PROXY_*`; None when no config path set
    pub fn from_proxy_env() -> Option<Self> {
        let path = env_string("MTX_PROXY_CONFIG_PATH", "");
        if path.trim().is_empty() {
            return None;
        }
        let uplink_mode = env_string("UPLINK_MODE", "").trim().to_lowercase();
        let ignore_uplink = env_bool("IGNORE_UPLINK", false);
        let mut config = generator_env("MTX_PROXY", path);
        config.republish_on_ready = uplink_mode == "mediamtx" || ignore_uplink;
        config.ignore_uplink = ignore_uplink;
        Some(Self::new(config))
    }

    /// Central-pull generator from `MTX_CENTRAL_*`; pulls every path from the
    /// proxy router and preserves operator defaults in the existing file.
    pub fn from_central_env() -> Option<Self> {
        let path = env_string("MTX_CENTRAL_CONFIG_PATH", "");
        if path.trim().is_empty() {
            return None;
        }
        let mut config = generator_env("MTX_CENTRAL", path);
        config.ignore_uplink = env_bool("IGNORE_UPLINK", false);
        config.use_central_paths = true;
        config.source_from_proxy = true;
        config.preserve_defaults = true;
        Some(Self::new(config))
    }

    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(API_TIMEOUT)
                .build()
                .unwrap_or_default(),
            sync_lock: Mutex::new(()),
        }
    }

    /// Reconcile the router config with the camera set. Writes the YAML only
    /// when it changed, then applies the diff to the running router.
    pub async fn sync(&self, cameras: &[CameraDescriptor]) -> Result<()> {
        let _guard = self.sync_lock.lock().await;

        let (existing, exists) = self.read_existing_config().await?;
        let desired = self.build_config(&existing, exists, cameras);
        if exists && existing == desired {
            return Ok(());
        }

        let data = serde_yaml::to_string(&desired)
            .map_err(|e| Error::Internal(format!("marshal media config: {}", e)))?;
        self.write_file(data.as_bytes()).await?;

        self.apply_changes(&existing, &desired).await
    }

    fn base_config(&self) -> MediaConfig {
        MediaConfig {
            rtsp_address: ":8554".to_string(),
            hls: false,
            webrtc: false,
            api: true,
            api_address: ":9997".to_string(),
            auth_internal_users: auth_users_for_api(&self.config.api_user, &self.config.api_pass),
            path_defaults: PathDefaults {
                record: true,
                record_path: "/recordings/%path/%Y-%m-%d_%H-%M-%S-%f".to_string(),
                record_format: "fmp4".to_string(),
                record_part_duration: "1s".to_string(),
                record_segment_duration: "1m".to_string(),
                record_delete_after: format_duration(self.config.record_delete_after),
            },
            paths: BTreeMap::new(),
        }
    }

    fn build_config(
        &self,
        existing: &MediaConfig,
        exists: bool,
        cameras: &[CameraDescriptor],
    ) -> MediaConfig {
        let mut config = if self.config.preserve_defaults && exists {
            let mut config = existing.clone();
            config.paths = BTreeMap::new();
            if !self.config.api_user.is_empty() || !self.config.api_pass.is_empty() {
                config.auth_internal_users =
                    auth_users_for_api(&self.config.api_user, &self.config.api_pass);
            }
            if config.path_defaults.record_delete_after.is_empty() {
                config.path_defaults.record_delete_after =
                    format_duration(self.config.record_delete_after);
            }
            config
        } else {
            let mut config = self.base_config();
            if exists && self.config.api_user.is_empty() && self.config.api_pass.is_empty() {
                config.auth_internal_users = existing.auth_internal_users.clone();
            }
            config
        };

        for camera in cameras {
            let mut camera = camera.clone();
            if self.config.ignore_uplink {
                if camera.central_host.is_empty() {
                    camera.central_host = self.config.default_central_host.clone();
                }
                if camera.central_path.is_empty() {
                    camera.central_path = central_path_for(&camera.identity());
                }
            }

            let path = self.path_name_for(&camera);
            if path.is_empty() {
                continue;
            }

            let source = self.source_url_for(&camera);
            if source.is_empty() && !self.config.republish_on_ready {
                tracing::warn!(
                    device_id = %camera.device_id,
                    "camera has no usable source, dropping from media config"
                );
                continue;
            }

            config
                .paths
                .insert(path, self.path_spec_for(&camera, source));
        }

        config
    }

    fn path_name_for(&self, camera: &CameraDescriptor) -> String {
        let path = if self.config.use_central_paths {
            let central = camera.central_path.trim();
            if central.is_empty() {
                central_path_for(&camera.identity())
            } else {
                central.to_string()
            }
        } else {
            let proxy = camera.proxy_path.trim();
            if proxy.is_empty() {
                camera.device_id.clone()
            } else {
                proxy.to_string()
            }
        };
        let path = path.trim_start_matches('/').trim();
        if path == "." {
            return String::new();
        }
        path.to_string()
    }

    fn source_url_for(&self, camera: &CameraDescriptor) -> String {
        if self.config.source_from_proxy {
            let mut proxy_path = camera.proxy_path.trim();
            if proxy_path.is_empty() {
                proxy_path = camera.device_id.trim();
            }
            let proxy_path = proxy_path.trim_start_matches('/');
            if proxy_path.is_empty() {
                return String::new();
            }
            return format!(
                "{}/{}",
                self.config.proxy_rtsp_base.trim_end_matches('/'),
                proxy_path
            );
        }
        camera.rtsp_url.trim().to_string()
    }

    fn path_spec_for(&self, camera: &CameraDescriptor, source: String) -> PathSpec {
        let mut spec = PathSpec {
            source,
            source_on_demand: false,
            ..Default::default()
        };

        if self.config.republish_on_ready
            && !camera.central_host.is_empty()
            && !camera.central_path.is_empty()
        {
            if let Some(command) = self.build_republish_command(camera) {
                spec.run_on_ready = command;
                spec.run_on_ready_restart = true;
            }
        }

        if !camera.record_enabled {
            spec.record = Some(false);
            return spec;
        }

        let retention = retention_for_camera(camera, self.config.record_delete_after);
        if retention != self.config.record_delete_after {
            spec.record_delete_after = format_duration(retention);
        }
        spec
    }

    /// `runOnReady` command: the on-router republisher with the full SRT
    /// candidate list to try in order.
    fn build_republish_command(&self, camera: &CameraDescriptor) -> Option<String> {
        let mut proxy_path = camera.proxy_path.trim().trim_matches('/');
        if proxy_path.is_empty() {
            proxy_path = camera.device_id.trim().trim_matches('/');
        }
        let proxy_url = format!(
            "{}/{}",
            self.config.proxy_rtsp_base.trim_end_matches('/'),
            proxy_path
        );
        let srt_urls = build_srt_url_candidates(
            &camera.central_host,
            camera.central_srt_port,
            &camera.central_path,
            &self.config.srt,
        );
        if srt_urls.is_empty() {
            tracing::warn!(
                host = %camera.central_host,
                path = %camera.central_path,
                "no srt candidates, skipping runOnReady"
            );
            return None;
        }

        let mut args = vec![
            "/usr/local/bin/republish-srt".to_string(),
            "--proxy-url".to_string(),
            proxy_url,
            "--".to_string(),
        ];
        args.extend(srt_urls);
        Some(
            args.iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    async fn read_existing_config(&self) -> Result<(MediaConfig, bool)> {
        let data = match tokio::fs::read(&self.config.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((MediaConfig::default(), false))
            }
            Err(e) => return Err(Error::Io(e)),
        };
        match serde_yaml::from_slice::<MediaConfig>(&data) {
            Ok(existing) => Ok((existing, true)),
            // Unparseable file: treat as empty baseline and rewrite it.
            Err(_) => Ok((MediaConfig::default(), false)),
        }
    }

    async fn write_file(&self, data: &[u8]) -> Result<()> {
        if let Some(dir) = self.config.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.config.path, data).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o644);
            tokio::fs::set_permissions(&self.config.path, permissions).await?;
        }
        Ok(())
    }

    async fn apply_changes(&self, existing: &MediaConfig, desired: &MediaConfig) -> Result<()> {
        if !self.config.api_base_url.is_empty() {
            return self.apply_via_api(existing, desired).await;
        }
        if self.config.reload_pid > 0 {
            return self.reload_via_signal();
        }
        Err(Error::Reload("reload not configured".to_string()))
    }

    fn reload_via_signal(&self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(self.config.reload_pid), Signal::SIGHUP)
            .map_err(|e| Error::Reload(format!("signal media router reload: {}", e)))
    }

    async fn apply_via_api(&self, existing: &MediaConfig, desired: &MediaConfig) -> Result<()> {
        let global = GlobalPatch {
            rtsp_address: desired.rtsp_address.clone(),
            hls: desired.hls,
            webrtc: desired.webrtc,
            api: desired.api,
            api_address: desired.api_address.clone(),
            auth_internal_users: desired.auth_internal_users.clone(),
        };

        self.api_request(reqwest::Method::PATCH, "v3/config/global/patch", Some(serde_json::to_value(&global)?))
            .await
            .map_err(|e| Error::Reload(format!("patch global config: {}", e)))?;
        self.api_request(
            reqwest::Method::PATCH,
            "v3/config/pathdefaults/patch",
            Some(serde_json::to_value(&desired.path_defaults)?),
        )
        .await
        .map_err(|e| Error::Reload(format!("patch path defaults: {}", e)))?;

        for name in existing.paths.keys() {
            if !desired.paths.contains_key(name) {
                let endpoint = format!("v3/config/paths/delete/{}", path_escape(name));
                self.api_request(reqwest::Method::DELETE, &endpoint, None)
                    .await
                    .map_err(|e| Error::Reload(format!("delete path {:?}: {}", name, e)))?;
            }
        }

        for (name, spec) in &desired.paths {
            let endpoint = if existing.paths.contains_key(name) {
                format!("v3/config/paths/replace/{}", path_escape(name))
            } else {
                format!("v3/config/paths/add/{}", path_escape(name))
            };
            self.api_request(
                reqwest::Method::POST,
                &endpoint,
                Some(serde_json::to_value(spec)?),
            )
            .await
            .map_err(|e| Error::Reload(format!("apply path {:?}: {}", name, e)))?;
        }

        Ok(())
    }

    async fn api_request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let base = self.config.api_base_url.trim_end_matches('/');
        let url = format!("{}/{}", base, endpoint);

        let mut request = self.client.request(method, &url);
        if !self.config.reload_auth_token.is_empty() {
            request = request.header(
                "Authorization",
                format!("Bearer {}", self.config.reload_auth_token),
            );
        } else if !self.config.reload_auth_user.is_empty()
            || !self.config.reload_auth_pass.is_empty()
        {
            request = request.basic_auth(
                &self.config.reload_auth_user,
                Some(&self.config.reload_auth_pass),
            );
        }
        if let Some(payload) = payload {
            request = request.json(&payload);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Reload(format!(
                "media api status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Shared `MTX_<mode>_*` environment parsing
fn generator_env(prefix: &str, path: String) -> GeneratorConfig {
    let getenv = |suffix: &str| env_string(&format!("{}_{}", prefix, suffix), "");

    let api_base_url = normalize_api_base_url(&getenv("RELOAD_URL"));
    let mut reload_pid = parse_pid(&getenv("RELOAD_PID"));
    if reload_pid == 0 {
        reload_pid = parse_pid(&getenv("PID"));
    }

    let mut reload_user = getenv("RELOAD_USER");
    let mut reload_pass = getenv("RELOAD_PASS");
    let mut reload_token = getenv("RELOAD_TOKEN");
    let api_user = getenv("API_USER");
    let api_pass = getenv("API_PASS");
    let api_token = getenv("API_TOKEN");
    if reload_user.is_empty() && reload_pass.is_empty() && reload_token.is_empty() {
        // Reuse the API credentials so authInternalUsers does not lock us out.
        reload_user = api_user.clone();
        reload_pass = api_pass.clone();
        reload_token = api_token;
    }

    let mut retention = parse_go_duration(&getenv("RECORD_DELETE_AFTER"))
        .unwrap_or(MAX_RECORD_DELETE_AFTER);
    if retention > MAX_RECORD_DELETE_AFTER {
        retention = MAX_RECORD_DELETE_AFTER;
    }

    GeneratorConfig {
        path: PathBuf::from(path.trim()),
        reload_pid,
        api_base_url,
        reload_auth_user: reload_user,
        reload_auth_pass: reload_pass,
        reload_auth_token: reload_token,
        api_user,
        api_pass,
        record_delete_after: retention,
        republish_on_ready: false,
        proxy_rtsp_base: env_string("UPLINK_PROXY_RTSP_BASE", DEFAULT_PROXY_RTSP_BASE)
            .trim_end_matches('/')
            .to_string(),
        ignore_uplink: false,
        default_central_host: env_string("UPLINK_CENTRAL_HOST", "").trim().to_string(),
        use_central_paths: false,
        source_from_proxy: false,
        preserve_defaults: false,
        srt: SrtSettings::from_env(),
    }
}

fn auth_users_for_api(api_user: &str, api_pass: &str) -> Vec<AuthInternalUser> {
    if api_user.is_empty() && api_pass.is_empty() {
        return Vec::new();
    }
    vec![
        AuthInternalUser {
            user: "any".to_string(),
            pass: String::new(),
            ips: Vec::new(),
            permissions: vec![
                AuthPermission {
                    action: "publish".to_string(),
                    path: String::new(),
                },
                AuthPermission {
                    action: "read".to_string(),
                    path: String::new(),
                },
                AuthPermission {
                    action: "playback".to_string(),
                    path: String::new(),
                },
            ],
        },
        AuthInternalUser {
            user: api_user.to_string(),
            pass: api_pass.to_string(),
            ips: Vec::new(),
            permissions: vec![AuthPermission {
                action: "api".to_string(),
                path: String::new(),
            }],
        },
    ]
}

/// Per-camera retention: clamp to the configured ceiling; non-positive means
/// "inherit the default".
fn retention_for_camera(camera: &CameraDescriptor, default_retention: Duration) -> Duration {
    if camera.record_retention_minutes <= 0 {
        return default_retention;
    }
    let retention = Duration::from_secs(camera.record_retention_minutes as u64 * 60);
    if retention > default_retention {
        default_retention
    } else {
        retention
    }
}

/// "5m" / "30s" style rendering for the router config
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Minimal Go-style duration parsing: "10m", "90s", "1h", "1h30m"
fn parse_go_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total_secs: u64 = 0;
    let mut number = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: u64 = number.parse().ok()?;
        number.clear();
        total_secs += match c {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return None,
        };
    }
    if !number.is_empty() {
        // Bare number: treat as seconds.
        total_secs += number.parse::<u64>().ok()?;
    }
    if total_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(total_secs))
    }
}

fn parse_pid(raw: &str) -> i32 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0;
    }
    match raw.parse::<i32>() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            tracing::warn!(value = %raw, "invalid media router PID");
            0
        }
    }
}

/// Strip legacy `/v3/reload` or `/v3` suffixes from the reload URL
fn normalize_api_base_url(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    let value = value.trim_end_matches('/');
    if let Some(stripped) = value.strip_suffix("/v3/reload") {
        return stripped.trim_end_matches('/').to_string();
    }
    if let Some(stripped) = value.strip_suffix("/v3") {
        return stripped.trim_end_matches('/').to_string();
    }
    value.to_string()
}

/// RFC3986 path-segment escaping (slashes included)
fn path_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CameraIdentity;

    fn generator(dir: &std::path::Path) -> MediaConfigGenerator {
        MediaConfigGenerator::new(GeneratorConfig {
            path: dir.join("mediamtx.yml"),
            reload_pid: 0,
            api_base_url: String::new(),
            reload_auth_user: String::new(),
            reload_auth_pass: String::new(),
            reload_auth_token: String::new(),
            api_user: String::new(),
            api_pass: String::new(),
            record_delete_after: MAX_RECORD_DELETE_AFTER,
            republish_on_ready: false,
            proxy_rtsp_base: "rtsp://localhost:8554".to_string(),
            ignore_uplink: false,
            default_central_host: String::new(),
            use_central_paths: false,
            source_from_proxy: false,
            preserve_defaults: false,
            srt: SrtSettings::default(),
        })
    }

    fn camera(device_id: &str, retention_minutes: i64) -> CameraDescriptor {
        let mut camera = CameraDescriptor {
            rtsp_url: format!("rtsp://10.0.0.10:554/{}", device_id),
            record_retention_minutes: retention_minutes,
            enabled: true,
            ..Default::default()
        };
        camera.set_identity(&CameraIdentity {
            tenant: "acme".to_string(),
            building: "hq".to_string(),
            floor: "1".to_string(),
            device_type: "ipcam".to_string(),
            device_id: device_id.to_string(),
        });
        camera.normalize();
        camera
    }

    #[tokio::test]
    async fn test_sync_writes_then_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        let cameras = vec![camera("cam-a", 5), camera("cam-b", 0)];

        // First sync writes the file; reload is not configured, which is the
        // one error the caller logs and retries next cycle.
        let err = generator.sync(&cameras).await.unwrap_err();
        assert!(matches!(err, Error::Reload(_)));
        let first = std::fs::read(dir.path().join("mediamtx.yml")).unwrap();
        assert!(!first.is_empty());

        // Second sync: nothing changed, nothing rewritten, no reload attempt.
        generator.sync(&cameras).await.unwrap();
        let second = std::fs::read(dir.path().join("mediamtx.yml")).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sync_record_flags_and_clamp() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        let cameras = vec![camera("cam-a", 5), camera("cam-b", 0)];

        let _ = generator.sync(&cameras).await;
        let yaml = std::fs::read_to_string(dir.path().join("mediamtx.yml")).unwrap();
        let parsed: MediaConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.paths.len(), 2);
        let a = &parsed.paths["cam-a"];
        assert_eq!(a.record, None);
        assert_eq!(a.record_delete_after, "5m");
        let b = &parsed.paths["cam-b"];
        assert_eq!(b.record, Some(false));
        assert!(b.record_delete_after.is_empty());
    }

    #[test]
    fn test_retention_clamped_to_ceiling() {
        let camera_long = camera("cam-a", 120);
        assert_eq!(
            retention_for_camera(&camera_long, MAX_RECORD_DELETE_AFTER),
            MAX_RECORD_DELETE_AFTER
        );
        let camera_short = camera("cam-a", 5);
        assert_eq!(
            retention_for_camera(&camera_short, MAX_RECORD_DELETE_AFTER),
            Duration::from_secs(300)
        );
    }

    #[tokio::test]
    async fn test_central_mode_paths_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = generator(dir.path()).config;
        config.use_central_paths = true;
        config.source_from_proxy = true;
        let generator = MediaConfigGenerator::new(config);

        let cameras = vec![camera("cam-a", 0)];
        let desired = generator.build_config(&MediaConfig::default(), false, &cameras);
        let spec = &desired.paths["acme/hq/cam-a"];
        assert_eq!(spec.source, "rtsp://localhost:8554/cam-a");
    }

    #[tokio::test]
    async fn test_camera_without_source_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path());
        let mut no_source = camera("cam-a", 0);
        no_source.rtsp_url = String::new();

        let desired = generator.build_config(&MediaConfig::default(), false, &[no_source]);
        assert!(desired.paths.is_empty());
    }

    #[tokio::test]
    async fn test_republish_on_ready_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = generator(dir.path()).config;
        config.republish_on_ready = true;
        let generator = MediaConfigGenerator::new(config);

        let mut cam = camera("cam-a", 0);
        cam.central_host = "central.local".to_string();
        cam.central_srt_port = 8890;

        let desired = generator.build_config(&MediaConfig::default(), false, &[cam]);
        let spec = &desired.paths["cam-a"];
        assert!(spec.run_on_ready.starts_with("'/usr/local/bin/republish-srt'"));
        assert!(spec.run_on_ready.contains("--proxy-url"));
        assert!(spec.run_on_ready.contains("srt://central.local:8890"));
        assert!(spec.run_on_ready_restart);
    }

    #[test]
    fn test_auth_users_for_api() {
        assert!(auth_users_for_api("", "").is_empty());
        let users = auth_users_for_api("admin", "pw");
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user, "any");
        assert_eq!(users[1].user, "admin");
        assert_eq!(users[1].permissions[0].action, "api");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    }

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_go_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(
            parse_go_duration("1h30m"),
            Some(Duration::from_secs(5400))
        );
        assert_eq!(parse_go_duration("42"), Some(Duration::from_secs(42)));
        assert_eq!(parse_go_duration(""), None);
        assert_eq!(parse_go_duration("bogus"), None);
    }

    #[test]
    fn test_normalize_api_base_url() {
        assert_eq!(
            normalize_api_base_url("http://mtx:9997/v3/reload"),
            "http://mtx:9997"
        );
        assert_eq!(normalize_api_base_url("http://mtx:9997/v3"), "http://mtx:9997");
        assert_eq!(normalize_api_base_url("http://mtx:9997/"), "http://mtx:9997");
        assert_eq!(normalize_api_base_url(""), "");
    }

    #[test]
    fn test_path_escape() {
        assert_eq!(path_escape("acme/hq/cam-001"), "acme%2Fhq%2Fcam-001");
        assert_eq!(path_escape("plain"), "plain");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }
}
