//! Republisher process launchers
//!
//! The uplink manager drives external republisher processes through the
//! `Launcher` contract. Two implementations:
//!
//! - `ContainerLauncher` - shells out to the container runtime: ensures the
//!   ffmpeg image (pull or build), runs one container per uplink on the host
//!   network, inspects container state, retries once without an ffmpeg flag
//!   the image's ffmpeg does not support
//! - `MediamtxLauncher` - declarative mode: the media router owns the
//!   republishers, so start/stop are no-ops that only feed the status hook

use crate::error::{Error, LauncherErrorKind, Result};
use crate::state::env_string;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_DOCKER_BIN: &str = "docker";
const DEFAULT_DOCKER_IMAGE: &str = "jrottenberg/ffmpeg:6.0-alpine";
const MAX_FFMPEG_LOG_LENGTH: usize = 2000;
const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_FFMPEG_GLOBAL_ARGS: &[&str] = &["-hide_banner"];
const DEFAULT_FFMPEG_INPUT_ARGS: &[&str] = &[
    "-fflags",
    "+nobuffer",
    "-rtsp_transport",
    "tcp",
    "-rw_timeout",
    "15000000",
    "-stimeout",
    "15000000",
];
const DEFAULT_FFMPEG_OUTPUT_ARGS: &[&str] = &[
    "-c",
    "copy",
    "-f",
    "mpegts",
    "-mpegts_flags",
    "+resend_headers",
    "-muxdelay",
    "0",
    "-muxpreload",
    "0",
];

/// Request to start one republisher
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub name: String,
    pub proxy_url: String,
    pub srt_url: String,
}

/// Observed process state
#[derive(Debug, Clone, Default)]
pub struct ProcessStatus {
    pub state: String,
    pub exit_code: i64,
    pub error: String,
}

/// External republisher lifecycle contract
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the process; returns its id. Errors are classified.
    async fn start(&self, request: &LaunchRequest) -> Result<String>;
    /// Terminate the process.
    async fn stop(&self, name: &str) -> Result<()>;
    /// Observe the process state.
    async fn inspect(&self, name: &str) -> Result<ProcessStatus>;
}

/// Container name for an uplink keyed by central path
pub fn container_name_for_central_path(path: &str) -> String {
    let mut sanitized: String = path
        .trim()
        .trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() {
        sanitized = "default".to_string();
    }
    format!("cam-bus-uplink-{}", sanitized)
}

/// Container-runtime launcher
pub struct ContainerLauncher {
    docker_bin: String,
    image: String,
    config_dir: String,
    build_context: String,
    dockerfile: String,
    ffmpeg_global_args: Vec<String>,
    ffmpeg_input_args: Vec<String>,
    ffmpeg_output_args: Vec<String>,
}

impl ContainerLauncher {
    pub fn from_env() -> Self {
        Self {
            docker_bin: env_string("UPLINK_DOCKER_BIN", DEFAULT_DOCKER_BIN),
            image: env_string("UPLINK_DOCKER_IMAGE", DEFAULT_DOCKER_IMAGE),
            config_dir: std::env::var("UPLINK_DOCKER_CONFIG").unwrap_or_default(),
            build_context: std::env::var("UPLINK_DOCKER_BUILD_CONTEXT").unwrap_or_default(),
            dockerfile: std::env::var("UPLINK_DOCKERFILE").unwrap_or_default(),
            ffmpeg_global_args: args_env("UPLINK_FFMPEG_GLOBAL_ARGS", DEFAULT_FFMPEG_GLOBAL_ARGS),
            ffmpeg_input_args: args_env("UPLINK_FFMPEG_INPUT_ARGS", DEFAULT_FFMPEG_INPUT_ARGS),
            ffmpeg_output_args: args_env("UPLINK_FFMPEG_OUTPUT_ARGS", DEFAULT_FFMPEG_OUTPUT_ARGS),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.run_with_env(args, &[]).await;
        // Credential-helper failures show up when no DOCKER_CONFIG is set;
        // retry against a scratch config dir.
        if let Err(ref e) = output {
            if self.config_dir.is_empty() && e.to_string().contains("error getting credentials") {
                let fallback_dir = "/tmp/cam-bus-docker-config";
                if std::fs::create_dir_all(fallback_dir).is_ok() {
                    return self
                        .run_with_env(args, &[("DOCKER_CONFIG", fallback_dir)])
                        .await;
                }
            }
        }
        output
    }

    async fn run_with_env(&self, args: &[&str], extra_env: &[(&str, &str)]) -> Result<String> {
        let mut command = Command::new(&self.docker_bin);
        command.args(args);
        if !self.config_dir.is_empty() {
            command.env("DOCKER_CONFIG", &self.config_dir);
        }
        for (key, value) in extra_env {
            command.env(key, value);
        }
        command.kill_on_drop(true);

        let output = command
            .output()
            .await
            .map_err(|e| Error::Internal(format!("run {}: {}", self.docker_bin, e)))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "{} {} failed: {}",
                self.docker_bin,
                args.first().unwrap_or(&""),
                combined.trim()
            )));
        }
        Ok(combined)
    }

    async fn ensure_image(&self) -> Result<()> {
        if self
            .run_with_env(&["image", "inspect", &self.image], &[])
            .await
            .is_ok()
        {
            return Ok(());
        }

        if self.build_context.is_empty() && self.dockerfile.is_empty() {
            tracing::info!(image = %self.image, "docker image not found, pulling");
            self.run(&["pull", &self.image]).await.map_err(|e| {
                Error::Internal(format!("pull docker image {}: {}", self.image, e))
            })?;
            return Ok(());
        }

        let build_context = if self.build_context.is_empty() {
            "."
        } else {
            &self.build_context
        };
        let mut args = vec!["build", "-t", self.image.as_str()];
        if !self.dockerfile.is_empty() {
            args.push("-f");
            args.push(&self.dockerfile);
        }
        args.push(build_context);
        tracing::info!(image = %self.image, context = %build_context, "docker image not found, building");
        self.run(&args)
            .await
            .map_err(|e| Error::Internal(format!("build docker image {}: {}", self.image, e)))?;
        Ok(())
    }

    fn build_ffmpeg_args(&self, request: &LaunchRequest, input_args: &[String]) -> Vec<String> {
        let input_args = normalize_input_args(&request.proxy_url, input_args);
        let mut args = Vec::with_capacity(
            self.ffmpeg_global_args.len() + input_args.len() + self.ffmpeg_output_args.len() + 4,
        );
        args.extend(self.ffmpeg_global_args.iter().cloned());
        args.extend(input_args);
        args.push("-i".to_string());
        args.push(request.proxy_url.clone());
        args.extend(self.ffmpeg_output_args.iter().cloned());
        args.push(request.srt_url.clone());
        args
    }

    async fn start_container(
        &self,
        request: &LaunchRequest,
        input_args: &[String],
    ) -> std::result::Result<String, (Option<String>, Error)> {
        let ffmpeg_args = self.build_ffmpeg_args(request, input_args);
        let mut run_args: Vec<&str> = vec![
            "run",
            "-d",
            "--name",
            &request.name,
            "--network",
            "host",
            &self.image,
        ];
        run_args.extend(ffmpeg_args.iter().map(String::as_str));

        let run_output = match self.run(&run_args).await {
            Ok(out) => out,
            Err(e) => {
                let logs = truncate(&e.to_string(), MAX_FFMPEG_LOG_LENGTH);
                return Err((
                    Some(logs.clone()),
                    Error::Launcher {
                        kind: LauncherErrorKind::DockerFailure,
                        message: format!(
                            "start docker container: ffmpeg_args={:?} logs={}",
                            ffmpeg_args, logs
                        ),
                    },
                ));
            }
        };

        let container_id = run_output.trim().to_string();
        if container_id.is_empty() {
            return Err((
                None,
                Error::Internal("start docker container: empty container id".to_string()),
            ));
        }

        let status = match self.inspect_state(&container_id).await {
            Ok(s) => s,
            Err(e) => return Err((None, e)),
        };
        if status.state != "running" {
            let logs_output = self
                .run(&["logs", "--tail", "200", &container_id])
                .await
                .unwrap_or_default();
            let logs = truncate(logs_output.trim(), MAX_FFMPEG_LOG_LENGTH);
            let (kind, summary) = classify_ffmpeg_logs(&logs);
            let summary = if summary.is_empty() {
                format!(
                    "container {} not running (status={} exitCode={} stateError={})",
                    container_id, status.state, status.exit_code, status.error
                )
            } else {
                summary
            };
            return Err((
                Some(logs.clone()),
                Error::Launcher {
                    kind,
                    message: format!(
                        "{} ffmpeg_args={:?} logs={}",
                        summary, ffmpeg_args, logs
                    ),
                },
            ));
        }
        Ok(container_id)
    }

    async fn inspect_state(&self, name: &str) -> Result<ProcessStatus> {
        let output = self
            .run(&[
                "inspect",
                "--format",
                "{{.State.Status}}|{{.State.ExitCode}}|{{.State.Error}}",
                name,
            ])
            .await
            .map_err(|e| Error::Internal(format!("inspect docker container {}: {}", name, e)))?;

        let trimmed = output.trim();
        let parts: Vec<&str> = trimmed.splitn(3, '|').collect();
        if parts.len() != 3 {
            return Err(Error::Internal(format!(
                "inspect docker container {}: unexpected output {:?}",
                name, trimmed
            )));
        }
        let exit_code = parts[1].trim().parse::<i64>().map_err(|_| {
            Error::Internal(format!(
                "inspect docker container {}: invalid exit code {:?}",
                name, parts[1]
            ))
        })?;
        Ok(ProcessStatus {
            state: parts[0].to_string(),
            exit_code,
            error: parts[2].trim().to_string(),
        })
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    async fn start(&self, request: &LaunchRequest) -> Result<String> {
        if request.name.is_empty() {
            return Err(Error::UplinkInvalid("container name required".to_string()));
        }
        validate_launch_urls(request)?;
        self.ensure_image().await?;
        let _ = self.run(&["rm", "-f", &request.name]).await;

        match self.start_container(request, &self.ffmpeg_input_args).await {
            Ok(container_id) => Ok(container_id),
            Err((logs, error)) => {
                if let Some(logs) = logs {
                    if let Some(option) = unsupported_ffmpeg_option(&logs) {
                        let flag = if option.starts_with('-') {
                            option
                        } else {
                            format!("-{}", option)
                        };
                        let fallback_args =
                            remove_option_with_value(&self.ffmpeg_input_args, &flag);
                        if fallback_args.len() != self.ffmpeg_input_args.len() {
                            tracing::warn!(
                                image = %self.image,
                                flag = %flag,
                                "ffmpeg does not support flag, retrying without it"
                            );
                            let _ = self.run(&["rm", "-f", &request.name]).await;
                            return self
                                .start_container(request, &fallback_args)
                                .await
                                .map_err(|(_, e)| e);
                        }
                    }
                }
                Err(error)
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::UplinkInvalid("container name required".to_string()));
        }
        self.run(&["rm", "-f", name])
            .await
            .map(|_| ())
            .map_err(|e| Error::Internal(format!("remove docker container: {}", e)))
    }

    async fn inspect(&self, name: &str) -> Result<ProcessStatus> {
        if name.is_empty() {
            return Err(Error::UplinkInvalid("container name required".to_string()));
        }
        tokio::time::timeout(INSPECT_TIMEOUT, self.inspect_state(name))
            .await
            .map_err(|_| Error::Internal(format!("inspect docker container {}: timeout", name)))?
    }
}

/// Declarative launcher: the media router owns the republishers. Start/stop
/// only exist to drive the status hook.
pub struct MediamtxLauncher;

#[async_trait]
impl Launcher for MediamtxLauncher {
    async fn start(&self, request: &LaunchRequest) -> Result<String> {
        tracing::debug!(name = %request.name, "mediamtx mode, republisher managed externally");
        Ok(request.name.clone())
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn inspect(&self, _name: &str) -> Result<ProcessStatus> {
        Ok(ProcessStatus {
            state: "running".to_string(),
            exit_code: 0,
            error: String::new(),
        })
    }
}

fn args_env(key: &str, def: &[&str]) -> Vec<String> {
    let raw = std::env::var(key).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        def.iter().map(|s| s.to_string()).collect()
    } else {
        raw.split_whitespace().map(String::from).collect()
    }
}

/// Input args depend on the proxy scheme: file sources replay in real time
/// and drop the RTSP-only flags; unknown schemes drop them too.
fn normalize_input_args(proxy_url: &str, input_args: &[String]) -> Vec<String> {
    let scheme = url::Url::parse(proxy_url)
        .map(|u| u.scheme().to_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "file" => {
            let mut args = remove_option_with_value(input_args, "-rtsp_transport");
            args = remove_option_with_value(&args, "-stimeout");
            if !args.iter().any(|a| a == "-re") {
                args.insert(0, "-re".to_string());
            }
            args
        }
        "rtsp" => input_args.to_vec(),
        _ => {
            let args = remove_option_with_value(input_args, "-rtsp_transport");
            remove_option_with_value(&args, "-stimeout")
        }
    }
}

fn remove_option_with_value(args: &[String], option: &str) -> Vec<String> {
    let mut filtered = Vec::with_capacity(args.len());
    let mut skip_next = false;
    for (i, arg) in args.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == option {
            if i + 1 < args.len() {
                skip_next = true;
            }
            continue;
        }
        filtered.push(arg.clone());
    }
    filtered
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &value[..end])
}

/// Flag name from "Option X not found" or "Unrecognized option 'X'"
fn unsupported_ffmpeg_option(logs: &str) -> Option<String> {
    if let Some(idx) = logs.find("Option ") {
        let rest = &logs[idx + "Option ".len()..];
        if let Some(end) = rest.find(" not found") {
            let option = rest[..end].trim_matches('.').trim();
            if !option.is_empty() && !option.contains(char::is_whitespace) {
                return Some(option.to_string());
            }
        }
    }
    if let Some(idx) = logs.find("Unrecognized option") {
        let rest = logs[idx + "Unrecognized option".len()..]
            .trim_start()
            .trim_start_matches(['\'', '"']);
        let option: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '\'' && *c != '"' && *c != '.')
            .collect();
        if !option.is_empty() {
            return Some(option);
        }
    }
    None
}

fn classify_ffmpeg_logs(logs: &str) -> (LauncherErrorKind, String) {
    if logs.is_empty() {
        return (LauncherErrorKind::Unknown, String::new());
    }
    if let Some(option) = unsupported_ffmpeg_option(logs) {
        return (
            LauncherErrorKind::UnsupportedOption,
            format!("ffmpeg unsupported option: {}", option),
        );
    }
    const NETWORK_INDICATORS: &[&str] = &[
        "Connection refused",
        "Connection timed out",
        "Network is unreachable",
        "No route to host",
        "Connection reset by peer",
        "Could not resolve host",
        "Server returned 404",
        "HTTP error",
    ];
    for indicator in NETWORK_INDICATORS {
        if logs.contains(indicator) {
            return (LauncherErrorKind::NetworkFailure, String::new());
        }
    }
    (LauncherErrorKind::Unknown, String::new())
}

fn validate_launch_urls(request: &LaunchRequest) -> Result<()> {
    if request.proxy_url.is_empty() {
        return Err(Error::UplinkInvalid("proxy url required".to_string()));
    }
    if request.srt_url.is_empty() {
        return Err(Error::UplinkInvalid("srt url required".to_string()));
    }

    let proxy = url::Url::parse(&request.proxy_url)
        .map_err(|e| Error::UplinkInvalid(format!("proxy url invalid: {}", e)))?;
    match proxy.scheme().to_lowercase().as_str() {
        "rtsp" => {
            if proxy.host_str().unwrap_or_default().is_empty() {
                return Err(Error::UplinkInvalid("proxy url missing host".to_string()));
            }
        }
        "file" => {}
        other => {
            return Err(Error::UplinkInvalid(format!(
                "proxy url invalid: expected scheme rtsp,file got {:?}",
                other
            )))
        }
    }

    let srt = url::Url::parse(&request.srt_url)
        .map_err(|e| Error::UplinkInvalid(format!("srt url invalid: {}", e)))?;
    if srt.scheme().to_lowercase() != "srt" {
        return Err(Error::UplinkInvalid(format!(
            "srt url invalid: expected scheme srt got {:?}",
            srt.scheme()
        )));
    }
    if srt.host_str().unwrap_or_default().is_empty() {
        return Err(Error::UplinkInvalid("srt url missing host".to_string()));
    }
    Ok(())
}
