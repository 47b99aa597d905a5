//! Error handling for cambus

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed payload or unusable configuration value
    #[error("Config invalid: {0}")]
    ConfigInvalid(String),

    /// No driver registered for (manufacturer, model)
    #[error("No driver for {manufacturer}:{model}")]
    DriverNotFound { manufacturer: String, model: String },

    /// Device-side failure (connect, stream, parse); retried by the driver
    #[error("Device failure: {0}")]
    Device(String),

    /// Uplink launcher failure with classification
    #[error("Launcher error ({kind}): {message}")]
    Launcher {
        kind: LauncherErrorKind,
        message: String,
    },

    /// Uplink request validation failure
    #[error("Uplink request invalid: {0}")]
    UplinkInvalid(String),

    /// Media-router reload failed (the config file has already been rewritten)
    #[error("Media reload error: {0}")]
    Reload(String),

    /// Snapshot store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// MQTT transport error
    #[error("Bus error: {0}")]
    Bus(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Launcher start-error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherErrorKind {
    /// ffmpeg rejected one of the configured flags
    UnsupportedOption,
    /// connection refused / unreachable source or sink
    NetworkFailure,
    /// the container runtime itself failed
    DockerFailure,
    /// anything else
    Unknown,
}

impl std::fmt::Display for LauncherErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LauncherErrorKind::UnsupportedOption => "unsupported_option",
            LauncherErrorKind::NetworkFailure => "network_failure",
            LauncherErrorKind::DockerFailure => "docker_failure",
            LauncherErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
