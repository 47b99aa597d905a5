//! Process configuration
//!
//! Environment-derived settings shared across components. Component-specific
//! knobs (uplink tuning, media-router generation) live next to their owners
//! and are read through the helpers here.

use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base topic for all camera traffic (`<base>/<tenant>/.../info`)
    pub base_topic: String,
    /// Shard label this instance serves (empty = all shards)
    pub shard: String,
    /// Interval between status publications (zero disables the loop)
    pub status_interval: Duration,
    /// MQTT broker host
    pub mqtt_host: String,
    /// MQTT broker port
    pub mqtt_port: u16,
    /// MQTT username (empty = anonymous)
    pub mqtt_username: String,
    /// MQTT password
    pub mqtt_password: String,
    /// MQTT client id
    pub mqtt_client_id: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_topic: env_string("MQTT_BASE_TOPIC", "security-vision/cameras")
                .trim_end_matches('/')
                .to_string(),
            shard: std::env::var("CAMBUS_SHARD").unwrap_or_default(),
            status_interval: env_duration_secs("CAMBUS_STATUS_INTERVAL_SECONDS", 30),
            mqtt_host: env_string("MQTT_HOST", "localhost"),
            mqtt_port: env_u16("MQTT_PORT", 1883),
            mqtt_username: std::env::var("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: std::env::var("MQTT_PASSWORD").unwrap_or_default(),
            mqtt_client_id: env_string("MQTT_CLIENT_ID", "cam-bus"),
        }
    }
}

/// String env var with default
pub fn env_string(key: &str, def: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => def.to_string(),
    }
}

/// Positive integer env var with default
pub fn env_i64(key: &str, def: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(def)
}

/// Port-style env var with default
pub fn env_u16(key: &str, def: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(def)
}

/// Boolean env var: 1/true/yes/y/on vs 0/false/no/n/off, anything else = default
pub fn env_bool(key: &str, def: bool) -> bool {
    let raw = match std::env::var(key) {
        Ok(v) => v,
        Err(_) => return def,
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => def,
    }
}

/// Seconds-valued env var with default; zero is allowed and means "disabled"
pub fn env_duration_secs(key: &str, def_secs: u64) -> Duration {
    let raw = match std::env::var(key) {
        Ok(v) => v,
        Err(_) => return Duration::from_secs(def_secs),
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, default_secs = def_secs, "invalid duration env, using default");
            Duration::from_secs(def_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_variants() {
        std::env::set_var("CAMBUS_TEST_BOOL", "yes");
        assert!(env_bool("CAMBUS_TEST_BOOL", false));
        std::env::set_var("CAMBUS_TEST_BOOL", "off");
        assert!(!env_bool("CAMBUS_TEST_BOOL", true));
        std::env::set_var("CAMBUS_TEST_BOOL", "maybe");
        assert!(env_bool("CAMBUS_TEST_BOOL", true));
        std::env::remove_var("CAMBUS_TEST_BOOL");
        assert!(!env_bool("CAMBUS_TEST_BOOL", false));
    }

    #[test]
    fn test_env_duration_zero_allowed() {
        std::env::set_var("CAMBUS_TEST_SECS", "0");
        assert_eq!(env_duration_secs("CAMBUS_TEST_SECS", 30), Duration::ZERO);
        std::env::remove_var("CAMBUS_TEST_SECS");
    }
}
