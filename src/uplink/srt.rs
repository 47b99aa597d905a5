//! SRT URL candidate construction
//!
//! A republisher may face gateways with different SRT stacks, so instead of
//! one URL we emit an ordered candidate list: the tuned base, a stripped
//! variant without the fragile knobs, a default-latency variant and an
//! optional compat variant. Candidates whose stream id survives raw encoding
//! also get a variant with the stream id appended unencoded (some receivers
//! reject percent-encoded `publish:` prefixes). Duplicates are suppressed by
//! URL equality and every candidate is validated before use.

use crate::state::{env_bool, env_i64, env_string};
use std::collections::BTreeMap;

/// Default SRT payload size (MPEG-TS aligned)
pub const DEFAULT_SRT_PACKET_SIZE: i64 = 1316;
/// Default SRT port on the central gateway
pub const DEFAULT_SRT_PORT: u16 = 8890;
/// Default latency for the balanced profile
pub const DEFAULT_SRT_LATENCY_MS: i64 = 200;

/// Tunable SRT query options
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SrtQueryOptions {
    pub latency: i64,
    pub packet_size: i64,
    pub max_bw: i64,
    pub rcv_buf: i64,
    pub passphrase: String,
    pub pb_key_len: i64,
    pub peer_latency: i64,
    pub rcv_latency: i64,
    pub conn_timeout: i64,
    pub snd_buf: i64,
    pub input_bw: i64,
    pub ohead_bw: i64,
    pub tl_pkt_drop: bool,
    pub extra_params: String,
}

/// Resolved SRT tuning: profile-derived options + compat toggle
#[derive(Debug, Clone, Default)]
pub struct SrtSettings {
    pub options: SrtQueryOptions,
    pub compat_profile: bool,
}

impl SrtSettings {
    /// Resolve `UPLINK_SRT_PROFILE` (custom | latency | balanced | quality)
    /// and the `UPLINK_SRT_*` parameter set.
    pub fn from_env() -> Self {
        let profile = env_string("UPLINK_SRT_PROFILE", "custom")
            .trim()
            .to_lowercase();
        let options = match profile.as_str() {
            "custom" => custom_options_from_env(),
            "latency" => with_aux_env(SrtQueryOptions {
                latency: 80,
                packet_size: DEFAULT_SRT_PACKET_SIZE,
                rcv_buf: 2_097_152,
                ..Default::default()
            }),
            "balanced" => with_aux_env(SrtQueryOptions {
                latency: DEFAULT_SRT_LATENCY_MS,
                packet_size: DEFAULT_SRT_PACKET_SIZE,
                ..Default::default()
            }),
            "quality" => with_aux_env(SrtQueryOptions {
                latency: 400,
                packet_size: DEFAULT_SRT_PACKET_SIZE,
                max_bw: 8_000_000,
                rcv_buf: 8_388_608,
                ..Default::default()
            }),
            other => {
                tracing::warn!(profile = %other, "invalid UPLINK_SRT_PROFILE, using custom");
                custom_options_from_env()
            }
        };
        Self {
            options,
            compat_profile: env_bool("UPLINK_SRT_COMPAT_PROFILE", false),
        }
    }
}

fn custom_options_from_env() -> SrtQueryOptions {
    SrtQueryOptions {
        latency: env_i64("UPLINK_SRT_LATENCY", 0),
        packet_size: env_i64("UPLINK_SRT_PACKET_SIZE", 0),
        max_bw: env_i64("UPLINK_SRT_MAXBW", 0),
        rcv_buf: env_i64("UPLINK_SRT_RCVBUF", 0),
        passphrase: env_string("UPLINK_SRT_PASSPHRASE", "").trim().to_string(),
        pb_key_len: env_i64("UPLINK_SRT_PBKEYLEN", 0),
        peer_latency: env_i64("UPLINK_SRT_PEERLATENCY", 0),
        rcv_latency: env_i64("UPLINK_SRT_RCVLATENCY", 0),
        conn_timeout: env_i64("UPLINK_SRT_CONNTIMEO", 0),
        snd_buf: env_i64("UPLINK_SRT_SNDBUF", 0),
        input_bw: env_i64("UPLINK_SRT_INPUTBW", 0),
        ohead_bw: env_i64("UPLINK_SRT_OHEADBW", 0),
        tl_pkt_drop: env_bool("UPLINK_SRT_TLPKTDROP", false),
        extra_params: env_string("UPLINK_SRT_EXTRA_PARAMS", "").trim().to_string(),
    }
}

fn with_aux_env(mut options: SrtQueryOptions) -> SrtQueryOptions {
    options.passphrase = env_string("UPLINK_SRT_PASSPHRASE", "").trim().to_string();
    options.pb_key_len = env_i64("UPLINK_SRT_PBKEYLEN", 0);
    options
}

/// Build the ordered, deduplicated, validated candidate list
pub fn build_srt_url_candidates(
    host: &str,
    port: u16,
    path: &str,
    settings: &SrtSettings,
) -> Vec<String> {
    let (host, port, path) = match normalize_srt_inputs(host, port, path) {
        Some(v) => v,
        None => {
            tracing::warn!(host = %host, path = %path, "invalid host/path for SRT");
            return Vec::new();
        }
    };

    let mut urls = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for candidate in option_candidates(settings) {
        for srt_url in build_url_variants(&host, port, &path, &candidate) {
            if let Err(e) = validate_srt_url(&srt_url) {
                tracing::warn!(error = %e, "invalid srt url candidate");
                continue;
            }
            if seen.insert(srt_url.clone()) {
                urls.push(srt_url);
            }
        }
    }
    urls
}

/// Candidate fan-out: base, stripped, default-latency, optional compat
fn option_candidates(settings: &SrtSettings) -> Vec<SrtQueryOptions> {
    let base = with_defaults(settings.options.clone());
    let mut candidates = vec![base.clone()];

    let mut stripped = base.clone();
    stripped.peer_latency = 0;
    stripped.rcv_latency = 0;
    stripped.tl_pkt_drop = false;
    stripped.extra_params = String::new();
    if stripped != base {
        candidates.push(stripped.clone());
    }

    let mut default_latency = stripped.clone();
    default_latency.latency = DEFAULT_SRT_LATENCY_MS;
    if default_latency != stripped {
        candidates.push(default_latency.clone());
    }

    if !settings.compat_profile {
        return candidates;
    }

    let mut compat = stripped.clone();
    compat.latency = 80;
    compat.peer_latency = 500;
    compat.rcv_latency = 500;
    compat.tl_pkt_drop = true;
    if compat != base && compat != stripped && compat != default_latency {
        candidates.push(compat);
    }
    candidates
}

fn with_defaults(mut options: SrtQueryOptions) -> SrtQueryOptions {
    if options.latency == 0 {
        options.latency = DEFAULT_SRT_LATENCY_MS;
    }
    if options.packet_size == 0 {
        options.packet_size = DEFAULT_SRT_PACKET_SIZE;
    }
    options
}

fn build_url_variants(host: &str, port: u16, path: &str, options: &SrtQueryOptions) -> Vec<String> {
    let stream_id = stream_id_for_path(path);
    let query_pairs = build_query_pairs(&stream_id, options);
    let mut urls = vec![format_srt_url(host, port, &encode_query(&query_pairs))];

    if is_safe_raw_stream_id(&stream_id) {
        let mut without_stream_id = query_pairs.clone();
        without_stream_id.remove("streamid");
        let encoded = encode_query(&without_stream_id);
        let raw_query = if encoded.is_empty() {
            format!("streamid={}", stream_id)
        } else {
            format!("{}&streamid={}", encoded, stream_id)
        };
        urls.push(format_srt_url(host, port, &raw_query));
    }
    urls
}

/// Always-present keys plus conditionally-present tuned parameters
fn build_query_pairs(stream_id: &str, options: &SrtQueryOptions) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    pairs.insert("streamid".to_string(), stream_id.to_string());
    pairs.insert("mode".to_string(), "caller".to_string());
    pairs.insert("transtype".to_string(), "live".to_string());
    if options.packet_size > 0 {
        pairs.insert("pkt_size".to_string(), options.packet_size.to_string());
    }
    if options.latency > 0 {
        pairs.insert("latency".to_string(), options.latency.to_string());
    }
    if options.max_bw > 0 {
        pairs.insert("maxbw".to_string(), options.max_bw.to_string());
    }
    if options.rcv_buf > 0 {
        pairs.insert("rcvbuf".to_string(), options.rcv_buf.to_string());
    }
    if !options.passphrase.is_empty() {
        pairs.insert("passphrase".to_string(), options.passphrase.clone());
    }
    if options.pb_key_len > 0 {
        pairs.insert("pbkeylen".to_string(), options.pb_key_len.to_string());
    }
    if options.peer_latency > 0 {
        pairs.insert("peerlatency".to_string(), options.peer_latency.to_string());
    }
    if options.rcv_latency > 0 {
        pairs.insert("rcvlatency".to_string(), options.rcv_latency.to_string());
    }
    if options.conn_timeout > 0 {
        pairs.insert("conntimeo".to_string(), options.conn_timeout.to_string());
    }
    if options.snd_buf > 0 {
        pairs.insert("sndbuf".to_string(), options.snd_buf.to_string());
    }
    if options.input_bw > 0 {
        pairs.insert("inputbw".to_string(), options.input_bw.to_string());
    }
    if options.ohead_bw > 0 {
        pairs.insert("oheadbw".to_string(), options.ohead_bw.to_string());
    }
    if options.tl_pkt_drop {
        pairs.insert("tlpktdrop".to_string(), "1".to_string());
    }

    let extra = options.extra_params.trim().trim_start_matches(['?', '&']);
    if !extra.is_empty() {
        // Pre-parsed query string merged last-write-wins
        for (key, value) in url::form_urlencoded::parse(extra.as_bytes()) {
            pairs.insert(key.into_owned(), value.into_owned());
        }
    }
    pairs
}

/// Alphabetical key order, percent-encoded
fn encode_query(pairs: &BTreeMap<String, String>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn format_srt_url(host: &str, port: u16, raw_query: &str) -> String {
    format!("srt://{}:{}?{}", host, port, raw_query)
}

/// `publish:<path>`, or pass-through when the path already carries the prefix
fn stream_id_for_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with("publish:") {
        return trimmed.to_string();
    }
    format!("publish:{}", trimmed)
}

fn is_safe_raw_stream_id(stream_id: &str) -> bool {
    stream_id.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, ':' | '/' | '-' | '_' | '.' | '~')
    })
}

/// Strip scheme prefix, trailing slashes and inline port from the host;
/// fall back to the default SRT port.
fn normalize_srt_inputs(host: &str, port: u16, path: &str) -> Option<(String, u16, String)> {
    let mut host = host.trim().to_string();
    let path = path.trim().trim_matches('/').to_string();
    if host.is_empty() || path.is_empty() {
        return None;
    }

    if let Some(idx) = host.find("://") {
        host = host[idx + 3..].to_string();
    }
    if let Some(idx) = host.find('/') {
        tracing::warn!(host = %host, "host carries extra path, using authority only");
        host = host[..idx].to_string();
    }

    let mut port = port;
    let (hostname, host_port) = split_host_port(&host);
    if !hostname.is_empty() {
        host = hostname;
    }
    if port == 0 {
        port = host_port.unwrap_or(0);
    }
    if port == 0 {
        port = DEFAULT_SRT_PORT;
    }

    let host = host.trim().to_string();
    if host.is_empty() {
        return None;
    }
    Some((host, port, path))
}

fn split_host_port(host: &str) -> (String, Option<u16>) {
    match host.rsplit_once(':') {
        Some((name, port_str)) if !name.contains(':') => match port_str.trim().parse::<u16>() {
            Ok(port) if port > 0 => (name.to_string(), Some(port)),
            _ => {
                tracing::warn!(host = %host, "invalid port in host, ignoring");
                (name.to_string(), None)
            }
        },
        _ => (host.to_string(), None),
    }
}

fn validate_srt_url(raw: &str) -> crate::error::Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| crate::error::Error::UplinkInvalid(format!("parse srt url: {}", e)))?;
    if parsed.scheme() != "srt" {
        return Err(crate::error::Error::UplinkInvalid(format!(
            "srt url needs srt scheme: {}",
            raw
        )));
    }
    if parsed.host_str().unwrap_or_default().is_empty() {
        return Err(crate::error::Error::UplinkInvalid(format!(
            "srt url without host: {}",
            raw
        )));
    }
    let has_stream_id = parsed
        .query_pairs()
        .any(|(k, v)| k == "streamid" && !v.trim().is_empty());
    if !has_stream_id {
        return Err(crate::error::Error::UplinkInvalid(format!(
            "srt url without streamid: {}",
            raw
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(options: SrtQueryOptions, compat: bool) -> SrtSettings {
        SrtSettings {
            options,
            compat_profile: compat,
        }
    }

    #[test]
    fn test_candidates_have_required_query_keys() {
        let s = settings(SrtQueryOptions::default(), false);
        let urls = build_srt_url_candidates("central.local", 8890, "acme/hq/cam-001", &s);
        assert!(!urls.is_empty());
        for raw in &urls {
            let parsed = url::Url::parse(raw).unwrap();
            assert_eq!(parsed.scheme(), "srt");
            assert_eq!(parsed.host_str(), Some("central.local"));
            let query: std::collections::HashMap<String, String> = parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            assert_eq!(query.get("mode").map(String::as_str), Some("caller"));
            assert_eq!(query.get("transtype").map(String::as_str), Some("live"));
            assert_eq!(
                query.get("streamid").map(String::as_str),
                Some("publish:acme/hq/cam-001")
            );
        }
    }

    #[test]
    fn test_raw_stream_id_variant_emitted() {
        let s = settings(SrtQueryOptions::default(), false);
        let urls = build_srt_url_candidates("central.local", 0, "acme/hq/cam-001", &s);
        assert!(urls
            .iter()
            .any(|u| u.ends_with("&streamid=publish:acme/hq/cam-001")));
    }

    #[test]
    fn test_tuned_base_fans_out_stripped_and_default_latency() {
        let s = settings(
            SrtQueryOptions {
                latency: 80,
                peer_latency: 500,
                rcv_latency: 500,
                tl_pkt_drop: true,
                ..Default::default()
            },
            false,
        );
        let urls = build_srt_url_candidates("c", 8890, "p", &s);
        // base + raw, stripped + raw, default-latency + raw
        assert_eq!(urls.len(), 6);
        assert!(urls[0].contains("peerlatency=500"));
        assert!(!urls[2].contains("peerlatency"));
        assert!(urls[4].contains(&format!("latency={}", DEFAULT_SRT_LATENCY_MS)));
    }

    #[test]
    fn test_compat_profile_appends_variant() {
        let plain = settings(SrtQueryOptions::default(), false);
        let compat = settings(SrtQueryOptions::default(), true);
        let without = build_srt_url_candidates("c", 8890, "p", &plain);
        let with = build_srt_url_candidates("c", 8890, "p", &compat);
        assert!(with.len() > without.len());
        assert!(with.iter().any(|u| u.contains("tlpktdrop=1")));
    }

    #[test]
    fn test_host_normalization_strips_scheme_and_port() {
        let s = settings(SrtQueryOptions::default(), false);
        let urls = build_srt_url_candidates("srt://gateway.example.com:9000/", 0, "/p/", &s);
        assert!(urls[0].starts_with("srt://gateway.example.com:9000?"));
    }

    #[test]
    fn test_explicit_port_wins_over_host_port() {
        let s = settings(SrtQueryOptions::default(), false);
        let urls = build_srt_url_candidates("gateway:9000", 7000, "p", &s);
        assert!(urls[0].starts_with("srt://gateway:7000?"));
    }

    #[test]
    fn test_empty_host_or_path_yields_nothing() {
        let s = settings(SrtQueryOptions::default(), false);
        assert!(build_srt_url_candidates("", 8890, "p", &s).is_empty());
        assert!(build_srt_url_candidates("c", 8890, "  ", &s).is_empty());
    }

    #[test]
    fn test_publish_prefix_passthrough() {
        assert_eq!(stream_id_for_path("publish:x/y"), "publish:x/y");
        assert_eq!(stream_id_for_path("x/y"), "publish:x/y");
    }

    #[test]
    fn test_extra_params_merge_last_write_wins() {
        let s = settings(
            SrtQueryOptions {
                extra_params: "latency=999&snddropdelay=10".to_string(),
                ..Default::default()
            },
            false,
        );
        let urls = build_srt_url_candidates("c", 8890, "p", &s);
        assert!(urls[0].contains("latency=999"));
        assert!(urls[0].contains("snddropdelay=10"));
        // stripped variant drops the extras back to defaults
        assert!(urls
            .iter()
            .any(|u| u.contains(&format!("latency={}", DEFAULT_SRT_LATENCY_MS))));
    }

    #[test]
    fn test_unsafe_stream_id_has_no_raw_variant() {
        let s = settings(SrtQueryOptions::default(), false);
        let urls = build_srt_url_candidates("c", 8890, "path with space", &s);
        assert_eq!(urls.len(), 1);
    }
}
