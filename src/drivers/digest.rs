//! HTTP digest authentication
//!
//! Vendor cameras answer the first unauthenticated request with a 401 and a
//! `WWW-Authenticate: Digest ...` challenge. We parse realm/nonce/qop, compute
//! the MD5 response with a fresh client nonce and `nc=00000001`, and retry the
//! request exactly once.

use crate::error::{Error, Result};
use md5::{Digest, Md5};
use rand::RngCore;
use reqwest::{Client, Method, Response, StatusCode};

/// Parsed digest challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
}

/// Issue `method url`, answering one digest challenge if the device sends one.
pub async fn request_with_digest(
    client: &Client,
    method: Method,
    url: &str,
    username: &str,
    password: &str,
    content_type: Option<&str>,
    body: Option<Vec<u8>>,
) -> Result<Response> {
    let mut request = client.request(method.clone(), url);
    if let Some(ct) = content_type {
        request = request.header("Content-Type", ct);
    }
    request = request.header("Connection", "keep-alive");
    if let Some(ref b) = body {
        request = request.body(b.clone());
    }

    let response = request.send().await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return Ok(response);
    }

    let challenge_header = response
        .headers()
        .get("WWW-Authenticate")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    drop(response);

    let challenge = parse_digest_challenge(&challenge_header)?;
    let uri = request_uri(url)?;
    let authorization = digest_authorization(&challenge, &method, &uri, username, password);

    let mut retry = client.request(method, url);
    if let Some(ct) = content_type {
        retry = retry.header("Content-Type", ct);
    }
    retry = retry
        .header("Connection", "keep-alive")
        .header("Authorization", authorization);
    if let Some(b) = body {
        retry = retry.body(b);
    }
    retry.send().await.map_err(Error::Http)
}

/// Path + query portion of the URL, as sent on the request line
fn request_uri(raw_url: &str) -> Result<String> {
    let parsed = url::Url::parse(raw_url)
        .map_err(|e| Error::Device(format!("invalid device url {}: {}", raw_url, e)))?;
    let mut uri = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        uri.push('?');
        uri.push_str(query);
    }
    Ok(uri)
}

/// Parse `Digest key="value", ...`; realm and nonce are required, qop
/// defaults to `auth`.
pub fn parse_digest_challenge(header: &str) -> Result<DigestChallenge> {
    let lower = header.to_lowercase();
    if !lower.starts_with("digest ") {
        return Err(Error::Device(format!(
            "WWW-Authenticate is not Digest: {}",
            header
        )));
    }

    let mut challenge = DigestChallenge {
        realm: String::new(),
        nonce: String::new(),
        qop: String::new(),
    };

    let rest = header["Digest ".len()..].trim();
    for pair in split_challenge_pairs(rest) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_lowercase().as_str() {
            "realm" => challenge.realm = value,
            "nonce" => challenge.nonce = value,
            "qop" => challenge.qop = value,
            _ => {}
        }
    }

    if challenge.realm.is_empty() || challenge.nonce.is_empty() {
        return Err(Error::Device(format!(
            "realm/nonce missing in WWW-Authenticate: {}",
            header
        )));
    }
    if challenge.qop.is_empty() {
        challenge.qop = "auth".to_string();
    }
    Ok(challenge)
}

/// Split on commas outside quoted values
fn split_challenge_pairs(input: &str) -> Vec<String> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    pairs.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        pairs.push(current.trim().to_string());
    }
    pairs
}

/// Build the `Authorization: Digest ...` header value
pub fn digest_authorization(
    challenge: &DigestChallenge,
    method: &Method,
    uri: &str,
    username: &str,
    password: &str,
) -> String {
    let nc = "00000001";
    let cnonce = random_hex(16);

    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));
    let response = md5_hex(&format!(
        "{}:{}:{}:{}:{}:{}",
        ha1, challenge.nonce, nc, cnonce, challenge.qop, ha2
    ));

    format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm=MD5, response=\"{}\", qop={}, nc={}, cnonce=\"{}\"",
        username, challenge.realm, challenge.nonce, uri, response, challenge.qop, nc, cnonce
    )
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_digest_challenge(
            r#"Digest realm="IP Camera(12345)", nonce="abcdef0123456789", qop="auth""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "IP Camera(12345)");
        assert_eq!(challenge.nonce, "abcdef0123456789");
        assert_eq!(challenge.qop, "auth");
    }

    #[test]
    fn test_parse_challenge_qop_default() {
        let challenge =
            parse_digest_challenge(r#"Digest realm="cam", nonce="n1""#).unwrap();
        assert_eq!(challenge.qop, "auth");
    }

    #[test]
    fn test_parse_challenge_rejects_basic() {
        assert!(parse_digest_challenge(r#"Basic realm="cam""#).is_err());
    }

    #[test]
    fn test_parse_challenge_requires_nonce() {
        assert!(parse_digest_challenge(r#"Digest realm="cam""#).is_err());
    }

    #[test]
    fn test_md5_hex_known_vector() {
        // RFC 2617 example HA1: Mufasa:testrealm@host.com:Circle Of Life
        assert_eq!(
            md5_hex("Mufasa:testrealm@host.com:Circle Of Life"),
            "939e7578ed9e3c518a452acee763bce9"
        );
    }

    #[test]
    fn test_authorization_contains_required_fields() {
        let challenge = DigestChallenge {
            realm: "cam".to_string(),
            nonce: "n1".to_string(),
            qop: "auth".to_string(),
        };
        let header =
            digest_authorization(&challenge, &Method::GET, "/cgi-bin/snapshot.cgi", "u", "p");
        assert!(header.starts_with("Digest username=\"u\""));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains("algorithm=MD5"));
        assert!(header.contains("uri=\"/cgi-bin/snapshot.cgi\""));
    }
}
