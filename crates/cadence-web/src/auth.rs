//! Request authentication
//!
//! Cron endpoints accept a shared secret header or a service-role bearer.
//! Telephony webhooks accept either the proxy signature (`v1:` scheme over
//! the raw body) or the provider's native signature (over a pipe-joined base
//! string). All signature checks are constant-time via `Mac::verify_slice`;
//! all timestamps must be within the anti-replay skew.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew a webhook timestamp may carry.
pub const MAX_TIMESTAMP_SKEW_MINUTES: i64 = 10;

/// Static auth material, read from env at startup.
#[derive(Clone, Default)]
pub struct AuthConfig {
    /// Shared secret for `X-Cron-Secret`.
    pub cron_secret: Option<String>,
    /// Service-role bearer token.
    pub service_token: Option<String>,
    /// Secret for the proxy `v1:` body signature.
    pub proxy_secret: Option<String>,
    /// Secret for the provider-native signature.
    pub provider_secret: Option<String>,
    /// Public URL of the webhook endpoint, part of the native base string.
    pub webhook_url: String,
}

/// Whether a cron request is authorized.
pub fn verify_cron(headers: &HeaderMap, config: &AuthConfig) -> bool {
    if let (Some(expected), Some(got)) = (
        config.cron_secret.as_deref(),
        headers.get("x-cron-secret").and_then(|v| v.to_str().ok()),
    ) {
        if constant_time_eq(expected.as_bytes(), got.as_bytes()) {
            return true;
        }
    }
    has_service_bearer(headers, config)
}

/// Whether the request carries the service-role bearer.
pub fn has_service_bearer(headers: &HeaderMap, config: &AuthConfig) -> bool {
    match (
        config.service_token.as_deref(),
        headers.get("authorization").and_then(|v| v.to_str().ok()),
    ) {
        (Some(expected), Some(got)) => got
            .strip_prefix("Bearer ")
            .map(|token| constant_time_eq(expected.as_bytes(), token.as_bytes()))
            .unwrap_or(false),
        _ => false,
    }
}

/// Unix-seconds timestamp within the allowed skew of `now`.
pub fn timestamp_fresh(ts_secs: i64, now: DateTime<Utc>) -> bool {
    match Utc.timestamp_opt(ts_secs, 0).single() {
        Some(ts) => (now - ts).abs() <= Duration::minutes(MAX_TIMESTAMP_SKEW_MINUTES),
        None => false,
    }
}

/// Proxy scheme: `HMAC-SHA256(secret, "v1:" || ts || ":" || body)`, sent as
/// `v1=<hex>`.
pub fn verify_proxy_signature(secret: &str, timestamp: &str, body: &[u8], header: &str) -> bool {
    let hex_sig = match header.strip_prefix("v1=") {
        Some(sig) => sig,
        None => {
            warn!("Proxy signature missing v1= prefix");
            return false;
        }
    };
    let expected = match hex::decode(hex_sig) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(b"v1:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Provider-native scheme: `HMAC-SHA256(secret, secret|urlencode(url)|type|ts)`
/// in hex. Version v1 only.
pub fn verify_provider_signature(
    secret: &str,
    webhook_url: &str,
    event_type: &str,
    timestamp: &str,
    signature_hex: &str,
) -> bool {
    let expected = match hex::decode(signature_hex) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let base = format!(
        "{}|{}|{}|{}",
        secret,
        urlencoding::encode(webhook_url),
        event_type,
        timestamp
    );
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(base.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    // Reuse the MAC machinery so the comparison cost is data-independent
    let mut mac = match HmacSha256::new_from_slice(b"cadence-auth-compare") {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(a);
    let a_tag = mac.finalize().into_bytes();

    let mut mac = match HmacSha256::new_from_slice(b"cadence-auth-compare") {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(b);
    mac.verify_slice(&a_tag).is_ok()
}

/// Test helper mirrored by real proxies: sign a body the way we verify it.
pub fn sign_proxy_body(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(b"v1:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Test helper: produce a provider-native signature.
pub fn sign_provider(secret: &str, webhook_url: &str, event_type: &str, timestamp: &str) -> String {
    let base = format!(
        "{}|{}|{}|{}",
        secret,
        urlencoding::encode(webhook_url),
        event_type,
        timestamp
    );
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(base.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_proxy_signature_round_trip() {
        let body = br#"{"type":"call_completed"}"#;
        let sig = sign_proxy_body("topsecret", "1748952000", body);
        assert!(verify_proxy_signature("topsecret", "1748952000", body, &sig));
        assert!(!verify_proxy_signature("wrong", "1748952000", body, &sig));
        assert!(!verify_proxy_signature("topsecret", "1748952001", body, &sig));
        assert!(!verify_proxy_signature("topsecret", "1748952000", b"tampered", &sig));
    }

    #[test]
    fn test_proxy_signature_requires_prefix() {
        let body = b"x";
        let sig = sign_proxy_body("s", "1", body);
        let bare = sig.strip_prefix("v1=").unwrap();
        assert!(!verify_proxy_signature("s", "1", body, bare));
    }

    #[test]
    fn test_provider_signature_round_trip() {
        let url = "https://hooks.example.com/webhook?token=abc";
        let sig = sign_provider("psecret", url, "call_completed", "1748952000");
        assert!(verify_provider_signature("psecret", url, "call_completed", "1748952000", &sig));
        assert!(!verify_provider_signature("psecret", url, "sms_received", "1748952000", &sig));
        assert!(!verify_provider_signature(
            "psecret",
            "https://elsewhere.example.com",
            "call_completed",
            "1748952000",
            &sig
        ));
    }

    #[test]
    fn test_timestamp_skew_window() {
        let fresh = now().timestamp() - 60;
        let stale = now().timestamp() - 15 * 60;
        let future_ok = now().timestamp() + 5 * 60;
        let future_bad = now().timestamp() + 15 * 60;
        assert!(timestamp_fresh(fresh, now()));
        assert!(!timestamp_fresh(stale, now()));
        assert!(timestamp_fresh(future_ok, now()));
        assert!(!timestamp_fresh(future_bad, now()));
    }

    #[test]
    fn test_cron_auth_secret_or_bearer() {
        let config = AuthConfig {
            cron_secret: Some("cron-s".to_string()),
            service_token: Some("svc-t".to_string()),
            ..Default::default()
        };

        let mut headers = HeaderMap::new();
        assert!(!verify_cron(&headers, &config));

        headers.insert("x-cron-secret", HeaderValue::from_static("cron-s"));
        assert!(verify_cron(&headers, &config));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer svc-t"));
        assert!(verify_cron(&headers, &config));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert!(!verify_cron(&headers, &config));
    }
}
