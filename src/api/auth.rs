//! Bearer-secret gates for the HTTP surface
//!
//! Tokens are opaque shared secrets compared in constant time against
//! server configuration. An unconfigured token closes its surface.

use crate::error::{Error, Result};
use axum::http::HeaderMap;
use constant_time_eq::constant_time_eq;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const CRON_KEY_HEADER: &str = "x-cron-key";
pub const VERIFIER_KEY_HEADER: &str = "x-verifier-key";
pub const NODE_KEY_HEADER: &str = "x-node-key";

/// Require `header` to match the configured secret exactly.
pub fn require_key(headers: &HeaderMap, header: &str, expected: &Option<String>) -> Result<()> {
    let expected = expected
        .as_ref()
        .ok_or_else(|| Error::Auth(format!("{} surface not configured", header)))?;

    let provided = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Auth(format!("missing {}", header)))?;

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(Error::Auth(format!("invalid {}", header)));
    }
    Ok(())
}

/// Like `require_key`, but an unconfigured secret leaves the surface open
/// (the node key is optional hardening in front of signature checks).
pub fn require_key_if_configured(
    headers: &HeaderMap,
    header: &str,
    expected: &Option<String>,
) -> Result<()> {
    if expected.is_none() {
        return Ok(());
    }
    require_key(headers, header, expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(header: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_matching_key_passes() {
        let headers = headers_with(API_KEY_HEADER, "secret");
        assert!(require_key(&headers, API_KEY_HEADER, &Some("secret".into())).is_ok());
    }

    #[test]
    fn test_wrong_or_missing_key_fails() {
        let headers = headers_with(API_KEY_HEADER, "nope");
        assert!(require_key(&headers, API_KEY_HEADER, &Some("secret".into())).is_err());
        assert!(require_key(&HeaderMap::new(), API_KEY_HEADER, &Some("secret".into())).is_err());
    }

    #[test]
    fn test_unconfigured_key_closes_surface() {
        let headers = headers_with(API_KEY_HEADER, "anything");
        assert!(require_key(&headers, API_KEY_HEADER, &None).is_err());
    }

    #[test]
    fn test_optional_gate_open_when_unset() {
        assert!(require_key_if_configured(&HeaderMap::new(), NODE_KEY_HEADER, &None).is_ok());
        assert!(
            require_key_if_configured(&HeaderMap::new(), NODE_KEY_HEADER, &Some("k".into()))
                .is_err()
        );
    }
}
