//! Server-to-server authorization for internal endpoints.
//!
//! Callers present a pre-shared key in `x-internal-key`. Two keys may be
//! configured at once so that a new key can be rolled out before the old one
//! is retired. Requests that carry a browser `Origin` header are refused
//! outright.

use axum::http::HeaderMap;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::ServiceError;

pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

#[derive(Clone, Default)]
pub struct InternalCredentials {
    keys: Vec<String>,
}

impl std::fmt::Debug for InternalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalCredentials")
            .field("configured_keys", &self.keys.len())
            .finish()
    }
}

impl InternalCredentials {
    pub fn new(current: Option<String>, next: Option<String>) -> Self {
        let keys = [current, next]
            .into_iter()
            .flatten()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keys }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.internal_admin_key.clone(),
            config.internal_admin_key_next.clone(),
        )
    }

    pub fn is_configured(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Accepts the presented key if it matches any configured key.
    pub fn accepts(&self, presented: &str) -> bool {
        // every key is compared so timing does not reveal which slot matched
        self.keys
            .iter()
            .fold(false, |acc, key| constant_time_eq(key, presented) | acc)
    }

    /// Full gate for internal endpoints: no browser origin, valid key.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), ServiceError> {
        if headers.contains_key(axum::http::header::ORIGIN) {
            warn!("Rejected internal call carrying a browser Origin header");
            return Err(ServiceError::Forbidden(
                "browser-originated requests are not allowed".to_string(),
            ));
        }

        let presented = headers
            .get(INTERNAL_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if presented.is_empty() || !self.accepts(presented) {
            warn!("Rejected internal call with missing or invalid key");
            return Err(ServiceError::Unauthorized(
                "invalid internal credential".to_string(),
            ));
        }

        Ok(())
    }
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    fn headers(key: Option<&'static str>, origin: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = key {
            headers.insert(INTERNAL_KEY_HEADER, HeaderValue::from_static(key));
        }
        if let Some(origin) = origin {
            headers.insert("origin", HeaderValue::from_static(origin));
        }
        headers
    }

    #[test]
    fn accepts_either_rotation_key() {
        let creds = InternalCredentials::new(Some("current".into()), Some("next".into()));
        assert!(creds.authorize(&headers(Some("current"), None)).is_ok());
        assert!(creds.authorize(&headers(Some("next"), None)).is_ok());
        assert_matches!(
            creds.authorize(&headers(Some("stale"), None)),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn missing_key_is_unauthorized() {
        let creds = InternalCredentials::new(Some("current".into()), None);
        assert_matches!(
            creds.authorize(&headers(None, None)),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn browser_origin_is_forbidden_even_with_valid_key() {
        let creds = InternalCredentials::new(Some("current".into()), None);
        assert_matches!(
            creds.authorize(&headers(Some("current"), Some("https://shop.example"))),
            Err(ServiceError::Forbidden(_))
        );
    }

    #[test]
    fn blank_keys_are_ignored() {
        let creds = InternalCredentials::new(Some("   ".into()), None);
        assert!(!creds.is_configured());
        assert!(!creds.accepts(""));
    }

    #[test]
    fn constant_time_eq_compares_exactly() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
