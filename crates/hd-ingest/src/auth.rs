//! Static bearer-key authentication.
//!
//! The key comparison is constant-time to defeat timing attacks.

use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct ApiKeyAuth {
    api_key: Option<String>,
}

impl ApiKeyAuth {
    /// An empty key disables authentication (dev mode only).
    pub fn new(api_key: &str) -> Self {
        let api_key = if api_key.is_empty() {
            None
        } else {
            Some(api_key.to_string())
        };
        Self { api_key }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Verify an `Authorization` header value.
    pub fn verify(&self, authorization: Option<&str>) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };

        let Some(value) = authorization else {
            return false;
        };

        let token = value.strip_prefix("Bearer ").unwrap_or("");
        token.as_bytes().ct_eq(expected.as_bytes()).into()
    }
}
