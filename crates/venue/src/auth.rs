use std::sync::Arc;

use bxconnect_core::{CredentialsConfig, Error, Result, SynchronizedClock};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::request::{RestRequest, SignedRequest};

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-API-KEY";
pub const TIMESTAMP_HEADER: &str = "X-TIMESTAMP";
pub const SIGNATURE_HEADER: &str = "X-SIGNATURE";

/// Path signed for the user-stream login message.
const STREAM_LOGIN_PATH: &str = "/users/self/verify";

#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(c: &CredentialsConfig) -> Self {
        Self {
            api_key: c.api_key.clone(),
            api_secret: c.api_secret.clone(),
        }
    }
}

/// Produces HMAC-SHA256 request signatures.
///
/// Signing is a pure function of credentials, timestamp and request. The
/// timestamp comes from the [`SynchronizedClock`] so requests stay inside the
/// venue's receive window even when the local clock drifts.
#[derive(Debug, Clone)]
pub struct Authenticator {
    credentials: Credentials,
    clock: Arc<SynchronizedClock>,
}

impl Authenticator {
    pub fn new(credentials: Credentials, clock: Arc<SynchronizedClock>) -> Result<Self> {
        if credentials.api_key.trim().is_empty() {
            return Err(Error::AuthConfig("API key is empty".into()));
        }
        if credentials.api_secret.trim().is_empty() {
            return Err(Error::AuthConfig("API secret is empty".into()));
        }
        if credentials.api_key.chars().any(char::is_whitespace) {
            return Err(Error::AuthConfig("API key contains whitespace".into()));
        }
        Ok(Self { credentials, clock })
    }

    pub fn api_key(&self) -> &str {
        &self.credentials.api_key
    }

    pub fn clock(&self) -> &Arc<SynchronizedClock> {
        &self.clock
    }

    /// Sign `request` as of `timestamp_ms` (venue time).
    ///
    /// Payload: `timestamp || METHOD || path[?query] || body`.
    pub fn sign(&self, request: &RestRequest, timestamp_ms: i64) -> Result<SignedRequest> {
        let payload = format!(
            "{}{}{}{}",
            timestamp_ms,
            request.method.as_str(),
            request.path_and_query(),
            request.body_string()
        );
        let signature = self.signature(&payload)?;

        Ok(SignedRequest {
            request: request.clone(),
            headers: vec![
                (API_KEY_HEADER.to_string(), self.credentials.api_key.clone()),
                (TIMESTAMP_HEADER.to_string(), timestamp_ms.to_string()),
                (SIGNATURE_HEADER.to_string(), signature),
            ],
        })
    }

    /// Sign with the current synchronized time.
    pub fn sign_now(&self, request: &RestRequest) -> Result<SignedRequest> {
        self.sign(request, self.clock.now_ms())
    }

    /// Login message for the authenticated user stream, as of `timestamp_ms`.
    pub fn stream_login(&self, timestamp_ms: i64) -> Result<Value> {
        let payload = format!("{timestamp_ms}GET{STREAM_LOGIN_PATH}");
        let signature = self.signature(&payload)?;
        Ok(json!({
            "op": "login",
            "args": {
                "api_key": self.credentials.api_key,
                "timestamp": timestamp_ms.to_string(),
                "signature": signature,
            }
        }))
    }

    fn signature(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| Error::AuthConfig(format!("HMAC init failed: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
