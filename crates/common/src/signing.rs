//! HMAC-SHA256 request signing.
//!
//! The canonical string is built from fixed, ordered fields joined by `\n`:
//! agent id, customer id (game-service requests only), upper-cased HTTP method,
//! request path (no query string) and unix timestamp (timestamped requests
//! only). The signature is the lowercase hex HMAC of that string keyed with the
//! agent's shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the claimed agent id.
pub const AGENT_ID_HEADER: &str = "x-agent-id";
/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "x-agent-signature";
/// Header carrying the unix timestamp (seconds) the request was signed at.
pub const TIMESTAMP_HEADER: &str = "x-agent-timestamp";
/// Header carrying the customer id for game-service requests.
pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";

/// Fields covered by a request signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningInput<'a> {
    /// Agent the request is made by or for.
    pub agent_id: &'a str,
    /// Customer id, only present for game-service requests.
    pub customer_id: Option<&'a str>,
    /// HTTP method.
    pub method: &'a str,
    /// Request path without query string.
    pub path: &'a str,
    /// Unix timestamp in seconds, only present for timestamped requests.
    pub timestamp: Option<i64>,
}

impl SigningInput<'_> {
    /// Build the newline-joined canonical string.
    pub fn canonical_string(&self) -> String {
        let method = self.method.to_ascii_uppercase();
        let timestamp = self.timestamp.map(|ts| ts.to_string());
        let mut parts: Vec<&str> = Vec::with_capacity(5);
        parts.push(self.agent_id);
        if let Some(customer_id) = self.customer_id {
            parts.push(customer_id);
        }
        parts.push(&method);
        parts.push(self.path);
        if let Some(ts) = timestamp.as_deref() {
            parts.push(ts);
        }
        parts.join("\n")
    }
}

/// Raw HMAC-SHA256 of the canonical string.
pub fn signature_bytes(secret: &[u8], input: &SigningInput<'_>) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts keys of any length");
    mac.update(input.canonical_string().as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Hex encoded signature for the given input.
pub fn sign(secret: &[u8], input: &SigningInput<'_>) -> String {
    hex::encode(signature_bytes(secret, input))
}
