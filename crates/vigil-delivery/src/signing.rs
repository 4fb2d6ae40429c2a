//! HMAC-SHA256 webhook signatures.
//!
//! Outbound webhook bodies are signed with the subscription's secret and
//! the signature is sent as `X-Vigil-Signature: sha256=<hex>`. Receivers
//! recompute the HMAC over the raw body to authenticate the request.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
///
/// # Errors
///
/// Returns `Configuration` if the secret is empty.
pub fn hmac_hex(body: &[u8], secret: &str) -> Result<String> {
    if secret.is_empty() {
        return Err(DeliveryError::configuration("webhook secret is empty"));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::configuration(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signature header value for `body`.
///
/// # Errors
///
/// Returns `Configuration` if the secret is empty.
pub fn sign_payload(body: &[u8], secret: &str) -> Result<String> {
    Ok(format!("{SIGNATURE_PREFIX}{}", hmac_hex(body, secret)?))
}

/// Checks a `sha256=<hex>` header against `body` in constant time.
pub fn verify_signature(body: &[u8], header: &str, secret: &str) -> bool {
    let Some(hex_signature) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}
