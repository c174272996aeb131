//! GitHub webhook signature verification (`X-Hub-Signature-256`).

use hmac::{Hmac, Mac};
use log::warn;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "sha256=";

/// Expected header value for `payload` under `secret`, or `None` if the key is rejected.
pub fn sign(payload: &[u8], secret: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(format!("{}{}", SCHEME, hex::encode(mac.finalize().into_bytes())))
}

/// Checks `provided_signature` against the HMAC-SHA256 of `payload`.
///
/// Never errors: an empty signature, an empty secret or any computation failure
/// all count as a mismatch. The comparison runs in constant time over the
/// expected digest.
pub fn verify(payload: &[u8], provided_signature: &str, secret: &str) -> bool {
    if provided_signature.is_empty() || secret.is_empty() {
        return false;
    }
    let Some(expected) = sign(payload, secret) else {
        warn!("Webhook secret rejected by HMAC key setup");
        return false;
    };
    let expected = expected.as_bytes();
    let provided = provided_signature.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}
