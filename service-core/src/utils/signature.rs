use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`.
pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex HMAC-SHA256 signature using constant-time comparison.
///
/// Never errors: a malformed key or signature simply fails verification.
pub fn verify_hex_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let Ok(expected_signature) = hmac_sha256_hex(secret, payload) else {
        return false;
    };

    // Constant time comparison
    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = signature.trim().to_ascii_lowercase();
    let signature_bytes = signature_bytes.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(signature_bytes).into()
}
