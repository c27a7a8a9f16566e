//! Secret and token generation for DeskBridge.
//!
//! Transport encryption is the transport's business; this module only mints
//! the values the session protocol exchanges:
//!
//! - numeric session secrets shown to the host user
//! - handover tokens (URL-safe base64 of 24 random bytes)
//! - constant-time comparison for credential checks

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;

/// Number of random bytes in a handover token.
pub const HANDOVER_TOKEN_BYTES: usize = 24;

/// Constant-time comparison of two byte slices.
///
/// Returns `true` if the slices are equal, `false` otherwise.
/// This function takes the same amount of time regardless of where
/// the first difference occurs, preventing timing attacks.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;

    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a numeric secret of `len` digits.
///
/// The first digit is never zero so the secret survives being typed into
/// numeric fields.
#[must_use]
pub fn generate_numeric_secret(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len.max(1))
        .map(|i| {
            let low = u8::from(i == 0);
            char::from(b'0' + rng.gen_range(low..=9))
        })
        .collect()
}

/// Generate a fresh single-use handover token.
#[must_use]
pub fn generate_handover_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<HANDOVER_TOKEN_BYTES>())
}
