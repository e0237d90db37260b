//! WireGuard key helpers
//!
//! Keys travel through configuration as Base64 strings; these helpers decode
//! them into the x25519 types boringtun consumes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::RngCore;

use crate::error::InterceptError;

/// Generate a new random private key
///
/// # Example
///
/// ```
/// use wg_intercept::tunnel::generate_private_key;
///
/// let private_key = generate_private_key();
/// assert_eq!(private_key.len(), 44);
/// assert!(private_key.ends_with('='));
/// ```
pub fn generate_private_key() -> String {
    let mut rng = rand::thread_rng();
    let mut key_bytes = [0u8; 32];
    rng.fill_bytes(&mut key_bytes);

    // StaticSecret handles clamping
    let secret = StaticSecret::from(key_bytes);
    BASE64.encode(secret.as_bytes())
}

/// Derive the Base64 public key for a Base64 private key
///
/// # Errors
///
/// Returns `InterceptError::Key` if the private key is not 32 bytes of Base64.
///
/// # Example
///
/// ```
/// use wg_intercept::tunnel::{derive_public_key, generate_private_key};
///
/// let private_key = generate_private_key();
/// let public_key = derive_public_key(&private_key).unwrap();
/// assert_eq!(public_key.len(), 44);
/// ```
pub fn derive_public_key(private_key: &str) -> Result<String, InterceptError> {
    let secret = decode_private_key(private_key)?;
    let public = PublicKey::from(&secret);
    Ok(BASE64.encode(public.as_bytes()))
}

/// Check that a key is valid Base64 and decodes to exactly 32 bytes
pub fn validate_key(key: &str) -> bool {
    BASE64
        .decode(key)
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

fn decode_32(key: &str, what: &str) -> Result<[u8; 32], InterceptError> {
    let bytes = BASE64
        .decode(key)
        .map_err(|e| InterceptError::Key(format!("Invalid {what} Base64: {e}")))?;

    bytes.as_slice().try_into().map_err(|_| {
        InterceptError::Key(format!("{what} must be 32 bytes, got {}", bytes.len()))
    })
}

/// Decode a Base64-encoded private key to `StaticSecret`
pub(crate) fn decode_private_key(key: &str) -> Result<StaticSecret, InterceptError> {
    decode_32(key, "private key").map(StaticSecret::from)
}

/// Decode a Base64-encoded public key to `PublicKey`
pub(crate) fn decode_public_key(key: &str) -> Result<PublicKey, InterceptError> {
    decode_32(key, "public key").map(PublicKey::from)
}

/// Decode a Base64-encoded pre-shared key
pub(crate) fn decode_preshared_key(key: &str) -> Result<[u8; 32], InterceptError> {
    decode_32(key, "pre-shared key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_private_key() {
        let key = generate_private_key();
        assert_eq!(key.len(), 44);
        assert!(validate_key(&key));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_private_key(), generate_private_key());
    }

    #[test]
    fn test_derive_public_key_is_deterministic() {
        let private_key = generate_private_key();
        let a = derive_public_key(&private_key).unwrap();
        let b = derive_public_key(&private_key).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, private_key);
    }

    #[test]
    fn test_validate_key() {
        assert!(!validate_key("invalid"));
        assert!(!validate_key(""));
        // 16 bytes of Base64
        assert!(!validate_key("AAAAAAAAAAAAAAAAAAAAAA=="));
    }

    #[test]
    fn test_decode_wrong_length() {
        let err = decode_public_key("AAAAAAAAAAAAAAAAAAAAAA==").unwrap_err();
        assert!(matches!(err, InterceptError::Key(msg) if msg.contains("32 bytes")));
    }

    #[test]
    fn test_decode_preshared_key() {
        let psk = BASE64.encode([7u8; 32]);
        assert_eq!(decode_preshared_key(&psk).unwrap(), [7u8; 32]);
    }
}
