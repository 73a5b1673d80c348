//! Peer credential signing
//!
//! Peers authenticate to one another with a credential derived from the
//! node name and a cluster-wide shared secret: an HMAC-SHA256 signature,
//! hex encoded. No per-peer certificates are involved; any process that
//! holds the shared secret can mint a valid credential for its own name.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Error types for credential operations
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),

    #[error("empty shared secret")]
    EmptySecret,
}

/// Result type for credential operations
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Signs a node name with the cluster shared secret.
///
/// Returns the hex-encoded HMAC-SHA256 signature that accompanies the node
/// name in the authentication handshake.
pub fn sign_node_name(shared_secret: &str, node_name: &str) -> CredentialResult<String> {
    if shared_secret.is_empty() {
        return Err(CredentialError::EmptySecret);
    }

    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(shared_secret.as_bytes())
        .map_err(|e| CredentialError::InvalidEncoding(e.to_string()))?;
    mac.update(node_name.as_bytes());

    Ok(const_hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a hex-encoded credential signature for a node name.
///
/// Returns `true` only when the signature decodes and matches the expected
/// HMAC (constant-time comparison via the hmac crate).
pub fn verify_node_name(shared_secret: &str, node_name: &str, signature: &str) -> bool {
    let Ok(raw) = const_hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(shared_secret.as_bytes()) else {
        return false;
    };
    mac.update(node_name.as_bytes());

    mac.verify_slice(&raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signature = sign_node_name("super-secret", "alpha").unwrap();
        assert!(verify_node_name("super-secret", "alpha", &signature));
    }

    #[test]
    fn test_verify_wrong_secret() {
        let signature = sign_node_name("super-secret", "alpha").unwrap();
        assert!(!verify_node_name("other-secret", "alpha", &signature));
    }

    #[test]
    fn test_verify_wrong_node() {
        let signature = sign_node_name("super-secret", "alpha").unwrap();
        assert!(!verify_node_name("super-secret", "beta", &signature));
    }

    #[test]
    fn test_verify_garbage_signature() {
        assert!(!verify_node_name("super-secret", "alpha", "not-hex!"));
        assert!(!verify_node_name("super-secret", "alpha", "deadbeef"));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            sign_node_name("", "alpha"),
            Err(CredentialError::EmptySecret)
        ));
    }

    #[test]
    fn test_signature_is_stable() {
        let a = sign_node_name("s3cret", "gamma").unwrap();
        let b = sign_node_name("s3cret", "gamma").unwrap();
        assert_eq!(a, b);
    }
}
