//! Credential checking for the handshake's Auth step.
//!
//! The server issues a 32-byte random nonce; the client proves it holds the
//! pre-shared secret by returning `HMAC-SHA256(secret, nonce || node_id)`.
//! Binding the node id means a captured response cannot be replayed under a
//! different identity, and a fresh nonce per connection means it cannot be
//! replayed at all.
//!
//! Both roles are traits so the security collaborator can plug in a different
//! scheme without touching the state machine.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::protocol::CHALLENGE_NONCE_SIZE;
use crate::session::model::PeerIdentity;

type HmacSha256 = Hmac<Sha256>;

/// Server side: decides whether a response proves the credential.
pub trait Authenticator: Send + Sync {
    fn verify(&self, nonce: &[u8; CHALLENGE_NONCE_SIZE], credential: &[u8], peer: &PeerIdentity) -> bool;
}

/// Client side: answers a challenge.
pub trait CredentialSource: Send + Sync {
    fn respond(&self, nonce: &[u8; CHALLENGE_NONCE_SIZE], local: &PeerIdentity) -> Vec<u8>;
}

/// Pre-shared secret usable on both sides.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Vec<u8>,
}

impl SharedSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// `None` only if the MAC rejects the key, which HMAC never does.
    fn mac(&self, nonce: &[u8], peer: &PeerIdentity) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(nonce);
        mac.update(peer.node_id.as_bytes());
        Some(mac)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl Authenticator for SharedSecret {
    fn verify(&self, nonce: &[u8; CHALLENGE_NONCE_SIZE], credential: &[u8], peer: &PeerIdentity) -> bool {
        // `verify_slice` compares in constant time.
        self.mac(nonce, peer)
            .is_some_and(|mac| mac.verify_slice(credential).is_ok())
    }
}

impl CredentialSource for SharedSecret {
    fn respond(&self, nonce: &[u8; CHALLENGE_NONCE_SIZE], local: &PeerIdentity) -> Vec<u8> {
        self.mac(nonce, local)
            .map(|mac| mac.finalize().into_bytes().to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer() -> PeerIdentity {
        PeerIdentity {
            node_id: Uuid::new_v4(),
            name: "desk".to_string(),
            capabilities: 0,
        }
    }

    #[test]
    fn test_matching_secret_is_accepted() {
        // Arrange
        let secret = SharedSecret::new("correct horse");
        let nonce = [3u8; 32];
        let who = peer();

        // Act
        let credential = secret.respond(&nonce, &who);

        // Assert
        assert_eq!(credential.len(), 32);
        assert!(secret.verify(&nonce, &credential, &who));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let nonce = [3u8; 32];
        let who = peer();
        let credential = SharedSecret::new("guess").respond(&nonce, &who);
        assert!(!SharedSecret::new("correct horse").verify(&nonce, &credential, &who));
    }

    #[test]
    fn test_response_is_bound_to_nonce_and_identity() {
        let secret = SharedSecret::new("s");
        let who = peer();
        let credential = secret.respond(&[1u8; 32], &who);

        assert!(!secret.verify(&[2u8; 32], &credential, &who));
        assert!(!secret.verify(&[1u8; 32], &credential, &peer()));
    }

    #[test]
    fn test_empty_secret_still_produces_a_full_credential() {
        // Arrange
        let secret = SharedSecret::new("");
        let nonce = [9u8; 32];
        let who = peer();

        // Act
        let credential = secret.respond(&nonce, &who);

        // Assert
        assert_eq!(credential.len(), 32);
        assert!(secret.verify(&nonce, &credential, &who));
    }

    #[test]
    fn test_empty_credential_is_rejected() {
        let secret = SharedSecret::new("s");
        assert!(!secret.verify(&[1u8; 32], &[], &peer()));
    }

    #[test]
    fn test_debug_output_hides_secret() {
        assert_eq!(format!("{:?}", SharedSecret::new("hunter2")), "SharedSecret(..)");
    }
}
