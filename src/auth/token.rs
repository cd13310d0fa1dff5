//! Signed IO tokens.
//!
//! A token binds one client to one operation on one chunk of one volume for
//! [`TOKEN_TTL`]. The authority signs tokens with the cluster secret and
//! storage nodes verify them with the same secret, so no call back to the
//! authority is needed on the data path.

use crate::config::MIN_SECRET_LENGTH;
use crate::error::{FlexError, Result};
use crate::types::{now_millis, ChunkId, ClientId, IoOperation, VolumeId, TOKEN_TTL};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock skew for tokens issued "in the future".
const MAX_CLOCK_SKEW_MS: u64 = 5_000;

/// A signed, time-limited IO capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoToken {
    pub volume_id: VolumeId,
    pub chunk_id: ChunkId,
    pub client_id: ClientId,
    pub operation: IoOperation,
    /// Issue time, milliseconds since the Unix epoch.
    pub issued_at_ms: u64,
    /// Base64 (URL-safe, unpadded) HMAC-SHA256 over the other fields.
    pub signature: String,
}

impl IoToken {
    fn signing_input(
        volume_id: VolumeId,
        chunk_id: ChunkId,
        client_id: ClientId,
        operation: IoOperation,
        issued_at_ms: u64,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            volume_id, chunk_id, client_id, operation, issued_at_ms
        )
    }

    /// Milliseconds since the epoch at which this token stops being accepted.
    pub fn expires_at_ms(&self, ttl: Duration) -> u64 {
        self.issued_at_ms.saturating_add(ttl.as_millis() as u64)
    }
}

/// Signs and verifies IO tokens with a shared secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Create a signer. The secret must not be empty.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(FlexError::InvalidConfig {
                field: "security.token_secret".to_string(),
                reason: "Token secret must not be empty".to_string(),
            });
        }
        if secret.len() < MIN_SECRET_LENGTH {
            tracing::warn!(
                "Token secret is shorter than {} bytes. Consider using a longer secret for production.",
                MIN_SECRET_LENGTH
            );
        }
        Ok(Self {
            secret: secret.to_vec(),
            ttl: TOKEN_TTL,
        })
    }

    /// Token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a token issued now.
    pub fn sign(
        &self,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        client_id: ClientId,
        operation: IoOperation,
    ) -> Result<IoToken> {
        self.sign_at(volume_id, chunk_id, client_id, operation, now_millis())
    }

    /// Sign a token with an explicit issue time.
    pub fn sign_at(
        &self,
        volume_id: VolumeId,
        chunk_id: ChunkId,
        client_id: ClientId,
        operation: IoOperation,
        issued_at_ms: u64,
    ) -> Result<IoToken> {
        let input = IoToken::signing_input(volume_id, chunk_id, client_id, operation, issued_at_ms);
        let mut mac = self.mac()?;
        mac.update(input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(IoToken {
            volume_id,
            chunk_id,
            client_id,
            operation,
            issued_at_ms,
            signature,
        })
    }

    /// Verify signature and lifetime against the current clock.
    pub fn verify(&self, token: &IoToken) -> Result<()> {
        self.verify_at(token, now_millis())
    }

    /// Verify signature and lifetime against `now_ms`.
    pub fn verify_at(&self, token: &IoToken, now_ms: u64) -> Result<()> {
        let signature = URL_SAFE_NO_PAD
            .decode(&token.signature)
            .map_err(|_| FlexError::TokenInvalid("malformed signature".to_string()))?;

        let input = IoToken::signing_input(
            token.volume_id,
            token.chunk_id,
            token.client_id,
            token.operation,
            token.issued_at_ms,
        );
        let mut mac = self.mac()?;
        mac.update(input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| FlexError::TokenInvalid("signature mismatch".to_string()))?;

        if token.issued_at_ms > now_ms.saturating_add(MAX_CLOCK_SKEW_MS) {
            return Err(FlexError::TokenInvalid("token issued in the future".to_string()));
        }
        if now_ms >= token.expires_at_ms(self.ttl) {
            return Err(FlexError::TokenInvalid(format!(
                "token for chunk {} expired",
                token.chunk_id
            )));
        }

        Ok(())
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| FlexError::Internal(format!("HMAC key rejected: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-only-for-unit-tests-not-production";

    #[test]
    fn test_sign_and_verify() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let token = signer.sign_at(1, 10, 7, IoOperation::Write, 1_000).unwrap();

        assert!(!token.signature.is_empty());
        assert!(signer.verify_at(&token, 1_000).is_ok());
        assert!(signer.verify_at(&token, 31_000).is_ok());
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let token = signer.sign_at(1, 10, 7, IoOperation::Read, 1_000).unwrap();

        let result = signer.verify_at(&token, 1_000 + 61_000);
        assert!(matches!(result, Err(FlexError::TokenInvalid(_))));

        let result = signer.verify_at(&token, 1_000 + 60_000);
        assert!(matches!(result, Err(FlexError::TokenInvalid(_))));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let mut token = signer.sign_at(1, 10, 7, IoOperation::Read, 1_000).unwrap();
        token.operation = IoOperation::Write;
        assert!(matches!(
            signer.verify_at(&token, 2_000),
            Err(FlexError::TokenInvalid(_))
        ));

        let mut token = signer.sign_at(1, 10, 7, IoOperation::Read, 1_000).unwrap();
        token.chunk_id = 11;
        assert!(signer.verify_at(&token, 2_000).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let other = TokenSigner::new("another-secret-for-a-different-cluster").unwrap();
        let token = signer.sign_at(1, 10, 7, IoOperation::Read, 1_000).unwrap();
        assert!(other.verify_at(&token, 1_500).is_err());
    }

    #[test]
    fn test_future_token_rejected() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let token = signer.sign_at(1, 10, 7, IoOperation::Read, 100_000).unwrap();
        assert!(signer.verify_at(&token, 96_000).is_ok());
        assert!(signer.verify_at(&token, 90_000).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            TokenSigner::new(""),
            Err(FlexError::InvalidConfig { .. })
        ));
        assert!(TokenSigner::new("short").is_ok());
    }

    #[test]
    fn test_malformed_signature() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let mut token = signer.sign_at(1, 10, 7, IoOperation::Read, 1_000).unwrap();
        token.signature = "***".to_string();
        assert!(matches!(
            signer.verify_at(&token, 1_000),
            Err(FlexError::TokenInvalid(_))
        ));
    }
}
