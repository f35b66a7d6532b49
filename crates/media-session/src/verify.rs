use async_trait::async_trait;

use crate::error::VerifyError;

/// Verdict on one still image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Identity confirmed; the challenge ends successfully.
    Verified,
    /// Inconclusive; wait for the next keyframe.
    Retry,
    /// Hard refusal; the challenge ends without further attempts.
    Rejected(String),
}

/// External identity check fed with base64-encoded JPEG stills.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, still_base64: &str) -> Result<Verification, VerifyError>;
}
