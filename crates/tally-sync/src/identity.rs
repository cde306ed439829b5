//! Signing of locally cast votes.

/// Produces the `signatureProof` attached to locally cast votes.
///
/// The coordinator hands the provider [`tally_core::VoteRecord::signing_payload`]
/// and stores whatever string it returns. Verification is the reader's concern.
pub trait IdentityProvider: Send + Sync {
    /// Sign `payload`, returning the proof as a string.
    fn sign(&self, payload: &[u8]) -> String;
}

/// Identity provider that does not sign: every proof is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedIdentity;

impl IdentityProvider for UnsignedIdentity {
    fn sign(&self, _payload: &[u8]) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_identity_returns_empty_proof() {
        assert_eq!(UnsignedIdentity.sign(b"anything"), "");
    }
}
