use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::dfu::init_command::SignatureType;

/// Checks an init command signature against the provisioned public key.
/// Key storage and the curve arithmetic live behind this seam so they can be
/// swapped per device and mocked in tests.
#[cfg_attr(test, automock)]
pub trait SignatureVerifier {
    /// `digest` is the SHA-256 of the signed command bytes.
    fn verify(&self, signature_type: SignatureType, digest: &[u8; 32], signature: &[u8]) -> bool;
}

/// Verifier for devices without a provisioned key. Rejects every signature.
#[derive(Debug, Default)]
pub struct NoKeyVerifier;

impl SignatureVerifier for NoKeyVerifier {
    fn verify(&self, signature_type: SignatureType, _digest: &[u8; 32], _signature: &[u8]) -> bool {
        warn!(?signature_type, "no public key provisioned, rejecting signed command");
        false
    }
}
