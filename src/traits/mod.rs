pub mod verifier;

pub use verifier::{NoKeyVerifier, SignatureVerifier};

#[cfg(test)]
pub use verifier::MockSignatureVerifier;
