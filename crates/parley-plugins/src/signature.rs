//! Manifest signature verification.
//!
//! Manifests may carry a base64 `signature` over their canonical JSON (see
//! [`PluginManifest::signing_payload`]). The runtime calls a
//! [`ManifestVerifier`] whenever a signed manifest is loaded. The default
//! verifier accepts everything; deployments that want enforcement install an
//! [`Ed25519Verifier`] with their publisher keys.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::{debug, warn};

use crate::manifest::PluginManifest;

/// Hook invoked for every signed manifest.
pub trait ManifestVerifier: Send + Sync + std::fmt::Debug {
    /// Verify `signature` over `manifest`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if the signature is rejected.
    fn verify(&self, manifest: &PluginManifest, signature: &str) -> Result<(), String>;
}

/// Accepts every signature. Logs that enforcement is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnenforcedVerifier;

impl ManifestVerifier for UnenforcedVerifier {
    fn verify(&self, manifest: &PluginManifest, _signature: &str) -> Result<(), String> {
        debug!(
            plugin_id = %manifest.id,
            version = %manifest.version,
            "Manifest signature present but not enforced"
        );
        Ok(())
    }
}

/// Verifies Ed25519 signatures against a set of trusted publisher keys.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    trusted: Vec<VerifyingKey>,
}

impl Ed25519Verifier {
    /// Create a verifier with no trusted keys. Rejects every signature.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust an additional publisher key.
    #[must_use]
    pub fn with_key(mut self, key: VerifyingKey) -> Self {
        self.trusted.push(key);
        self
    }

    /// Trust a publisher key given as base64-encoded 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns a message if the key is not valid base64 or not a valid
    /// Ed25519 public key.
    pub fn with_base64_key(self, key: &str) -> Result<Self, String> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| format!("invalid base64 key: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "public key must be 32 bytes".to_string())?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| format!("invalid key: {e}"))?;
        Ok(self.with_key(key))
    }

    /// Number of trusted keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.trusted.len()
    }
}

impl ManifestVerifier for Ed25519Verifier {
    fn verify(&self, manifest: &PluginManifest, signature: &str) -> Result<(), String> {
        let bytes = BASE64
            .decode(signature.trim())
            .map_err(|e| format!("signature is not valid base64: {e}"))?;
        let signature =
            Signature::from_slice(&bytes).map_err(|e| format!("malformed signature: {e}"))?;
        let payload = manifest.signing_payload();

        if self
            .trusted
            .iter()
            .any(|key| key.verify(&payload, &signature).is_ok())
        {
            debug!(plugin_id = %manifest.id, "Manifest signature verified");
            return Ok(());
        }

        warn!(
            plugin_id = %manifest.id,
            version = %manifest.version,
            trusted_keys = self.trusted.len(),
            "Manifest signature rejected"
        );
        Err("signature does not match any trusted key".into())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ed25519_dalek::{Signer, SigningKey};

    use super::*;
    use crate::error::PluginError;

    fn manifest() -> PluginManifest {
        PluginManifest::from_slice(
            br#"{"id": "weather", "name": "Weather", "version": "1.0", "entry": "run"}"#,
            Path::new("plugin.json"),
        )
        .unwrap()
    }

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn sign(manifest: &PluginManifest, key: &SigningKey) -> String {
        BASE64.encode(key.sign(&manifest.signing_payload()).to_bytes())
    }

    #[test]
    fn test_unenforced_accepts_anything() {
        let m = manifest();
        assert!(UnenforcedVerifier.verify(&m, "garbage").is_ok());
    }

    #[test]
    fn test_ed25519_accepts_trusted_signature() {
        let key = signing_key(7);
        let verifier = Ed25519Verifier::new().with_key(key.verifying_key());
        let mut m = manifest();
        m.signature = Some(sign(&m, &key));

        assert!(m.verify_signature(&verifier).is_ok());
    }

    #[test]
    fn test_ed25519_rejects_untrusted_signature() {
        let verifier = Ed25519Verifier::new().with_key(signing_key(1).verifying_key());
        let mut m = manifest();
        m.signature = Some(sign(&m, &signing_key(2)));

        assert!(matches!(
            m.verify_signature(&verifier),
            Err(PluginError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn test_ed25519_rejects_tampered_manifest() {
        let key = signing_key(3);
        let verifier = Ed25519Verifier::new().with_key(key.verifying_key());
        let mut m = manifest();
        m.signature = Some(sign(&m, &key));
        m.entry = "rm -rf /".into();

        assert!(m.verify_signature(&verifier).is_err());
    }

    #[test]
    fn test_unsigned_manifest_passes_strict_verifier() {
        let verifier = Ed25519Verifier::new();
        assert!(manifest().verify_signature(&verifier).is_ok());
    }

    #[test]
    fn test_base64_key_parsing() {
        let key = signing_key(9).verifying_key();
        let encoded = BASE64.encode(key.to_bytes());
        let verifier = Ed25519Verifier::new().with_base64_key(&encoded).unwrap();
        assert_eq!(verifier.key_count(), 1);

        assert!(Ed25519Verifier::new().with_base64_key("AAAA").is_err());
        assert!(Ed25519Verifier::new().with_base64_key("not base64!").is_err());
    }
}
