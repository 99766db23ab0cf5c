//! # RSA Key Pair
//!
//! Long-lived, read-only RSA key material shared by every concurrent
//! encryption. Provides OAEP key wrapping for JWE and PSS signatures for JWS.

use crate::error::{EncrypterError, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;
use tracing::{debug, info};

/// RSA key pair used for OAEP key wrapping and PSS signing.
///
/// Never mutated after construction, so it can be shared through an `Arc`
/// without locking.
pub struct RsaKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    signing_key: BlindedSigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    public_key_pem: String,
}

impl RsaKeyPair {
    /// Generate a fresh key pair with the given modulus size.
    ///
    /// ## Errors
    /// - `EncrypterError::ConfigError`: if `bits` is below [`crate::MIN_RSA_KEY_SIZE`]
    /// - `EncrypterError::RsaError`: if key generation fails
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < crate::MIN_RSA_KEY_SIZE {
            return Err(EncrypterError::config_error(
                format!(
                    "RSA key size {bits} is below the minimum of {}",
                    crate::MIN_RSA_KEY_SIZE
                ),
                None,
            ));
        }

        info!("Generating {}-bit RSA key pair", bits);
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| {
            EncrypterError::rsa_error(format!("Key generation failed: {e}"), Some(Box::new(e)))
        })?;
        Self::from_private_key(private_key)
    }

    /// Load a private key from a PEM file (PKCS#8 or PKCS#1).
    ///
    /// ## Errors
    /// - `EncrypterError::ConfigError`: if the file cannot be read or parsed,
    ///   or the key is smaller than the minimum size
    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|e| {
            EncrypterError::config_error(
                format!("Failed to read RSA key {}: {e}", path.display()),
                Some(Box::new(e)),
            )
        })?;
        Self::from_pem(&pem)
    }

    /// Parse a private key from PEM text (PKCS#8 or PKCS#1).
    ///
    /// ## Errors
    /// - `EncrypterError::ConfigError`: if the PEM cannot be parsed, or the key
    ///   is smaller than the minimum size
    /// - `EncrypterError::RsaError`: if the key fails validation
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| {
                EncrypterError::config_error(
                    format!("Invalid RSA private key PEM: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        let bits = private_key.size() * 8;
        if bits < crate::MIN_RSA_KEY_SIZE {
            return Err(EncrypterError::config_error(
                format!(
                    "RSA key size {bits} is below the minimum of {}",
                    crate::MIN_RSA_KEY_SIZE
                ),
                None,
            ));
        }
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        private_key.validate()?;

        let public_key = RsaPublicKey::from(&private_key);
        let public_key_pem = public_key.to_public_key_pem(LineEnding::LF).map_err(|e| {
            EncrypterError::rsa_error(
                format!("Failed to encode public key: {e}"),
                Some(Box::new(e)),
            )
        })?;
        let signing_key = BlindedSigningKey::<Sha256>::new(private_key.clone());
        let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());

        debug!("RSA key pair ready ({} bits)", public_key.size() * 8);
        Ok(Self {
            private_key,
            public_key,
            signing_key,
            verifying_key,
            public_key_pem,
        })
    }

    /// Modulus size in bits.
    #[must_use]
    pub fn bits(&self) -> usize {
        self.public_key.size() * 8
    }

    /// Public key in SPKI PEM form.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Encrypt a content-encryption key to the public key with OAEP/SHA-256.
    pub fn wrap_key(&self, cek: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        self.public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), cek)
            .map_err(|e| {
                EncrypterError::rsa_error(format!("OAEP key wrap failed: {e}"), Some(Box::new(e)))
            })
    }

    /// Recover a content-encryption key wrapped by [`Self::wrap_key`].
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| {
                EncrypterError::rsa_error(
                    format!("OAEP key unwrap failed: {e}"),
                    Some(Box::new(e)),
                )
            })
    }

    /// Sign with RSASSA-PSS/SHA-256 and a random salt.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let signature = self
            .signing_key
            .try_sign_with_rng(&mut rng, message)
            .map_err(|e| {
                EncrypterError::rsa_error(format!("PSS signing failed: {e}"), Some(Box::new(e)))
            })?;
        Ok(signature.to_vec())
    }

    /// Verify a PSS signature produced by [`Self::sign`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::try_from(signature).map_err(|e| {
            EncrypterError::rsa_error(format!("Malformed signature: {e}"), Some(Box::new(e)))
        })?;
        self.verifying_key.verify(message, &signature).map_err(|e| {
            EncrypterError::rsa_error(
                format!("Signature verification failed: {e}"),
                Some(Box::new(e)),
            )
        })
    }
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}
