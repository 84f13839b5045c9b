//! Hybrid (ECIES-style) encryption.
//!
//! Ephemeral P-256 Diffie-Hellman against the recipient's static key,
//! HKDF-SHA256 key derivation, AES-256-GCM with a detached tag. The tag is
//! checked before any plaintext leaves [`decrypt`].

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::CryptoError;

const KDF_INFO: &[u8] = b"ecies-aes256gcm";

/// Output of one ECIES encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EciesResult {
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub iv: [u8; 12],
    pub mac: [u8; 16],
    /// SEC1-encoded ephemeral sender public key.
    #[serde(with = "serde_bytes")]
    pub ephemeral_public_key: Vec<u8>,
}

fn derive_key(shared_secret: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, shared_secret)
        .expand(KDF_INFO, key.as_mut())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(key)
}

/// Encrypt `plaintext` towards `recipient`.
///
/// A fresh ephemeral key pair and IV are drawn per call, so two encryptions
/// of the same plaintext never coincide.
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<EciesResult, CryptoError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_public_key = ephemeral.public_key().to_encoded_point(false).as_bytes().to_vec();

    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_key(shared.raw_secret_bytes())?;

    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), &[], &mut ciphertext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(EciesResult {
        ciphertext,
        iv,
        mac: tag.into(),
        ephemeral_public_key,
    })
}

/// Decrypt an [`EciesResult`] with the recipient's private key.
///
/// Fails hard on tag mismatch; never returns partial plaintext.
pub fn decrypt(result: &EciesResult, recipient: &SecretKey) -> Result<Vec<u8>, CryptoError> {
    let sender = PublicKey::from_sec1_bytes(&result.ephemeral_public_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    let shared = p256::ecdh::diffie_hellman(recipient.to_nonzero_scalar(), sender.as_affine());
    let key = derive_key(shared.raw_secret_bytes())?;

    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    let mut plaintext = result.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&result.iv),
            &[],
            &mut plaintext,
            GenericArray::from_slice(&result.mac),
        )
        .map_err(|_| CryptoError::MacMismatch)?;
    Ok(plaintext)
}
