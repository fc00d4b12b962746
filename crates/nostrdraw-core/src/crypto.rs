//! Pairwise encryption between two identities (NIP-04).
//!
//! The shared key is the x-coordinate of the secp256k1 ECDH point, used
//! directly as an AES-256 key. Payloads are encrypted with AES-256-CBC and
//! PKCS#7 padding under a random IV and carried as
//! `base64(ciphertext)?iv=base64(iv)`, which is what remote signer apps
//! speak.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use secp256k1::{Parity, SecretKey, XOnlyPublicKey};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256 key size.
pub const KEY_SIZE: usize = 32;

/// CBC initialization vector size.
pub const IV_SIZE: usize = 16;

const IV_SEPARATOR: &str = "?iv=";

/// Encryption errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed")]
    KeyDerivation,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid payload encoding: {0}")]
    Encoding(String),
}

/// Symmetric key shared by exactly two identities.
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    /// Derive the key from our secret and the peer's public key.
    ///
    /// Both sides derive the same key.
    pub fn derive(secret: &SecretKey, peer: &XOnlyPublicKey) -> Self {
        let point = secp256k1::ecdh::shared_secret_point(&peer.public_key(Parity::Even), secret);
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&point[..KEY_SIZE]);
        Self(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, &iv)
    }

    fn encrypt_with_iv(&self, plaintext: &str, iv: &[u8; IV_SIZE]) -> Result<String, CryptoError> {
        let ciphertext = Aes256CbcEnc::new_from_slices(&self.0, iv)
            .map_err(|_| CryptoError::KeyDerivation)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(format!("{}{}{}", STANDARD.encode(ciphertext), IV_SEPARATOR, STANDARD.encode(iv)))
    }

    pub fn decrypt(&self, payload: &str) -> Result<String, CryptoError> {
        let (ciphertext, iv) = payload
            .trim()
            .split_once(IV_SEPARATOR)
            .ok_or_else(|| CryptoError::Encoding("missing iv".to_string()))?;
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let iv = STANDARD.decode(iv).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        if iv.len() != IV_SIZE {
            return Err(CryptoError::Encoding(format!("iv is {} bytes", iv.len())));
        }

        let plaintext = Aes256CbcDec::new_from_slices(&self.0, &iv)
            .map_err(|_| CryptoError::KeyDerivation)?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Encrypt `plaintext` so only `peer` (and we) can read it.
pub fn encrypt(secret: &SecretKey, peer: &XOnlyPublicKey, plaintext: &str) -> Result<String, CryptoError> {
    SharedKey::derive(secret, peer).encrypt(plaintext)
}

/// Decrypt a payload sent to us by `peer`.
pub fn decrypt(secret: &SecretKey, peer: &XOnlyPublicKey, payload: &str) -> Result<String, CryptoError> {
    SharedKey::derive(secret, peer).decrypt(payload)
}
