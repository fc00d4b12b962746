//! Identities: secp256k1 keypairs with hex and bech32 text forms.
//!
//! Public keys are BIP-340 x-only keys. The textual forms are `npub1…` for
//! public keys and `nsec1…` for secret keys.

use bech32::{Bech32, Hrp};
use secp256k1::schnorr::Signature;
use secp256k1::{All, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

const NPUB: Hrp = Hrp::parse_unchecked("npub");
const NSEC: Hrp = Hrp::parse_unchecked("nsec");

/// Identity errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid bech32 string: {0}")]
    Bech32(String),
}

/// Shared signing/verification context.
pub(crate) fn secp() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

/// A local identity holding its secret key.
#[derive(Clone)]
pub struct Keys {
    secret: SecretKey,
    keypair: Keypair,
    public: XOnlyPublicKey,
}

impl Keys {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut secp256k1::rand::thread_rng());
        Self::from_secret_key(secret)
    }

    /// Build an identity from a secret key.
    pub fn from_secret_key(secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(secp(), &secret);
        let (public, _parity) = keypair.x_only_public_key();
        Self { secret, keypair, public }
    }

    /// Parse a secret key given as `nsec1…` or 64 hex characters.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let input = input.trim();
        let bytes = if input.starts_with("nsec1") {
            decode_bech32(NSEC, input)?
        } else {
            hex::decode(input).map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?
        };
        let secret =
            SecretKey::from_slice(&bytes).map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret))
    }

    /// The x-only public key.
    pub fn public_key(&self) -> XOnlyPublicKey {
        self.public
    }

    /// Public key as lowercase hex.
    pub fn public_key_hex(&self) -> String {
        self.public.to_string()
    }

    /// Public key as `npub1…`.
    pub fn npub(&self) -> String {
        encode_bech32(NPUB, &self.public.serialize())
    }

    /// Secret key as `nsec1…`.
    pub fn nsec(&self) -> String {
        encode_bech32(NSEC, &self.secret.secret_bytes())
    }

    /// Secret key as lowercase hex.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// BIP-340 signature over a 32-byte digest.
    pub(crate) fn sign_digest(&self, digest: [u8; 32]) -> Signature {
        secp().sign_schnorr(&Message::from_digest(digest), &self.keypair)
    }
}

impl PartialEq for Keys {
    fn eq(&self, other: &Self) -> bool {
        self.secret == other.secret
    }
}

impl Eq for Keys {}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys").field("public", &self.public_key_hex()).finish_non_exhaustive()
    }
}

/// Parse a public key given as `npub1…` or 64 hex characters.
pub fn parse_public_key(input: &str) -> Result<XOnlyPublicKey, IdentityError> {
    let input = input.trim();
    if input.starts_with("npub1") {
        let bytes = decode_bech32(NPUB, input)?;
        XOnlyPublicKey::from_slice(&bytes).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    } else {
        XOnlyPublicKey::from_str(input).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    }
}

/// Encode a hex public key as `npub1…`.
pub fn npub_encode(public_key_hex: &str) -> Result<String, IdentityError> {
    let public = parse_public_key(public_key_hex)?;
    Ok(encode_bech32(NPUB, &public.serialize()))
}

/// Decode `npub1…` into a hex public key.
pub fn npub_decode(npub: &str) -> Result<String, IdentityError> {
    if !npub.trim().starts_with("npub1") {
        return Err(IdentityError::Bech32(format!("expected npub, got {}", npub)));
    }
    parse_public_key(npub).map(|public| public.to_string())
}

fn encode_bech32(hrp: Hrp, data: &[u8]) -> String {
    // Encoding 32 bytes under a fixed short prefix cannot exceed the length limit.
    bech32::encode::<Bech32>(hrp, data).unwrap_or_default()
}

fn decode_bech32(expected: Hrp, input: &str) -> Result<Vec<u8>, IdentityError> {
    let (hrp, data) = bech32::decode(input).map_err(|e| IdentityError::Bech32(e.to_string()))?;
    if hrp != expected {
        return Err(IdentityError::Bech32(format!(
            "expected prefix {}, got {}",
            expected.as_str(),
            hrp.as_str()
        )));
    }
    Ok(data)
}
