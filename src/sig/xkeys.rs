//! Root identifiers and the derivation of per-app ephemeral keys.
//!
//! A participant is identified by an extended public key (compressed public
//! key + chain code). The key used to sign updates of a specific app is the
//! non-hardened child at index `appSeqNo` (BIP-32 CKDpriv/CKDpub), which means
//! the counterparty can compute our ephemeral address from our root
//! identifier alone, without ever seeing a per-app key. Everything here is a
//! pure function of its inputs; nothing is cached.

use core::{fmt, str::FromStr};

use crate::types::{Address, ParseError};
use hmac::{Hmac, Mac};
use k256::{
    ecdsa::SigningKey,
    elliptic_curve::{sec1::ToEncodedPoint, PrimeField},
    FieldBytes, ProjectivePoint, PublicKey, Scalar, SecretKey,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Indices at or above this value would be hardened children, which cannot be
/// derived from the public identifier.
pub const HARDENED_OFFSET: u32 = 1 << 31;

const MASTER_KEY_SALT: &[u8] = b"Bitcoin seed";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KeyError {
    #[error("index {0} is hardened and cannot be derived publicly")]
    HardenedIndex(u32),
    #[error("derived key for index {0} is invalid")]
    InvalidChild(u32),
    #[error("seed does not produce a valid master key")]
    InvalidSeed,
    #[error("identifier does not contain a valid public key")]
    InvalidPublicKey,
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Stable long-term identity of a participant: 33 bytes compressed public key
/// followed by 32 bytes chain code.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; 65]);

impl Identifier {
    pub fn from_bytes(bytes: [u8; 65]) -> Result<Self, KeyError> {
        PublicKey::from_sec1_bytes(&bytes[..33]).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    fn public_key(&self) -> Result<PublicKey, KeyError> {
        PublicKey::from_sec1_bytes(&self.0[..33]).map_err(|_| KeyError::InvalidPublicKey)
    }

    fn chain_code(&self) -> &[u8] {
        &self.0[33..]
    }

    /// Address of the ephemeral key at `index`.
    pub fn derive_address(&self, index: u32) -> Result<Address, KeyError> {
        let parent = self.public_key()?;
        let tweak = child_tweak(self.chain_code(), &parent, index)?;

        let point = ProjectivePoint::GENERATOR * tweak + parent.to_projective();
        let child =
            PublicKey::from_affine(point.to_affine()).map_err(|_| KeyError::InvalidChild(index))?;
        Ok(Address::from(&child))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The full 130 hex chars are rarely useful in logs.
        write!(f, "Identifier({}..)", hex::encode(&self.0[1..9]))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Identifier {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(ParseError::from)?;
        let arr: [u8; 65] = bytes.as_slice().try_into().map_err(|_| {
            ParseError::LengthMismatch {
                expected: 65,
                actual: bytes.len(),
            }
        })?;
        Self::from_bytes(arr)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// The root secret of a participant. Only ever lives in memory.
#[derive(Clone)]
pub struct ExtendedSecretKey {
    key: SecretKey,
    chain_code: [u8; 32],
}

impl fmt::Debug for ExtendedSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedSecretKey")
            .field("identifier", &self.public_identifier())
            .finish_non_exhaustive()
    }
}

impl ExtendedSecretKey {
    /// BIP-32 master key generation.
    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let mut mac = HmacSha512::new_from_slice(MASTER_KEY_SALT).map_err(|_| KeyError::InvalidSeed)?;
        mac.update(seed);
        let i = mac.finalize().into_bytes();

        let key = SecretKey::from_bytes(&left_half(&i))
            .map_err(|_| KeyError::InvalidSeed)?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&i[32..]);
        Ok(Self { key, chain_code })
    }

    pub fn public_identifier(&self) -> Identifier {
        let mut bytes = [0u8; 65];
        bytes[..33].copy_from_slice(self.key.public_key().to_encoded_point(true).as_bytes());
        bytes[33..].copy_from_slice(&self.chain_code);
        Identifier(bytes)
    }

    /// Signing key of the ephemeral child at `index`.
    pub fn derive_signing_key(&self, index: u32) -> Result<SigningKey, KeyError> {
        let tweak = child_tweak(&self.chain_code, &self.key.public_key(), index)?;
        let child = tweak + *self.key.to_nonzero_scalar();
        SigningKey::from_bytes(&child.to_repr()).map_err(|_| KeyError::InvalidChild(index))
    }
}

/// The first 32 bytes of an HMAC-SHA512 output.
fn left_half(i: &[u8]) -> FieldBytes {
    let mut il = [0u8; 32];
    il.copy_from_slice(&i[..32]);
    il.into()
}

/// `IL` of BIP-32 CKD for a non-hardened index, as a scalar.
fn child_tweak(chain_code: &[u8], parent: &PublicKey, index: u32) -> Result<Scalar, KeyError> {
    if index >= HARDENED_OFFSET {
        return Err(KeyError::HardenedIndex(index));
    }

    let mut mac = HmacSha512::new_from_slice(chain_code).map_err(|_| KeyError::InvalidChild(index))?;
    mac.update(parent.to_encoded_point(true).as_bytes());
    mac.update(&index.to_be_bytes());
    let i = mac.finalize().into_bytes();

    // IL >= n happens with probability < 2^-127, BIP-32 says to skip such an
    // index. We report it instead, the caller can't pick another index anyway.
    Option::<Scalar>::from(Scalar::from_repr(left_half(&i)))
        .ok_or(KeyError::InvalidChild(index))
}
