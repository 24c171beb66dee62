//! Primitive value types shared by every layer: addresses, hashes, recoverable
//! signatures and 256-bit amounts.
//!
//! All of them serialize to human readable strings (`0x`-prefixed hex, or a
//! decimal string for [U256]) because their serialized form ends up in the
//! persisted channel records and inside protocol parameters on the wire.

use core::{fmt, str::FromStr};

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use uint::construct_uint;

/// Error returned when parsing one of the hex encoded types fails.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

/// Implements string based (de)serialization, parsing and random sampling for
/// a fixed-size byte newtype.
macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl $T {
            pub const LEN: usize = $N;

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
                let arr: [u8; $N] = bytes.try_into().map_err(|_| ParseError::LengthMismatch {
                    expected: $N,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }
        }

        impl FromStr for $T {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                Self::from_slice(&hex::decode(s)?)
            }
        }

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut bytes = [0u8; $N];
                rng.fill(&mut bytes[..]);
                $T(bytes)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytesN!(Hash, 32);
bytesN!(Address, 20);
bytesN!(Signature, 65);

impl Hash {
    /// keccak256 over an arbitrary byte string.
    pub fn keccak(data: &[u8]) -> Self {
        Hash(Keccak256::digest(data).into())
    }
}

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

// Serialized as a decimal string.
construct_uint! {
    pub struct U256(4);
}

impl U256 {
    /// Big-endian 32 byte representation, the slot layout used when packing
    /// values into a digest.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16).map_err(de::Error::custom),
            None => U256::from_dec_str(&s).map_err(de::Error::custom),
        }
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
