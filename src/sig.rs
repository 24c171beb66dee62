//! Handles the creation and verification of (Ethereum) Signatures, and the
//! per-app ephemeral keys they are created with.

mod xkeys;

pub use xkeys::{ExtendedSecretKey, Identifier, KeyError, HARDENED_OFFSET};

use crate::types::{Address, Hash, Signature};
use async_trait::async_trait;
use k256::{
    ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey,
};
use sha3::{Digest, Keccak256};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ecdsa: {0}")]
    Ecdsa(#[from] k256::ecdsa::Error),
    #[error("invalid recovery byte {0}")]
    InvalidRecoveryId(u8),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use a serializer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

impl From<&PublicKey> for Address {
    fn from(key: &PublicKey) -> Self {
        // See https://ethereum.stackexchange.com/questions/65233/goethereum-getting-public-key-from-private-key-hex-formatting
        //
        // Throw away the first byte, which is not part of the public key. It is
        // added by the uncompressed SEC1 encoding.
        let point = key.to_encoded_point(false);
        let hash: [u8; 32] = Keccak256::digest(&point.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl From<&VerifyingKey> for Address {
    fn from(key: &VerifyingKey) -> Self {
        Address::from(&PublicKey::from(key))
    }
}

/// Sign a digest with an Ethereum 65-byte recoverable signature.
pub fn sign_eth(key: &SigningKey, msg: Hash) -> Result<Signature, Error> {
    // "\x19Ethereum Signed Message:\n32" format
    let hash = hash_to_eth_signed_msg_hash(msg);

    // k256 already normalizes s to the lower half (EIP-2) and flips the
    // recovery id accordingly.
    let (sig, recid) = key.sign_prehash_recoverable(&hash.0)?;

    let mut rs = [0u8; 64];
    rs.copy_from_slice(&sig.to_bytes());
    debug_assert!(rs[32] & 0x80 == 0);

    // We still have to add 27 to v for the signature to be valid in the EVM.
    Ok(Signature::new(&rs, recid.to_byte() + 27))
}

/// Recover the address that signed `msg`.
///
/// `msg` is the digest given to [sign_eth()], it should not include the
/// `Ethereum Signed Message` prefix.
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Undo adding the 27, to go back to the format expected below
    let v = eth_sig.0[64];
    let recid = v
        .checked_sub(27)
        .and_then(RecoveryId::from_byte)
        .ok_or(Error::InvalidRecoveryId(v))?;
    let sig = K256Signature::from_slice(&eth_sig.0[..64])?;

    let verifying_key = VerifyingKey::recover_from_prehash(&hash.0, &sig, recid)?;
    Ok(Address::from(&verifying_key))
}

/// The signing capability handed to the interpreter.
///
/// Implementations must derive the key for `app_seq_no` on every call and must
/// not persist anything besides their root secret.
#[async_trait]
pub trait ChannelSigner: Send + Sync {
    /// Root identifier matching the secret used for signing.
    fn public_identifier(&self) -> Identifier;

    async fn sign(&self, digest: Hash, app_seq_no: u32) -> Result<Signature, Error>;
}

/// [ChannelSigner] backed by an in-memory root secret.
#[derive(Debug, Clone)]
pub struct RootSigner {
    root: ExtendedSecretKey,
}

impl RootSigner {
    pub fn new(root: ExtendedSecretKey) -> Self {
        Self { root }
    }

    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        Ok(Self::new(ExtendedSecretKey::from_seed(seed)?))
    }

    /// Address of the ephemeral key used for the app with `app_seq_no`.
    pub fn address(&self, app_seq_no: u32) -> Result<Address, KeyError> {
        self.root.public_identifier().derive_address(app_seq_no)
    }
}

#[async_trait]
impl ChannelSigner for RootSigner {
    fn public_identifier(&self) -> Identifier {
        self.root.public_identifier()
    }

    async fn sign(&self, digest: Hash, app_seq_no: u32) -> Result<Signature, Error> {
        let key = self.root.derive_signing_key(app_seq_no)?;
        sign_eth(&key, digest)
    }
}

#[cfg(test)]
mod tests;
