//! Set-state commitments: the signable object binding one app state update.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::{
    channel::AppInstance,
    error::ProtocolError,
    sig::{self, recover_signer},
    types::{Address, Hash, Signature, U256},
};

/// Domain separator of set-state digests.
const SET_STATE_TARGET: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CommitmentError {
    #[error("signature recovers to {recovered}, expected {expected}")]
    UnexpectedSigner { expected: Address, recovered: Address },
    #[error("slot {0} already carries a different signature")]
    SlotTaken(usize),
    #[error("signature of participant {0} is missing")]
    MissingSignature(usize),
    #[error(transparent)]
    Signature(#[from] sig::Error),
}

impl From<CommitmentError> for ProtocolError {
    fn from(e: CommitmentError) -> Self {
        match e {
            CommitmentError::UnexpectedSigner {
                expected,
                recovered,
            } => Self::Authentication {
                expected,
                recovered,
            },
            CommitmentError::SlotTaken(_) => Self::Validation(e.to_string()),
            CommitmentError::MissingSignature(_) => Self::Persistence(e.to_string()),
            CommitmentError::Signature(e) => e.into(),
        }
    }
}

/// What a persisted commitment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitmentKind {
    /// Initial state of a proposed app.
    Proposal,
    /// State of an installed app or the free balance.
    SetState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStateCommitment {
    app_identity_hash: Hash,
    version: u64,
    state_hash: Hash,
    state_timeout: U256,
    /// Expected signers, app initiator first.
    participants: [Address; 2],
    signatures: [Option<Signature>; 2],
}

impl SetStateCommitment {
    /// Unsigned commitment to the current state of `app`.
    pub fn new(app: &AppInstance) -> Self {
        Self {
            app_identity_hash: app.identity_hash(),
            version: app.version(),
            state_hash: app.state().hash(),
            state_timeout: app.state_timeout(),
            participants: app.participants(),
            signatures: [None; 2],
        }
    }

    pub fn app_identity_hash(&self) -> Hash {
        self.app_identity_hash
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state_hash(&self) -> Hash {
        self.state_hash
    }

    /// The hash both parties sign.
    pub fn digest(&self) -> Hash {
        // Packed encoding => We can't use a serializer
        let mut hasher = Keccak256::new();
        hasher.update([SET_STATE_TARGET]);
        hasher.update(self.app_identity_hash.0);
        hasher.update(self.state_hash.0);
        hasher.update(U256::from(self.version).to_be_bytes());
        hasher.update(self.state_timeout.to_be_bytes());
        Hash(hasher.finalize().into())
    }

    /// Check that `sig` over this commitment was made by `expected`.
    pub fn verify(&self, sig: Signature, expected: Address) -> Result<(), CommitmentError> {
        let recovered = recover_signer(self.digest(), sig)?;
        if recovered != expected {
            return Err(CommitmentError::UnexpectedSigner {
                expected,
                recovered,
            });
        }
        Ok(())
    }

    /// Put each signature into the slot of the participant it recovers to.
    ///
    /// The order of `sigs` does not matter. Adding a signature that is already
    /// present is a no-op.
    pub fn add_signatures(
        &mut self,
        sigs: impl IntoIterator<Item = Signature>,
    ) -> Result<(), CommitmentError> {
        let digest = self.digest();
        for sig in sigs {
            let recovered = recover_signer(digest, sig)?;
            let idx = self
                .participants
                .iter()
                .position(|p| *p == recovered)
                .ok_or_else(|| CommitmentError::UnexpectedSigner {
                    expected: self.first_unsigned(),
                    recovered,
                })?;

            match self.signatures[idx] {
                Some(existing) if existing != sig => return Err(CommitmentError::SlotTaken(idx)),
                _ => self.signatures[idx] = Some(sig),
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.signatures.iter().all(Option::is_some)
    }

    /// Both signatures, app initiator first.
    pub fn signatures(&self) -> Result<[Signature; 2], CommitmentError> {
        let mut signatures = [Signature::default(); 2];
        for (idx, s) in self.signatures.iter().enumerate() {
            signatures[idx] = s.ok_or(CommitmentError::MissingSignature(idx))?;
        }
        Ok(signatures)
    }

    fn first_unsigned(&self) -> Address {
        let idx = self
            .signatures
            .iter()
            .position(Option::is_none)
            .unwrap_or(0);
        self.participants[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{AppState, AppTerms, OutcomeInterpreterParams},
        sig::{ChannelSigner, RootSigner},
    };
    use serde_json::json;

    struct Setup {
        initiator: RootSigner,
        responder: RootSigner,
        app: AppInstance,
    }

    fn setup() -> Setup {
        let initiator = RootSigner::from_seed(b"commitment initiator").unwrap();
        let responder = RootSigner::from_seed(b"commitment responder").unwrap();
        let app = AppInstance::new(
            Address([0x11; 20]),
            initiator.public_identifier(),
            responder.public_identifier(),
            7,
            AppTerms {
                app_definition: Address([0x22; 20]),
                initial_state: AppState(json!({ "x": 1 })),
                initiator_deposit: 0.into(),
                responder_deposit: 0.into(),
                default_timeout: 50.into(),
                state_timeout: 5.into(),
                outcome_interpreter: OutcomeInterpreterParams {
                    limit: 0.into(),
                    token_address: Address::default(),
                },
            },
        )
        .unwrap();
        Setup {
            initiator,
            responder,
            app,
        }
    }

    async fn signed(s: &Setup) -> (SetStateCommitment, Signature, Signature) {
        let c = SetStateCommitment::new(&s.app);
        let a = s.initiator.sign(c.digest(), 7).await.unwrap();
        let b = s.responder.sign(c.digest(), 7).await.unwrap();
        (c, a, b)
    }

    #[tokio::test]
    async fn slots_do_not_depend_on_arrival_order() {
        let s = setup();
        let (c, a, b) = signed(&s).await;

        let mut ab = c.clone();
        ab.add_signatures([a, b]).unwrap();
        let mut ba = c;
        ba.add_signatures([b]).unwrap();
        assert!(!ba.is_complete());
        ba.add_signatures([a]).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.signatures().unwrap(), [a, b]);
    }

    #[tokio::test]
    async fn incomplete_commitment_has_no_signatures() {
        let s = setup();
        let (mut c, a, _) = signed(&s).await;
        c.add_signatures([a]).unwrap();
        assert!(matches!(
            c.signatures(),
            Err(CommitmentError::MissingSignature(1))
        ));
    }

    #[tokio::test]
    async fn stranger_is_rejected() {
        let s = setup();
        let (mut c, _, _) = signed(&s).await;
        let stranger = RootSigner::from_seed(b"someone else").unwrap();
        let sig = stranger.sign(c.digest(), 7).await.unwrap();
        let err = c.add_signatures([sig]).unwrap_err();
        assert!(matches!(
            ProtocolError::from(err),
            ProtocolError::Authentication { .. }
        ));
    }

    #[tokio::test]
    async fn verify_checks_the_ephemeral_key() {
        let s = setup();
        let (c, _, b) = signed(&s).await;
        let expected = s.app.participants()[1];
        c.verify(b, expected).unwrap();

        // Same root, wrong app: the key for seq no 8 must not verify.
        let wrong = s.responder.sign(c.digest(), 8).await.unwrap();
        assert!(matches!(
            c.verify(wrong, expected),
            Err(CommitmentError::UnexpectedSigner { .. })
        ));
    }

    #[test]
    fn digest_binds_version_and_state() {
        let s = setup();
        let c0 = SetStateCommitment::new(&s.app);
        let next = s.app.with_state(s.app.state().clone());
        let c1 = SetStateCommitment::new(&next);
        assert_eq!(c0.state_hash(), c1.state_hash());
        assert_ne!(c0.digest(), c1.digest());

        let other = s.app.with_state(AppState(json!({ "x": 2 })));
        assert_ne!(c1.digest(), SetStateCommitment::new(&other).digest());
    }
}
