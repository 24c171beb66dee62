use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use super::{decode_action, decode_state, encode_state, AppDefinition, ChainContext, TransitionError};
use crate::{
    channel::{AppAction, AppState, CoinTransfer},
    sig::recover_signer,
    types::{Address, Hash, Signature, U256},
};

/// Payment released by a signature of `signer_address` over
/// `(payment_id, data)`, e.g. an attestation that some off-chain work was
/// done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleSignedTransferState {
    pub coin_transfers: [CoinTransfer; 2],
    pub signer_address: Address,
    pub payment_id: Hash,
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleSignedTransferAction {
    pub data: Hash,
    pub signature: Signature,
}

/// The digest the designated signer signs.
pub fn signed_transfer_digest(payment_id: &Hash, data: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(payment_id.0);
    hasher.update(data.0);
    Hash(hasher.finalize().into())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleSignedTransferApp;

impl AppDefinition for SimpleSignedTransferApp {
    fn apply_action(
        &self,
        state: &AppState,
        action: &AppAction,
        _chain: &ChainContext,
    ) -> Result<AppState, TransitionError> {
        let mut state: SimpleSignedTransferState = decode_state(state)?;
        let action: SimpleSignedTransferAction = decode_action(action)?;

        if state.finalized {
            return Err(TransitionError::Rejected("transfer already finalized".into()));
        }

        let digest = signed_transfer_digest(&state.payment_id, &action.data);
        let signer = recover_signer(digest, action.signature)
            .map_err(|e| TransitionError::Rejected(format!("invalid signature: {e}")))?;
        if signer != state.signer_address {
            return Err(TransitionError::Rejected(format!(
                "signed by {signer}, expected {}",
                state.signer_address
            )));
        }

        let [sender, receiver] = state.coin_transfers;
        state.coin_transfers = [
            CoinTransfer {
                to: sender.to,
                amount: U256::zero(),
            },
            CoinTransfer {
                to: receiver.to,
                amount: receiver
                    .amount
                    .checked_add(sender.amount)
                    .ok_or_else(|| TransitionError::Rejected("amount overflow".into()))?,
            },
        ];
        state.finalized = true;
        Ok(encode_state(&state))
    }

    fn compute_outcome(&self, state: &AppState) -> Result<Vec<CoinTransfer>, TransitionError> {
        let state: SimpleSignedTransferState = decode_state(state)?;
        Ok(state.coin_transfers.to_vec())
    }
}
