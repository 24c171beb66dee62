use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{decode_action, decode_state, encode_state, AppDefinition, ChainContext, TransitionError};
use crate::{
    channel::{AppAction, AppState, CoinTransfer},
    types::{Hash, U256},
};

/// Conditional payment unlocked by revealing the sha256 pre-image of
/// `lock_hash` before block `expiry`.
///
/// `coin_transfers` is `[sender, receiver]`. Unlocking moves everything to the
/// receiver; if the lock is never opened the sender keeps the funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashLockTransferState {
    pub coin_transfers: [CoinTransfer; 2],
    pub lock_hash: Hash,
    pub pre_image: Hash,
    pub expiry: U256,
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashLockTransferAction {
    pub pre_image: Hash,
}

pub fn lock_hash(pre_image: &Hash) -> Hash {
    Hash(Sha256::digest(pre_image.0).into())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HashLockTransferApp;

impl AppDefinition for HashLockTransferApp {
    fn apply_action(
        &self,
        state: &AppState,
        action: &AppAction,
        chain: &ChainContext,
    ) -> Result<AppState, TransitionError> {
        let mut state: HashLockTransferState = decode_state(state)?;
        let action: HashLockTransferAction = decode_action(action)?;

        if state.finalized {
            return Err(TransitionError::Rejected("transfer already finalized".into()));
        }
        if U256::from(chain.block_number) >= state.expiry {
            return Err(TransitionError::Rejected(format!(
                "lock expired at block {}",
                state.expiry
            )));
        }
        if lock_hash(&action.pre_image) != state.lock_hash {
            return Err(TransitionError::Rejected(
                "pre-image does not match lock hash".into(),
            ));
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
        state.pre_image = action.pre_image;
        state.finalized = true;
        Ok(encode_state(&state))
    }

    fn compute_outcome(&self, state: &AppState) -> Result<Vec<CoinTransfer>, TransitionError> {
        let state: HashLockTransferState = decode_state(state)?;
        Ok(state.coin_transfers.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use serde_json::json;

    const SENDER: Address = Address([1; 20]);
    const RECEIVER: Address = Address([2; 20]);

    fn state(pre_image: &Hash) -> AppState {
        encode_state(&HashLockTransferState {
            coin_transfers: [
                CoinTransfer {
                    to: SENDER,
                    amount: 5.into(),
                },
                CoinTransfer {
                    to: RECEIVER,
                    amount: 0.into(),
                },
            ],
            lock_hash: lock_hash(pre_image),
            pre_image: Hash::default(),
            expiry: 100.into(),
            finalized: false,
        })
    }

    fn reveal(pre_image: &Hash) -> AppAction {
        AppAction(json!({ "preImage": pre_image }))
    }

    #[test]
    fn unlock_pays_receiver() {
        let p = Hash([9; 32]);
        let next = HashLockTransferApp
            .apply_action(&state(&p), &reveal(&p), &ChainContext { block_number: 10 })
            .unwrap();
        let outcome = HashLockTransferApp.compute_outcome(&next).unwrap();
        assert_eq!(outcome[0].amount, U256::zero());
        assert_eq!(outcome[1].amount, 5.into());
        assert_eq!(outcome[1].to, RECEIVER);
    }

    #[test]
    fn wrong_pre_image() {
        let p = Hash([9; 32]);
        let res = HashLockTransferApp.apply_action(
            &state(&p),
            &reveal(&Hash([8; 32])),
            &ChainContext { block_number: 10 },
        );
        assert!(matches!(res, Err(TransitionError::Rejected(_))));
    }

    #[test]
    fn expired_lock() {
        let p = Hash([9; 32]);
        let res = HashLockTransferApp.apply_action(
            &state(&p),
            &reveal(&p),
            &ChainContext { block_number: 100 },
        );
        assert!(matches!(res, Err(TransitionError::Rejected(_))));
    }

    #[test]
    fn unfinalized_outcome_refunds_sender() {
        let p = Hash([9; 32]);
        let outcome = HashLockTransferApp.compute_outcome(&state(&p)).unwrap();
        assert_eq!(outcome[0].amount, 5.into());
    }
}
