use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{AppState, ChannelError};
use crate::types::{Address, Hash, U256};

/// The app definition address recorded for free balance apps. The free
/// balance is never driven through an app definition, the address only
/// takes part in its identity hash.
pub const FREE_BALANCE_APP_DEFINITION: Address = Address([0; 20]);

/// The native token of the chain.
pub const NATIVE_TOKEN: Address = Address([0; 20]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinTransfer {
    pub to: Address,
    pub amount: U256,
}

/// Typed view of the free balance app's state: the funds of both parties that
/// are not locked in an app, per token, plus the apps currently holding
/// funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeBalance {
    /// Free balance addresses, channel initiator first.
    parties: [Address; 2],
    balances: BTreeMap<Address, [CoinTransfer; 2]>,
    active_apps: Vec<Hash>,
}

impl FreeBalance {
    pub fn new(parties: [Address; 2]) -> Self {
        Self {
            parties,
            balances: BTreeMap::new(),
            active_apps: Vec::new(),
        }
    }

    pub fn from_state(state: &AppState) -> Result<Self, ChannelError> {
        Ok(serde_json::from_value(state.0.clone())?)
    }

    pub fn to_state(&self) -> AppState {
        AppState(serde_json::to_value(self).expect("free balance serializes to json"))
    }

    pub fn parties(&self) -> [Address; 2] {
        self.parties
    }

    /// Balance of party `idx` (0 = channel initiator) in `token`.
    pub fn balance(&self, token: Address, idx: usize) -> U256 {
        self.balances
            .get(&token)
            .map(|t| t[idx].amount)
            .unwrap_or_default()
    }

    pub fn active_apps(&self) -> &[Hash] {
        &self.active_apps
    }

    fn entry(&mut self, token: Address) -> &mut [CoinTransfer; 2] {
        let parties = self.parties;
        self.balances.entry(token).or_insert_with(|| {
            parties.map(|to| CoinTransfer {
                to,
                amount: U256::zero(),
            })
        })
    }

    /// Add funds that arrived in the multisig.
    pub fn deposit(&mut self, token: Address, amounts: [U256; 2]) -> Result<(), ChannelError> {
        let entry = self.entry(token);
        for (t, amount) in entry.iter_mut().zip(amounts) {
            t.amount = t
                .amount
                .checked_add(amount)
                .ok_or(ChannelError::Overflow)?;
        }
        Ok(())
    }

    /// Move the deposits of a newly installed app out of the free balance.
    pub fn lock_for_app(
        &mut self,
        app: Hash,
        token: Address,
        amounts: [U256; 2],
    ) -> Result<(), ChannelError> {
        if self.active_apps.contains(&app) {
            return Err(ChannelError::AppAlreadyActive(app));
        }

        let entry = self.entry(token);
        let mut debited = *entry;
        for (t, amount) in debited.iter_mut().zip(amounts) {
            t.amount = t
                .amount
                .checked_sub(amount)
                .ok_or(ChannelError::InsufficientBalance {
                    party: t.to,
                    token,
                })?;
        }
        *entry = debited;
        self.active_apps.push(app);
        Ok(())
    }

    /// Pay out the outcome of an uninstalled app.
    ///
    /// Each transfer is credited to the party whose free balance address it
    /// names. The total may not exceed `limit`.
    pub fn release_from_app(
        &mut self,
        app: Hash,
        token: Address,
        limit: U256,
        outcome: &[CoinTransfer],
    ) -> Result<(), ChannelError> {
        let pos = self
            .active_apps
            .iter()
            .position(|h| *h == app)
            .ok_or(ChannelError::AppNotFound(app))?;

        let mut total = U256::zero();
        for t in outcome {
            total = total.checked_add(t.amount).ok_or(ChannelError::Overflow)?;
        }
        if total > limit {
            return Err(ChannelError::OutcomeExceedsLimit { limit, total });
        }

        let parties = self.parties;
        let entry = self.entry(token);
        let mut credited = *entry;
        for t in outcome {
            let idx = parties
                .iter()
                .position(|p| *p == t.to)
                .ok_or(ChannelError::UnknownRecipient(t.to))?;
            credited[idx].amount = credited[idx]
                .amount
                .checked_add(t.amount)
                .ok_or(ChannelError::Overflow)?;
        }
        *entry = credited;
        self.active_apps.remove(pos);
        Ok(())
    }
}
