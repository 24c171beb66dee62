use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{
    AppInstance, AppState, AppTerms, ChannelError, CoinTransfer, FreeBalance,
    OutcomeInterpreterParams, FREE_BALANCE_APP_DEFINITION,
};
use crate::{
    sig::Identifier,
    types::{Address, Hash, U256},
};

/// Immutable value of one multisig channel.
///
/// Every operation returns a new value and leaves `self` untouched. App
/// instances are shared between versions through [Arc], only the entries an
/// operation touches are replaced. Each operation bumps `version` by one, so
/// two values derived from the same snapshot can be told apart from a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChannel {
    multisig_address: Address,
    initiator_identifier: Identifier,
    responder_identifier: Identifier,
    free_balance: Arc<AppInstance>,
    proposed_apps: BTreeMap<Hash, Arc<AppInstance>>,
    installed_apps: BTreeMap<Hash, Arc<AppInstance>>,
    num_proposed_apps: u32,
    version: u64,
}

impl StateChannel {
    /// A fresh channel with an empty free balance at app sequence number 0.
    pub fn setup(
        multisig_address: Address,
        initiator_identifier: Identifier,
        responder_identifier: Identifier,
        free_balance_timeout: U256,
    ) -> Result<Self, ChannelError> {
        let parties = [
            initiator_identifier.derive_address(0)?,
            responder_identifier.derive_address(0)?,
        ];
        let terms = AppTerms {
            app_definition: FREE_BALANCE_APP_DEFINITION,
            initial_state: FreeBalance::new(parties).to_state(),
            initiator_deposit: U256::zero(),
            responder_deposit: U256::zero(),
            default_timeout: free_balance_timeout,
            state_timeout: free_balance_timeout,
            outcome_interpreter: OutcomeInterpreterParams {
                limit: U256::zero(),
                token_address: Address::default(),
            },
        };
        let free_balance = AppInstance::new(
            multisig_address,
            initiator_identifier,
            responder_identifier,
            0,
            terms,
        )?;

        Ok(Self {
            multisig_address,
            initiator_identifier,
            responder_identifier,
            free_balance: Arc::new(free_balance),
            proposed_apps: BTreeMap::new(),
            installed_apps: BTreeMap::new(),
            num_proposed_apps: 0,
            version: 0,
        })
    }

    pub fn multisig_address(&self) -> Address {
        self.multisig_address
    }

    pub fn initiator_identifier(&self) -> &Identifier {
        &self.initiator_identifier
    }

    pub fn responder_identifier(&self) -> &Identifier {
        &self.responder_identifier
    }

    pub fn is_participant(&self, id: &Identifier) -> bool {
        *id == self.initiator_identifier || *id == self.responder_identifier
    }

    pub fn free_balance(&self) -> &Arc<AppInstance> {
        &self.free_balance
    }

    pub fn free_balance_state(&self) -> Result<FreeBalance, ChannelError> {
        FreeBalance::from_state(self.free_balance.state())
    }

    pub fn proposed_apps(&self) -> impl Iterator<Item = &Arc<AppInstance>> {
        self.proposed_apps.values()
    }

    pub fn installed_apps(&self) -> impl Iterator<Item = &Arc<AppInstance>> {
        self.installed_apps.values()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_proposed_apps(&self) -> u32 {
        self.num_proposed_apps
    }

    /// Sequence number the next proposal must use.
    pub fn next_app_seq_no(&self) -> u32 {
        self.num_proposed_apps + 1
    }

    /// An installed app (the free balance counts as installed).
    pub fn lookup_app(&self, identity_hash: Hash) -> Result<&Arc<AppInstance>, ChannelError> {
        if identity_hash == self.free_balance.identity_hash() {
            return Ok(&self.free_balance);
        }
        self.installed_apps
            .get(&identity_hash)
            .ok_or(ChannelError::AppNotFound(identity_hash))
    }

    pub fn lookup_proposal(&self, identity_hash: Hash) -> Result<&Arc<AppInstance>, ChannelError> {
        self.proposed_apps
            .get(&identity_hash)
            .ok_or(ChannelError::ProposalNotFound(identity_hash))
    }

    /// Replace the state of one installed app, bumping its version by one.
    pub fn replace_app_state(
        &self,
        identity_hash: Hash,
        state: AppState,
    ) -> Result<Self, ChannelError> {
        let updated = Arc::new(self.lookup_app(identity_hash)?.with_state(state));

        let mut next = self.next_version();
        if identity_hash == self.free_balance.identity_hash() {
            next.free_balance = updated;
        } else {
            next.installed_apps.insert(identity_hash, updated);
        }
        Ok(next)
    }

    /// Add a proposal built from `terms` at the next sequence number.
    ///
    /// `initiator` is the proposing party and becomes the app's initiator.
    pub fn add_proposal(
        &self,
        initiator: Identifier,
        terms: AppTerms,
    ) -> Result<(Self, Arc<AppInstance>), ChannelError> {
        let responder = self.counterparty_of(&initiator)?;
        let app = Arc::new(AppInstance::new(
            self.multisig_address,
            initiator,
            responder,
            self.next_app_seq_no(),
            terms,
        )?);
        let hash = app.identity_hash();
        if self.proposed_apps.contains_key(&hash) || self.installed_apps.contains_key(&hash) {
            return Err(ChannelError::ProposalExists(hash));
        }

        let mut next = self.next_version();
        next.proposed_apps.insert(hash, app.clone());
        next.num_proposed_apps += 1;
        Ok((next, app))
    }

    /// Move a proposal into the installed apps, locking both deposits in the
    /// free balance (whose version increases by one).
    pub fn install_app(&self, identity_hash: Hash) -> Result<Self, ChannelError> {
        let app = self.lookup_proposal(identity_hash)?.clone();

        let mut fb = self.free_balance_state()?;
        fb.lock_for_app(
            identity_hash,
            app.outcome_interpreter().token_address,
            self.amounts_by_channel_role(&app)?,
        )?;

        let mut next = self.replace_app_state(self.free_balance.identity_hash(), fb.to_state())?;
        next.proposed_apps.remove(&identity_hash);
        next.installed_apps.insert(identity_hash, app);
        Ok(next)
    }

    /// Remove an installed app, paying `outcome` into the free balance (whose
    /// version increases by one).
    pub fn uninstall_app(
        &self,
        identity_hash: Hash,
        outcome: &[CoinTransfer],
    ) -> Result<Self, ChannelError> {
        if identity_hash == self.free_balance.identity_hash() {
            return Err(ChannelError::FreeBalanceNotRemovable);
        }
        let app = self
            .installed_apps
            .get(&identity_hash)
            .ok_or(ChannelError::AppNotFound(identity_hash))?;

        let mut fb = self.free_balance_state()?;
        let interpreter = app.outcome_interpreter();
        fb.release_from_app(
            identity_hash,
            interpreter.token_address,
            interpreter.limit,
            outcome,
        )?;

        let mut next = self.replace_app_state(self.free_balance.identity_hash(), fb.to_state())?;
        next.installed_apps.remove(&identity_hash);
        Ok(next)
    }

    fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    fn counterparty_of(&self, id: &Identifier) -> Result<Identifier, ChannelError> {
        if *id == self.initiator_identifier {
            Ok(self.responder_identifier)
        } else if *id == self.responder_identifier {
            Ok(self.initiator_identifier)
        } else {
            Err(ChannelError::NotParticipant(id.to_string()))
        }
    }

    /// App deposits reordered so the channel initiator comes first.
    fn amounts_by_channel_role(&self, app: &AppInstance) -> Result<[U256; 2], ChannelError> {
        let deposits = [app.initiator_deposit(), app.responder_deposit()];
        if *app.initiator_identifier() == self.initiator_identifier {
            Ok(deposits)
        } else if *app.initiator_identifier() == self.responder_identifier {
            Ok([deposits[1], deposits[0]])
        } else {
            Err(ChannelError::NotParticipant(
                app.initiator_identifier().to_string(),
            ))
        }
    }
}
