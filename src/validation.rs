//! Validator registry: the checks a party runs before it agrees to anything.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    channel::FreeBalance,
    error::ProtocolError,
    protocol::{Protocol, ProtocolParams, ValidationContext},
};

#[async_trait]
pub trait Validator: Send + Sync + fmt::Debug {
    /// Fails with [ProtocolError::Validation] on the first rejecting check.
    async fn validate(&self, ctx: &ValidationContext) -> Result<(), ProtocolError>;
}

pub type Check = Arc<dyn Fn(&ValidationContext) -> Result<(), String> + Send + Sync>;

/// Checks per protocol. A protocol without checks accepts everything.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    checks: HashMap<Protocol, Vec<Check>>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.checks.iter().map(|(p, c)| (p, c.len())).collect();
        f.debug_struct("ValidatorRegistry")
            .field("checks", &counts)
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the generic checks every deployment wants.
    pub fn with_default_checks() -> Self {
        let mut registry = Self::new();
        for protocol in [
            Protocol::Propose,
            Protocol::Install,
            Protocol::Update,
            Protocol::TakeAction,
            Protocol::Uninstall,
        ] {
            registry.register(protocol, parties_match_channel);
        }
        registry.register(Protocol::Propose, limit_within_deposits);
        registry.register(Protocol::Update, free_balance_keeps_active_apps);
        registry
    }

    pub fn register<F>(&mut self, protocol: Protocol, check: F) -> &mut Self
    where
        F: Fn(&ValidationContext) -> Result<(), String> + Send + Sync + 'static,
    {
        self.checks
            .entry(protocol)
            .or_default()
            .push(Arc::new(check));
        self
    }
}

#[async_trait]
impl Validator for ValidatorRegistry {
    async fn validate(&self, ctx: &ValidationContext) -> Result<(), ProtocolError> {
        for check in self.checks.get(&ctx.protocol).into_iter().flatten() {
            check(ctx).map_err(|reason| {
                ProtocolError::Validation(format!("{} ({:?}): {reason}", ctx.protocol, ctx.role))
            })?;
        }
        Ok(())
    }
}

fn parties_match_channel(ctx: &ValidationContext) -> Result<(), String> {
    let Some(channel) = &ctx.channel else {
        return Ok(());
    };
    let parties = ctx.params.parties();
    if parties.initiator_identifier == parties.responder_identifier
        || !channel.is_participant(&parties.initiator_identifier)
        || !channel.is_participant(&parties.responder_identifier)
    {
        return Err("parties are not the participants of the channel".into());
    }
    Ok(())
}

fn limit_within_deposits(ctx: &ValidationContext) -> Result<(), String> {
    let ProtocolParams::Propose(p) = &ctx.params else {
        return Ok(());
    };
    let deposits = p
        .terms
        .initiator_deposit
        .checked_add(p.terms.responder_deposit)
        .ok_or("deposits overflow")?;
    if p.terms.outcome_interpreter.limit > deposits {
        return Err(format!(
            "outcome limit {} exceeds deposits {deposits}",
            p.terms.outcome_interpreter.limit
        ));
    }
    Ok(())
}

fn free_balance_keeps_active_apps(ctx: &ValidationContext) -> Result<(), String> {
    let (ProtocolParams::Update(p), Some(channel)) = (&ctx.params, &ctx.channel) else {
        return Ok(());
    };
    if p.app_identity_hash != channel.free_balance().identity_hash() {
        return Ok(());
    }
    let current = channel.free_balance_state().map_err(|e| e.to_string())?;
    let next = FreeBalance::from_state(&p.new_state).map_err(|e| e.to_string())?;
    if current.active_apps() != next.active_apps() || current.parties() != next.parties() {
        return Err("free balance updates cannot change active apps or parties".into());
    }
    Ok(())
}
