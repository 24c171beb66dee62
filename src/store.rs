//! Persistence gateway.
//!
//! The interpreter hands the store everything a run writes as one
//! [WriteBatch]: the signed commitment(s) together with the channel/app
//! change they belong to. Implementations must apply a batch atomically.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    channel::{AppInstance, StateChannel},
    commitment::{CommitmentKind, SetStateCommitment},
    error::ProtocolError,
    protocol::AppChange,
    types::{Address, Hash},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Conflict(String),
    #[error("stale write for {what}: stored version {stored}, writing {writing}")]
    Stale {
        what: Hash,
        stored: u64,
        writing: u64,
    },
    #[error("stale write for channel {multisig}: stored version {stored}, writing {writing}")]
    StaleChannel {
        multisig: Address,
        stored: u64,
        writing: u64,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("commitment for {0} is not fully signed")]
    IncompleteCommitment(Hash),
    #[error("record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ProtocolError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}

/// The write concluding a run.
#[derive(Debug, Clone)]
pub enum ChannelWrite {
    /// A new channel (setup).
    Channel(StateChannel),
    App {
        change: AppChange,
        channel: StateChannel,
        app: Arc<AppInstance>,
    },
}

impl ChannelWrite {
    pub fn channel(&self) -> &StateChannel {
        match self {
            ChannelWrite::Channel(channel) => channel,
            ChannelWrite::App { channel, .. } => channel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub commitments: Vec<(CommitmentKind, SetStateCommitment)>,
    pub write: ChannelWrite,
}

#[async_trait]
pub trait Store: Send + Sync + Debug {
    async fn get_state_channel(
        &self,
        multisig_address: Address,
    ) -> Result<Option<StateChannel>, StoreError>;

    /// An installed app or a proposal.
    async fn get_app_instance(
        &self,
        identity_hash: Hash,
    ) -> Result<Option<AppInstance>, StoreError>;

    async fn get_commitment(
        &self,
        app_identity_hash: Hash,
    ) -> Result<Option<(CommitmentKind, SetStateCommitment)>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Records {
    channels: HashMap<Address, Value>,
    /// Installed apps and the free balances.
    apps: HashMap<Hash, Value>,
    proposals: HashMap<Hash, Value>,
    commitments: HashMap<Hash, (CommitmentKind, Value)>,
    commits: usize,
    unavailable: bool,
}

fn encode<T: Serialize>(v: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(v)?)
}

fn decode<T: DeserializeOwned>(v: &Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(v.clone())?)
}

/// In-process [Store] keeping the serialized form of every record.
///
/// Besides atomicity it enforces the consistency rules a relational backend
/// would: proposals are created once, instances only from a proposal, and
/// updates (of the channel and of the app they touch) must build on the
/// stored version.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches committed so far.
    pub async fn commits(&self) -> usize {
        self.records.lock().await.commits
    }

    /// Make every following commit fail, or recover.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.records.lock().await.unavailable = unavailable;
    }

    fn check_version(
        records: &Records,
        app: &AppInstance,
        expect_increment: bool,
    ) -> Result<(), StoreError> {
        let hash = app.identity_hash();
        let stored: AppInstance = match records.apps.get(&hash) {
            Some(v) => decode(v)?,
            None => return Err(StoreError::NotFound(format!("app {hash}"))),
        };
        let ok = if expect_increment {
            stored.version() + 1 == app.version()
        } else {
            stored.version() == app.version()
        };
        if !ok {
            return Err(StoreError::Stale {
                what: hash,
                stored: stored.version(),
                writing: app.version(),
            });
        }
        Ok(())
    }

    /// All guards, run before anything is written.
    fn check(records: &Records, batch: &WriteBatch) -> Result<(), StoreError> {
        for (_, c) in &batch.commitments {
            if !c.is_complete() {
                return Err(StoreError::IncompleteCommitment(c.app_identity_hash()));
            }
        }

        let channel = batch.write.channel();
        let multisig = channel.multisig_address();
        let (change, app) = match &batch.write {
            ChannelWrite::Channel(_) => {
                if records.channels.contains_key(&multisig) {
                    return Err(StoreError::Conflict(format!(
                        "channel {multisig} already exists"
                    )));
                }
                return Ok(());
            }
            ChannelWrite::App { change, app, .. } => (*change, app),
        };

        let stored: StateChannel = match records.channels.get(&multisig) {
            Some(v) => decode(v)?,
            None => return Err(StoreError::NotFound(format!("channel {multisig}"))),
        };

        // Install and uninstall move funds, the free balance must move by
        // exactly one version. Everything else leaves it alone.
        let fb_changes = matches!(
            change,
            AppChange::CreateInstance | AppChange::RemoveInstance
        ) || app.identity_hash() == channel.free_balance().identity_hash();
        Self::check_version(records, channel.free_balance(), fb_changes)?;

        let hash = app.identity_hash();
        match change {
            AppChange::CreateProposal => {
                if records.proposals.contains_key(&hash) || records.apps.contains_key(&hash) {
                    return Err(StoreError::Conflict(format!("proposal {hash} exists")));
                }
            }
            AppChange::CreateInstance => {
                if !records.proposals.contains_key(&hash) {
                    return Err(StoreError::NotFound(format!("proposal {hash}")));
                }
            }
            AppChange::UpdateInstance => {
                if hash != channel.free_balance().identity_hash() {
                    Self::check_version(records, app, true)?;
                }
            }
            AppChange::RemoveInstance => {
                if !records.apps.contains_key(&hash) {
                    return Err(StoreError::NotFound(format!("app {hash}")));
                }
            }
        }

        // The channel record is replaced whole, so it must build on exactly
        // what is stored or it would drop another run's change.
        if stored.version() + 1 != channel.version() {
            return Err(StoreError::StaleChannel {
                multisig,
                stored: stored.version(),
                writing: channel.version(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_state_channel(
        &self,
        multisig_address: Address,
    ) -> Result<Option<StateChannel>, StoreError> {
        let records = self.records.lock().await;
        records
            .channels
            .get(&multisig_address)
            .map(decode)
            .transpose()
    }

    async fn get_app_instance(
        &self,
        identity_hash: Hash,
    ) -> Result<Option<AppInstance>, StoreError> {
        let records = self.records.lock().await;
        records
            .apps
            .get(&identity_hash)
            .or_else(|| records.proposals.get(&identity_hash))
            .map(decode)
            .transpose()
    }

    async fn get_commitment(
        &self,
        app_identity_hash: Hash,
    ) -> Result<Option<(CommitmentKind, SetStateCommitment)>, StoreError> {
        let records = self.records.lock().await;
        match records.commitments.get(&app_identity_hash) {
            Some((kind, v)) => Ok(Some((*kind, decode(v)?))),
            None => Ok(None),
        }
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.unavailable {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Self::check(&records, &batch)?;

        // Encode everything up front so a failure cannot leave half a batch.
        let commitments = batch
            .commitments
            .iter()
            .map(|(kind, c)| Ok((c.app_identity_hash(), (*kind, encode(c)?))))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let channel = batch.write.channel();
        let channel_record = encode(channel)?;
        let fb = channel.free_balance();
        let fb_record = encode(fb.as_ref())?;
        let app_record = match &batch.write {
            ChannelWrite::App { change, app, .. } => {
                Some((*change, app.identity_hash(), encode(app.as_ref())?))
            }
            ChannelWrite::Channel(_) => None,
        };

        records
            .channels
            .insert(channel.multisig_address(), channel_record);
        records.apps.insert(fb.identity_hash(), fb_record);
        if let Some((change, hash, record)) = app_record {
            match change {
                AppChange::CreateProposal => {
                    records.proposals.insert(hash, record);
                }
                AppChange::CreateInstance => {
                    records.proposals.remove(&hash);
                    records.apps.insert(hash, record);
                }
                AppChange::UpdateInstance => {
                    records.apps.insert(hash, record);
                }
                AppChange::RemoveInstance => {
                    records.apps.remove(&hash);
                }
            }
        }
        records.commitments.extend(commitments);
        records.commits += 1;
        Ok(())
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

    struct Fixture {
        a: RootSigner,
        b: RootSigner,
        store: MemoryStore,
        channel: StateChannel,
    }

    async fn signed(f: &Fixture, app: &AppInstance) -> SetStateCommitment {
        let mut c = SetStateCommitment::new(app);
        let seq = app.app_seq_no();
        let sigs = [
            f.a.sign(c.digest(), seq).await.unwrap(),
            f.b.sign(c.digest(), seq).await.unwrap(),
        ];
        c.add_signatures(sigs).unwrap();
        c
    }

    async fn fixture() -> Fixture {
        let a = RootSigner::from_seed(b"store a").unwrap();
        let b = RootSigner::from_seed(b"store b").unwrap();
        let channel = StateChannel::setup(
            Address([5; 20]),
            a.public_identifier(),
            b.public_identifier(),
            10.into(),
        )
        .unwrap();
        let f = Fixture {
            a,
            b,
            store: MemoryStore::new(),
            channel,
        };
        let c = signed(&f, f.channel.free_balance()).await;
        f.store
            .commit(WriteBatch {
                commitments: vec![(CommitmentKind::SetState, c)],
                write: ChannelWrite::Channel(f.channel.clone()),
            })
            .await
            .unwrap();
        f
    }

    fn terms() -> AppTerms {
        AppTerms {
            app_definition: Address([9; 20]),
            initial_state: AppState(json!({})),
            initiator_deposit: 0.into(),
            responder_deposit: 0.into(),
            default_timeout: 1.into(),
            state_timeout: 1.into(),
            outcome_interpreter: OutcomeInterpreterParams {
                limit: 0.into(),
                token_address: Address::default(),
            },
        }
    }

    #[tokio::test]
    async fn setup_roundtrip() {
        let f = fixture().await;
        let stored = f
            .store
            .get_state_channel(f.channel.multisig_address())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, f.channel);
        let (kind, c) = f
            .store
            .get_commitment(f.channel.free_balance().identity_hash())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, CommitmentKind::SetState);
        assert!(c.is_complete());
    }

    #[tokio::test]
    async fn instance_requires_proposal() {
        let f = fixture().await;
        let (with_proposal, app) = f
            .channel
            .add_proposal(f.a.public_identifier(), terms())
            .unwrap();
        let installed = with_proposal.install_app(app.identity_hash()).unwrap();
        let c = signed(&f, installed.free_balance()).await;

        // The proposal was never written.
        let err = f
            .store
            .commit(WriteBatch {
                commitments: vec![(CommitmentKind::SetState, c)],
                write: ChannelWrite::App {
                    change: AppChange::CreateInstance,
                    channel: installed,
                    app,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(f.store.commits().await, 1);
    }

    #[tokio::test]
    async fn rejects_unsigned_commitment() {
        let f = fixture().await;
        let (channel, app) = f
            .channel
            .add_proposal(f.a.public_identifier(), terms())
            .unwrap();
        let err = f
            .store
            .commit(WriteBatch {
                commitments: vec![(CommitmentKind::Proposal, SetStateCommitment::new(&app))],
                write: ChannelWrite::App {
                    change: AppChange::CreateProposal,
                    channel,
                    app,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IncompleteCommitment(_)));
    }

    #[tokio::test]
    async fn second_write_from_the_same_snapshot_is_stale() {
        let f = fixture().await;
        let (proposed, app) = f
            .channel
            .add_proposal(f.a.public_identifier(), terms())
            .unwrap();
        let hash = app.identity_hash();
        f.store
            .commit(WriteBatch {
                commitments: vec![(CommitmentKind::Proposal, signed(&f, &app).await)],
                write: ChannelWrite::App {
                    change: AppChange::CreateProposal,
                    channel: proposed.clone(),
                    app,
                },
            })
            .await
            .unwrap();

        let installed = proposed.install_app(hash).unwrap();
        f.store
            .commit(WriteBatch {
                commitments: vec![(
                    CommitmentKind::SetState,
                    signed(&f, installed.free_balance()).await,
                )],
                write: ChannelWrite::App {
                    change: AppChange::CreateInstance,
                    app: installed.lookup_app(hash).unwrap().clone(),
                    channel: installed.clone(),
                },
            })
            .await
            .unwrap();

        // Two runs that both read `installed` and then persist.
        let mut errors = Vec::new();
        for n in [1, 2] {
            let post = installed
                .replace_app_state(hash, AppState(json!({ "n": n })))
                .unwrap();
            let app = post.lookup_app(hash).unwrap().clone();
            let res = f
                .store
                .commit(WriteBatch {
                    commitments: vec![(CommitmentKind::SetState, signed(&f, &app).await)],
                    write: ChannelWrite::App {
                        change: AppChange::UpdateInstance,
                        channel: post,
                        app,
                    },
                })
                .await;
            if let Err(e) = res {
                errors.push(e);
            }
        }
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            StoreError::Stale {
                stored: 1,
                writing: 1,
                ..
            }
        ));
        let stored = f.store.get_app_instance(hash).await.unwrap().unwrap();
        assert_eq!(stored.state().0["n"], 1);
    }

    #[tokio::test]
    async fn proposals_from_the_same_snapshot_cannot_both_land() {
        let f = fixture().await;
        let mut results = Vec::new();
        for definition in [Address([9; 20]), Address([8; 20])] {
            let (channel, app) = f
                .channel
                .add_proposal(
                    f.a.public_identifier(),
                    AppTerms {
                        app_definition: definition,
                        ..terms()
                    },
                )
                .unwrap();
            results.push(
                f.store
                    .commit(WriteBatch {
                        commitments: vec![(CommitmentKind::Proposal, signed(&f, &app).await)],
                        write: ChannelWrite::App {
                            change: AppChange::CreateProposal,
                            channel,
                            app,
                        },
                    })
                    .await,
            );
        }

        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(StoreError::StaleChannel {
                stored: 1,
                writing: 1,
                ..
            })
        ));
        let stored = f
            .store
            .get_state_channel(f.channel.multisig_address())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.num_proposed_apps(), 1);
        assert_eq!(stored.proposed_apps().count(), 1);
        assert_eq!(f.store.commits().await, 2);
    }

    #[tokio::test]
    async fn stale_free_balance_update() {
        let f = fixture().await;
        let fb = f.channel.free_balance().identity_hash();
        let next = f
            .channel
            .replace_app_state(fb, f.channel.free_balance().state().clone())
            .unwrap();
        // Skips a version.
        let skipped = next
            .replace_app_state(fb, next.free_balance().state().clone())
            .unwrap();
        let c = signed(&f, skipped.free_balance()).await;

        let err = f
            .store
            .commit(WriteBatch {
                commitments: vec![(CommitmentKind::SetState, c)],
                write: ChannelWrite::App {
                    change: AppChange::UpdateInstance,
                    app: skipped.free_balance().clone(),
                    channel: skipped,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Stale {
                stored: 0,
                writing: 2,
                ..
            }
        ));
    }
}
