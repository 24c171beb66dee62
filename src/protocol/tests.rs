//! Flows driven by hand, without interpreter, store or network: every request
//! is answered directly from a [Party].

use super::*;
use crate::{
    apps::{lock_hash, HashLockTransferApp, HashLockTransferState},
    channel::{AppAction, AppState, AppTerms, CoinTransfer, OutcomeInterpreterParams, NATIVE_TOKEN},
    sig::{recover_signer, ChannelSigner, RootSigner},
    types::U256,
};
use serde_json::json;

const MULTISIG: Address = Address([0x4d; 20]);
const HASHLOCK: Address = Address([0x48; 20]);
const PRE_IMAGE: Hash = Hash([0x50; 32]);

struct Party {
    signer: RootSigner,
    channel: Option<StateChannel>,
    chain: ChainContext,
    reject: Option<&'static str>,
    log: Vec<&'static str>,
    sent: Vec<ProtocolMessage>,
}

impl Party {
    fn new(seed: &[u8], channel: Option<StateChannel>) -> Self {
        Party {
            signer: RootSigner::from_seed(seed).unwrap(),
            channel,
            chain: ChainContext { block_number: 10 },
            reject: None,
            log: Vec::new(),
            sent: Vec::new(),
        }
    }

    fn id(&self) -> Identifier {
        self.signer.public_identifier()
    }
}

#[derive(Debug)]
enum Outcome {
    Waiting(ProtocolMessage),
    Done(RunOutput),
}

/// Step `flow` until it finishes or waits for the counterparty.
async fn pump(
    flow: &mut dyn ProtocolFlow,
    party: &mut Party,
    mut input: Option<Response>,
) -> Result<Outcome, ProtocolError> {
    loop {
        let request = match flow.step(input.take())? {
            Step::Done(out) => return Ok(Outcome::Done(out)),
            Step::Request(r) => r,
        };
        party.log.push(request.name());
        input = Some(match request {
            Request::LoadChannel { .. } => Response::Channel(party.channel.clone()),
            Request::Validate(_) => match party.reject {
                Some(reason) => return Err(ProtocolError::Validation(reason.into())),
                None => Response::Ack,
            },
            Request::FetchChainContext => Response::Chain(party.chain),
            Request::Sign { digest, app_seq_no } => {
                Response::Signature(party.signer.sign(digest, app_seq_no).await.unwrap())
            }
            Request::Send(msg) => {
                party.sent.push(msg);
                Response::Ack
            }
            Request::SendAndWait(msg) => return Ok(Outcome::Waiting(msg)),
            Request::PersistStateChannel(channel) => {
                party.channel = Some(channel);
                Response::Ack
            }
            Request::PersistAppInstance { channel, .. } => {
                party.channel = Some(channel);
                Response::Ack
            }
            Request::PersistCommitment { .. } => Response::Ack,
        });
    }
}

/// Full round trip of one run between `a` (initiator) and `b`.
async fn run_both(
    params: ProtocolParams,
    a: &mut Party,
    b: &mut Party,
    apps: &Arc<AppRegistry>,
) -> Result<(RunOutput, RunOutput), ProtocolError> {
    let mut init = initiate(params, apps.clone());
    let first = match pump(init.as_mut(), a, None).await? {
        Outcome::Waiting(m) => m,
        Outcome::Done(_) => panic!("initiator finished without counterparty"),
    };

    let mut resp = respond(first, apps.clone())?;
    let out_b = match pump(resp.as_mut(), b, None).await? {
        Outcome::Done(out) => out,
        Outcome::Waiting(_) => panic!("responder must not wait"),
    };
    let reply = b.sent.pop().expect("responder replied");
    assert_eq!(reply.seq, Seq::Terminal);

    let out_a = match pump(init.as_mut(), a, Some(Response::Reply(reply))).await? {
        Outcome::Done(out) => out,
        Outcome::Waiting(_) => panic!("initiator waits twice"),
    };
    assert_eq!(init.phase(), Phase::Done);
    assert_eq!(resp.phase(), Phase::Done);
    Ok((out_a, out_b))
}

fn apps() -> Arc<AppRegistry> {
    let mut apps = AppRegistry::new();
    apps.register(HASHLOCK, Arc::new(HashLockTransferApp));
    Arc::new(apps)
}

fn dummy_terms() -> AppTerms {
    AppTerms {
        app_definition: Address([0xdd; 20]),
        initial_state: AppState(json!({})),
        initiator_deposit: U256::zero(),
        responder_deposit: U256::zero(),
        default_timeout: 10.into(),
        state_timeout: 10.into(),
        outcome_interpreter: OutcomeInterpreterParams {
            limit: U256::zero(),
            token_address: NATIVE_TOKEN,
        },
    }
}

fn hashlock_terms(x: &Identifier, y: &Identifier) -> AppTerms {
    let state = HashLockTransferState {
        coin_transfers: [
            CoinTransfer {
                to: x.derive_address(0).unwrap(),
                amount: 5.into(),
            },
            CoinTransfer {
                to: y.derive_address(0).unwrap(),
                amount: U256::zero(),
            },
        ],
        lock_hash: lock_hash(&PRE_IMAGE),
        pre_image: Hash::default(),
        expiry: 100.into(),
        finalized: false,
    };
    AppTerms {
        app_definition: HASHLOCK,
        initial_state: AppState(serde_json::to_value(state).unwrap()),
        initiator_deposit: 5.into(),
        responder_deposit: U256::zero(),
        default_timeout: 100.into(),
        state_timeout: 10.into(),
        outcome_interpreter: OutcomeInterpreterParams {
            limit: 5.into(),
            token_address: NATIVE_TOKEN,
        },
    }
}

/// Channel between X and Y with six proposals and an installed hashlock
/// transfer at appSeqNo 7.
fn channel_with_hashlock(x: &Identifier, y: &Identifier) -> (StateChannel, Hash) {
    let ch = StateChannel::setup(MULTISIG, *x, *y, 100.into()).unwrap();
    let mut fb = ch.free_balance_state().unwrap();
    fb.deposit(NATIVE_TOKEN, [10.into(), 10.into()]).unwrap();
    let mut ch = ch
        .replace_app_state(ch.free_balance().identity_hash(), fb.to_state())
        .unwrap();

    for _ in 0..6 {
        ch = ch.add_proposal(*x, dummy_terms()).unwrap().0;
    }
    let (ch, app) = ch.add_proposal(*x, hashlock_terms(x, y)).unwrap();
    assert_eq!(app.app_seq_no(), 7);
    let hash = app.identity_hash();
    (ch.install_app(hash).unwrap(), hash)
}

fn take_action(a: &Party, b: &Party, app: Hash, pre_image: Hash) -> ProtocolParams {
    ProtocolParams::TakeAction(TakeActionParams {
        parties: Parties {
            multisig_address: MULTISIG,
            initiator_identifier: a.id(),
            responder_identifier: b.id(),
        },
        app_identity_hash: app,
        action: AppAction(json!({ "preImage": pre_image })),
    })
}

/// X and Y sharing the channel from [channel_with_hashlock].
fn fresh() -> (Party, Party, Hash) {
    let mut x = Party::new(b"party x", None);
    let mut y = Party::new(b"party y", None);
    let (ch, hash) = channel_with_hashlock(&x.id(), &y.id());
    x.channel = Some(ch.clone());
    y.channel = Some(ch);
    (x, y, hash)
}

#[tokio::test]
async fn take_action_reveals_pre_image() {
    let (mut x, mut y, hash) = fresh();
    let pre = x.channel.clone().unwrap();
    let old = pre.lookup_app(hash).unwrap().clone();

    let (out_x, out_y) = run_both(take_action(&x, &y, hash, PRE_IMAGE), &mut x, &mut y, &apps())
        .await
        .unwrap();

    // Both sides computed the same post-protocol value independently.
    assert_eq!(out_x.channel, out_y.channel);
    assert_eq!(out_x.commitment, out_y.commitment);

    let new = out_x.channel.lookup_app(hash).unwrap();
    assert_eq!(new.version(), old.version() + 1);
    let state: HashLockTransferState = serde_json::from_value(new.state().0.clone()).unwrap();
    assert_eq!(state.coin_transfers[0].amount, U256::zero());
    assert_eq!(state.coin_transfers[1].amount, 5.into());
    assert!(state.finalized);

    // Slots follow the app's roles: derive(X, 7) first, derive(Y, 7) second.
    let [sx, sy] = out_x.commitment.signatures().unwrap();
    let digest = out_x.commitment.digest();
    assert_eq!(
        recover_signer(digest, sx).unwrap(),
        x.id().derive_address(7).unwrap()
    );
    assert_eq!(
        recover_signer(digest, sy).unwrap(),
        y.id().derive_address(7).unwrap()
    );

    // The pre-protocol value is untouched.
    assert_eq!(pre.lookup_app(hash).unwrap().version(), old.version());

    // Persistence comes last, commitment first.
    assert_eq!(
        &x.log[x.log.len() - 2..],
        &["PersistCommitment", "PersistAppInstance"]
    );
    assert_eq!(
        y.log,
        [
            "LoadChannel",
            "Validate",
            "FetchChainContext",
            "Sign",
            "PersistCommitment",
            "PersistAppInstance",
            "Send"
        ]
    );
}

#[tokio::test]
async fn counterparty_can_initiate_too() {
    // Y starts the run on an app X initiated. Slots still follow the app.
    let (mut x, mut y, hash) = fresh();
    let (out_y, _) = run_both(take_action(&y, &x, hash, PRE_IMAGE), &mut y, &mut x, &apps())
        .await
        .unwrap();
    let [first, _] = out_y.commitment.signatures().unwrap();
    assert_eq!(
        recover_signer(out_y.commitment.digest(), first).unwrap(),
        x.id().derive_address(7).unwrap()
    );
}

#[tokio::test]
async fn wrong_pre_image_is_a_transition_failure() {
    let (mut x, mut y, hash) = fresh();
    let err = run_both(take_action(&x, &y, hash, Hash([1; 32])), &mut x, &mut y, &apps())
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Transition(_)));
    assert!(!x.log.contains(&"Sign"));
}

#[tokio::test]
async fn expired_lock_is_rejected_by_the_responder() {
    // The responder sees a later block, its own transition fails and it never
    // countersigns.
    let (mut x, mut y, hash) = fresh();
    y.chain = ChainContext { block_number: 500 };
    let err = run_both(take_action(&x, &y, hash, PRE_IMAGE), &mut x, &mut y, &apps())
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Transition(_)));
    assert!(!y.log.contains(&"Sign"));
    assert!(y.sent.is_empty());
}

#[tokio::test]
async fn unknown_app_aborts_before_validation() {
    let (mut x, y, _) = fresh();
    let mut flow = initiate(take_action(&x, &y, Hash([9; 32]), PRE_IMAGE), apps());
    let err = pump(flow.as_mut(), &mut x, None).await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotFound(_)));
    assert_eq!(x.log, ["LoadChannel"]);
    assert_eq!(flow.phase(), Phase::Aborted);
    // Aborted for good.
    assert!(flow.step(None).is_err());
}

#[tokio::test]
async fn rejected_validation_has_no_side_effects() {
    let (mut x, y, hash) = fresh();
    x.reject = Some("not today");
    let mut flow = initiate(take_action(&x, &y, hash, PRE_IMAGE), apps());
    let err = pump(flow.as_mut(), &mut x, None).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Validation(_)));
    assert_eq!(x.log, ["LoadChannel", "Validate"]);
}

#[tokio::test]
async fn responder_checks_initiator_signature_before_signing() {
    let (mut x, mut y, hash) = fresh();
    let mut init = initiate(take_action(&x, &y, hash, PRE_IMAGE), apps());
    let mut msg = match pump(init.as_mut(), &mut x, None).await.unwrap() {
        Outcome::Waiting(m) => m,
        Outcome::Done(_) => unreachable!(),
    };
    // Signed with X's key for another app.
    let sig = x.signer.sign(Hash([3; 32]), 7).await.unwrap();
    msg.custom_data.signature = Some(sig);

    let mut resp = respond(msg, apps()).unwrap();
    let err = pump(resp.as_mut(), &mut y, None).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Authentication { .. }));
    assert!(!y.log.contains(&"Sign"));
    assert!(!y.log.iter().any(|r| r.starts_with("Persist")));
}

#[tokio::test]
async fn diverging_snapshots_never_commit() {
    // Y has a different version of the app, so the digests differ.
    let (mut x, mut y, hash) = fresh();
    let ch = y.channel.take().unwrap();
    let app = ch.lookup_app(hash).unwrap();
    y.channel = Some(ch.replace_app_state(hash, app.state().clone()).unwrap());

    let err = run_both(take_action(&x, &y, hash, PRE_IMAGE), &mut x, &mut y, &apps())
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Authentication { .. }));
    assert!(!x.log.iter().any(|r| r.starts_with("Persist")));
    assert!(!y.log.iter().any(|r| r.starts_with("Persist")));
}

#[tokio::test]
async fn forged_reply_is_rejected_by_initiator() {
    let (mut x, mut y, hash) = fresh();
    let mut init = initiate(take_action(&x, &y, hash, PRE_IMAGE), apps());
    let first = match pump(init.as_mut(), &mut x, None).await.unwrap() {
        Outcome::Waiting(m) => m,
        Outcome::Done(_) => unreachable!(),
    };
    let mut resp = respond(first, apps()).unwrap();
    pump(resp.as_mut(), &mut y, None).await.unwrap();
    let mut reply = y.sent.pop().unwrap();

    // Signed by Y's root key for seq no 8, not 7.
    let post = y.channel.as_ref().unwrap().lookup_app(hash).unwrap();
    let digest = SetStateCommitment::new(post).digest();
    reply.custom_data.signature = Some(y.signer.sign(digest, 8).await.unwrap());

    let err = pump(init.as_mut(), &mut x, Some(Response::Reply(reply)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Authentication { expected, .. } if expected == y.id().derive_address(7).unwrap()
    ));
    assert!(!x.log.iter().any(|r| r.starts_with("Persist")));
    assert_eq!(init.phase(), Phase::Aborted);
}

#[tokio::test]
async fn reply_at_wrong_step_is_malformed() {
    let (mut x, mut y, hash) = fresh();
    let mut init = initiate(take_action(&x, &y, hash, PRE_IMAGE), apps());
    let first = match pump(init.as_mut(), &mut x, None).await.unwrap() {
        Outcome::Waiting(m) => m,
        Outcome::Done(_) => unreachable!(),
    };
    let mut resp = respond(first, apps()).unwrap();
    pump(resp.as_mut(), &mut y, None).await.unwrap();
    let mut reply = y.sent.pop().unwrap();
    reply.seq = Seq::Step(5);

    let err = pump(init.as_mut(), &mut x, Some(Response::Reply(reply)))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Malformed(_)));
}

#[test]
fn unexpected_response_is_malformed() {
    let x = Party::new(b"party x", None);
    let y = Party::new(b"party y", None);
    let mut flow = initiate(take_action(&x, &y, Hash([1; 32]), PRE_IMAGE), apps());
    assert!(matches!(
        flow.step(None),
        Ok(Step::Request(Request::LoadChannel { .. }))
    ));
    let err = flow.step(Some(Response::Ack)).unwrap_err();
    assert!(matches!(err, ProtocolError::Malformed(_)));
    assert_eq!(flow.phase(), Phase::Aborted);
}

#[test]
fn responder_only_joins_at_step_one() {
    let x = Party::new(b"party x", None);
    let y = Party::new(b"party y", None);
    let msg = ProtocolMessage {
        protocol: Protocol::TakeAction,
        process_id: ProcessId::random(),
        seq: Seq::Terminal,
        to_identifier: y.id(),
        params: take_action(&x, &y, Hash([1; 32]), PRE_IMAGE),
        custom_data: CustomData::default(),
    };
    assert!(matches!(
        respond(msg.clone(), apps()),
        Err(ProtocolError::Malformed(_))
    ));

    let mixed = ProtocolMessage {
        protocol: Protocol::Update,
        seq: Seq::Step(1),
        ..msg
    };
    assert!(matches!(
        respond(mixed, apps()),
        Err(ProtocolError::Malformed(_))
    ));
}

#[tokio::test]
async fn setup_then_update_free_balance() {
    let mut x = Party::new(b"party x", None);
    let mut y = Party::new(b"party y", None);
    let parties = Parties {
        multisig_address: MULTISIG,
        initiator_identifier: x.id(),
        responder_identifier: y.id(),
    };
    let (out, _) = run_both(
        ProtocolParams::Setup(SetupParams {
            parties: parties.clone(),
            free_balance_timeout: 100.into(),
        }),
        &mut x,
        &mut y,
        &apps(),
    )
    .await
    .unwrap();
    assert!(out.app.is_none());
    assert_eq!(x.channel, y.channel);

    let ch = x.channel.clone().unwrap();
    let mut fb = ch.free_balance_state().unwrap();
    fb.deposit(NATIVE_TOKEN, [3.into(), 4.into()]).unwrap();
    let (out, _) = run_both(
        ProtocolParams::Update(UpdateParams {
            parties,
            app_identity_hash: ch.free_balance().identity_hash(),
            new_state: fb.to_state(),
        }),
        &mut x,
        &mut y,
        &apps(),
    )
    .await
    .unwrap();
    assert_eq!(out.channel.free_balance().version(), 1);
    assert_eq!(
        out.channel.free_balance_state().unwrap().balance(NATIVE_TOKEN, 1),
        4.into()
    );
    assert_eq!(x.channel, y.channel);
}

#[tokio::test]
async fn setup_on_existing_channel() {
    let (mut x, y, _) = fresh();
    let mut flow = initiate(
        ProtocolParams::Setup(SetupParams {
            parties: Parties {
                multisig_address: MULTISIG,
                initiator_identifier: x.id(),
                responder_identifier: y.id(),
            },
            free_balance_timeout: 100.into(),
        }),
        apps(),
    );
    let err = pump(flow.as_mut(), &mut x, None).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Validation(_)));
}

#[test]
fn seq_wire_form() {
    assert_eq!(Seq::Terminal.to_wire(), -1);
    assert_eq!(Seq::from_wire(-1), Some(Seq::Terminal));
    assert_eq!(Seq::from_wire(2), Some(Seq::Step(2)));
    assert_eq!(Seq::from_wire(-2), None);
}

#[test]
fn protocol_names() {
    for p in [Protocol::Setup, Protocol::TakeAction, Protocol::Uninstall] {
        assert_eq!(Protocol::from_name(p.name()), Some(p));
    }
    assert_eq!(Protocol::from_name("withdraw"), None);
}
