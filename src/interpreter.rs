//! The protocol interpreter: drives a [ProtocolFlow] by carrying out the
//! requests it issues against injected capabilities.
//!
//! It knows nothing about individual protocols and does not take the channel
//! lock; the caller holds it for the whole run. No request is retried. The
//! first error aborts the run and is returned as is.

use std::{fmt, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    apps::ChainProvider,
    commitment::{CommitmentKind, SetStateCommitment},
    config::EngineConfig,
    error::ProtocolError,
    protocol::{Phase, ProtocolFlow, Request, Response, RunOutput, Step},
    sig::ChannelSigner,
    store::{ChannelWrite, Store, WriteBatch},
    validation::Validator,
    wire::MessageBus,
};

/// The capabilities a run may use.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn MessageBus>,
    pub validator: Arc<dyn Validator>,
    pub signer: Arc<dyn ChannelSigner>,
    pub chain: Arc<dyn ChainProvider>,
    pub config: EngineConfig,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("identifier", &self.signer.public_identifier())
            .field("store", &self.store)
            .field("bus", &self.bus)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolRunner {
    ctx: Context,
}

impl ProtocolRunner {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run `flow` to completion.
    pub async fn run(&self, mut flow: Box<dyn ProtocolFlow>) -> Result<RunOutput, ProtocolError> {
        let span = info_span!(
            "protocol",
            protocol = %flow.protocol(),
            role = ?flow.role(),
            process_id = %flow.process_id(),
        );

        async move {
            info!("run started");
            let started = Instant::now();
            // Commitments are held back until the write they belong to, so
            // both land in the store together.
            let mut staged = Vec::new();
            let mut input = None;

            loop {
                let phase = flow.phase();
                let step = flow.step(input.take());
                let request = match step {
                    Ok(Step::Request(request)) => request,
                    Ok(Step::Done(output)) => {
                        info!(elapsed_ms = elapsed_ms(started), "run finished");
                        return Ok(output);
                    }
                    Err(e) => return Err(aborted(phase, e)),
                };

                let name = request.name();
                let t = Instant::now();
                match self.dispatch(request, &mut staged).await {
                    Ok(response) => {
                        debug!(request = name, elapsed_ms = elapsed_ms(t), "request done");
                        input = Some(response);
                    }
                    Err(e) => return Err(aborted(flow.phase(), e)),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        request: Request,
        staged: &mut Vec<(CommitmentKind, SetStateCommitment)>,
    ) -> Result<Response, ProtocolError> {
        let ctx = &self.ctx;
        Ok(match request {
            Request::LoadChannel { multisig_address } => {
                Response::Channel(ctx.store.get_state_channel(multisig_address).await?)
            }
            Request::Validate(vctx) => {
                ctx.validator.validate(&vctx).await?;
                Response::Ack
            }
            Request::FetchChainContext => Response::Chain(ctx.chain.chain_context().await?),
            Request::Sign { digest, app_seq_no } => Response::Signature(
                ctx.signer
                    .sign(digest, app_seq_no)
                    .await
                    .map_err(|e| ProtocolError::Signing(e.to_string()))?,
            ),
            Request::Send(msg) => {
                ctx.bus.send(msg).await?;
                Response::Ack
            }
            Request::SendAndWait(msg) => {
                let budget = ctx.config.send_and_wait_timeout();
                Response::Reply(
                    tokio::time::timeout(budget, ctx.bus.send_and_wait(msg))
                        .await
                        .map_err(|_| no_reply(budget))??,
                )
            }
            Request::PersistCommitment {
                kind,
                commitment,
                app_identity_hash,
            } => {
                if commitment.app_identity_hash() != app_identity_hash {
                    return Err(ProtocolError::Persistence(format!(
                        "commitment for {} filed under {app_identity_hash}",
                        commitment.app_identity_hash()
                    )));
                }
                staged.push((kind, commitment));
                Response::Ack
            }
            Request::PersistStateChannel(channel) => {
                ctx.store
                    .commit(WriteBatch {
                        commitments: std::mem::take(staged),
                        write: ChannelWrite::Channel(channel),
                    })
                    .await?;
                Response::Ack
            }
            Request::PersistAppInstance {
                change,
                channel,
                app,
            } => {
                ctx.store
                    .commit(WriteBatch {
                        commitments: std::mem::take(staged),
                        write: ChannelWrite::App {
                            change,
                            channel,
                            app,
                        },
                    })
                    .await?;
                Response::Ack
            }
        })
    }
}

/// Log an abort in `phase`, the last phase the flow reached.
fn aborted(phase: Phase, e: ProtocolError) -> ProtocolError {
    match &e {
        // Signatures may already be with the counterparty.
        ProtocolError::Persistence(_) => {
            error!(?phase, error = %e, "run aborted, update NOT persisted")
        }
        _ if phase >= Phase::Signed => warn!(?phase, error = %e, "run aborted after signing"),
        _ => info!(?phase, error = %e, "run aborted"),
    }
    e
}

fn no_reply(budget: Duration) -> ProtocolError {
    ProtocolError::Delivery(format!("no reply within {budget:?}"))
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}
