use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    node::{self, ConnectionDescriptor},
    probe::{ProbeFailure, ProbeOutcome, ProbeResult, probe_via_socks},
    xray::{EngineConfig, EngineOptions, OrchestrateError, Outbound, ProbeContext, build_outbound},
};

pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<u64, ProbeFailure>> + Send>>;

/// A node that decoded and has an engine outbound; only plans ever take a concurrency slot.
#[derive(Debug, Clone)]
pub struct ProbePlan {
    pub descriptor: ConnectionDescriptor,
    pub outbound: Outbound,
}

pub trait NodeProber: Send + Sync {
    /// Measures one node. Must release every resource it acquires before resolving.
    fn probe(&self, plan: ProbePlan) -> ProbeFuture;
}

/// Probes through a dedicated Xray process per node.
#[derive(Debug, Clone)]
pub struct XrayProber {
    engine: Arc<EngineOptions>,
    target_url: Arc<str>,
    timeout: Duration,
}

impl XrayProber {
    pub fn new(engine: EngineOptions, target_url: &str, timeout: Duration) -> Self {
        Self {
            engine: Arc::new(engine),
            target_url: Arc::from(target_url),
            timeout,
        }
    }
}

impl NodeProber for XrayProber {
    fn probe(&self, plan: ProbePlan) -> ProbeFuture {
        let engine = Arc::clone(&self.engine);
        let target_url = Arc::clone(&self.target_url);
        let timeout = self.timeout;
        Box::pin(async move {
            let mut ctx = ProbeContext::create(&engine.work_root).map_err(process_start)?;
            let config = EngineConfig::assemble(&plan.outbound, ctx.port());

            let started = async {
                ctx.write_config(&config)?;
                ctx.start(&engine)?;
                ctx.await_ready(&engine).await
            }
            .await;

            let result = match started {
                Ok(()) => {
                    debug!(
                        node = %plan.descriptor.raw,
                        protocol = plan.outbound.protocol(),
                        port = ctx.port(),
                        pid = ?ctx.engine_pid(),
                        "engine ready"
                    );
                    probe_via_socks(ctx.port(), &target_url, timeout).await
                }
                Err(err) => {
                    debug!(stage = ctx.stage().as_str(), error = %err, "engine did not start");
                    Err(process_start(err))
                }
            };

            ctx.shutdown(engine.stop_timeout).await;
            result
        })
    }
}

fn process_start(err: OrchestrateError) -> ProbeFailure {
    ProbeFailure::ProcessStart {
        message: err.to_string(),
    }
}

/// Decodes and probes every node with at most `concurrency` probes in flight. Returns one result
/// per input node, in input order.
pub async fn run_all(
    nodes: Vec<String>,
    prober: Arc<dyn NodeProber>,
    concurrency: usize,
) -> Vec<ProbeResult> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut results: Vec<Option<ProbeResult>> = vec![None; nodes.len()];
    let mut tasks = Vec::new();

    for (index, raw) in nodes.into_iter().enumerate() {
        let plan = match plan_node(&raw) {
            Ok(plan) => plan,
            Err(failure) => {
                debug!(node = %raw, reason = failure.kind(), error = %failure, "node skipped");
                results[index] = Some(ProbeResult {
                    index,
                    raw,
                    outcome: ProbeOutcome::Failure(failure),
                });
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
            // The semaphore is never closed.
            break;
        };
        let prober = Arc::clone(&prober);
        let task_raw = raw.clone();

        tasks.push((
            index,
            raw,
            tokio::spawn(async move {
                let _permit = permit;
                match prober.probe(plan).await {
                    Ok(latency_ms) => {
                        info!(node = %task_raw, latency_ms, "probe ok");
                        ProbeOutcome::Success { latency_ms }
                    }
                    Err(failure) => {
                        debug!(
                            node = %task_raw,
                            reason = failure.kind(),
                            error = %failure,
                            "probe failed"
                        );
                        ProbeOutcome::Failure(failure)
                    }
                }
            }),
        ));
    }

    let (meta, handles): (Vec<_>, Vec<_>) = tasks
        .into_iter()
        .map(|(index, raw, handle)| ((index, raw), handle))
        .unzip();
    for ((index, raw), joined) in meta.into_iter().zip(join_all(handles).await) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => {
                warn!(%join_err, node = %raw, "probe task join error");
                ProbeOutcome::Failure(ProbeFailure::ProcessStart {
                    message: join_err.to_string(),
                })
            }
        };
        results[index] = Some(ProbeResult {
            index,
            raw,
            outcome,
        });
    }

    results.into_iter().flatten().collect()
}

fn plan_node(raw: &str) -> Result<ProbePlan, ProbeFailure> {
    let descriptor = node::decode(raw)?;
    let outbound = build_outbound(&descriptor)?;
    Ok(ProbePlan {
        descriptor,
        outbound,
    })
}
