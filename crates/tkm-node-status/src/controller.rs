//! TKMNodeStatus reconciliation
//!
//! Checks every cache assigned to a node against the accelerator the node
//! actually has and publishes the verdict as `Compatible` and `Ready`
//! conditions.
//!
//! Each pass walks `spec.caches` in order and stops at the first problem:
//!
//! - probe failure: `Compatible=False/GPUDetectError`, retried after 10s
//! - mismatch: `Compatible=False/IncompatibleGPU`, terminal until the spec changes
//! - every entry matches: `Compatible=True`, `Ready=True/CacheReady`
//!
//! Both terminal verdicts are pinned to the spec generation they describe, so
//! reconciling again is a no-op until the spec changes. Status writes carry
//! the object's resourceVersion; a conflict fails the pass and the controller
//! retries it from a fresh read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use tkm_common::conditions::{find_condition, is_condition_true, upsert_condition_at};
use tkm_common::crd::{
    ConditionStatus, TKMNodeStatus, TKMNodeStatusStatus, CONDITION_COMPATIBLE, CONDITION_READY,
    REASON_CACHE_READY, REASON_GPU_COMPATIBLE, REASON_GPU_DETECT_ERROR, REASON_INCOMPATIBLE_GPU,
};
use tkm_common::Error;

use crate::probe::{HardwareProbe, ProbeError};

/// Retry interval after a failed GPU probe
pub const PROBE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Retry interval after a status write conflict
pub const CONFLICT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Retry interval after any other reconcile error
pub const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline for one probe call
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Status writes for TKMNodeStatus objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeStatusClient: Send + Sync {
    /// Replace the status of `node`, guarded by its resourceVersion
    async fn replace_status(
        &self,
        node: &TKMNodeStatus,
        status: &TKMNodeStatusStatus,
    ) -> Result<(), Error>;
}

/// [`NodeStatusClient`] backed by the Kubernetes API
pub struct KubeNodeStatusClient {
    client: Client,
}

impl KubeNodeStatusClient {
    /// Create from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeStatusClient for KubeNodeStatusClient {
    async fn replace_status(
        &self,
        node: &TKMNodeStatus,
        status: &TKMNodeStatusStatus,
    ) -> Result<(), Error> {
        let api: Api<TKMNodeStatus> = Api::all(self.client.clone());

        // Full object so metadata.resourceVersion rides along as the precondition
        let mut updated = node.clone();
        updated.status = Some(status.clone());
        let body = serde_json::to_vec(&updated)?;

        api.replace_status(&node.name_any(), &PostParams::default(), body)
            .await?;
        Ok(())
    }
}

/// Controller context
pub struct Context {
    /// Status writer
    pub client: Arc<dyn NodeStatusClient>,
    /// Accelerator detection
    pub probe: Arc<dyn HardwareProbe>,
    /// Deadline for one probe call
    pub probe_timeout: Duration,
}

impl Context {
    /// Create a context that writes through the Kubernetes API
    pub fn new(client: Client, probe: Arc<dyn HardwareProbe>) -> Self {
        Self {
            client: Arc::new(KubeNodeStatusClient::new(client)),
            probe,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(client: Arc<dyn NodeStatusClient>, probe: Arc<dyn HardwareProbe>) -> Self {
        Self {
            client,
            probe,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Result of one evaluation pass, before anything is written
#[derive(Clone, Debug, PartialEq)]
pub enum Evaluation {
    /// Verdict for the current generation is already published
    Settled,
    /// A pass ran; `status` is what should be published
    Checked {
        /// Status after the pass
        status: TKMNodeStatusStatus,
        /// Whether `status` differs from what is stored
        changed: bool,
        /// When to run again, if at all
        requeue: Option<Duration>,
    },
}

/// Run one compatibility pass over a node without writing anything
pub async fn evaluate(
    node: &TKMNodeStatus,
    probe: &dyn HardwareProbe,
    probe_timeout: Duration,
    now: DateTime<Utc>,
) -> Evaluation {
    let generation = node.metadata.generation;
    let current = node.status.clone().unwrap_or_default();

    if is_settled(&current, generation) {
        return Evaluation::Settled;
    }

    let mut status = current.clone();
    status.observed_generation = generation;
    status.retain_required(&node.spec.caches);

    for requirement in &node.spec.caches {
        let detected = match tokio::time::timeout(probe_timeout, probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(probe_timeout)),
        };

        let info = match detected {
            Ok(info) => info,
            Err(e) => {
                warn!(cache = %requirement.name, error = %e, "GPU probe failed");
                set_not_ready(
                    &mut status,
                    REASON_GPU_DETECT_ERROR,
                    &format!("failed to detect GPU: {e}"),
                    now,
                );
                return checked(&current, status, Some(PROBE_RETRY_INTERVAL));
            }
        };

        if !info.satisfies(requirement) {
            info!(
                cache = %requirement.name,
                required_gpu = %requirement.gpu_type,
                required_driver = %requirement.driver_version,
                detected_gpu = %info.gpu_type,
                detected_driver = %info.driver_version,
                "cache incompatible with node GPU"
            );
            let message = format!(
                "cache {} requires {} driver {}, node has {} driver {}",
                requirement.name,
                requirement.gpu_type,
                requirement.driver_version,
                info.gpu_type,
                info.driver_version
            );
            set_not_ready(&mut status, REASON_INCOMPATIBLE_GPU, &message, now);
            return checked(&current, status, None);
        }

        status.record_observation(&requirement.name, &info.gpu_type, &info.driver_version, now);
    }

    upsert_condition_at(
        &mut status.conditions,
        CONDITION_COMPATIBLE,
        ConditionStatus::True,
        REASON_GPU_COMPATIBLE,
        "all caches are compatible with the node GPU",
        now,
    );
    upsert_condition_at(
        &mut status.conditions,
        CONDITION_READY,
        ConditionStatus::True,
        REASON_CACHE_READY,
        "all caches are ready",
        now,
    );
    checked(&current, status, None)
}

/// Ready, or definitively incompatible, at the current generation
fn is_settled(status: &TKMNodeStatusStatus, generation: Option<i64>) -> bool {
    if status.observed_generation != generation {
        return false;
    }
    if is_condition_true(&status.conditions, CONDITION_READY) {
        return true;
    }
    find_condition(&status.conditions, CONDITION_COMPATIBLE).is_some_and(|c| {
        c.status == ConditionStatus::False && c.reason == REASON_INCOMPATIBLE_GPU
    })
}

/// Record a failed pass; `Ready` is withdrawn rather than set False
fn set_not_ready(status: &mut TKMNodeStatusStatus, reason: &str, message: &str, now: DateTime<Utc>) {
    upsert_condition_at(
        &mut status.conditions,
        CONDITION_COMPATIBLE,
        ConditionStatus::False,
        reason,
        message,
        now,
    );
    status.conditions.retain(|c| c.type_ != CONDITION_READY);
}

fn checked(
    current: &TKMNodeStatusStatus,
    mut status: TKMNodeStatusStatus,
    requeue: Option<Duration>,
) -> Evaluation {
    // lastSynced alone is not a change
    status.last_synced = current.last_synced;
    let changed = status != *current;
    Evaluation::Checked {
        status,
        changed,
        requeue,
    }
}

/// Reconcile a TKMNodeStatus
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<TKMNodeStatus>, ctx: Arc<Context>) -> Result<Action, Error> {
    let now = Utc::now();

    let (mut status, changed, requeue) =
        match evaluate(&node, ctx.probe.as_ref(), ctx.probe_timeout, now).await {
            Evaluation::Settled => {
                debug!("verdict already published for this generation");
                return Ok(Action::await_change());
            }
            Evaluation::Checked {
                status,
                changed,
                requeue,
            } => (status, changed, requeue),
        };

    if changed {
        status.last_synced = Some(now);
        ctx.client.replace_status(&node, &status).await?;
        info!(
            ready = is_condition_true(&status.conditions, CONDITION_READY),
            "updated node status"
        );
    }

    Ok(requeue.map_or_else(Action::await_change, Action::requeue))
}

/// Requeue policy for failed reconciles
pub fn error_policy(node: Arc<TKMNodeStatus>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_conflict() {
        debug!(node = %node.name_any(), "status write conflict, retrying from fresh state");
        return Action::requeue(CONFLICT_RETRY_INTERVAL);
    }

    error!(
        ?error,
        node = %node.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_RETRY_INTERVAL)
}
