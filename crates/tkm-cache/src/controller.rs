//! Cache status reconciliation
//!
//! Mirrors what admission decided into observed state so it can be read from
//! `status` alone: the pinned digest, the kernel summary, and a `Verified`
//! condition. One generic reconciler serves all three cache kinds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use tkm_common::conditions::upsert_condition_at;
use tkm_common::crd::{
    CacheKind, CacheResource, CacheStatus, ClusterGKMCache, ConditionStatus, TKMCache,
    TKMCacheCluster, CONDITION_VERIFIED, REASON_AWAITING_ADMISSION, REASON_DIGEST_PINNED,
};
use tkm_common::{Error, FIELD_MANAGER};

/// Retry interval after a failed reconcile
pub const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Status writes for cache objects of any kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheStatusClient: Send + Sync {
    /// Patch the status of a cache object
    async fn patch_status(
        &self,
        kind: CacheKind,
        namespace: Option<String>,
        name: String,
        status: &CacheStatus,
    ) -> Result<(), Error>;
}

/// [`CacheStatusClient`] backed by the Kubernetes API
pub struct KubeCacheStatusClient {
    client: Client,
}

impl KubeCacheStatusClient {
    /// Create from a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn api_resource(kind: CacheKind) -> ApiResource {
    match kind {
        CacheKind::TKMCache => ApiResource::erase::<TKMCache>(&()),
        CacheKind::TKMCacheCluster => ApiResource::erase::<TKMCacheCluster>(&()),
        CacheKind::ClusterGKMCache => ApiResource::erase::<ClusterGKMCache>(&()),
    }
}

#[async_trait]
impl CacheStatusClient for KubeCacheStatusClient {
    async fn patch_status(
        &self,
        kind: CacheKind,
        namespace: Option<String>,
        name: String,
        status: &CacheStatus,
    ) -> Result<(), Error> {
        let resource = api_resource(kind);
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), &ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };

        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch(status)),
        )
        .await?;

        Ok(())
    }
}

/// Merge patch body that replaces every mirrored status field
///
/// A cleared digest goes out as `null` and a cleared summary as `[]`, so the
/// stored status converges on what [`desired_status`] computed.
pub fn status_patch(status: &CacheStatus) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

/// Controller context shared by all cache kinds
pub struct Context {
    /// Status writer
    pub client: Arc<dyn CacheStatusClient>,
}

impl Context {
    /// Create a context that writes through the Kubernetes API
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(KubeCacheStatusClient::new(client)),
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(client: Arc<dyn CacheStatusClient>) -> Self {
        Self { client }
    }
}

/// Compute the observed state for a cache
///
/// Returns the status and whether it differs from the stored one, ignoring
/// `lastSynced`.
pub fn desired_status<K: CacheResource>(cache: &K, now: DateTime<Utc>) -> (CacheStatus, bool) {
    let current = cache.cache_status().cloned().unwrap_or_default();
    let mut status = current.clone();

    status.digest = cache.resolved_digest().map(str::to_string);
    status.summary = cache.cache_spec().kernel_properties.summary.clone();

    match cache.resolved_digest() {
        Some(digest) => upsert_condition_at(
            &mut status.conditions,
            CONDITION_VERIFIED,
            ConditionStatus::True,
            REASON_DIGEST_PINNED,
            &format!("image pinned to {digest}"),
            now,
        ),
        None => upsert_condition_at(
            &mut status.conditions,
            CONDITION_VERIFIED,
            ConditionStatus::False,
            REASON_AWAITING_ADMISSION,
            "image digest has not been pinned by admission",
            now,
        ),
    };

    let changed = status != current;
    (status, changed)
}

/// Reconcile a cache object of any kind
#[instrument(skip(cache, ctx), fields(kind = %K::KIND, cache = %cache.name_any()))]
pub async fn reconcile<K: CacheResource>(cache: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    let now = Utc::now();
    let (mut status, changed) = desired_status(cache.as_ref(), now);

    if !changed {
        debug!("cache status up to date");
        return Ok(Action::await_change());
    }

    status.last_synced = Some(now);
    ctx.client
        .patch_status(K::KIND, cache.namespace(), cache.name_any(), &status)
        .await?;
    info!(digest = ?status.digest, "updated cache status");

    Ok(Action::await_change())
}

/// Requeue policy for failed cache reconciles
pub fn error_policy<K: CacheResource>(cache: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        kind = %K::KIND,
        cache = %cache.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_RETRY_INTERVAL)
}
