//! Controller wiring
//!
//! Builds the watch loops for every TKM kind. Each builder returns boxed
//! futures so `main` can run them alongside the webhook server.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use tkm_common::crd::{CacheResource, ClusterGKMCache, TKMCache, TKMCacheCluster, TKMNodeStatus};
use tkm_node_status::HardwareProbe;

/// Watch timeout for controllers (must stay below the client read timeout)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be driven
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the node compatibility controller
pub fn build_node_status_controller(
    client: Client,
    probe: Arc<dyn HardwareProbe>,
) -> ControllerFuture {
    let nodes: Api<TKMNodeStatus> = Api::all(client.clone());
    let ctx = Arc::new(tkm_node_status::Context::new(client, probe));

    tracing::info!("- TKMNodeStatus controller");

    Box::pin(
        Controller::new(nodes, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(
                tkm_node_status::reconcile,
                tkm_node_status::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("TKMNodeStatus")),
    )
}

/// Build the status controllers for every cache kind
pub fn build_cache_controllers(client: Client) -> Vec<ControllerFuture> {
    let ctx = Arc::new(tkm_cache::Context::new(client.clone()));

    vec![
        build_cache_controller::<TKMCache>(client.clone(), ctx.clone()),
        build_cache_controller::<TKMCacheCluster>(client.clone(), ctx.clone()),
        build_cache_controller::<ClusterGKMCache>(client, ctx),
    ]
}

fn build_cache_controller<K: CacheResource>(
    client: Client,
    ctx: Arc<tkm_cache::Context>,
) -> ControllerFuture {
    let caches: Api<K> = Api::all(client);
    let name = K::KIND.kind_str();

    tracing::info!("- {} controller", name);

    Box::pin(
        Controller::new(caches, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(tkm_cache::reconcile::<K>, tkm_cache::error_policy::<K>, ctx)
            .for_each(log_reconcile_result(name)),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
