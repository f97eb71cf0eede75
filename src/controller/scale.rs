//! Scale decisions for debounced namespaces.
//!
//! This is the consumer end of the pipeline: once a namespace's debounce
//! delay expires, [`reconcile_namespace`] re-reads the world and either
//! applies the current manifest set (scale-up) or zeroes the engine
//! deployment (scale-down). A single loop drains the queue, so at most one
//! namespace is ever being reconciled at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

#[cfg(test)]
use crate::apply::ApplyClient;
use crate::apply::{ApplyClientImpl, ApplyEngine};
use crate::manifest::ManifestStore;
use crate::{Error, Result, ENABLED_ANNOTATION, ENGINE_DEPLOYMENT, FIELD_MANAGER, VERSION_LABEL};

use super::debounce::DelayedNamespaces;
use super::watch::ResourceCounter;

/// Tunables shared by the watch and scale sides.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Debounce delay for namespaces that still hold workload resources.
    pub scale_up_after: Duration,
    /// Debounce delay for namespaces that have drained.
    pub scale_down_after: Duration,
    /// Whether namespaces without an opt-in annotation are managed.
    pub default_enabled: bool,
}

/// What a reconciliation pass decided to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// The namespace is not opted in to engine management.
    Disabled,
    /// The namespace no longer exists.
    NamespaceGone,
    /// The engine deployment is running and already at the current
    /// manifest version.
    AlreadyUpToDate,
    /// The manifest set was applied to bring the engine up.
    ScaledUp,
    /// The engine deployment was patched down to zero replicas.
    ScaledDown,
    /// Scale-down found no deployment to patch.
    NothingToScaleDown,
}

/// Cluster reads and writes the scale controller needs, behind a trait so
/// reconciliation logic can be tested against mocks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleClient: Send + Sync {
    /// Fetches a namespace, returning `None` when it no longer exists.
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Fetches a deployment, returning `None` when it does not exist.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Merge-patches a deployment's replica count.
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;
}

/// Production [`ScaleClient`] backed by a real cluster connection.
pub struct ScaleClientImpl {
    client: Client,
}

impl ScaleClientImpl {
    /// Creates a scale client from a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ScaleClient for ScaleClientImpl {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(namespace) => Ok(Some(namespace)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

/// Shared state for reconciliation.
pub struct Context {
    /// Namespace and deployment access (trait object for testability).
    pub scale: Arc<dyn ScaleClient>,
    /// Declarative apply engine for the manifest set.
    pub engine: ApplyEngine,
    /// Current manifest set, refreshed in the background.
    pub store: Arc<ManifestStore>,
    /// Read side of the watch reflector stores.
    pub counter: ResourceCounter,
    /// Scale tunables.
    pub settings: Settings,
}

impl Context {
    /// Creates a production context from a cluster connection.
    pub fn new(
        client: Client,
        store: Arc<ManifestStore>,
        counter: ResourceCounter,
        settings: Settings,
    ) -> Self {
        Self {
            scale: Arc::new(ScaleClientImpl::new(client.clone())),
            engine: ApplyEngine::new(Arc::new(ApplyClientImpl::new(client))),
            store,
            counter,
            settings,
        }
    }

    /// Creates a context wired to mock clients.
    #[cfg(test)]
    pub fn for_testing(
        scale: Arc<dyn ScaleClient>,
        apply: Arc<dyn ApplyClient>,
        store: Arc<ManifestStore>,
        counter: ResourceCounter,
        settings: Settings,
    ) -> Self {
        Self {
            scale,
            engine: ApplyEngine::new(apply),
            store,
            counter,
            settings,
        }
    }
}

/// Reconciles a single namespace whose debounce delay has expired.
///
/// The resource count is taken now, not at event time, so a namespace that
/// emptied and refilled during the delay is handled according to its current
/// state. Errors bubble up to the caller; the scale loop logs them and moves
/// on without retrying.
#[instrument(skip(ctx))]
pub async fn reconcile_namespace(namespace: &str, ctx: &Context) -> Result<ScaleOutcome> {
    let Some(ns_object) = ctx.scale.get_namespace(namespace).await? else {
        debug!(namespace, "namespace no longer exists; nothing to do");
        return Ok(ScaleOutcome::NamespaceGone);
    };

    if !is_enabled(&ns_object, ctx.settings.default_enabled) {
        debug!(namespace, "namespace is not opted in; skipping");
        return Ok(ScaleOutcome::Disabled);
    }

    let count = ctx.counter.count(namespace);
    if count > 0 {
        scale_up(namespace, count, ctx).await
    } else {
        scale_down(namespace, ctx).await
    }
}

/// Whether a namespace is managed, per its opt-in annotation.
///
/// `"true"` and `"false"` are definitive; any other value, or no annotation
/// at all, falls back to the configured default.
fn is_enabled(namespace: &Namespace, default_enabled: bool) -> bool {
    let annotation = namespace
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ENABLED_ANNOTATION))
        .map(String::as_str);

    match annotation {
        Some("true") => true,
        Some("false") => false,
        _ => default_enabled,
    }
}

async fn scale_up(namespace: &str, count: usize, ctx: &Context) -> Result<ScaleOutcome> {
    let set = ctx.store.current().await;

    if let Some(deployment) = ctx.scale.get_deployment(namespace, ENGINE_DEPLOYMENT).await? {
        // No replica count on the spec means the server default of one, so
        // only an explicit zero counts as scaled down.
        let running = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .map_or(true, |replicas| replicas >= 1);
        let version = deployment
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(VERSION_LABEL))
            .map(String::as_str);

        if running && version == Some(set.version.as_str()) {
            debug!(namespace, version = %set.version, "engine already up to date");
            return Ok(ScaleOutcome::AlreadyUpToDate);
        }
    }

    info!(namespace, count, version = %set.version, "scaling engine up");
    ctx.engine.apply(namespace, &set).await?;
    Ok(ScaleOutcome::ScaledUp)
}

async fn scale_down(namespace: &str, ctx: &Context) -> Result<ScaleOutcome> {
    match ctx
        .scale
        .scale_deployment(namespace, ENGINE_DEPLOYMENT, 0)
        .await
    {
        Ok(()) => {
            info!(namespace, "scaled engine down");
            Ok(ScaleOutcome::ScaledDown)
        }
        Err(Error::Kube(kube::Error::Api(response))) if response.code == 404 => {
            debug!(namespace, "no engine deployment; nothing to scale down");
            Ok(ScaleOutcome::NothingToScaleDown)
        }
        Err(error) => Err(error),
    }
}

/// Drains the debounce queue, reconciling one namespace at a time.
///
/// Reconciliation errors are logged and dropped; the next expiry for the
/// namespace gets a fresh attempt. Cancellation stops the loop between
/// namespaces, so a reconciliation in flight always runs to completion.
pub async fn run_scale_loop(
    mut delayed: DelayedNamespaces,
    ctx: Arc<Context>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("scale loop stopping");
                break;
            }
            next = delayed.next() => match next {
                Some(namespace) => {
                    match reconcile_namespace(&namespace, &ctx).await {
                        Ok(outcome) => debug!(namespace = %namespace, ?outcome, "reconciled"),
                        Err(error) => {
                            error!(namespace = %namespace, error = %error, "reconciliation failed");
                        }
                    }
                }
                None => {
                    info!("schedule channel closed; scale loop stopping");
                    break;
                }
            }
        }
    }
}
