//! Declarative apply engine
//!
//! Reconciles one namespace against the current manifest set: create what is
//! missing, patch what drifted, skip what is already right or not ours. The
//! whole resource list runs once with the cluster's dry-run mode before any
//! real write, so an invalid manifest set fails before it can leave a
//! namespace half-applied.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::diff::{is_noop, merge_patch};
use crate::manifest::{DesiredResource, ManifestSet};
use crate::normalize::normalize;
use crate::{Error, Result, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Trait abstracting dynamic-resource operations for the apply engine
///
/// This trait allows mocking the cluster in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplyClient: Send + Sync {
    /// Read a live resource by name; `Ok(None)` when it does not exist.
    async fn get(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create a resource, optionally as a server-side dry run.
    async fn create(
        &self,
        namespace: &str,
        resource: &ApiResource,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<()>;

    /// Merge-patch a resource, optionally as a server-side dry run.
    async fn patch(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
        patch: &Value,
        dry_run: bool,
    ) -> Result<()>;
}

/// Production [`ApplyClient`] over `Api<DynamicObject>`
pub struct ApplyClientImpl {
    client: Client,
}

impl ApplyClientImpl {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl ApplyClient for ApplyClientImpl {
    async fn get(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        match self.api(namespace, resource).get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        namespace: &str,
        resource: &ApiResource,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<()> {
        let params = PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        self.api(namespace, resource).create(&params, object).await?;
        Ok(())
    }

    async fn patch(
        &self,
        namespace: &str,
        resource: &ApiResource,
        name: &str,
        patch: &Value,
        dry_run: bool,
    ) -> Result<()> {
        let params = PatchParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        self.api(namespace, resource)
            .patch(name, &params, &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

/// What the apply engine decided for one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The resource did not exist and was created.
    Created,
    /// The live resource drifted from the manifest and was patched.
    Patched,
    /// The live resource already matches the manifest.
    Unchanged,
    /// The live resource is not owned by this operator and was left alone.
    SkippedUnmanaged,
}

/// Applies a manifest set to a namespace with a dry-run safety gate.
pub struct ApplyEngine {
    client: Arc<dyn ApplyClient>,
}

impl ApplyEngine {
    /// Create an engine over the given cluster client
    pub fn new(client: Arc<dyn ApplyClient>) -> Self {
        Self { client }
    }

    /// Reconcile `namespace` against `set`.
    ///
    /// Every resource is processed in set order, twice: the first pass sets
    /// the dry-run flag so the API server validates each mutation without
    /// persisting it, the second pass is real. If anything in the dry-run
    /// pass fails, the real pass never starts. A failure in the real pass
    /// aborts the remaining resources and surfaces to the caller; the next
    /// watch-triggered cycle retries.
    #[instrument(skip(self, set), fields(version = %set.version))]
    pub async fn apply(&self, namespace: &str, set: &ManifestSet) -> Result<()> {
        for dry_run in [true, false] {
            for resource in &set.resources {
                let outcome = self.apply_resource(namespace, resource, dry_run).await?;
                log_outcome(namespace, resource, dry_run, outcome);
            }
        }
        Ok(())
    }

    async fn apply_resource(
        &self,
        namespace: &str,
        resource: &DesiredResource,
        dry_run: bool,
    ) -> Result<ApplyOutcome> {
        let key = resource.key();
        let name = resource.name();

        let live = self
            .client
            .get(namespace, &resource.api_resource, name)
            .await
            .map_err(|e| Error::apply(format!("failed to get {key} in {namespace}: {e}")))?;

        let Some(live) = live else {
            self.client
                .create(namespace, &resource.api_resource, &resource.object, dry_run)
                .await
                .map_err(|e| Error::apply(format!("failed to create {key} in {namespace}: {e}")))?;
            return Ok(ApplyOutcome::Created);
        };

        let owned = live
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MANAGED_BY_LABEL))
            .map(String::as_str)
            == Some(MANAGED_BY_VALUE);
        if !owned {
            return Ok(ApplyOutcome::SkippedUnmanaged);
        }

        let live_value = serde_json::to_value(&live)
            .map_err(|e| Error::serialization(format!("failed to diff {key}: {e}")))?;
        let desired_value = serde_json::to_value(&resource.object)
            .map_err(|e| Error::serialization(format!("failed to diff {key}: {e}")))?;
        let patch = merge_patch(&normalize(&live_value), &desired_value);
        if is_noop(&patch) {
            return Ok(ApplyOutcome::Unchanged);
        }

        self.client
            .patch(namespace, &resource.api_resource, name, &patch, dry_run)
            .await
            .map_err(|e| Error::apply(format!("failed to patch {key} in {namespace}: {e}")))?;
        Ok(ApplyOutcome::Patched)
    }
}

fn log_outcome(namespace: &str, resource: &DesiredResource, dry_run: bool, outcome: ApplyOutcome) {
    let key = resource.key();
    match outcome {
        ApplyOutcome::Created => {
            info!(namespace, resource = %key, dry_run, "created");
        }
        ApplyOutcome::Patched => {
            info!(namespace, resource = %key, dry_run, "patched");
        }
        ApplyOutcome::Unchanged => {
            debug!(namespace, resource = %key, dry_run, "unchanged");
        }
        ApplyOutcome::SkippedUnmanaged => {
            warn!(namespace, resource = %key, "resource is not managed by sluice; skipping");
        }
    }
}
