//! Versioned manifest-set store
//!
//! The supporting resources sluice applies per namespace come from a single
//! multi-document YAML source. The store fetches it, fingerprints the raw
//! bytes, and parses it into an immutable [`ManifestSet`] snapshot that the
//! apply engine reads. A background refresh re-fetches on an interval and
//! swaps the snapshot only when the fingerprint actually changes; a failed
//! refresh keeps the previous set authoritative.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use sha1::{Digest, Sha1};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetch::ManifestFetcher;
use crate::{
    Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PART_OF_LABEL, PART_OF_VALUE, VERSION_LABEL,
};

/// One parsed manifest document plus the API coordinates to address it.
#[derive(Clone, Debug)]
pub struct DesiredResource {
    /// The desired object, already stamped with the ownership and version
    /// labels.
    pub object: DynamicObject,
    /// Where this object lives in the API (group/version/plural).
    pub api_resource: ApiResource,
}

impl DesiredResource {
    /// Object name from the manifest.
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or("")
    }

    /// `Kind/name` identifier used in logs and error messages.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_resource.kind, self.name())
    }
}

/// An immutable parsed manifest snapshot.
///
/// All resources in a set carry `version` in their version label; the
/// scale-up path compares the live deployment's label against this value to
/// detect stale namespaces.
#[derive(Clone, Debug)]
pub struct ManifestSet {
    /// Hex-encoded SHA-1 of the raw source bytes.
    pub version: String,
    /// Desired resources in source order.
    pub resources: Vec<DesiredResource>,
}

/// Holds the current [`ManifestSet`] and refreshes it from the source.
///
/// Single writer (the refresh loop), many readers (the apply engine via
/// [`ManifestStore::current`]). Readers always observe a complete snapshot.
pub struct ManifestStore {
    source: String,
    fetcher: Arc<dyn ManifestFetcher>,
    current: RwLock<Arc<ManifestSet>>,
}

impl std::fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStore")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl ManifestStore {
    /// Fetch and parse the source once, failing hard on any error.
    ///
    /// Used at startup: without an initial manifest set there is nothing to
    /// reconcile, so the process should not come up.
    pub async fn load(source: impl Into<String>, fetcher: Arc<dyn ManifestFetcher>) -> Result<Self> {
        let source = source.into();
        let bytes = fetcher.fetch(&source).await?;
        let version = fingerprint(&bytes);
        let set = parse_manifest_set(&bytes, &version)?;
        info!(
            source = %source,
            version = %set.version,
            resources = set.resources.len(),
            "loaded manifest set"
        );
        Ok(Self {
            source,
            fetcher,
            current: RwLock::new(Arc::new(set)),
        })
    }

    /// The current snapshot. Cheap; clones an `Arc`.
    pub async fn current(&self) -> Arc<ManifestSet> {
        self.current.read().await.clone()
    }

    /// Re-fetch the source and swap in a new snapshot if its fingerprint
    /// changed. Returns whether a swap happened.
    ///
    /// Any failure leaves the previous snapshot in place; after the initial
    /// [`ManifestStore::load`] this is never fatal.
    pub async fn refresh(&self) -> Result<bool> {
        let bytes = self.fetcher.fetch(&self.source).await?;
        let version = fingerprint(&bytes);
        if self.current.read().await.version == version {
            return Ok(false);
        }
        let set = Arc::new(parse_manifest_set(&bytes, &version)?);
        info!(
            version = %set.version,
            resources = set.resources.len(),
            "manifest set changed; swapping snapshot"
        );
        *self.current.write().await = set;
        Ok(true)
    }

    /// Periodic refresh until cancelled. Failures are logged and the loop
    /// keeps going with the previous set.
    pub async fn run_refresh_loop(self: Arc<Self>, every: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately; the startup load already
        // covered it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("manifest refresh loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(true) => {}
                        Ok(false) => debug!("manifest set unchanged"),
                        Err(error) => {
                            warn!(error = %error, "manifest refresh failed; keeping previous set");
                        }
                    }
                }
            }
        }
    }
}

/// Hex-encoded SHA-1 of the raw manifest bytes.
fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Split a multi-document YAML stream on `---` and decode each part.
///
/// Blank parts (leading separators, trailing newlines) are skipped. Any part
/// that fails to decode, or decodes without an apiVersion, kind, or name,
/// fails the whole parse; a partial manifest set is never published.
fn parse_manifest_set(bytes: &[u8], version: &str) -> Result<ManifestSet> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::manifest(format!("manifest source is not valid UTF-8: {e}")))?;

    let mut resources = Vec::new();
    for (index, part) in text.split("---").enumerate() {
        if part.trim().is_empty() {
            continue;
        }
        let mut object: DynamicObject = serde_yaml::from_str(part)
            .map_err(|e| Error::manifest(format!("failed to decode manifest document {index}: {e}")))?;

        let types = object
            .types
            .clone()
            .filter(|t| !t.kind.is_empty() && !t.api_version.is_empty())
            .ok_or_else(|| {
                Error::manifest(format!("manifest document {index} has no apiVersion/kind"))
            })?;
        if object.metadata.name.as_deref().unwrap_or("").is_empty() {
            return Err(Error::manifest(format!(
                "manifest document {index} ({}) has no name",
                types.kind
            )));
        }

        let (group, group_version) = match types.api_version.split_once('/') {
            Some((group, group_version)) => (group.to_string(), group_version.to_string()),
            None => (String::new(), types.api_version.clone()),
        };
        let gvk = kube::api::GroupVersionKind {
            group,
            version: group_version,
            kind: types.kind.clone(),
        };
        let api_resource = ApiResource::from_gvk(&gvk);

        let labels = object.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string());
        labels.insert(VERSION_LABEL.to_string(), version.to_string());

        resources.push(DesiredResource {
            object,
            api_resource,
        });
    }

    if resources.is_empty() {
        return Err(Error::manifest("manifest source contains no documents"));
    }

    Ok(ManifestSet {
        version: version.to_string(),
        resources,
    })
}
