//! Watch loops for the engine's workload resources.
//!
//! One loop runs per watched kind. Each loop feeds a reflector store so the
//! controller always has an in-memory view of the cluster, and every touched
//! object schedules its namespace through the debounce queue. The delay class
//! is chosen from the namespace's current resource count: namespaces with
//! work pending get the short scale-up delay, drained namespaces get the
//! longer scale-down delay.

use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::WATCHED_KINDS;

use super::debounce::ScheduleHandle;
use super::scale::Settings;

/// API coordinates for every watched kind, in [`WATCHED_KINDS`] order.
pub fn watched_resources() -> Vec<ApiResource> {
    WATCHED_KINDS
        .iter()
        .map(|(group, version, kind, plural)| {
            let api_version = if group.is_empty() {
                (*version).to_string()
            } else {
                format!("{group}/{version}")
            };
            ApiResource {
                group: (*group).to_string(),
                version: (*version).to_string(),
                api_version,
                kind: (*kind).to_string(),
                plural: (*plural).to_string(),
            }
        })
        .collect()
}

/// Read side of the reflector stores for every watched kind.
///
/// Counting is a synchronous scan of the cached state; no API round trip is
/// involved, so the count reflects whatever the watches have seen so far.
#[derive(Clone)]
pub struct ResourceCounter {
    stores: Vec<Store<DynamicObject>>,
}

impl ResourceCounter {
    /// Builds a counter over the given reflector stores.
    pub fn new(stores: Vec<Store<DynamicObject>>) -> Self {
        Self { stores }
    }

    /// Number of watched resources currently living in `namespace`, summed
    /// across every watched kind.
    pub fn count(&self, namespace: &str) -> usize {
        self.stores
            .iter()
            .map(|store| {
                store
                    .state()
                    .iter()
                    .filter(|object| object.namespace().as_deref() == Some(namespace))
                    .count()
            })
            .sum()
    }
}

/// Picks the debounce delay for a namespace from its resource count.
///
/// A populated namespace should come up quickly; an empty one gets a longer
/// grace period so back-to-back flows do not bounce the engine.
pub(super) fn reconcile_delay(count: usize, settings: &Settings) -> Duration {
    if count > 0 {
        settings.scale_up_after
    } else {
        settings.scale_down_after
    }
}

/// Runs a single watch loop until the stream ends or `token` fires.
///
/// The watcher restarts itself with backoff on transient API errors; errors
/// are logged and the loop keeps going. Every object the watch touches
/// (including deletions) reschedules its namespace.
pub async fn run_watch(
    api: Api<DynamicObject>,
    writer: Writer<DynamicObject>,
    counter: ResourceCounter,
    schedule: ScheduleHandle,
    settings: Settings,
    token: CancellationToken,
) {
    let mut objects = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .boxed();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("watch loop stopping");
                break;
            }
            event = objects.next() => match event {
                Some(Ok(object)) => {
                    schedule_touched(&object, &counter, &schedule, &settings).await;
                }
                Some(Err(error)) => {
                    warn!(error = %error, "watch stream error");
                }
                None => {
                    warn!("watch stream ended");
                    break;
                }
            }
        }
    }
}

async fn schedule_touched(
    object: &DynamicObject,
    counter: &ResourceCounter,
    schedule: &ScheduleHandle,
    settings: &Settings,
) {
    // Watched kinds are namespaced; anything without a namespace is noise.
    let Some(namespace) = object.namespace() else {
        return;
    };

    let count = counter.count(&namespace);
    let delay = reconcile_delay(count, settings);
    debug!(namespace = %namespace, count, delay = ?delay, "scheduling reconciliation");
    schedule.schedule(namespace, delay).await;
}
