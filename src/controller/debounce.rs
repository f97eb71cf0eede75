//! Per-namespace reconciliation debouncing.
//!
//! Watch events arrive in bursts: a pipeline submitting twenty flows produces
//! twenty events in quick succession, and every one of them names the same
//! namespace. Instead of reconciling per event, the watch side schedules the
//! namespace here with a delay, and re-scheduling an already pending namespace
//! resets its timer. A burst therefore collapses into a single reconciliation
//! that runs once the namespace has been quiet for the full delay.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;
use tracing::debug;

/// Capacity of the schedule channel. Watch handlers block briefly if the
/// consumer falls this far behind, which backpressures the watch streams.
const SCHEDULE_BUFFER: usize = 256;

/// Creates a connected schedule handle and delayed-namespace stream.
///
/// The handle side is cheap to clone and is shared by all watch loops; the
/// stream side is consumed by the single scale loop.
pub fn channel() -> (ScheduleHandle, DelayedNamespaces) {
    let (tx, rx) = mpsc::channel(SCHEDULE_BUFFER);
    (
        ScheduleHandle { tx },
        DelayedNamespaces {
            rx,
            queue: DelayQueue::new(),
            pending: HashMap::new(),
            closed: false,
        },
    )
}

/// Producer half: schedules a namespace for reconciliation after a delay.
#[derive(Clone)]
pub struct ScheduleHandle {
    tx: mpsc::Sender<(String, Duration)>,
}

impl ScheduleHandle {
    /// Schedules `namespace` to be emitted after `delay`.
    ///
    /// If the namespace is already pending, its timer restarts from now with
    /// the new delay. Sending to a shut-down consumer is not an error; the
    /// request is simply dropped.
    pub async fn schedule(&self, namespace: String, delay: Duration) {
        if self.tx.send((namespace, delay)).await.is_err() {
            debug!("scale loop has shut down; dropping schedule request");
        }
    }
}

/// Consumer half: yields namespaces once their debounce delay has elapsed.
pub struct DelayedNamespaces {
    rx: mpsc::Receiver<(String, Duration)>,
    queue: DelayQueue<String>,
    pending: HashMap<String, Key>,
    closed: bool,
}

impl DelayedNamespaces {
    /// Waits for the next namespace whose delay has expired.
    ///
    /// Returns `None` once every [`ScheduleHandle`] has been dropped and all
    /// pending entries have drained, so the consumer loop can wind down
    /// without losing scheduled work.
    pub async fn next(&mut self) -> Option<String> {
        let Self {
            rx,
            queue,
            pending,
            closed,
        } = self;

        loop {
            if *closed && pending.is_empty() {
                return None;
            }

            tokio::select! {
                request = rx.recv(), if !*closed => match request {
                    Some((namespace, delay)) => match pending.entry(namespace) {
                        Entry::Occupied(entry) => {
                            queue.reset(entry.get(), delay);
                        }
                        Entry::Vacant(entry) => {
                            let key = queue.insert(entry.key().clone(), delay);
                            entry.insert(key);
                        }
                    },
                    None => *closed = true,
                },
                Some(expired) = poll_fn(|cx| queue.poll_expired(cx)), if !pending.is_empty() => {
                    let namespace = expired.into_inner();
                    pending.remove(&namespace);
                    return Some(namespace);
                }
            }
        }
    }
}
