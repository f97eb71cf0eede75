//! Namespace-scoped autoscaling for the flow engine.
//!
//! The controller is three cooperating pieces: watch loops that mirror the
//! workload resources of every namespace, a debounce queue that collapses
//! event bursts into single per-namespace expiries, and a serial scale loop
//! that re-reads the world at each expiry and scales the engine deployment
//! up or down.

mod debounce;
mod scale;
mod watch;

pub use debounce::{channel, DelayedNamespaces, ScheduleHandle};
pub use scale::{
    reconcile_namespace, run_scale_loop, Context, ScaleClient, ScaleClientImpl, ScaleOutcome,
    Settings,
};
pub use watch::{run_watch, watched_resources, ResourceCounter};
