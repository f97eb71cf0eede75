//! Sluice - scales per-namespace flow engines with the workloads they serve.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::api::{Api, DynamicObject};
use kube::runtime::reflector::store::Writer;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sluice::controller::{self, Context, ResourceCounter, Settings};
use sluice::fetch::SourceFetcher;
use sluice::manifest::ManifestStore;

/// Sluice - namespace-scoped autoscaler for the flow engine
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about, long_about = None)]
struct Cli {
    /// Path or URL of the engine manifest set
    #[arg(short = 'f', long = "manifests", default_value = "manifests.yaml")]
    manifests: String,

    /// Quiet period before a populated namespace is scaled up
    #[arg(long, default_value = "2s", value_parser = parse_delay)]
    scale_up_after: Duration,

    /// Quiet period before a drained namespace is scaled down
    #[arg(long, default_value = "5s", value_parser = parse_delay)]
    scale_down_after: Duration,

    /// How often the manifest source is re-fetched
    #[arg(long, default_value = "1m", value_parser = parse_delay)]
    refresh_interval: Duration,

    /// Whether namespaces without an opt-in annotation are managed
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    default_enabled: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_delay(raw: &str) -> Result<Duration, String> {
    let delay = humantime::parse_duration(raw).map_err(|error| error.to_string())?;
    if delay.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(delay)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Both ring and aws-lc-rs can end up linked through the HTTP stacks;
    // pick one process-wide before anything opens a TLS connection.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the default TLS crypto provider");
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    info!(
        manifests = %cli.manifests,
        scale_up_after = %humantime::format_duration(cli.scale_up_after),
        scale_down_after = %humantime::format_duration(cli.scale_down_after),
        default_enabled = cli.default_enabled,
        "starting sluice"
    );

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    // The first manifest load is fatal: without a set there is nothing to
    // apply, so refusing to start beats running blind.
    let store = Arc::new(
        ManifestStore::load(cli.manifests.clone(), Arc::new(SourceFetcher::default()))
            .await
            .context("initial manifest load failed")?,
    );
    info!(version = %store.current().await.version, "manifest set loaded");

    let settings = Settings {
        scale_up_after: cli.scale_up_after,
        scale_down_after: cli.scale_down_after,
        default_enabled: cli.default_enabled,
    };

    let token = CancellationToken::new();
    let (schedule, delayed) = controller::channel();

    let mut apis = Vec::new();
    let mut writers = Vec::new();
    let mut readers = Vec::new();
    for resource in controller::watched_resources() {
        apis.push(Api::<DynamicObject>::all_with(client.clone(), &resource));
        let writer = Writer::<DynamicObject>::new(resource);
        readers.push(writer.as_reader());
        writers.push(writer);
    }
    let counter = ResourceCounter::new(readers);

    let mut tasks = Vec::new();
    for (api, writer) in apis.into_iter().zip(writers) {
        tasks.push(tokio::spawn(controller::run_watch(
            api,
            writer,
            counter.clone(),
            schedule.clone(),
            settings,
            token.clone(),
        )));
    }
    drop(schedule);

    tasks.push(tokio::spawn(
        Arc::clone(&store).run_refresh_loop(cli.refresh_interval, token.clone()),
    ));

    let ctx = Arc::new(Context::new(client, store, counter, settings));
    tasks.push(tokio::spawn(controller::run_scale_loop(
        delayed,
        ctx,
        token.clone(),
    )));

    shutdown_signal().await;
    info!("shutdown signal received; stopping");
    token.cancel();
    for task in tasks {
        if let Err(error) = task.await {
            warn!(error = %error, "task ended abnormally");
        }
    }
    info!("sluice stopped");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
