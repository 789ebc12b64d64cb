#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{
    reflector::{self, Store},
    watcher,
};
use linkerd_external_endpoints_controller::{
    endpoint_slice::LABEL_MANAGED_BY,
    queue::Caches,
    reconcile::{self, KubeSliceWriter},
    Config, EndpointSlice, ExternalWorkload, Index, Queue, Reconciler, Service, SliceTracker,
    Update, Worker,
};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::Instrument;

#[derive(Parser)]
#[command(version)]
struct Args {
    #[arg(
        long,
        env = "LINKERD_EXTERNAL_ENDPOINTS_LOG_LEVEL",
        default_value = "linkerd=info,warn"
    )]
    log_level: kubert::LogFilter,

    #[arg(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[command(flatten)]
    client: kubert::ClientArgs,

    #[command(flatten)]
    admin: kubert::AdminArgs,

    /// The maximum number of endpoints in each EndpointSlice
    #[arg(
        long,
        env = "LINKERD_EXTERNAL_ENDPOINTS_MAX_ENDPOINTS",
        default_value_t = reconcile::DEFAULT_MAX_ENDPOINTS_PER_SLICE
    )]
    max_endpoints_per_slice: usize,

    /// Identifies this controller in the managed-by label of EndpointSlices
    #[arg(long, default_value = reconcile::DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// Seconds to wait for each EndpointSlice write
    #[arg(long, default_value_t = 10)]
    write_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        max_endpoints_per_slice,
        controller_name,
        write_timeout,
    } = Args::parse();

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let (services, service_events) =
        cache(runtime.watch_all::<Service>(watcher::Config::default()));
    let (workloads, workload_events) =
        cache(runtime.watch_all::<ExternalWorkload>(watcher::Config::default()));
    let managed_by = format!("{}={}", LABEL_MANAGED_BY, controller_name);
    let (slices, slice_events) =
        cache(runtime.watch_all::<EndpointSlice>(watcher::Config::default().labels(&managed_by)));

    let tracker = SliceTracker::shared();
    let (queue, queue_rx) = Queue::new();

    // Every event updates its cache before it's indexed, so the services affected by an event are
    // always resolved against current state.
    let updates = stream::select(
        service_events.map(Update::from),
        stream::select(
            workload_events.map(Update::from),
            slice_events.map(Update::from),
        ),
    );
    let index = Index::new(
        services.clone(),
        tracker.clone(),
        controller_name.clone(),
        queue.clone(),
    );
    tokio::spawn(
        index
            .run(updates)
            .instrument(tracing::info_span!("index")),
    );

    // Leader election isn't implemented; this replica always leads.
    let (_leader_tx, leader_rx) = watch::channel(true);

    // All writes happen on a single task so that a service is never reconciled concurrently.
    let writer = KubeSliceWriter::new(
        runtime.client(),
        tracker.clone(),
        time::Duration::from_secs(write_timeout),
    );
    let reconciler = Reconciler::new(Config {
        max_endpoints_per_slice,
        controller_name,
    });
    let worker = Worker::new(
        queue_rx,
        queue,
        Caches {
            services,
            workloads,
            slices,
        },
        tracker,
        reconciler,
        Arc::new(writer),
        leader_rx,
    );
    tokio::spawn(
        runtime
            .cancel_on_shutdown(worker.run())
            .instrument(tracing::info_span!("reconcile")),
    );

    // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
    // complete before exiting.
    if runtime.run().await.is_err() {
        bail!("aborted");
    }

    Ok(())
}

/// Maintains a cache from a stream of watch events. Each event is applied to the cache before it
/// is yielded.
fn cache<K>(
    events: impl Stream<Item = watcher::Event<K>>,
) -> (Store<K>, impl Stream<Item = watcher::Event<K>>)
where
    K: kube::Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + std::hash::Hash,
{
    let (store, mut writer) = reflector::store();
    let events = events.map(move |ev| {
        writer.apply_watcher_event(&ev);
        ev
    });
    (store, events)
}
