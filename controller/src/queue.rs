//! Schedules service reconciliations.
//!
//! Keys are deduplicated while they wait in the queue, and a single [`Worker`] drains it, so a
//! service is never reconciled concurrently with itself.

use crate::{
    endpoint_slice::{self, LABEL_SERVICE_NAME},
    external_workload::ExternalWorkload,
    reconcile::{Reconciler, SliceWriter},
    service::{self, ServiceRef},
    tracker::SharedTracker,
};
use anyhow::{bail, Context, Result};
use k8s_openapi::api::{core::v1::Service, discovery::v1::EndpointSlice};
use kube::{runtime::reflector::Store, ResourceExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, watch},
    time,
};

/// Failed keys are dropped after this many retries.
pub const MAX_RETRIES: u32 = 15;

const BACKOFF_BASE: time::Duration = time::Duration::from_millis(5);
const BACKOFF_MAX: time::Duration = time::Duration::from_secs(1000);

/// A handle for scheduling services to be reconciled.
#[derive(Clone, Debug)]
pub struct Queue {
    tx: mpsc::UnboundedSender<ServiceRef>,
    pending: Arc<Mutex<HashSet<ServiceRef>>>,
}

/// The caches a reconciliation reads from.
#[derive(Clone)]
pub struct Caches {
    pub services: Store<Service>,
    pub workloads: Store<ExternalWorkload>,
    pub slices: Store<EndpointSlice>,
}

/// Reconciles the services taken from a [`Queue`], one at a time.
pub struct Worker {
    rx: mpsc::UnboundedReceiver<ServiceRef>,
    queue: Queue,
    caches: Caches,
    tracker: SharedTracker,
    reconciler: Reconciler,
    writer: Arc<dyn SliceWriter>,
    leader: watch::Receiver<bool>,
    retries: HashMap<ServiceRef, u32>,
}

// === impl Queue ===

impl Queue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServiceRef>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            pending: Default::default(),
        };
        (queue, rx)
    }

    /// Schedules the service unless it's already waiting to be processed.
    pub fn enqueue(&self, key: ServiceRef) {
        if !self.pending.lock().insert(key.clone()) {
            tracing::trace!(service = %key, "already queued");
            return;
        }
        if let Err(mpsc::error::SendError(key)) = self.tx.send(key) {
            tracing::debug!(service = %key, "worker has stopped; dropping service");
            self.pending.lock().remove(&key);
        }
    }

    /// Enqueues the service after a delay.
    pub fn enqueue_after(&self, key: ServiceRef, delay: time::Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Marks the service as taken by the worker so that later changes schedule it again.
    pub(crate) fn done(&self, key: &ServiceRef) {
        self.pending.lock().remove(key);
    }
}

// === impl Worker ===

impl Worker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<ServiceRef>,
        queue: Queue,
        caches: Caches,
        tracker: SharedTracker,
        reconciler: Reconciler,
        writer: Arc<dyn SliceWriter>,
        leader: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rx,
            queue,
            caches,
            tracker,
            reconciler,
            writer,
            leader,
            retries: HashMap::new(),
        }
    }

    /// Processes services until the task is cancelled.
    ///
    /// Services are only reconciled while `leader` is true. When leadership is acquired, every
    /// known service is scheduled.
    pub async fn run(mut self) {
        let mut leading = *self.leader.borrow_and_update();
        if leading {
            tracing::info!("leading; reconciling all services");
            self.enqueue_all();
        }
        let mut leader_open = true;
        loop {
            tokio::select! {
                res = self.leader.changed(), if leader_open => match res {
                    Ok(()) => {
                        let now_leading = *self.leader.borrow_and_update();
                        if now_leading && !leading {
                            tracing::info!("acquired leadership; reconciling all services");
                            self.enqueue_all();
                        } else if !now_leading && leading {
                            tracing::info!("lost leadership");
                        }
                        leading = now_leading;
                    }
                    // Leadership can no longer change.
                    Err(_) => leader_open = false,
                },

                key = self.rx.recv() => match key {
                    Some(key) => self.process(key, leading).await,
                    None => return,
                },
            }
        }
    }

    fn enqueue_all(&self) {
        for svc in self.caches.services.state() {
            self.queue.enqueue(ServiceRef::from_service(&svc));
        }
    }

    async fn process(&mut self, key: ServiceRef, leading: bool) {
        self.queue.done(&key);
        if !leading {
            tracing::trace!(service = %key, "not leader; skipping");
            self.retries.remove(&key);
            return;
        }

        let error = match self.sync(&key).await {
            Ok(()) => {
                self.retries.remove(&key);
                return;
            }
            Err(error) => error,
        };

        let attempts = self.retries.get(&key).copied().unwrap_or(0);
        if attempts >= MAX_RETRIES {
            tracing::error!(
                service = %key,
                error = format_args!("{:#}", error),
                "dropping service after too many failures"
            );
            self.retries.remove(&key);
            return;
        }
        self.retries.insert(key.clone(), attempts + 1);

        let delay = backoff(attempts);
        tracing::warn!(
            service = %key,
            error = format_args!("{:#}", error),
            ?delay,
            "failed to sync service"
        );
        self.queue.enqueue_after(key, delay);
    }

    /// Converges the slices of a single service with the current cache contents.
    #[tracing::instrument(skip_all, fields(service = %key))]
    pub async fn sync(&self, key: &ServiceRef) -> Result<()> {
        let svc = match self.caches.services.get(&key.object_ref()) {
            Some(svc) => svc,
            None => {
                // Owned slices are garbage collected with the service.
                tracing::debug!("service deleted");
                self.tracker.lock().delete_service(key);
                return Ok(());
            }
        };

        if svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("ExternalName") {
            tracing::trace!("skipping ExternalName service");
            return Ok(());
        }

        let selector = match service::selector(&svc) {
            Some(selector) => selector,
            None => {
                tracing::trace!("skipping service without a selector");
                return Ok(());
            }
        };

        let workloads = self
            .caches
            .workloads
            .state()
            .into_iter()
            .filter(|wl| wl.namespace().as_deref() == Some(key.namespace.as_str()))
            .filter(|wl| service::selector_matches(selector, wl.labels()))
            .collect::<Vec<_>>();

        let controller = &self.reconciler.config().controller_name;
        let slices = self
            .caches
            .slices
            .state()
            .into_iter()
            .filter(|s| s.namespace().as_deref() == Some(key.namespace.as_str()))
            .filter(|s| s.labels().get(LABEL_SERVICE_NAME) == Some(&key.name))
            .filter(|s| endpoint_slice::is_managed_by(s, controller))
            .filter(|s| s.metadata.deletion_timestamp.is_none())
            .collect::<Vec<_>>();

        if self.tracker.lock().stale_slices(key, &slices) {
            bail!("endpoint slice cache is stale");
        }

        self.reconciler
            .reconcile(&svc, &workloads, &slices, &*self.writer)
            .await
            .with_context(|| format!("failed to reconcile EndpointSlices for {}", key))
    }
}

fn backoff(attempts: u32) -> time::Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempts))
        .min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        external_workload::tests::mk_workload,
        reconcile::{
            tests::{FakeStore, Op, OpKind},
            Config, WriteError,
        },
        service::tests::mk_service,
        tracker::SliceTracker,
    };
    use kube::runtime::{reflector::store::Writer, watcher};

    struct Fixture {
        services: Writer<Service>,
        workloads: Writer<ExternalWorkload>,
        slices: Writer<EndpointSlice>,
        store: Arc<FakeStore>,
        tracker: SharedTracker,
        worker: Worker,
    }

    fn fixture() -> Fixture {
        let services = Writer::<Service>::default();
        let workloads = Writer::<ExternalWorkload>::default();
        let slices = Writer::<EndpointSlice>::default();
        let store = Arc::new(FakeStore::default());
        let tracker = SliceTracker::shared();
        let (queue, rx) = Queue::new();
        let (_, leader) = watch::channel(true);
        let worker = Worker::new(
            rx,
            queue,
            Caches {
                services: services.as_reader(),
                workloads: workloads.as_reader(),
                slices: slices.as_reader(),
            },
            tracker.clone(),
            Reconciler::new(Config {
                max_endpoints_per_slice: 10,
                controller_name: "test-controller".to_string(),
            }),
            store.clone(),
            leader,
        );
        Fixture {
            services,
            workloads,
            slices,
            store,
            tracker,
            worker,
        }
    }

    fn workload(ns: &str, name: &str, ip: &str) -> ExternalWorkload {
        mk_workload(ns, name, &[("app", "web")], &[ip], &[(Some("http"), 8080)], true)
    }

    #[test]
    fn backs_off_exponentially() {
        assert_eq!(backoff(0), time::Duration::from_millis(5));
        assert_eq!(backoff(1), time::Duration::from_millis(10));
        assert_eq!(backoff(4), time::Duration::from_millis(80));
        assert_eq!(backoff(30), BACKOFF_MAX);
        assert_eq!(backoff(u32::MAX), BACKOFF_MAX);
    }

    #[tokio::test]
    async fn deduplicates_pending_keys() {
        let (queue, mut rx) = Queue::new();
        let web = ServiceRef::new("ns-0", "web");
        queue.enqueue(web.clone());
        queue.enqueue(web.clone());
        queue.enqueue(ServiceRef::new("ns-0", "api"));

        assert_eq!(rx.recv().await, Some(web.clone()));
        assert_eq!(rx.recv().await, Some(ServiceRef::new("ns-0", "api")));
        assert!(rx.try_recv().is_err());

        // Once taken, the key may be scheduled again.
        queue.done(&web);
        queue.enqueue(web.clone());
        assert_eq!(rx.recv().await, Some(web));
    }

    #[tokio::test]
    async fn syncs_selected_workloads() {
        let mut f = fixture();
        f.services
            .apply_watcher_event(&watcher::Event::Applied(mk_service("ns-0", "web", &[("app", "web")])));
        f.workloads.apply_watcher_event(&watcher::Event::Restarted(vec![
            workload("ns-0", "wl-0", "192.0.2.1"),
            workload("ns-0", "wl-1", "192.0.2.2"),
            // Services only select workloads in their own namespace.
            workload("ns-1", "wl-2", "192.0.2.3"),
        ]));

        f.worker
            .sync(&ServiceRef::new("ns-0", "web"))
            .await
            .expect("sync must succeed");

        let slices = f.store.slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].endpoints.len(), 2);
    }

    #[tokio::test]
    async fn ignores_missing_services() {
        let f = fixture();
        let web = ServiceRef::new("ns-0", "web");
        let mut slice = EndpointSlice::default();
        slice.metadata.namespace = Some("ns-0".to_string());
        slice.metadata.uid = Some("slice-uid".to_string());
        slice.metadata.labels =
            Some(std::iter::once((LABEL_SERVICE_NAME.to_string(), "web".to_string())).collect());
        f.tracker.lock().update(&slice);

        f.worker.sync(&web).await.expect("sync must succeed");
        assert!(f.store.take_ops().is_empty());
        assert!(!f.tracker.lock().has(&slice));
    }

    #[tokio::test]
    async fn ignores_services_without_endpoints() {
        let mut f = fixture();
        let mut external = mk_service("ns-0", "external", &[("app", "web")]);
        external.spec.as_mut().unwrap().type_ = Some("ExternalName".to_string());
        let mut selectorless = mk_service("ns-0", "selectorless", &[]);
        selectorless.spec.as_mut().unwrap().selector = None;
        f.services
            .apply_watcher_event(&watcher::Event::Restarted(vec![external, selectorless]));
        f.workloads
            .apply_watcher_event(&watcher::Event::Applied(workload("ns-0", "wl-0", "192.0.2.1")));

        f.worker
            .sync(&ServiceRef::new("ns-0", "external"))
            .await
            .expect("sync must succeed");
        f.worker
            .sync(&ServiceRef::new("ns-0", "selectorless"))
            .await
            .expect("sync must succeed");
        assert!(f.store.take_ops().is_empty());
    }

    #[tokio::test]
    async fn only_reads_managed_slices() {
        let mut f = fixture();
        f.services
            .apply_watcher_event(&watcher::Event::Applied(mk_service("ns-0", "web", &[("app", "web")])));
        f.workloads
            .apply_watcher_event(&watcher::Event::Applied(workload("ns-0", "wl-0", "192.0.2.1")));
        let web = ServiceRef::new("ns-0", "web");
        f.worker.sync(&web).await.expect("sync must succeed");
        assert_eq!(f.store.take_ops().len(), 1);

        // A slice managed by another controller is left alone, even though it's labelled for
        // the same service.
        let mut foreign = f.store.slices().remove(0);
        foreign.metadata.name = Some("foreign".to_string());
        foreign.metadata.uid = Some("foreign-uid".to_string());
        foreign
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(endpoint_slice::LABEL_MANAGED_BY.to_string(), "other".to_string());
        let mut cached = f.store.slices();
        cached.push(foreign);
        f.slices
            .apply_watcher_event(&watcher::Event::Restarted(cached));

        f.worker.sync(&web).await.expect("sync must succeed");
        assert!(f.store.take_ops().is_empty());
    }

    #[tokio::test]
    async fn rejects_stale_caches() {
        let mut f = fixture();
        f.services
            .apply_watcher_event(&watcher::Event::Applied(mk_service("ns-0", "web", &[("app", "web")])));
        f.workloads
            .apply_watcher_event(&watcher::Event::Applied(workload("ns-0", "wl-0", "192.0.2.1")));
        let web = ServiceRef::new("ns-0", "web");
        f.worker.sync(&web).await.expect("sync must succeed");

        // The fake doesn't record writes in the tracker, so record the created slice as the
        // client would have.
        let created = f.store.slices().remove(0);
        f.tracker.lock().update(&created);

        // The slice cache hasn't observed the created slice yet.
        let error = f.worker.sync(&web).await.expect_err("sync must fail");
        assert!(error.to_string().contains("stale"), "{}", error);

        f.slices
            .apply_watcher_event(&watcher::Event::Applied(created));
        f.worker.sync(&web).await.expect("sync must succeed");
    }

    #[tokio::test]
    async fn reports_write_failures() {
        let mut f = fixture();
        f.services
            .apply_watcher_event(&watcher::Event::Applied(mk_service("ns-0", "web", &[("app", "web")])));
        f.workloads
            .apply_watcher_event(&watcher::Event::Applied(workload("ns-0", "wl-0", "192.0.2.1")));
        f.store.fail(OpKind::Create, || {
            WriteError::Timeout(time::Duration::from_secs(1))
        });

        let error = f
            .worker
            .sync(&ServiceRef::new("ns-0", "web"))
            .await
            .expect_err("sync must fail");
        assert!(error.downcast_ref::<WriteError>().is_some());
        assert_eq!(f.store.take_ops(), Vec::<Op>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_services() {
        let mut f = fixture();
        f.services
            .apply_watcher_event(&watcher::Event::Applied(mk_service("ns-0", "web", &[("app", "web")])));
        f.workloads
            .apply_watcher_event(&watcher::Event::Applied(workload("ns-0", "wl-0", "192.0.2.1")));
        f.store.fail(OpKind::Create, || {
            WriteError::Timeout(time::Duration::from_secs(1))
        });
        let web = ServiceRef::new("ns-0", "web");

        f.worker.process(web.clone(), true).await;
        assert_eq!(f.worker.retries.get(&web), Some(&1));

        // The retry is scheduled after the backoff.
        time::sleep(backoff(0) * 2).await;
        let key = f.worker.rx.recv().await.expect("service must be requeued");
        assert_eq!(key, web);

        f.worker.retries.insert(web.clone(), MAX_RETRIES);
        f.worker.process(web.clone(), true).await;
        assert!(f.worker.retries.get(&web).is_none());
    }

    #[tokio::test]
    async fn followers_do_not_write() {
        let mut f = fixture();
        f.services
            .apply_watcher_event(&watcher::Event::Applied(mk_service("ns-0", "web", &[("app", "web")])));
        f.workloads
            .apply_watcher_event(&watcher::Event::Applied(workload("ns-0", "wl-0", "192.0.2.1")));

        f.worker.process(ServiceRef::new("ns-0", "web"), false).await;
        assert!(f.store.take_ops().is_empty());

        f.worker.process(ServiceRef::new("ns-0", "web"), true).await;
        assert_eq!(f.store.take_ops().len(), 1);
    }

    /// A worker over two services with one workload each.
    fn two_services(leading: bool) -> (Worker, Arc<FakeStore>, watch::Sender<bool>) {
        let mut services = Writer::<Service>::default();
        services.apply_watcher_event(&watcher::Event::Restarted(vec![
            mk_service("ns-0", "web", &[("app", "web")]),
            mk_service("ns-1", "web", &[("app", "web")]),
        ]));
        let mut workloads = Writer::<ExternalWorkload>::default();
        workloads.apply_watcher_event(&watcher::Event::Restarted(vec![
            workload("ns-0", "wl-0", "192.0.2.1"),
            workload("ns-1", "wl-0", "192.0.2.2"),
        ]));
        let (queue, rx) = Queue::new();
        let (leader_tx, leader) = watch::channel(leading);
        let store = Arc::new(FakeStore::default());
        let worker = Worker::new(
            rx,
            queue,
            Caches {
                services: services.as_reader(),
                workloads: workloads.as_reader(),
                slices: Writer::default().as_reader(),
            },
            SliceTracker::shared(),
            Reconciler::new(Config::default()),
            store.clone(),
            leader,
        );
        (worker, store, leader_tx)
    }

    async fn await_slices(store: &FakeStore, n: usize) {
        time::timeout(time::Duration::from_secs(10), async {
            while store.slices().len() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("services must be reconciled");
    }

    #[tokio::test]
    async fn acquiring_leadership_enqueues_all_services() {
        let (worker, store, leader_tx) = two_services(false);
        let task = tokio::spawn(worker.run());

        // Leadership may be acquired before the worker first observes the gate.
        leader_tx.send(true).expect("worker must be running");
        await_slices(&store, 2).await;
        task.abort();
    }

    #[tokio::test]
    async fn starting_as_leader_enqueues_all_services() {
        let (worker, store, _leader_tx) = two_services(true);
        let task = tokio::spawn(worker.run());

        await_slices(&store, 2).await;
        task.abort();
    }
}
