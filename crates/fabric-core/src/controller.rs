// ── Discovery controller lifecycle ──
//
// State machine driving the whole subsystem:
//
//   Disconnected ──connect──▶ Connected ──sweep ok──▶ Initialized
//        ▲                        │                        │
//        └────── any failure ─────┴──── watch opened ──────▶ Monitoring
//
// Monitoring is the steady state: a periodic ticker re-runs the full sweep
// and catalog watch events feed the dispatch queue. Stop is requested
// externally and wins from every state.
//
// Reconcilers are rebuilt for every catalog connection; each connection
// carries a child cancellation token so the previous connection's
// subscription monitors and pumps are torn down rather than leaked.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_api::{CatalogClient, EventKind, Id, Object};

use crate::config::DiscoveryConfig;
use crate::error::CoreError;
use crate::reconcile::{HostReconciler, LinkReconciler, PortReconciler};

/// Lifecycle states of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connected,
    Initialized,
    Monitoring,
    Stopped,
}

/// Everything bound to one catalog connection.
pub(crate) struct Epoch {
    pub(crate) catalog: CatalogClient,
    pub(crate) ports: Arc<PortReconciler>,
    pub(crate) links: Arc<LinkReconciler>,
    pub(crate) hosts: Arc<HostReconciler>,
    pub(crate) cancel: CancellationToken,
}

/// The topology discovery controller.
///
/// Cheaply cloneable; [`start`](Self::start) spawns the lifecycle loop and
/// the worker pool, [`stop`](Self::stop) tears everything down.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

pub(crate) struct ControllerInner {
    pub(crate) config: DiscoveryConfig,
    state: watch::Sender<LifecycleState>,
    cancel: CancellationToken,
    realm_tx: mpsc::Sender<Object>,
    neighbor_tx: mpsc::Sender<Object>,
    realm_rx: Mutex<Option<mpsc::Receiver<Object>>>,
    neighbor_rx: Mutex<Option<mpsc::Receiver<Object>>>,
    working_on: StdMutex<HashSet<Id>>,
    epoch: RwLock<Option<Arc<Epoch>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone, Copy)]
enum WorkerRole {
    /// Full discovery of realm devices.
    Realm,
    /// Agent-only registration of neighbor-realm devices.
    Neighbor,
}

impl Controller {
    /// Build a controller from validated configuration. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: DiscoveryConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let (state, _) = watch::channel(LifecycleState::Disconnected);
        let (realm_tx, realm_rx) = mpsc::channel(config.queue_depth);
        let (neighbor_tx, neighbor_rx) = mpsc::channel(config.queue_depth);

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                state,
                cancel: CancellationToken::new(),
                realm_tx,
                neighbor_tx,
                realm_rx: Mutex::new(Some(realm_rx)),
                neighbor_rx: Mutex::new(Some(neighbor_rx)),
                working_on: StdMutex::new(HashSet::new()),
                epoch: RwLock::new(None),
                tasks: StdMutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the lifecycle loop and the worker pools.
    pub async fn start(&self) {
        info!("starting discovery controller");
        let Some(realm_rx) = self.inner.realm_rx.lock().await.take() else {
            warn!("controller already started");
            return;
        };

        let mut tasks = Vec::new();
        let realm_rx = Arc::new(Mutex::new(realm_rx));
        for worker_id in 0..self.inner.config.worker_count {
            tasks.push(tokio::spawn(worker(
                Arc::clone(&self.inner),
                Arc::clone(&realm_rx),
                WorkerRole::Realm,
                worker_id,
            )));
        }

        if self.inner.config.neighbor_realm.is_some() {
            if let Some(neighbor_rx) = self.inner.neighbor_rx.lock().await.take() {
                let neighbor_rx = Arc::new(Mutex::new(neighbor_rx));
                for worker_id in 0..self.inner.config.worker_count {
                    tasks.push(tokio::spawn(worker(
                        Arc::clone(&self.inner),
                        Arc::clone(&neighbor_rx),
                        WorkerRole::Neighbor,
                        worker_id,
                    )));
                }
            }
        }

        tasks.push(tokio::spawn(run(Arc::clone(&self.inner))));
        self.inner.tasks.lock().expect("lock poisoned").extend(tasks);
    }

    /// Request a stop from any state and wait for all tasks to exit.
    pub async fn stop(&self) {
        info!("stopping discovery controller");
        self.inner.force_state(LifecycleState::Stopped);
        self.inner.cancel.cancel();
        if let Some(epoch) = self.inner.epoch.write().await.take() {
            epoch.cancel.cancel();
        }

        let handles: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().expect("lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> LifecycleState {
        self.inner.current_state()
    }

    pub(crate) async fn monitoring_epoch(&self) -> Result<Arc<Epoch>, CoreError> {
        if self.inner.current_state() != LifecycleState::Monitoring {
            return Err(CoreError::NotReady);
        }
        self.inner.current_epoch().await.ok_or(CoreError::NotReady)
    }
}

// ── Lifecycle loop ──────────────────────────────────────────────────

async fn run(inner: Arc<ControllerInner>) {
    info!("controller started");
    loop {
        match inner.current_state() {
            LifecycleState::Stopped => break,
            LifecycleState::Disconnected => inner.connect_catalog().await,
            LifecycleState::Connected => inner.initial_sweep().await,
            LifecycleState::Initialized => begin_monitoring(&inner).await,
            LifecycleState::Monitoring => inner.monitor().await,
        }
    }
    info!("controller stopped");
}

impl ControllerInner {
    pub(crate) fn current_state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn force_state(&self, next: LifecycleState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "lifecycle transition");
            *state = next;
            true
        });
    }

    /// Transition only when still in the expected state, so a concurrent
    /// stop (or an earlier failure) is never overwritten.
    fn set_state_if(&self, expected: LifecycleState, next: LifecycleState) {
        self.state.send_if_modified(|state| {
            if *state != expected {
                return false;
            }
            debug!(from = ?expected, to = ?next, "lifecycle transition");
            *state = next;
            true
        });
    }

    pub(crate) async fn current_epoch(&self) -> Option<Arc<Epoch>> {
        self.epoch.read().await.clone()
    }

    /// Disconnected: dial the catalog until it answers or we are stopped.
    async fn connect_catalog(&self) {
        info!(address = %self.config.catalog_address, "connecting to catalog");
        while self.current_state() == LifecycleState::Disconnected {
            match CatalogClient::connect(
                &self.config.catalog_address,
                &self.config.catalog_tls,
                self.config.op_timeout,
            )
            .await
            {
                Ok(catalog) => {
                    self.install_epoch(catalog).await;
                    self.set_state_if(LifecycleState::Disconnected, LifecycleState::Connected);
                    info!("connected to catalog");
                }
                Err(error) => {
                    warn!(%error, "unable to connect to catalog");
                    self.pause(self.config.retry_pause).await;
                }
            }
        }
    }

    /// Swap in a fresh connection epoch, tearing the previous one down.
    async fn install_epoch(&self, catalog: CatalogClient) {
        let cancel = self.cancel.child_token();
        let epoch = Arc::new(Epoch {
            ports: PortReconciler::new(catalog.clone(), &self.config, cancel.child_token()),
            links: LinkReconciler::new(catalog.clone(), &self.config, cancel.child_token()),
            hosts: HostReconciler::new(catalog.clone(), &self.config, cancel.child_token()),
            catalog,
            cancel,
        });
        if let Some(old) = self.epoch.write().await.replace(epoch) {
            old.cancel.cancel();
        }
    }

    /// Connected: run the initial full sweep until it succeeds once.
    async fn initial_sweep(&self) {
        while self.current_state() == LifecycleState::Connected {
            match self.full_sweep().await {
                Ok(()) => self.set_state_if(LifecycleState::Connected, LifecycleState::Initialized),
                Err(error) => {
                    warn!(%error, "initial discovery sweep failed");
                    self.set_state_if(LifecycleState::Connected, LifecycleState::Disconnected);
                }
            }
        }
    }

    /// Query all realm devices and feed them to the dispatch queue.
    /// Never mutates the catalog; stops early when the lifecycle moves on.
    async fn full_sweep(&self) -> Result<(), CoreError> {
        let Some(epoch) = self.current_epoch().await else {
            return Err(CoreError::Api(fabric_api::Error::Disconnected {
                reason: "no active catalog connection".into(),
            }));
        };

        debug!("starting full discovery sweep");
        let mut stream = epoch.catalog.query(self.config.realm.device_filters())?;
        let mut count = 0usize;
        while let Some(object) = stream.recv().await? {
            if !matches!(
                self.current_state(),
                LifecycleState::Connected | LifecycleState::Monitoring
            ) {
                debug!("lifecycle left sweepable state, aborting sweep");
                return Ok(());
            }
            self.enqueue(&self.realm_tx, object).await;
            count += 1;
        }
        debug!(count, "completed full discovery sweep");
        Ok(())
    }

    /// Monitoring: periodic sweeps until the state changes.
    async fn monitor(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick

        let mut state_rx = self.state.subscribe();
        while self.current_state() == LifecycleState::Monitoring {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.full_sweep().await {
                        warn!(%error, "periodic discovery sweep failed");
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Blocking enqueue; backpressure from a full queue is deliberate.
    async fn enqueue(&self, queue: &mpsc::Sender<Object>, object: Object) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = queue.send(object) => {
                if result.is_err() {
                    debug!("dispatch queue closed");
                }
            }
        }
    }

    async fn pause(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Take exclusive ownership of a device; false when a worker holds it.
    fn claim(&self, id: &Id) -> bool {
        self.working_on.lock().expect("lock poisoned").insert(id.clone())
    }

    fn release(&self, id: &Id) {
        self.working_on.lock().expect("lock poisoned").remove(id);
    }
}

/// Initialized: open the realm watch (and the neighbor watch when
/// configured), then enter Monitoring.
async fn begin_monitoring(inner: &Arc<ControllerInner>) {
    let Some(epoch) = inner.current_epoch().await else {
        inner.set_state_if(LifecycleState::Initialized, LifecycleState::Disconnected);
        return;
    };

    match epoch.catalog.watch(inner.config.realm.device_filters()) {
        Ok(stream) => {
            info!(realm = %inner.config.realm.value, "watching catalog");
            tokio::spawn(watch_pump(
                Arc::clone(inner),
                Arc::clone(&epoch),
                stream,
                inner.realm_tx.clone(),
            ));
            inner.set_state_if(LifecycleState::Initialized, LifecycleState::Monitoring);
        }
        Err(error) => {
            warn!(%error, "unable to watch catalog");
            inner.set_state_if(LifecycleState::Initialized, LifecycleState::Disconnected);
            return;
        }
    }

    if let Some(neighbor) = &inner.config.neighbor_realm {
        if inner.current_state() == LifecycleState::Monitoring {
            match epoch.catalog.watch(neighbor.device_filters()) {
                Ok(stream) => {
                    info!(realm = %neighbor.value, "watching neighbor realm");
                    tokio::spawn(watch_pump(
                        Arc::clone(inner),
                        Arc::clone(&epoch),
                        stream,
                        inner.neighbor_tx.clone(),
                    ));
                }
                Err(error) => {
                    warn!(%error, "unable to watch neighbor realm");
                    inner.set_state_if(LifecycleState::Monitoring, LifecycleState::Disconnected);
                }
            }
        }
    }
}

// ── Watch pump ──────────────────────────────────────────────────────

/// Forward non-REMOVED watch events to a dispatch queue. A broken stream
/// drops the controller back to Disconnected; shutdown of the connection
/// epoch just ends the pump.
async fn watch_pump(
    inner: Arc<ControllerInner>,
    epoch: Arc<Epoch>,
    mut stream: fabric_api::catalog::EventStream,
    queue: mpsc::Sender<Object>,
) {
    loop {
        let event = tokio::select! {
            _ = epoch.cancel.cancelled() => return,
            event = stream.recv() => event,
        };
        match event {
            Ok(Some(event)) => {
                if event.kind != EventKind::Removed {
                    inner.enqueue(&queue, event.object).await;
                }
            }
            Ok(None) => {
                warn!("catalog watch stream ended");
                inner.set_state_if(LifecycleState::Monitoring, LifecycleState::Disconnected);
                return;
            }
            Err(error) => {
                if !epoch.cancel.is_cancelled() {
                    warn!(%error, "catalog watch stream failed");
                    inner.set_state_if(LifecycleState::Monitoring, LifecycleState::Disconnected);
                }
                return;
            }
        }
    }
}

// ── Workers ─────────────────────────────────────────────────────────

/// Dequeue device objects and run the reconcilers for them. Ownership of a
/// device is exclusive: a duplicate enqueue is observed and dropped here,
/// and the periodic sweep re-covers anything skipped.
async fn worker(
    inner: Arc<ControllerInner>,
    queue: Arc<Mutex<mpsc::Receiver<Object>>>,
    role: WorkerRole,
    worker_id: usize,
) {
    loop {
        let object = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            object = async { queue.lock().await.recv().await } => object,
        };
        let Some(object) = object else { break };

        if !inner.claim(&object.id) {
            debug!(worker_id, device = %object.id, "device already being worked on, dropping");
            continue;
        }

        if let Some(epoch) = inner.current_epoch().await {
            match role {
                WorkerRole::Realm => {
                    debug!(worker_id, device = %object.id, "working on device");
                    if let Err(error) = epoch.ports.reconcile(&object).await {
                        warn!(device = %object.id, %error, "port reconciliation failed");
                    }
                    if let Err(error) = epoch.links.reconcile(&object).await {
                        warn!(device = %object.id, %error, "link reconciliation failed");
                    }
                    if let Err(error) = epoch.hosts.reconcile(&object).await {
                        warn!(device = %object.id, %error, "host reconciliation failed");
                    }
                    debug!(worker_id, device = %object.id, "finished work on device");
                }
                WorkerRole::Neighbor => {
                    debug!(worker_id, device = %object.id, "registering neighbor device");
                    if let Err(error) = epoch.links.register_agent(&object).await {
                        warn!(device = %object.id, %error, "neighbor registration failed");
                    }
                }
            }
        }

        inner.release(&object.id);
    }
}
