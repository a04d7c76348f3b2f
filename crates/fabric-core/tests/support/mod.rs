// Test doubles for the discovery suite: an in-memory topology catalog and
// a scripted device agent, both served over the real wire transport on
// loopback TCP, plus polling helpers for convergence assertions.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use fabric_api::catalog::{CatalogRequest, CatalogResponse, Event, EventKind};
use fabric_api::telemetry::{TelemetryRequest, TelemetryResponse};
use fabric_api::transport::{serve, Handler, Reply};
use fabric_api::{
    Fault, Filters, Id, ManagementInfo, Notification, Object, ObjectBody, Path, TypedValue, Update,
};
use fabric_core::{Controller, DiscoveryConfig, LifecycleState, RealmSelector, SeedService};

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

// ── In-memory catalog ───────────────────────────────────────────────

pub struct CatalogState {
    objects: Mutex<BTreeMap<Id, Object>>,
    events: broadcast::Sender<Event>,
}

impl CatalogState {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self { objects: Mutex::new(BTreeMap::new()), events })
    }

    pub fn object(&self, id: &str) -> Option<Object> {
        self.objects.lock().unwrap().get(&Id::new(id)).cloned()
    }

    pub fn all(&self) -> BTreeMap<Id, Object> {
        self.objects.lock().unwrap().clone()
    }

    pub fn count_kinds(&self, kinds: &[&str]) -> usize {
        self.objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| kinds.contains(&o.kind()))
            .count()
    }

    pub fn aspect_status(&self, id: &str) -> Option<String> {
        let object = self.object(id)?;
        if object.kind() == fabric_api::kind::PORT {
            object.aspect::<fabric_api::PortAttrs>().ok().map(|a| a.status)
        } else {
            object.aspect::<fabric_api::LinkAttrs>().ok().map(|a| a.status)
        }
    }

    fn create(&self, object: Object) -> Result<(), Fault> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&object.id) {
            return Err(Fault::already_exists(format!("object {} already exists", object.id)));
        }
        if let ObjectBody::Relation { src, .. } = &object.body {
            let src = src.clone();
            if let Some(ObjectBody::Entity { src_relation_ids, .. }) =
                objects.get_mut(&src).map(|o| &mut o.body)
            {
                src_relation_ids.push(object.id.clone());
            }
        }
        objects.insert(object.id.clone(), object.clone());
        drop(objects);
        let _ = self.events.send(Event { kind: EventKind::Added, object });
        Ok(())
    }

    fn update(&self, mut object: Object) -> Result<(), Fault> {
        let mut objects = self.objects.lock().unwrap();
        let Some(existing) = objects.get(&object.id) else {
            return Err(Fault::not_found(format!("object {} not found", object.id)));
        };
        // The relation index is catalog-owned; ignore whatever the client
        // carried in its copy.
        if let (
            ObjectBody::Entity { src_relation_ids: stored, .. },
            ObjectBody::Entity { src_relation_ids, .. },
        ) = (&existing.body, &mut object.body)
        {
            *src_relation_ids = stored.clone();
        }
        objects.insert(object.id.clone(), object.clone());
        drop(objects);
        let _ = self.events.send(Event { kind: EventKind::Updated, object });
        Ok(())
    }

    fn delete(&self, id: &Id) -> Result<(), Fault> {
        let mut objects = self.objects.lock().unwrap();
        let Some(removed) = objects.remove(id) else {
            return Err(Fault::not_found(format!("object {id} not found")));
        };

        // Cascade: relations touching the deleted object go with it.
        let mut cascade: Vec<Id> = Vec::new();
        for (rel_id, object) in objects.iter() {
            if let ObjectBody::Relation { src, tgt, .. } = &object.body {
                if src == id || tgt == id {
                    cascade.push(rel_id.clone());
                }
            }
        }
        let mut removed_all = vec![removed];
        for rel_id in cascade {
            if let Some(rel) = objects.remove(&rel_id) {
                if let ObjectBody::Relation { src, .. } = &rel.body {
                    if let Some(ObjectBody::Entity { src_relation_ids, .. }) =
                        objects.get_mut(src).map(|o| &mut o.body)
                    {
                        src_relation_ids.retain(|r| r != &rel_id);
                    }
                }
                removed_all.push(rel);
            }
        }
        drop(objects);
        for object in removed_all {
            let _ = self.events.send(Event { kind: EventKind::Removed, object });
        }
        Ok(())
    }

    fn query(&self, filters: &Filters) -> Vec<Object> {
        let objects = self.objects.lock().unwrap();
        match &filters.relation {
            None => objects.values().filter(|o| filters.matches(o)).cloned().collect(),
            Some(rel) => {
                let mut out = Vec::new();
                for object in objects.values() {
                    let ObjectBody::Relation { kind, src, tgt } = &object.body else { continue };
                    if kind != &rel.kind || src != &rel.src {
                        continue;
                    }
                    let Some(target) = objects.get(tgt) else { continue };
                    if target.kind() == rel.target_kind && filters.matches(target) {
                        out.push(target.clone());
                    }
                }
                out
            }
        }
    }
}

struct CatalogHandler {
    state: Arc<CatalogState>,
}

#[async_trait]
impl Handler<CatalogRequest, CatalogResponse> for CatalogHandler {
    async fn handle(&self, request: CatalogRequest, reply: Reply<CatalogResponse>) -> Result<(), Fault> {
        match request {
            CatalogRequest::Get { id } => {
                let object = self
                    .state
                    .objects
                    .lock()
                    .unwrap()
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Fault::not_found(format!("object {id} not found")))?;
                let _ = reply.send(CatalogResponse::Object(object));
                Ok(())
            }
            CatalogRequest::Create { object } => {
                self.state.create(object)?;
                let _ = reply.send(CatalogResponse::Done);
                Ok(())
            }
            CatalogRequest::Update { object } => {
                self.state.update(object)?;
                let _ = reply.send(CatalogResponse::Done);
                Ok(())
            }
            CatalogRequest::Delete { id } => {
                self.state.delete(&id)?;
                let _ = reply.send(CatalogResponse::Done);
                Ok(())
            }
            CatalogRequest::Query { filters } => {
                for object in self.state.query(&filters) {
                    if reply.send(CatalogResponse::Object(object)).is_err() {
                        break;
                    }
                }
                Ok(())
            }
            CatalogRequest::Watch { filters } => {
                // Subscribe first so nothing between replay and live is lost.
                let mut events = self.state.events.subscribe();
                for object in self.state.query(&filters) {
                    let replay = Event { kind: EventKind::Added, object };
                    if reply.send(CatalogResponse::Event(replay)).is_err() {
                        return Ok(());
                    }
                }
                loop {
                    tokio::select! {
                        _ = reply.cancelled() => return Ok(()),
                        event = events.recv() => match event {
                            Ok(event) if filters.matches(&event.object) => {
                                if reply.send(CatalogResponse::Event(event)).is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        }
                    }
                }
            }
        }
    }
}

pub struct TestCatalog {
    state: Arc<CatalogState>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl TestCatalog {
    pub async fn start() -> Self {
        Self::start_on(CatalogState::new(), None).await
    }

    /// Start (or restart) a catalog server for the given state; `addr`
    /// pins the listen port, which a restart needs to come back on.
    pub async fn start_on(state: Arc<CatalogState>, addr: Option<SocketAddr>) -> Self {
        let bind = addr.map(|a| a.to_string()).unwrap_or_else(|| "127.0.0.1:0".to_owned());
        let listener = bind_with_retry(&bind).await;
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handler = Arc::new(CatalogHandler { state: Arc::clone(&state) });
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = serve(listener, None, handler, serve_cancel).await;
        });
        Self { state, addr, cancel }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> Arc<CatalogState> {
        Arc::clone(&self.state)
    }

    /// Kill the listener and every open connection; state survives.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn bind_with_retry(addr: &str) -> TcpListener {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return listener,
            Err(e) if tokio::time::Instant::now() < deadline => {
                let _ = e;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("unable to bind {addr}: {e}"),
        }
    }
}

// ── Scripted device agent ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimPort {
    pub name: String,
    pub number: u32,
    pub index: u64,
    pub speed: String,
    pub enabled: bool,
    pub status: String,
    pub last_change: u64,
}

#[derive(Debug, Clone)]
pub struct SimLink {
    pub egress_device: String,
    pub egress_port: u32,
    pub create_time: u64,
}

#[derive(Debug, Clone)]
pub struct SimHost {
    pub mac: String,
    pub ip: String,
    pub port: u32,
    pub create_time: u64,
}

pub struct AgentState {
    agent_id: String,
    ports: Mutex<BTreeMap<String, SimPort>>,
    links: Mutex<BTreeMap<u32, SimLink>>,
    hosts: Mutex<BTreeMap<String, SimHost>>,
    subs: broadcast::Sender<Notification>,
    gets_in_flight: AtomicUsize,
    max_concurrent_gets: AtomicUsize,
    interface_gets: AtomicUsize,
    get_delay: Mutex<Duration>,
}

/// One device agent serving the telemetry protocol for all three roles
/// (ports, links, hosts) from a single scripted model.
pub struct AgentSim {
    state: Arc<AgentState>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl AgentSim {
    pub async fn start(agent_id: &str) -> Self {
        let (subs, _) = broadcast::channel(256);
        let state = Arc::new(AgentState {
            agent_id: agent_id.to_owned(),
            ports: Mutex::new(BTreeMap::new()),
            links: Mutex::new(BTreeMap::new()),
            hosts: Mutex::new(BTreeMap::new()),
            subs,
            gets_in_flight: AtomicUsize::new(0),
            max_concurrent_gets: AtomicUsize::new(0),
            interface_gets: AtomicUsize::new(0),
            get_delay: Mutex::new(Duration::ZERO),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handler = Arc::new(AgentHandler { state: Arc::clone(&state) });
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = serve(listener, None, handler, serve_cancel).await;
        });

        Self { state, addr, cancel }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Management info pointing every agent role at this sim.
    pub fn management_info(&self) -> ManagementInfo {
        let endpoint = self.endpoint();
        ManagementInfo {
            p4rt_endpoint: endpoint.clone(),
            telemetry_endpoint: endpoint.clone(),
            link_agent_endpoint: endpoint.clone(),
            host_agent_endpoint: endpoint,
            chassis_config_id: "fabric-v1-chassis".to_owned(),
            pipeline_config_id: "fabric-v1-pipeline".to_owned(),
        }
    }

    pub fn add_port(&self, number: u32) {
        let name = format!("{number}/0");
        self.state.ports.lock().unwrap().insert(
            name.clone(),
            SimPort {
                name,
                number,
                index: number as u64,
                speed: "100GB".to_owned(),
                enabled: true,
                status: "UP".to_owned(),
                last_change: now_nanos(),
            },
        );
    }

    /// Flip a port's oper-status and notify subscribers.
    pub fn set_port_status(&self, number: u32, up: bool) {
        let name = format!("{number}/0");
        let status = if up { "UP" } else { "DOWN" };
        {
            let mut ports = self.state.ports.lock().unwrap();
            let Some(port) = ports.get_mut(&name) else { return };
            port.status = status.to_owned();
            port.enabled = up;
            port.last_change = now_nanos();
        }
        let update = Update {
            path: Path::parse(&format!("interfaces/interface[name={name}]/state/oper-status"))
                .unwrap(),
            value: TypedValue::String(status.to_owned()),
        };
        self.notify(Notification { timestamp: now_nanos(), updates: vec![update], deletes: vec![] });
    }

    pub fn add_link(&self, ingress_port: u32, egress_device: &str, egress_port: u32) {
        let link = SimLink {
            egress_device: egress_device.to_owned(),
            egress_port,
            create_time: now_nanos(),
        };
        self.state.links.lock().unwrap().insert(ingress_port, link.clone());
        let prefix = format!("state/link[port={ingress_port}]");
        let updates = vec![
            Update {
                path: Path::parse(&format!("{prefix}/egress-port")).unwrap(),
                value: TypedValue::Int(egress_port as i64),
            },
            Update {
                path: Path::parse(&format!("{prefix}/egress-device")).unwrap(),
                value: TypedValue::String(link.egress_device),
            },
            Update {
                path: Path::parse(&format!("{prefix}/create-time")).unwrap(),
                value: TypedValue::Uint(link.create_time),
            },
        ];
        self.notify(Notification { timestamp: now_nanos(), updates, deletes: vec![] });
    }

    /// Remove an ingress link and notify subscribers with a delete.
    pub fn remove_link(&self, ingress_port: u32) {
        self.state.links.lock().unwrap().remove(&ingress_port);
        let delete = Path::parse(&format!("state/link[port={ingress_port}]")).unwrap();
        self.notify(Notification { timestamp: now_nanos(), updates: vec![], deletes: vec![delete] });
    }

    pub fn add_host(&self, mac: &str, ip: &str, port: u32) {
        let host = SimHost {
            mac: mac.to_owned(),
            ip: ip.to_owned(),
            port,
            create_time: now_nanos(),
        };
        self.state.hosts.lock().unwrap().insert(mac.to_owned(), host.clone());
        let prefix = format!("state/host[mac={mac}]");
        let updates = vec![
            Update {
                path: Path::parse(&format!("{prefix}/port")).unwrap(),
                value: TypedValue::Int(port as i64),
            },
            Update {
                path: Path::parse(&format!("{prefix}/ip-address")).unwrap(),
                value: TypedValue::String(host.ip),
            },
            Update {
                path: Path::parse(&format!("{prefix}/create-time")).unwrap(),
                value: TypedValue::Uint(host.create_time),
            },
        ];
        self.notify(Notification { timestamp: now_nanos(), updates, deletes: vec![] });
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.state.get_delay.lock().unwrap() = delay;
    }

    pub fn max_concurrent_gets(&self) -> usize {
        self.state.max_concurrent_gets.load(Ordering::SeqCst)
    }

    pub fn interface_gets(&self) -> usize {
        self.state.interface_gets.load(Ordering::SeqCst)
    }

    fn notify(&self, notification: Notification) {
        let _ = self.state.subs.send(notification);
    }
}

impl Drop for AgentSim {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct AgentHandler {
    state: Arc<AgentState>,
}

#[async_trait]
impl Handler<TelemetryRequest, TelemetryResponse> for AgentHandler {
    async fn handle(&self, request: TelemetryRequest, reply: Reply<TelemetryResponse>) -> Result<(), Fault> {
        match request {
            TelemetryRequest::Get { paths } => {
                let in_flight = self.state.gets_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.state.max_concurrent_gets.fetch_max(in_flight, Ordering::SeqCst);
                if paths.iter().any(|p| p.elem_name(0) == Some("interfaces")) {
                    self.state.interface_gets.fetch_add(1, Ordering::SeqCst);
                }

                let delay = *self.state.get_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                for path in &paths {
                    let _ = reply.send(TelemetryResponse::Notification(self.state.render(path)));
                }
                self.state.gets_in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            TelemetryRequest::Subscribe { paths } => {
                let mut subs = self.state.subs.subscribe();
                loop {
                    tokio::select! {
                        _ = reply.cancelled() => return Ok(()),
                        notification = subs.recv() => match notification {
                            Ok(n) if relevant(&paths, &n) => {
                                if reply.send(TelemetryResponse::Notification(n)).is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        }
                    }
                }
            }
        }
    }
}

/// A notification is relevant to a subscription when any of its paths
/// shares the subscription's subtree (first two element names).
fn relevant(subscribed: &[Path], notification: &Notification) -> bool {
    let category = |path: &Path| {
        (
            path.elem_name(0).unwrap_or_default().to_owned(),
            path.elem_name(1).unwrap_or_default().to_owned(),
        )
    };
    let wanted: Vec<_> = subscribed.iter().map(&category).collect();
    notification
        .updates
        .iter()
        .map(|u| category(&u.path))
        .chain(notification.deletes.iter().map(&category))
        .any(|c| wanted.contains(&c))
}

impl AgentState {
    /// Render the requested subtree as one notification.
    fn render(&self, path: &Path) -> Notification {
        let mut updates = Vec::new();
        match path.elem_name(0) {
            Some("interfaces") => {
                let ports = self.ports.lock().unwrap();
                for port in ports.values() {
                    let base = format!("interfaces/interface[name={}]", port.name);
                    match (path.elem_name(2), path.elem_name(3)) {
                        (Some("state"), _) => {
                            updates.extend([
                                uint_update(&format!("{base}/state/ifindex"), port.index),
                                uint_update(&format!("{base}/state/id"), port.number as u64),
                                string_update(&format!("{base}/state/oper-status"), &port.status),
                                uint_update(&format!("{base}/state/last-change"), port.last_change),
                            ]);
                        }
                        (Some("config"), _) => {
                            updates.push(Update {
                                path: Path::parse(&format!("{base}/config/enabled")).unwrap(),
                                value: TypedValue::Bool(port.enabled),
                            });
                        }
                        (Some("ethernet"), Some("config")) => {
                            updates.push(string_update(
                                &format!("{base}/ethernet/config/port-speed"),
                                &port.speed,
                            ));
                        }
                        _ => {}
                    }
                }
            }
            Some("state") => match path.elem_name(1) {
                Some("agent-id") => {
                    updates.push(string_update("state/agent-id", &self.agent_id));
                }
                Some("link") => {
                    let links = self.links.lock().unwrap();
                    for (port, link) in links.iter() {
                        let base = format!("state/link[port={port}]");
                        updates.extend([
                            Update {
                                path: Path::parse(&format!("{base}/egress-port")).unwrap(),
                                value: TypedValue::Int(link.egress_port as i64),
                            },
                            string_update(&format!("{base}/egress-device"), &link.egress_device),
                            uint_update(&format!("{base}/create-time"), link.create_time),
                        ]);
                    }
                }
                Some("host") => {
                    let hosts = self.hosts.lock().unwrap();
                    for (mac, host) in hosts.iter() {
                        let base = format!("state/host[mac={mac}]");
                        updates.extend([
                            Update {
                                path: Path::parse(&format!("{base}/port")).unwrap(),
                                value: TypedValue::Int(host.port as i64),
                            },
                            string_update(&format!("{base}/ip-address"), &host.ip),
                            uint_update(&format!("{base}/create-time"), host.create_time),
                        ]);
                    }
                }
                _ => {}
            },
            _ => {}
        }
        Notification { timestamp: now_nanos(), updates, deletes: Vec::new() }
    }
}

fn string_update(path: &str, value: &str) -> Update {
    Update { path: Path::parse(path).unwrap(), value: TypedValue::String(value.to_owned()) }
}

fn uint_update(path: &str, value: u64) -> Update {
    Update { path: Path::parse(path).unwrap(), value: TypedValue::Uint(value) }
}

// ── Harness helpers ─────────────────────────────────────────────────

/// Discovery configuration with test-friendly timings.
pub fn test_config(catalog_address: String) -> DiscoveryConfig {
    DiscoveryConfig {
        catalog_address,
        realm: RealmSelector::new("pod", "all"),
        sweep_interval: Duration::from_millis(300),
        retry_pause: Duration::from_millis(100),
        op_timeout: Duration::from_secs(5),
        ..DiscoveryConfig::default()
    }
}

/// Serve the seeding API for a controller on an ephemeral port.
pub async fn start_seed_api(controller: Controller) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    let service = SeedService::new(controller);
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = service.serve(listener, None, serve_cancel).await;
    });
    (address, cancel)
}

/// Poll until `cond` holds, panicking with `what` on timeout.
pub async fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for the controller to reach a lifecycle state.
pub async fn wait_state(controller: &Controller, target: LifecycleState, timeout: Duration) {
    let mut state = controller.state();
    let result = tokio::time::timeout(timeout, async {
        loop {
            if *state.borrow_and_update() == target {
                return;
            }
            if state.changed().await.is_err() {
                panic!("controller state channel closed before reaching {target:?}");
            }
        }
    })
    .await;
    if result.is_err() {
        panic!(
            "timed out waiting for state {target:?}, still {:?}",
            controller.current_state()
        );
    }
}
