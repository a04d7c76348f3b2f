// ── Ingress link discovery against the device's link agent ──
//
// Each device-local link agent reports the links that *terminate* on the
// device, identifying both ends by opaque agent identifiers. Resolution of
// those identifiers into catalog devices happens in the link reconciler;
// this module only folds reports and streams add/delete events.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_api::{ClientTls, Id, LocalAgents, Notification, Object, Path, TelemetrySession};

use crate::error::CoreError;

const LINK_PATH: &str = "state/link[port=...]";

/// One observed ingress link, both endpoints named by agent identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressLink {
    pub ingress_device: String,
    pub ingress_port: u32,
    pub egress_device: String,
    pub egress_port: u32,
    pub create_time: u64,
}

/// Result of one link query, keyed by ingress port number.
#[derive(Debug, Clone, Default)]
pub struct LinkReport {
    pub agent_id: String,
    pub links: BTreeMap<u32, IngressLink>,
}

/// Streamed link change.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Added(IngressLink),
    Deleted(IngressLink),
}

/// Cached link-agent sessions and change monitors, one per device.
pub struct LinkScanner {
    contexts: Mutex<HashMap<Id, Arc<LinkAgentContext>>>,
    events: mpsc::Sender<LinkEvent>,
    tls: ClientTls,
    op_timeout: Duration,
    cancel: CancellationToken,
}

struct LinkAgentContext {
    device: Object,
    session: TelemetrySession,
    agent_id: String,
    state: Mutex<LinkAgentState>,
}

#[derive(Default)]
struct LinkAgentState {
    /// Most recent report contents; the monitor keeps this current so a
    /// later prune pass sees streamed changes too.
    links: BTreeMap<u32, IngressLink>,
    monitor_started: bool,
}

impl LinkScanner {
    pub fn new(
        events: mpsc::Sender<LinkEvent>,
        tls: ClientTls,
        op_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { contexts: Mutex::new(HashMap::new()), events, tls, op_timeout, cancel }
    }

    /// Query the device's link agent.
    ///
    /// With `discover` false this only resolves the agent identifier (the
    /// registration-only path for neighbor devices); the returned report
    /// carries no links and no monitor is started.
    pub async fn fetch_links(&self, device: &Object, discover: bool) -> Result<LinkReport, CoreError> {
        let ctx = self.context(device).await?;
        let mut report = LinkReport { agent_id: ctx.agent_id.clone(), links: BTreeMap::new() };
        if !discover {
            return Ok(report);
        }

        let notifications = match ctx.session.get(vec![Path::parse(LINK_PATH)?]).await {
            Ok(notifications) => notifications,
            Err(error) => {
                self.evict_if_dead(&device.id, &error).await;
                return Err(error.into());
            }
        };
        if notifications.is_empty() {
            return Err(CoreError::InvalidReport("no link data received".into()));
        }
        report.links = fold_links(&ctx.agent_id, &notifications);

        let mut state = ctx.state.lock().await;
        state.links = report.links.clone();
        if !state.monitor_started {
            state.monitor_started = true;
            tokio::spawn(monitor_link_changes(
                Arc::clone(&ctx),
                self.events.clone(),
                self.cancel.child_token(),
            ));
        }
        drop(state);

        Ok(report)
    }

    async fn context(&self, device: &Object) -> Result<Arc<LinkAgentContext>, CoreError> {
        let mut contexts = self.contexts.lock().await;
        if let Some(ctx) = contexts.get(&device.id) {
            return Ok(Arc::clone(ctx));
        }

        let agents = device.aspect::<LocalAgents>()?;
        let session = TelemetrySession::connect(
            device.id.clone(),
            &agents.link_agent_endpoint,
            &self.tls,
            self.op_timeout,
        )
        .await
        .map_err(|error| {
            warn!(device = %device.id, %error, "unable to connect to device link agent");
            error
        })?;
        let agent_id = session.agent_id().await?;

        let ctx = Arc::new(LinkAgentContext {
            device: device.clone(),
            session,
            agent_id,
            state: Mutex::new(LinkAgentState::default()),
        });
        contexts.insert(device.id.clone(), Arc::clone(&ctx));
        Ok(ctx)
    }

    async fn evict_if_dead(&self, device: &Id, error: &fabric_api::Error) {
        if error.is_transient() {
            self.contexts.lock().await.remove(device);
        }
    }
}

/// Fold link notifications into ingress links keyed by ingress port.
/// Updates whose port key does not parse are skipped.
pub fn fold_links(agent_id: &str, notifications: &[Notification]) -> BTreeMap<u32, IngressLink> {
    let mut links: BTreeMap<u32, IngressLink> = BTreeMap::new();
    for notification in notifications {
        for update in &notification.updates {
            if update.path.elem_name(1) != Some("link") {
                continue;
            }
            let Some(port) = parse_port_key(&update.path) else { continue };
            let link = links.entry(port).or_insert_with(|| IngressLink {
                ingress_device: agent_id.to_owned(),
                ingress_port: port,
                ..Default::default()
            });
            match update.path.leaf() {
                Some("egress-port") => {
                    link.egress_port = update.value.as_u64().unwrap_or_default() as u32
                }
                Some("egress-device") => {
                    link.egress_device = update.value.as_str().unwrap_or_default().to_owned()
                }
                Some("create-time") => link.create_time = update.value.as_u64().unwrap_or_default(),
                _ => {}
            }
        }
    }
    links
}

fn parse_port_key(path: &Path) -> Option<u32> {
    let key = path.key_at(1, "port")?;
    match key.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!(path = %path, "key 'port' is not a number, skipping");
            None
        }
    }
}

/// Subscribe for link changes and stream them into the reconciler's event
/// channel, keeping the cached report current along the way.
async fn monitor_link_changes(
    ctx: Arc<LinkAgentContext>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    let path = match Path::parse(LINK_PATH) {
        Ok(path) => path,
        Err(error) => {
            warn!(%error, "invalid link subscription path");
            return;
        }
    };
    let mut stream = match ctx.session.subscribe(vec![path]) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(device = %ctx.device.id, %error, "unable to subscribe for link changes");
            return;
        }
    };
    info!(device = %ctx.device.id, "link monitor started");

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            n = stream.recv() => match n {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(error) => {
                    warn!(device = %ctx.device.id, %error, "link subscription failed");
                    break;
                }
            },
        };

        let mut state = ctx.state.lock().await;

        // Deletions first: drop the link from the cached report and tell
        // the reconciler which link disappeared.
        let mut out = Vec::new();
        for path in &notification.deletes {
            let Some(port) = parse_port_key(path) else { continue };
            let link = state.links.remove(&port).unwrap_or_else(|| IngressLink {
                ingress_device: ctx.agent_id.clone(),
                ingress_port: port,
                ..Default::default()
            });
            debug!(device = %ctx.device.id, port, "link deleted");
            out.push(LinkEvent::Deleted(link));
        }

        // Additions fold exactly like a full report.
        for link in fold_links(&ctx.agent_id, std::slice::from_ref(&notification)).into_values() {
            state.links.insert(link.ingress_port, link.clone());
            debug!(device = %ctx.device.id, port = link.ingress_port, "link added");
            out.push(LinkEvent::Added(link));
        }
        drop(state);

        for event in out {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    info!(device = %ctx.device.id, "link monitor stopped");
}
