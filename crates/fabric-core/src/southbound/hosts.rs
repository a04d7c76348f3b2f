// ── Host discovery against the device's host agent ──

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_api::{ClientTls, Id, LocalAgents, Notification, Object, Path, TelemetrySession};

use crate::error::CoreError;

const HOST_PATH: &str = "state/host[mac=...]";

/// One attached host interface, keyed fabric-wide by its MAC address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEntry {
    pub mac: String,
    pub ip: String,
    pub port: u32,
    pub create_time: u64,
}

/// Result of one host query.
#[derive(Debug, Clone, Default)]
pub struct HostReport {
    pub agent_id: String,
    pub hosts: BTreeMap<String, HostEntry>,
}

/// Streamed host change, carrying the device whose agent reported it.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Added { device: Object, agent_id: String, host: HostEntry },
    Deleted { device: Object, agent_id: String, host: HostEntry },
}

/// Cached host-agent sessions and change monitors, one per device.
pub struct HostScanner {
    contexts: Mutex<HashMap<Id, Arc<HostAgentContext>>>,
    events: mpsc::Sender<HostEvent>,
    tls: ClientTls,
    op_timeout: Duration,
    cancel: CancellationToken,
}

struct HostAgentContext {
    device: Object,
    session: TelemetrySession,
    agent_id: String,
    state: Mutex<HostAgentState>,
}

#[derive(Default)]
struct HostAgentState {
    hosts: BTreeMap<String, HostEntry>,
    monitor_started: bool,
}

impl HostScanner {
    pub fn new(
        events: mpsc::Sender<HostEvent>,
        tls: ClientTls,
        op_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { contexts: Mutex::new(HashMap::new()), events, tls, op_timeout, cancel }
    }

    pub async fn fetch_hosts(&self, device: &Object) -> Result<HostReport, CoreError> {
        let ctx = self.context(device).await?;

        let notifications = match ctx.session.get(vec![Path::parse(HOST_PATH)?]).await {
            Ok(notifications) => notifications,
            Err(error) => {
                self.evict_if_dead(&device.id, &error).await;
                return Err(error.into());
            }
        };
        if notifications.is_empty() {
            return Err(CoreError::InvalidReport("no host data received".into()));
        }

        let report = HostReport {
            agent_id: ctx.agent_id.clone(),
            hosts: fold_hosts(&notifications),
        };

        let mut state = ctx.state.lock().await;
        state.hosts = report.hosts.clone();
        if !state.monitor_started {
            state.monitor_started = true;
            tokio::spawn(monitor_host_changes(
                Arc::clone(&ctx),
                self.events.clone(),
                self.cancel.child_token(),
            ));
        }
        drop(state);

        Ok(report)
    }

    async fn context(&self, device: &Object) -> Result<Arc<HostAgentContext>, CoreError> {
        let mut contexts = self.contexts.lock().await;
        if let Some(ctx) = contexts.get(&device.id) {
            return Ok(Arc::clone(ctx));
        }

        let agents = device.aspect::<LocalAgents>()?;
        let session = TelemetrySession::connect(
            device.id.clone(),
            &agents.host_agent_endpoint,
            &self.tls,
            self.op_timeout,
        )
        .await
        .map_err(|error| {
            warn!(device = %device.id, %error, "unable to connect to device host agent");
            error
        })?;
        let agent_id = session.agent_id().await?;

        let ctx = Arc::new(HostAgentContext {
            device: device.clone(),
            session,
            agent_id,
            state: Mutex::new(HostAgentState::default()),
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

/// Fold host notifications keyed by MAC address. Updates without a mac
/// key are skipped.
pub fn fold_hosts(notifications: &[Notification]) -> BTreeMap<String, HostEntry> {
    let mut hosts: BTreeMap<String, HostEntry> = BTreeMap::new();
    for notification in notifications {
        for update in &notification.updates {
            if update.path.elem_name(1) != Some("host") {
                continue;
            }
            let Some(mac) = update.path.key_at(1, "mac") else {
                warn!(path = %update.path, "host update without a mac key, skipping");
                continue;
            };
            let host = hosts
                .entry(mac.to_owned())
                .or_insert_with(|| HostEntry { mac: mac.to_owned(), ..Default::default() });
            match update.path.leaf() {
                Some("port") => host.port = update.value.as_u64().unwrap_or_default() as u32,
                Some("ip-address") => {
                    host.ip = update.value.as_str().unwrap_or_default().to_owned()
                }
                Some("create-time") => host.create_time = update.value.as_u64().unwrap_or_default(),
                _ => {}
            }
        }
    }
    hosts
}

async fn monitor_host_changes(
    ctx: Arc<HostAgentContext>,
    events: mpsc::Sender<HostEvent>,
    cancel: CancellationToken,
) {
    let path = match Path::parse(HOST_PATH) {
        Ok(path) => path,
        Err(error) => {
            warn!(%error, "invalid host subscription path");
            return;
        }
    };
    let mut stream = match ctx.session.subscribe(vec![path]) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(device = %ctx.device.id, %error, "unable to subscribe for host changes");
            return;
        }
    };
    info!(device = %ctx.device.id, "host monitor started");

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            n = stream.recv() => match n {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(error) => {
                    warn!(device = %ctx.device.id, %error, "host subscription failed");
                    break;
                }
            },
        };

        let mut state = ctx.state.lock().await;

        let mut out = Vec::new();
        for path in &notification.deletes {
            let Some(mac) = path.key_at(1, "mac") else { continue };
            let host = state.hosts.remove(mac).unwrap_or_else(|| HostEntry {
                mac: mac.to_owned(),
                ..Default::default()
            });
            debug!(device = %ctx.device.id, mac, "host deleted");
            out.push(HostEvent::Deleted {
                device: ctx.device.clone(),
                agent_id: ctx.agent_id.clone(),
                host,
            });
        }

        for host in fold_hosts(std::slice::from_ref(&notification)).into_values() {
            state.hosts.insert(host.mac.clone(), host.clone());
            debug!(device = %ctx.device.id, mac = %host.mac, "host added");
            out.push(HostEvent::Added {
                device: ctx.device.clone(),
                agent_id: ctx.agent_id.clone(),
                host,
            });
        }
        drop(state);

        for event in out {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    info!(device = %ctx.device.id, "host monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_api::{TypedValue, Update};

    fn update(path: &str, value: TypedValue) -> Update {
        Update { path: Path::parse(path).unwrap(), value }
    }

    #[test]
    fn folds_hosts_by_mac() {
        let notifications = vec![Notification {
            timestamp: 3,
            updates: vec![
                update("state/host[mac=00:aa:00:00:00:01]/port", TypedValue::Int(4)),
                update(
                    "state/host[mac=00:aa:00:00:00:01]/ip-address",
                    TypedValue::String("10.0.0.1".into()),
                ),
                update("state/host[mac=00:aa:00:00:00:01]/create-time", TypedValue::Uint(5)),
                update("state/host[mac=00:aa:00:00:00:02]/port", TypedValue::Int(9)),
            ],
            deletes: vec![],
        }];

        let hosts = fold_hosts(&notifications);
        assert_eq!(hosts.len(), 2);

        let host = &hosts["00:aa:00:00:00:01"];
        assert_eq!(host.port, 4);
        assert_eq!(host.ip, "10.0.0.1");
        assert_eq!(host.create_time, 5);
        assert_eq!(hosts["00:aa:00:00:00:02"].port, 9);
    }
}
