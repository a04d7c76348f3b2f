// ── Port discovery against the device's Stratum telemetry agent ──

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_api::{
    ClientTls, Id, Notification, Object, Path, PortAttrs, StratumAgents, TelemetrySession,
};

use crate::error::CoreError;

/// Interface subtrees fetched on every pass.
const INTERFACE_PATHS: [&str; 3] = [
    "interfaces/interface[name=...]/state",
    "interfaces/interface[name=...]/config",
    "interfaces/interface[name=...]/ethernet/config",
];

/// An oper-status transition streamed from a device.
#[derive(Debug, Clone)]
pub struct PortStatusEvent {
    pub device: Object,
    pub attrs: PortAttrs,
}

/// Cached telemetry sessions and port-status monitors, one per device.
pub struct PortScanner {
    contexts: Mutex<HashMap<Id, Arc<PortContext>>>,
    events: mpsc::Sender<PortStatusEvent>,
    tls: ClientTls,
    op_timeout: Duration,
    cancel: CancellationToken,
}

struct PortContext {
    device: Object,
    session: TelemetrySession,
    state: Mutex<PortContextState>,
}

#[derive(Default)]
struct PortContextState {
    ports: BTreeMap<String, PortAttrs>,
    monitor: Option<CancellationToken>,
}

impl PortScanner {
    pub fn new(
        events: mpsc::Sender<PortStatusEvent>,
        tls: ClientTls,
        op_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { contexts: Mutex::new(HashMap::new()), events, tls, op_timeout, cancel }
    }

    /// Fetch the device's ports, refresh the cached port map, and
    /// (re)start the oper-status monitor when the port set changed.
    pub async fn fetch_ports(&self, device: &Object) -> Result<BTreeMap<String, PortAttrs>, CoreError> {
        let ctx = self.context(device).await?;

        let mut paths = Vec::with_capacity(INTERFACE_PATHS.len());
        for path in INTERFACE_PATHS {
            paths.push(Path::parse(path)?);
        }
        let notifications = match ctx.session.get(paths).await {
            Ok(notifications) => notifications,
            Err(error) => {
                self.evict_if_dead(&device.id, &error).await;
                return Err(error.into());
            }
        };
        if notifications.is_empty() {
            return Err(CoreError::InvalidReport("no port data received".into()));
        }

        let ports = fold_interfaces(&notifications);

        let mut state = ctx.state.lock().await;
        let restart = !state.ports.keys().eq(ports.keys());
        state.ports = ports.clone();
        if state.monitor.is_none() || restart {
            if let Some(old) = state.monitor.take() {
                info!(device = %device.id, "restarting port status monitor");
                old.cancel();
            }
            let token = self.cancel.child_token();
            state.monitor = Some(token.clone());
            tokio::spawn(monitor_port_status(
                Arc::clone(&ctx),
                ports.keys().cloned().collect(),
                self.events.clone(),
                token,
            ));
        }
        drop(state);

        Ok(ports)
    }

    async fn context(&self, device: &Object) -> Result<Arc<PortContext>, CoreError> {
        let mut contexts = self.contexts.lock().await;
        if let Some(ctx) = contexts.get(&device.id) {
            return Ok(Arc::clone(ctx));
        }

        let agents = device.aspect::<StratumAgents>()?;
        let session = TelemetrySession::connect(
            device.id.clone(),
            &agents.telemetry_endpoint,
            &self.tls,
            self.op_timeout,
        )
        .await
        .map_err(|error| {
            warn!(device = %device.id, %error, "unable to connect to device telemetry agent");
            error
        })?;

        let ctx = Arc::new(PortContext {
            device: device.clone(),
            session,
            state: Mutex::new(PortContextState::default()),
        });
        contexts.insert(device.id.clone(), Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Drop a cached session whose transport broke, so the next sweep
    /// dials a fresh one.
    async fn evict_if_dead(&self, device: &Id, error: &fabric_api::Error) {
        if error.is_transient() {
            if let Some(ctx) = self.contexts.lock().await.remove(device) {
                let mut state = ctx.state.lock().await;
                if let Some(monitor) = state.monitor.take() {
                    monitor.cancel();
                }
            }
        }
    }
}

/// Fold interface notifications into per-port attributes, keyed by
/// interface name. Updates without a name key are skipped.
pub fn fold_interfaces(notifications: &[Notification]) -> BTreeMap<String, PortAttrs> {
    let mut ports: BTreeMap<String, PortAttrs> = BTreeMap::new();
    for notification in notifications {
        for update in &notification.updates {
            let Some(name) = update.path.key_at(1, "name") else {
                warn!(path = %update.path, "interface update without a name key, skipping");
                continue;
            };
            let attrs = ports
                .entry(name.to_owned())
                .or_insert_with(|| PortAttrs { display_name: name.to_owned(), ..Default::default() });
            match update.path.leaf() {
                Some("ifindex") => attrs.index = update.value.as_u64().unwrap_or_default(),
                Some("id") => attrs.number = update.value.as_u64().unwrap_or_default() as u32,
                Some("oper-status") => {
                    attrs.status = update.value.as_str().unwrap_or_default().to_owned()
                }
                Some("last-change") => attrs.last_change = update.value.as_u64().unwrap_or_default(),
                Some("port-speed") => {
                    attrs.speed = update.value.as_str().unwrap_or_default().to_owned()
                }
                Some("enabled") => attrs.enabled = update.value.as_bool().unwrap_or_default(),
                _ => {}
            }
        }
    }
    ports
}

/// Subscribe to oper-status for the given ports and stream transitions
/// into the reconciler's event channel until cancelled.
async fn monitor_port_status(
    ctx: Arc<PortContext>,
    port_names: Vec<String>,
    events: mpsc::Sender<PortStatusEvent>,
    cancel: CancellationToken,
) {
    let mut paths = Vec::with_capacity(port_names.len());
    for name in &port_names {
        match Path::parse(&format!("interfaces/interface[name={name}]/state/oper-status")) {
            Ok(path) => paths.push(path),
            Err(error) => warn!(%error, "skipping unsubscribable port name"),
        }
    }

    let mut stream = match ctx.session.subscribe(paths) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(device = %ctx.device.id, %error, "unable to subscribe for port status updates");
            return;
        }
    };
    info!(device = %ctx.device.id, ports = port_names.len(), "port status monitor started");

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            n = stream.recv() => match n {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(error) => {
                    warn!(device = %ctx.device.id, %error, "port status subscription failed");
                    break;
                }
            },
        };

        for update in &notification.updates {
            if update.path.leaf() != Some("oper-status") {
                continue;
            }
            let Some(name) = update.path.key_at(1, "name") else { continue };
            let Some(status) = update.value.as_str() else { continue };

            let mut state = ctx.state.lock().await;
            let Some(attrs) = state.ports.get_mut(name) else { continue };
            attrs.status = status.to_owned();
            let event = PortStatusEvent { device: ctx.device.clone(), attrs: attrs.clone() };
            drop(state);

            debug!(device = %ctx.device.id, port = name, status, "port status update");
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    info!(device = %ctx.device.id, "port status monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_api::{TypedValue, Update};

    fn update(path: &str, value: TypedValue) -> Update {
        Update { path: Path::parse(path).unwrap(), value }
    }

    #[test]
    fn folds_interface_subtrees_by_name() {
        let notifications = vec![Notification {
            timestamp: 1,
            updates: vec![
                update("interfaces/interface[name=1/0]/state/ifindex", TypedValue::Uint(1)),
                update("interfaces/interface[name=1/0]/state/id", TypedValue::Uint(201)),
                update("interfaces/interface[name=1/0]/state/oper-status", TypedValue::String("UP".into())),
                update("interfaces/interface[name=1/0]/state/last-change", TypedValue::Uint(42)),
                update("interfaces/interface[name=1/0]/ethernet/config/port-speed", TypedValue::String("100GB".into())),
                update("interfaces/interface[name=1/0]/config/enabled", TypedValue::Bool(true)),
                update("interfaces/interface[name=2/0]/state/id", TypedValue::Uint(202)),
            ],
            deletes: vec![],
        }];

        let ports = fold_interfaces(&notifications);
        assert_eq!(ports.len(), 2);

        let first = &ports["1/0"];
        assert_eq!(first.display_name, "1/0");
        assert_eq!(first.index, 1);
        assert_eq!(first.number, 201);
        assert_eq!(first.status, "UP");
        assert_eq!(first.last_change, 42);
        assert_eq!(first.speed, "100GB");
        assert!(first.enabled);

        assert_eq!(ports["2/0"].number, 202);
    }

    #[test]
    fn skips_updates_without_a_name_key() {
        let notifications = vec![Notification {
            timestamp: 1,
            updates: vec![update("interfaces/interface/state/id", TypedValue::Uint(7))],
            deletes: vec![],
        }];
        assert!(fold_interfaces(&notifications).is_empty());
    }
}
