// ── Host reconciliation ──
//
// Hosts are add/update only: stale hosts are not yet pruned from the
// catalog, so delete events simply re-reconcile with a fresh timestamp.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fabric_api::{kind, CatalogClient, HostNic, Id, Object};

use crate::config::DiscoveryConfig;
use crate::error::CoreError;
use crate::reconcile::{absorb_existing, absorb_missing};
use crate::southbound::{now_nanos, HostEntry, HostEvent, HostScanner};

const HOST_EVENT_BUFFER: usize = 256;

/// Reconciles attached hosts into host entities with an `originates`
/// relation from the port that sees them.
pub struct HostReconciler {
    catalog: CatalogClient,
    scanner: HostScanner,
}

impl HostReconciler {
    pub fn new(catalog: CatalogClient, config: &DiscoveryConfig, cancel: CancellationToken) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(HOST_EVENT_BUFFER);
        let this = Arc::new(Self {
            catalog,
            scanner: HostScanner::new(
                events_tx,
                config.agent_tls.clone(),
                config.op_timeout,
                cancel.clone(),
            ),
        });
        tokio::spawn(event_pump(Arc::clone(&this), events_rx, cancel));
        this
    }

    /// One reconciliation pass for `device`.
    pub async fn reconcile(&self, device: &Object) -> Result<(), CoreError> {
        let report = self.scanner.fetch_hosts(device).await?;
        for host in report.hosts.values() {
            if let Err(error) = self.reconcile_host(device, &report.agent_id, host).await {
                warn!(mac = %host.mac, %error, "unable to reconcile host");
            }
        }
        Ok(())
    }

    async fn reconcile_host(&self, device: &Object, agent_id: &str, host: &HostEntry) -> Result<(), CoreError> {
        let host_id = Id::host(agent_id, host.port, &host.mac);
        match self.catalog.get(&host_id).await {
            // Present: pruning and refresh are deliberately not done yet.
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => self.create_host(device, &host_id, host).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_host(&self, device: &Object, host_id: &Id, host: &HostEntry) -> Result<(), CoreError> {
        let nic = HostNic { mac: host.mac.clone(), ip: host.ip.clone() };
        let object = Object::entity(host_id.clone(), kind::HOST).with_aspect(&nic)?;
        absorb_existing(self.catalog.create(object).await)?;

        // Attach from the full port identifier of the reporting device.
        let port_id = Id::port(&device.id, host.port);
        let originates = Object::relation(port_id, host_id.clone(), kind::ORIGINATES);
        absorb_existing(self.catalog.create(originates).await)?;

        info!(host = %host_id, "created host");
        Ok(())
    }
}

async fn event_pump(
    reconciler: Arc<HostReconciler>,
    mut events: mpsc::Receiver<HostEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let result = match event {
            HostEvent::Added { device, agent_id, host } => {
                reconciler.reconcile_host(&device, &agent_id, &host).await
            }
            HostEvent::Deleted { device, agent_id, mut host } => {
                host.create_time = now_nanos();
                reconciler.reconcile_host(&device, &agent_id, &host).await
            }
        };
        if let Err(error) = result {
            warn!(%error, "unable to apply streamed host change");
        }
    }
}
