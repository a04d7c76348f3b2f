// ── Port reconciliation ──

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_api::{kind, CatalogClient, Filters, Id, Object, PortAttrs};

use crate::config::DiscoveryConfig;
use crate::error::CoreError;
use crate::reconcile::{absorb_existing, absorb_missing};
use crate::southbound::{PortScanner, PortStatusEvent};

const STATUS_EVENT_BUFFER: usize = 256;

/// Reconciles one device's ports: for every port the device reports there
/// is a port entity and a `has` relation from the device; catalog ports
/// the device no longer reports are deleted.
pub struct PortReconciler {
    catalog: CatalogClient,
    scanner: PortScanner,
}

impl PortReconciler {
    /// Build the reconciler and spawn its status-event pump. The pump and
    /// all subscription monitors stop when `cancel` fires.
    pub fn new(catalog: CatalogClient, config: &DiscoveryConfig, cancel: CancellationToken) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(STATUS_EVENT_BUFFER);
        let this = Arc::new(Self {
            catalog,
            scanner: PortScanner::new(
                events_tx,
                config.agent_tls.clone(),
                config.op_timeout,
                cancel.clone(),
            ),
        });
        tokio::spawn(status_pump(Arc::clone(&this), events_rx, cancel));
        this
    }

    /// One reconciliation pass for `device`.
    pub async fn reconcile(&self, device: &Object) -> Result<(), CoreError> {
        let device_ports = self.scanner.fetch_ports(device).await?;
        let catalog_ports = self.catalog_ports(&device.id).await?;

        let mut observed = HashSet::with_capacity(device_ports.len());
        for attrs in device_ports.values() {
            let port_id = Id::port(&device.id, attrs.number);
            match catalog_ports.get(&port_id) {
                None => self.create_port(device, &port_id, attrs).await?,
                Some(existing) => self.update_port_if_needed(existing, attrs).await?,
            }
            observed.insert(port_id);
        }

        for port_id in catalog_ports.keys() {
            if !observed.contains(port_id) {
                self.delete_port(port_id).await?;
            }
        }
        Ok(())
    }

    /// Existing port entities of the device, keyed by identifier.
    async fn catalog_ports(&self, device: &Id) -> Result<BTreeMap<Id, Object>, CoreError> {
        let filters = Filters::new()
            .with_relation(device.clone(), kind::HAS, kind::PORT)
            .with_aspects([fabric_api::aspect::PORT]);
        let mut stream = self.catalog.query(filters)?;
        let mut ports = BTreeMap::new();
        while let Some(object) = stream.recv().await? {
            ports.insert(object.id.clone(), object);
        }
        Ok(ports)
    }

    async fn create_port(&self, device: &Object, port_id: &Id, attrs: &PortAttrs) -> Result<(), CoreError> {
        // Derived entities inherit the device labels so realm-scoped
        // queries match them.
        let port = Object::entity(port_id.clone(), kind::PORT)
            .with_labels(device.labels.clone())
            .with_aspect(attrs)?;
        absorb_existing(self.catalog.create(port).await)?;

        let has = Object::relation(device.id.clone(), port_id.clone(), kind::HAS);
        absorb_existing(self.catalog.create(has).await)?;

        info!(port = %port_id, number = attrs.number, "created port");
        Ok(())
    }

    async fn update_port_if_needed(&self, existing: &Object, attrs: &PortAttrs) -> Result<(), CoreError> {
        let changed = match existing.aspect::<PortAttrs>() {
            Ok(stored) => port_state_changed(&stored, attrs),
            Err(error) => {
                warn!(port = %existing.id, %error, "stored port aspect unreadable, rewriting");
                true
            }
        };
        if !changed {
            return Ok(());
        }

        let mut updated = existing.clone();
        updated.set_aspect(attrs)?;
        absorb_missing(self.catalog.update(updated).await)?;
        info!(port = %existing.id, status = %attrs.status, "updated port");
        Ok(())
    }

    async fn delete_port(&self, port_id: &Id) -> Result<(), CoreError> {
        absorb_missing(self.catalog.delete(port_id).await)?;
        info!(port = %port_id, "deleted port");
        Ok(())
    }

    /// Rewrite the catalog port aspect after a streamed oper-status change.
    async fn apply_status(&self, event: &PortStatusEvent) -> Result<(), CoreError> {
        let port_id = Id::port(&event.device.id, event.attrs.number);
        let mut object = match self.catalog.get(&port_id).await {
            Ok(object) => object,
            // Deleted under us; the next sweep settles it.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let stored = object.aspect::<PortAttrs>()?;
        if stored.status == event.attrs.status {
            return Ok(());
        }
        object.set_aspect(&event.attrs)?;
        absorb_missing(self.catalog.update(object).await)?;
        info!(port = %port_id, status = %event.attrs.status, "applied port status update");
        Ok(())
    }
}

fn port_state_changed(a: &PortAttrs, b: &PortAttrs) -> bool {
    a.last_change != b.last_change || a.enabled != b.enabled || a.status != b.status
}

async fn status_pump(
    reconciler: Arc<PortReconciler>,
    mut events: mpsc::Receiver<PortStatusEvent>,
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
        debug!(device = %event.device.id, port = event.attrs.number, "processing port status event");
        if let Err(error) = reconciler.apply_status(&event).await {
            warn!(device = %event.device.id, %error, "unable to apply port status update");
        }
    }
}
