// ── Link reconciliation ──
//
// Links are the one place where observations from two independently
// reconciled devices must meet: the identifier of a link entity is derived
// from *both* endpoint devices. The reconciler keeps a fabric-wide map of
// agent identifiers to catalog devices, and parks links whose egress agent
// has not been registered yet until that agent's own report arrives.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_api::{kind, CatalogClient, Filters, Id, LinkAttrs, Object, PortAttrs, STATUS_DOWN, STATUS_UP};

use crate::config::DiscoveryConfig;
use crate::error::CoreError;
use crate::reconcile::{absorb_existing, absorb_missing};
use crate::southbound::{now_nanos, IngressLink, LinkEvent, LinkReport, LinkScanner};

const LINK_EVENT_BUFFER: usize = 256;

/// Reconciles ingress link reports into fabric-wide link entities with
/// `originates`/`terminates` relations, marking vanished links DOWN.
pub struct LinkReconciler {
    catalog: CatalogClient,
    scanner: LinkScanner,
    state: RwLock<LinkState>,
}

#[derive(Default)]
struct LinkState {
    /// Agent identifier → catalog device that owns the agent.
    agent_devices: HashMap<String, Object>,
    /// Links waiting for their egress agent to be registered, keyed by
    /// that unresolved agent identifier.
    pending_links: HashMap<String, Vec<IngressLink>>,
}

impl LinkState {
    fn add_pending(&mut self, link: IngressLink) {
        self.pending_links.entry(link.egress_device.clone()).or_default().push(link);
    }
}

impl LinkReconciler {
    pub fn new(catalog: CatalogClient, config: &DiscoveryConfig, cancel: CancellationToken) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        let this = Arc::new(Self {
            catalog,
            scanner: LinkScanner::new(
                events_tx,
                config.agent_tls.clone(),
                config.op_timeout,
                cancel.clone(),
            ),
            state: RwLock::new(LinkState::default()),
        });
        tokio::spawn(event_pump(Arc::clone(&this), events_rx, cancel));
        this
    }

    /// One reconciliation pass for `device`.
    pub async fn reconcile(&self, device: &Object) -> Result<(), CoreError> {
        let report = self.scanner.fetch_links(device, true).await?;

        let ready = self.register_report(device, &report).await;
        for link in &ready {
            if let Err(error) = self.reconcile_link(link, STATUS_UP).await {
                warn!(ingress = %link.ingress_device, port = link.ingress_port, %error,
                    "unable to reconcile link");
            }
        }

        self.mark_missing_links_down(device, &report).await
    }

    /// Registration-only path for neighbor devices: resolve and record the
    /// agent identifier without materializing any links.
    pub async fn register_agent(&self, device: &Object) -> Result<(), CoreError> {
        let report = self.scanner.fetch_links(device, false).await?;
        let mut state = self.state.write().await;
        debug!(device = %device.id, agent = %report.agent_id, "registered neighbor agent");
        state.agent_devices.insert(report.agent_id, device.clone());
        Ok(())
    }

    /// Record the reporting agent, then split its report into links whose
    /// egress agent is already known (process now) and links that must wait.
    /// Links from other devices that were waiting for *this* agent drain
    /// into the ready list.
    async fn register_report(&self, device: &Object, report: &LinkReport) -> Vec<IngressLink> {
        let mut state = self.state.write().await;
        state.agent_devices.insert(report.agent_id.clone(), device.clone());

        let mut ready = Vec::with_capacity(report.links.len());
        for link in report.links.values() {
            if state.agent_devices.contains_key(&link.egress_device) {
                ready.push(link.clone());
            } else {
                debug!(egress = %link.egress_device, port = link.ingress_port,
                    "egress agent not yet registered, deferring link");
                state.add_pending(link.clone());
            }
        }

        if let Some(pending) = state.pending_links.remove(&report.agent_id) {
            debug!(agent = %report.agent_id, drained = pending.len(), "draining deferred links");
            ready.extend(pending);
        }
        ready
    }

    /// Reconcile one observed link with the given status.
    ///
    /// Unresolvable ingress drops the link (the ingress device's own report
    /// will re-emit it); unresolvable egress parks it.
    async fn reconcile_link(&self, link: &IngressLink, status: &str) -> Result<(), CoreError> {
        let (ingress, egress) = {
            let state = self.state.read().await;
            (
                state.agent_devices.get(&link.ingress_device).cloned(),
                state.agent_devices.get(&link.egress_device).cloned(),
            )
        };
        let Some(ingress) = ingress else { return Ok(()) };
        let Some(egress) = egress else {
            self.state.write().await.add_pending(link.clone());
            return Ok(());
        };

        let egress_port = Id::port(&egress.id, link.egress_port);
        let ingress_port = Id::port(&ingress.id, link.ingress_port);
        let link_id = Id::link(&egress_port, &ingress_port);
        debug!(link = %link_id, status, "reconciling link");

        match self.catalog.get(&link_id).await {
            Err(e) if e.is_not_found() => {
                self.create_link(&link_id, &egress_port, &ingress_port, link, &egress).await
            }
            Err(e) => Err(e.into()),
            Ok(object) => self.update_link_if_newer(object, link, status).await,
        }
    }

    async fn create_link(
        &self,
        link_id: &Id,
        egress_port: &Id,
        ingress_port: &Id,
        link: &IngressLink,
        egress_device: &Object,
    ) -> Result<(), CoreError> {
        let attrs = LinkAttrs { status: STATUS_UP.to_owned(), last_change: link.create_time };
        let object = Object::entity(link_id.clone(), kind::LINK)
            .with_labels(egress_device.labels.clone())
            .with_aspect(&attrs)?;
        absorb_existing(self.catalog.create(object).await)?;

        let originates = Object::relation(egress_port.clone(), link_id.clone(), kind::ORIGINATES);
        absorb_existing(self.catalog.create(originates).await)?;

        let terminates = Object::relation(ingress_port.clone(), link_id.clone(), kind::TERMINATES);
        absorb_existing(self.catalog.create(terminates).await)?;

        info!(link = %link_id, "created link");
        Ok(())
    }

    /// Update gated on "observed create-time strictly newer than stored
    /// last-change"; an unreadable stored aspect is rewritten outright.
    async fn update_link_if_newer(
        &self,
        mut object: Object,
        link: &IngressLink,
        status: &str,
    ) -> Result<(), CoreError> {
        let stale = match object.aspect::<LinkAttrs>() {
            Ok(stored) => stored.last_change < link.create_time,
            Err(error) => {
                warn!(link = %object.id, %error, "stored link aspect unreadable, rewriting");
                true
            }
        };
        if !stale {
            return Ok(());
        }

        let attrs = LinkAttrs { status: status.to_owned(), last_change: link.create_time };
        object.set_aspect(&attrs)?;
        absorb_missing(self.catalog.update(object.clone()).await)?;
        info!(link = %object.id, status, "updated link status");
        Ok(())
    }

    /// Mark DOWN every catalog link terminating at a port of `device` that
    /// has no counterpart in the just-received report.
    async fn mark_missing_links_down(&self, device: &Object, report: &LinkReport) -> Result<(), CoreError> {
        let filters = Filters::new().with_relation(device.id.clone(), kind::HAS, kind::PORT);
        let ports = self.catalog.query(filters)?.collect().await?;

        for port in ports {
            // Ports that source no relations terminate no links.
            if port.src_relation_ids().is_empty() {
                continue;
            }
            let attrs = match port.aspect::<PortAttrs>() {
                Ok(attrs) => attrs,
                Err(error) => {
                    warn!(port = %port.id, %error, "port entity without readable aspect, skipping");
                    continue;
                }
            };
            if report.links.contains_key(&attrs.number) {
                continue;
            }
            if let Err(error) = self.mark_ingress_link_down(&port.id).await {
                warn!(port = %port.id, %error, "unable to mark ingress link down");
            }
        }
        Ok(())
    }

    async fn mark_ingress_link_down(&self, port_id: &Id) -> Result<(), CoreError> {
        let filters = Filters::new().with_relation(port_id.clone(), kind::TERMINATES, kind::LINK);
        let mut stream = self.catalog.query(filters)?;
        // At most one link terminates at a port.
        let Some(mut object) = stream.recv().await? else { return Ok(()) };

        let stored = match object.aspect::<LinkAttrs>() {
            Ok(stored) => stored,
            Err(error) => {
                warn!(link = %object.id, %error, "ingress link aspect unreadable, skipping");
                return Ok(());
            }
        };
        if stored.status == STATUS_DOWN {
            return Ok(());
        }

        let attrs = LinkAttrs { status: STATUS_DOWN.to_owned(), last_change: now_nanos() };
        object.set_aspect(&attrs)?;
        absorb_missing(self.catalog.update(object.clone()).await)?;
        info!(link = %object.id, "marked link down");
        Ok(())
    }
}

async fn event_pump(
    reconciler: Arc<LinkReconciler>,
    mut events: mpsc::Receiver<LinkEvent>,
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
            LinkEvent::Added(link) => reconciler.reconcile_link(&link, STATUS_UP).await,
            LinkEvent::Deleted(mut link) => {
                // Deletions carry no device-side timestamp; stamp the
                // transition with the wall clock.
                link.create_time = now_nanos();
                reconciler.reconcile_link(&link, STATUS_DOWN).await
            }
        };
        if let Err(error) = result {
            warn!(%error, "unable to apply streamed link change");
        }
    }
}
