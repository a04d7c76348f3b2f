// ── Seeding operations ──
//
// Operators create the structural scaffolding (pods, racks) and the device
// entities the discovery sweep then picks up. All operations require the
// controller to have reached Monitoring; before that they answer
// Unavailable so callers can retry.

use fabric_api::{
    kind, CatalogClient, DeviceConfig, Id, LocalAgents, ManagementInfo, Object, StratumAgents,
};
use tracing::info;

use crate::controller::Controller;
use crate::error::CoreError;

impl Controller {
    /// Create a pod entity labeled `{pod: id}`.
    pub async fn add_pod(&self, id: &Id) -> Result<(), CoreError> {
        let epoch = self.monitoring_epoch().await?;
        info!(pod = %id, "adding pod");
        let pod = Object::entity(id.clone(), kind::POD).with_label(kind::POD, id.as_str());
        epoch.catalog.create(pod).await?;
        Ok(())
    }

    /// Create a rack entity inside a pod, with a `contains` relation from
    /// the pod.
    pub async fn add_rack(&self, id: &Id, pod_id: &Id) -> Result<(), CoreError> {
        let epoch = self.monitoring_epoch().await?;
        info!(rack = %id, pod = %pod_id, "adding rack");
        let rack = Object::entity(id.clone(), kind::RACK)
            .with_label(kind::POD, pod_id.as_str())
            .with_label(kind::RACK, id.as_str());
        epoch.catalog.create(rack).await?;
        create_contains(&epoch.catalog, pod_id, id).await
    }

    /// Create a switch entity with its agent and provisioning aspects,
    /// contained by a rack.
    pub async fn add_switch(
        &self,
        id: &Id,
        pod_id: &Id,
        rack_id: &Id,
        info: &ManagementInfo,
    ) -> Result<(), CoreError> {
        let epoch = self.monitoring_epoch().await?;
        info!(switch = %id, rack = %rack_id, "adding switch");
        let switch = device_entity(id, kind::SWITCH, pod_id, rack_id, info)?;
        epoch.catalog.create(switch).await?;
        create_contains(&epoch.catalog, rack_id, id).await
    }

    /// Create a server entity plus its derived `<id>-IPU` device entity,
    /// the server contained by the rack and the IPU by the server.
    pub async fn add_server_ipu(
        &self,
        id: &Id,
        pod_id: &Id,
        rack_id: &Id,
        info: &ManagementInfo,
    ) -> Result<(), CoreError> {
        let epoch = self.monitoring_epoch().await?;
        info!(server = %id, rack = %rack_id, "adding server with IPU");

        let server = Object::entity(id.clone(), kind::SERVER)
            .with_label(kind::POD, pod_id.as_str())
            .with_label(kind::RACK, rack_id.as_str());
        epoch.catalog.create(server).await?;
        create_contains(&epoch.catalog, rack_id, id).await?;

        let ipu_id = Id::new(format!("{id}-IPU"));
        let ipu = device_entity(&ipu_id, kind::IPU, pod_id, rack_id, info)?;
        epoch.catalog.create(ipu).await?;
        create_contains(&epoch.catalog, id, &ipu_id).await
    }
}

/// A discoverable device entity: realm labels plus the three aspects
/// derived from the management info.
fn device_entity(
    id: &Id,
    device_kind: &str,
    pod_id: &Id,
    rack_id: &Id,
    info: &ManagementInfo,
) -> Result<Object, CoreError> {
    Ok(Object::entity(id.clone(), device_kind)
        .with_label(kind::POD, pod_id.as_str())
        .with_label(kind::RACK, rack_id.as_str())
        .with_aspect(&StratumAgents {
            p4rt_endpoint: info.p4rt_endpoint.clone(),
            telemetry_endpoint: info.telemetry_endpoint.clone(),
        })?
        .with_aspect(&LocalAgents {
            link_agent_endpoint: info.link_agent_endpoint.clone(),
            host_agent_endpoint: info.host_agent_endpoint.clone(),
        })?
        .with_aspect(&DeviceConfig {
            chassis_config_id: info.chassis_config_id.clone(),
            pipeline_config_id: info.pipeline_config_id.clone(),
        })?)
}

async fn create_contains(catalog: &CatalogClient, src: &Id, tgt: &Id) -> Result<(), CoreError> {
    let relation = Object::relation(src.clone(), tgt.clone(), kind::CONTAINS);
    catalog.create(relation).await?;
    Ok(())
}
