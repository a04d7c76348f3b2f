// ── Northbound seeding API ──
//
// Operators (and the integration suite) seed pods, racks, switches, and
// servers/IPUs through these messages. The discovery controller answers
// them only once it has reached its monitoring state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::Id;
use crate::transport::{ClientTls, RpcClient};

/// Management endpoints and provisioning references for a switch or IPU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagementInfo {
    pub p4rt_endpoint: String,
    pub telemetry_endpoint: String,
    pub link_agent_endpoint: String,
    pub host_agent_endpoint: String,
    pub chassis_config_id: String,
    pub pipeline_config_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SeedRequest {
    AddPod { id: Id },
    AddRack { id: Id, pod_id: Id },
    AddSwitch { id: Id, pod_id: Id, rack_id: Id, info: ManagementInfo },
    AddServerIpu { id: Id, pod_id: Id, rack_id: Id, info: ManagementInfo },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SeedResponse {
    Done,
}

/// Typed client for the seeding API.
#[derive(Clone)]
pub struct SeedClient {
    rpc: RpcClient<SeedRequest, SeedResponse>,
    op_timeout: Duration,
}

impl SeedClient {
    pub async fn connect(address: &str, tls: &ClientTls, op_timeout: Duration) -> Result<Self, Error> {
        let rpc = RpcClient::connect(address, tls, op_timeout).await?;
        Ok(Self { rpc, op_timeout })
    }

    pub async fn add_pod(&self, id: impl Into<Id>) -> Result<(), Error> {
        self.call(SeedRequest::AddPod { id: id.into() }).await
    }

    pub async fn add_rack(&self, id: impl Into<Id>, pod_id: impl Into<Id>) -> Result<(), Error> {
        self.call(SeedRequest::AddRack { id: id.into(), pod_id: pod_id.into() }).await
    }

    pub async fn add_switch(
        &self,
        id: impl Into<Id>,
        pod_id: impl Into<Id>,
        rack_id: impl Into<Id>,
        info: ManagementInfo,
    ) -> Result<(), Error> {
        self.call(SeedRequest::AddSwitch {
            id: id.into(),
            pod_id: pod_id.into(),
            rack_id: rack_id.into(),
            info,
        })
        .await
    }

    pub async fn add_server_ipu(
        &self,
        id: impl Into<Id>,
        pod_id: impl Into<Id>,
        rack_id: impl Into<Id>,
        info: ManagementInfo,
    ) -> Result<(), Error> {
        self.call(SeedRequest::AddServerIpu {
            id: id.into(),
            pod_id: pod_id.into(),
            rack_id: rack_id.into(),
            info,
        })
        .await
    }

    async fn call(&self, request: SeedRequest) -> Result<(), Error> {
        let call = self.rpc.call(request);
        match tokio::time::timeout(self.op_timeout, call)
            .await
            .map_err(|_| Error::Timeout { seconds: self.op_timeout.as_secs() })??
        {
            SeedResponse::Done => Ok(()),
        }
    }
}
