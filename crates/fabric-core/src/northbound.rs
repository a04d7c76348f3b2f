// ── Northbound service ──
//
// Exposes the seeding operations over the shared transport. A thin shim:
// every request maps onto one controller method and every core error onto
// a classified wire fault.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use fabric_api::transport::{serve, Handler, Reply};
use fabric_api::{Fault, SeedRequest, SeedResponse, ServerTls};

use crate::controller::Controller;
use crate::error::CoreError;

/// Handler implementing the seeding API on top of a controller.
pub struct SeedService {
    controller: Controller,
}

impl SeedService {
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }

    /// Serve the seeding API until `cancel` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        tls: Option<ServerTls>,
        cancel: CancellationToken,
    ) -> Result<(), fabric_api::Error> {
        serve(listener, tls, Arc::new(self), cancel).await
    }
}

#[async_trait]
impl Handler<SeedRequest, SeedResponse> for SeedService {
    async fn handle(&self, request: SeedRequest, reply: Reply<SeedResponse>) -> Result<(), Fault> {
        let result: Result<(), CoreError> = match &request {
            SeedRequest::AddPod { id } => self.controller.add_pod(id).await,
            SeedRequest::AddRack { id, pod_id } => self.controller.add_rack(id, pod_id).await,
            SeedRequest::AddSwitch { id, pod_id, rack_id, info } => {
                self.controller.add_switch(id, pod_id, rack_id, info).await
            }
            SeedRequest::AddServerIpu { id, pod_id, rack_id, info } => {
                self.controller.add_server_ipu(id, pod_id, rack_id, info).await
            }
        };

        match result {
            Ok(()) => {
                reply
                    .send(SeedResponse::Done)
                    .map_err(|e| Fault::internal(e.to_string()))?;
                Ok(())
            }
            Err(error) => {
                warn!(?request, %error, "seeding request failed");
                Err(error.to_fault())
            }
        }
    }
}
