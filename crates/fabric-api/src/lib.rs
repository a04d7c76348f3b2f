//! Wire model, framed RPC transport, and typed clients for the fabric
//! topology catalog and the per-device telemetry agents.
//!
//! Three protocol surfaces share one transport:
//!
//! - **Catalog** ([`CatalogClient`]) — the central topology object store:
//!   query/watch streams plus get/create/update/delete on entities and
//!   relations.
//! - **Telemetry** ([`TelemetrySession`]) — structured get/subscribe against
//!   a device agent, used for port, link, and host discovery.
//! - **Northbound** ([`SeedClient`]) — the seeding API operators use to
//!   create pods, racks, switches, and servers/IPUs.
//!
//! The transport itself ([`transport`]) frames bincode-encoded messages over
//! TCP (optionally TLS) and multiplexes any number of request streams per
//! connection. Higher-level consumers (the discovery core) never touch raw
//! frames.

pub mod catalog;
pub mod error;
pub mod filter;
pub mod model;
pub mod northbound;
pub mod telemetry;
pub mod transport;

pub use catalog::{CatalogClient, Event, EventKind, ObjectStream};
pub use error::{Error, Fault, FaultKind};
pub use filter::{Filters, RelationFilter};
pub use model::{
    aspect, kind, Aspect, AspectMap, DeviceConfig, HostNic, Id, LinkAttrs, LocalAgents, Object,
    ObjectBody, PortAttrs, StratumAgents, STATUS_DOWN, STATUS_UP,
};
pub use northbound::{ManagementInfo, SeedClient, SeedRequest, SeedResponse};
pub use telemetry::{Notification, Path, TelemetrySession, TypedValue, Update};
pub use transport::{ClientTls, Handler, Reply, RpcClient, RpcStream, ServerTls};
