//! Fabric topology discovery core.
//!
//! A long-lived controller that watches the topology catalog for
//! provisioned devices, polls each device's agents for ports, ingress
//! links, and attached hosts, and writes entity and relation objects back
//! so the catalog mirrors the physical fabric.
//!
//! The lifecycle controller ([`Controller`]) owns the catalog connection
//! and a bounded worker pool; per-device work flows through the three
//! reconcilers in [`reconcile`], which share the southbound session layer
//! in [`southbound`]. The seeding API used to create pods, racks, and
//! devices is served by [`northbound::SeedService`].

pub mod config;
pub mod controller;
pub mod error;
pub mod northbound;
pub mod reconcile;
pub mod seed;
pub mod southbound;

pub use config::{DiscoveryConfig, RealmSelector};
pub use controller::{Controller, LifecycleState};
pub use error::CoreError;
pub use northbound::SeedService;
