// ── Catalog object model ──
//
// The catalog is a graph of entities and relations. Every object carries a
// stable identifier, string labels, and a heterogeneous map of typed aspects.
// This module defines the wire shape plus the typed aspect payloads the
// discovery core reads and writes.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Id ──────────────────────────────────────────────────────────────

/// Stable catalog object identifier.
///
/// Derived identifiers are composed from their parents:
/// ports are `<device>/<portNumber>`, links `<egressPort>-<ingressPort>`,
/// hosts `<agentID>/<port>/<MAC>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier of the port entity `<device>/<number>`.
    pub fn port(device: &Id, number: u32) -> Self {
        Self(format!("{}/{}", device.0, number))
    }

    /// Identifier of the link entity `<egressPort>-<ingressPort>`.
    pub fn link(egress_port: &Id, ingress_port: &Id) -> Self {
        Self(format!("{}-{}", egress_port.0, ingress_port.0))
    }

    /// Identifier of a host entity `<agentID>/<port>/<MAC>`.
    pub fn host(agent_id: &str, port: u32, mac: &str) -> Self {
        Self(format!("{agent_id}/{port}/{mac}"))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ── Kinds ───────────────────────────────────────────────────────────

/// Entity and relation kind identifiers.
pub mod kind {
    // Entities
    pub const POD: &str = "pod";
    pub const RACK: &str = "rack";
    pub const SWITCH: &str = "switch";
    pub const SERVER: &str = "server";
    pub const IPU: &str = "ipu";
    pub const PORT: &str = "port";
    pub const LINK: &str = "link";
    pub const HOST: &str = "host";

    // Relations
    pub const CONTAINS: &str = "contains";
    pub const HAS: &str = "has";
    pub const ORIGINATES: &str = "originates";
    pub const TERMINATES: &str = "terminates";
}

/// Operational status values used by port and link aspects.
pub const STATUS_UP: &str = "UP";
/// See [`STATUS_UP`].
pub const STATUS_DOWN: &str = "DOWN";

// ── Aspects ─────────────────────────────────────────────────────────

/// A named, typed payload attached to a catalog object.
pub trait Aspect: Serialize + DeserializeOwned {
    const NAME: &'static str;
}

/// Aspect names, usable both as map keys and in `with_aspects` filters.
pub mod aspect {
    pub const PORT: &str = "port";
    pub const LINK: &str = "link";
    pub const HOST_NIC: &str = "host-nic";
    pub const STRATUM_AGENTS: &str = "stratum-agents";
    pub const LOCAL_AGENTS: &str = "local-agents";
    pub const DEVICE_CONFIG: &str = "device-config";
}

/// Physical port attributes mirrored from the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAttrs {
    pub display_name: String,
    pub index: u64,
    pub number: u32,
    pub status: String,
    pub last_change: u64,
    pub speed: String,
    pub enabled: bool,
}

impl Aspect for PortAttrs {
    const NAME: &'static str = aspect::PORT;
}

/// Link status and the device-side timestamp of its last transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAttrs {
    pub status: String,
    pub last_change: u64,
}

impl Aspect for LinkAttrs {
    const NAME: &'static str = aspect::LINK;
}

/// Network interface of an attached host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNic {
    pub mac: String,
    pub ip: String,
}

impl Aspect for HostNic {
    const NAME: &'static str = aspect::HOST_NIC;
}

/// Endpoints of the device's Stratum agents (P4Runtime and telemetry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumAgents {
    pub p4rt_endpoint: String,
    pub telemetry_endpoint: String,
}

impl Aspect for StratumAgents {
    const NAME: &'static str = aspect::STRATUM_AGENTS;
}

/// Endpoints of the device's local link and host agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAgents {
    pub link_agent_endpoint: String,
    pub host_agent_endpoint: String,
}

impl Aspect for LocalAgents {
    const NAME: &'static str = aspect::LOCAL_AGENTS;
}

/// Provisioning configuration references for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub chassis_config_id: String,
    pub pipeline_config_id: String,
}

impl Aspect for DeviceConfig {
    const NAME: &'static str = aspect::DEVICE_CONFIG;
}

/// Heterogeneous aspect storage: aspect name → canonical JSON text.
///
/// JSON text (rather than `serde_json::Value`) keeps the map encodable by
/// the non-self-describing wire codec, and makes repeated writes of the
/// same payload byte-identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectMap(BTreeMap<String, String>);

impl AspectMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<A: Aspect>(&mut self, aspect: &A) -> Result<(), serde_json::Error> {
        let body = serde_json::to_string(aspect)?;
        self.0.insert(A::NAME.to_owned(), body);
        Ok(())
    }

    pub fn get<A: Aspect>(&self) -> Option<Result<A, serde_json::Error>> {
        self.0.get(A::NAME).map(|body| serde_json::from_str(body))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Object ──────────────────────────────────────────────────────────

/// Whether an object is a graph node or an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectBody {
    Entity {
        kind: String,
        /// Identifiers of relations that have this entity as their source.
        /// Maintained by the catalog, never written by clients.
        src_relation_ids: Vec<Id>,
    },
    Relation {
        kind: String,
        src: Id,
        tgt: Id,
    },
}

/// A catalog object: identifier, labels, aspects, and an entity or
/// relation body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: Id,
    pub labels: BTreeMap<String, String>,
    pub aspects: AspectMap,
    pub body: ObjectBody,
}

impl Object {
    /// New entity with the given kind and no labels or aspects.
    pub fn entity(id: impl Into<Id>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeMap::new(),
            aspects: AspectMap::new(),
            body: ObjectBody::Entity { kind: kind.into(), src_relation_ids: Vec::new() },
        }
    }

    /// New relation `src -kind-> tgt`; the identifier is derived from all
    /// three parts so repeated creates collide deterministically.
    pub fn relation(src: impl Into<Id>, tgt: impl Into<Id>, kind: impl Into<String>) -> Self {
        let (src, tgt, kind) = (src.into(), tgt.into(), kind.into());
        Self {
            id: Id::new(format!("{src}-{kind}-{tgt}")),
            labels: BTreeMap::new(),
            aspects: AspectMap::new(),
            body: ObjectBody::Relation { kind, src, tgt },
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_aspect<A: Aspect>(mut self, aspect: &A) -> Result<Self, Error> {
        self.set_aspect(aspect)?;
        Ok(self)
    }

    pub fn set_aspect<A: Aspect>(&mut self, aspect: &A) -> Result<(), Error> {
        self.aspects.set(aspect).map_err(|source| Error::AspectInvalid {
            object: self.id.clone(),
            aspect: A::NAME,
            source,
        })
    }

    /// Decode a typed aspect, failing if it is absent or malformed.
    pub fn aspect<A: Aspect>(&self) -> Result<A, Error> {
        match self.aspects.get::<A>() {
            None => Err(Error::AspectMissing { object: self.id.clone(), aspect: A::NAME }),
            Some(Err(source)) => Err(Error::AspectInvalid {
                object: self.id.clone(),
                aspect: A::NAME,
                source,
            }),
            Some(Ok(aspect)) => Ok(aspect),
        }
    }

    /// The entity or relation kind.
    pub fn kind(&self) -> &str {
        match &self.body {
            ObjectBody::Entity { kind, .. } => kind,
            ObjectBody::Relation { kind, .. } => kind,
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self.body, ObjectBody::Entity { .. })
    }

    /// Relation ids sourced at this entity; empty for relations.
    pub fn src_relation_ids(&self) -> &[Id] {
        match &self.body {
            ObjectBody::Entity { src_relation_ids, .. } => src_relation_ids,
            ObjectBody::Relation { .. } => &[],
        }
    }

    /// `(src, tgt)` of a relation object.
    pub fn endpoints(&self) -> Option<(&Id, &Id)> {
        match &self.body {
            ObjectBody::Relation { src, tgt, .. } => Some((src, tgt)),
            ObjectBody::Entity { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_identifiers() {
        let device = Id::new("spine1");
        let egress = Id::port(&device, 3);
        assert_eq!(egress.as_str(), "spine1/3");

        let ingress = Id::port(&Id::new("leaf1"), 1);
        assert_eq!(Id::link(&egress, &ingress).as_str(), "spine1/3-leaf1/1");
        assert_eq!(Id::host("leaf1", 7, "00:11:22:33:44:55").as_str(), "leaf1/7/00:11:22:33:44:55");
    }

    #[test]
    fn aspect_round_trip() {
        let attrs = PortAttrs {
            display_name: "1/0".into(),
            index: 1,
            number: 1,
            status: STATUS_UP.into(),
            last_change: 42,
            speed: "100GB".into(),
            enabled: true,
        };

        let object = Object::entity("spine1/1", kind::PORT).with_aspect(&attrs).unwrap();
        assert_eq!(object.aspect::<PortAttrs>().unwrap(), attrs);
        assert!(object.aspects.contains(aspect::PORT));
        assert!(object.aspect::<LinkAttrs>().is_err());
    }

    #[test]
    fn aspect_writes_are_deterministic() {
        let attrs = LinkAttrs { status: STATUS_UP.into(), last_change: 7 };
        let a = Object::entity("l", kind::LINK).with_aspect(&attrs).unwrap();
        let b = Object::entity("l", kind::LINK).with_aspect(&attrs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn relation_identifier_is_derived() {
        let rel = Object::relation("spine1", "spine1/1", kind::HAS);
        assert_eq!(rel.id.as_str(), "spine1-has-spine1/1");
        let (src, tgt) = rel.endpoints().unwrap();
        assert_eq!(src.as_str(), "spine1");
        assert_eq!(tgt.as_str(), "spine1/1");
    }
}
