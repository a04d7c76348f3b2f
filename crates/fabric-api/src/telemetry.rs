// ── Device telemetry protocol ──
//
// Device agents expose a structured get/subscribe interface over paths of
// the form `interfaces/interface[name=1/0]/state`. Values are typed
// scalars; notifications carry path/value updates plus deleted paths.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::Id;
use crate::transport::{ClientTls, RpcClient, RpcStream};

/// Path of the agent's self-identification leaf.
pub const AGENT_ID_PATH: &str = "state/agent-id";

// ── Paths ───────────────────────────────────────────────────────────

/// One element of a structured path: a name plus optional keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathElem {
    pub name: String,
    pub keys: Vec<(String, String)>,
}

impl PathElem {
    pub fn key(&self, name: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A structured telemetry path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    pub elems: Vec<PathElem>,
}

impl Path {
    /// Parse a textual path such as `state/link[port=...]` or
    /// `interfaces/interface[name=1/0]/state/oper-status`.
    ///
    /// Splits on `/` outside brackets only, so key values may themselves
    /// contain slashes (interface names usually do).
    pub fn parse(text: &str) -> Result<Self, Error> {
        let bad = |reason| Error::BadPath { path: text.to_owned(), reason };

        let mut elems = Vec::new();
        let mut segment = String::new();
        let mut depth = 0usize;
        for ch in text.chars() {
            match ch {
                '[' => {
                    depth += 1;
                    segment.push(ch);
                }
                ']' => {
                    depth = depth.checked_sub(1).ok_or_else(|| bad("unbalanced ']'"))?;
                    segment.push(ch);
                }
                '/' if depth == 0 => {
                    elems.push(Self::parse_elem(&segment, text)?);
                    segment.clear();
                }
                _ => segment.push(ch),
            }
        }
        if depth != 0 {
            return Err(bad("unbalanced '['"));
        }
        if segment.is_empty() {
            return Err(bad("empty path element"));
        }
        elems.push(Self::parse_elem(&segment, text)?);
        Ok(Self { elems })
    }

    fn parse_elem(segment: &str, full: &str) -> Result<PathElem, Error> {
        let bad = |reason| Error::BadPath { path: full.to_owned(), reason };

        let Some(bracket) = segment.find('[') else {
            if segment.is_empty() {
                return Err(bad("empty path element"));
            }
            return Ok(PathElem { name: segment.to_owned(), keys: Vec::new() });
        };

        let name = &segment[..bracket];
        if name.is_empty() {
            return Err(bad("empty path element"));
        }
        let mut keys = Vec::new();
        let mut rest = &segment[bracket..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| bad("unbalanced '['"))?;
            let (kv, tail) = stripped.split_at(end);
            let (key, value) = kv.split_once('=').ok_or_else(|| bad("key without '='"))?;
            keys.push((key.to_owned(), value.to_owned()));
            rest = &tail[1..];
        }
        if !rest.is_empty() {
            return Err(bad("trailing characters after ']'"));
        }
        Ok(PathElem { name: name.to_owned(), keys })
    }

    /// Name of the element at `idx`, if present.
    pub fn elem_name(&self, idx: usize) -> Option<&str> {
        self.elems.get(idx).map(|e| e.name.as_str())
    }

    /// Key value on the element at `idx`.
    pub fn key_at(&self, idx: usize, key: &str) -> Option<&str> {
        self.elems.get(idx).and_then(|e| e.key(key))
    }

    /// Name of the final element (the leaf).
    pub fn leaf(&self) -> Option<&str> {
        self.elems.last().map(|e| e.name.as_str())
    }
}

// Rendered form mirrors the parsed form: `name[k=v]` segments joined by `/`.
impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, elem) in self.elems.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(&elem.name)?;
            for (k, v) in &elem.keys {
                write!(f, "[{k}={v}]")?;
            }
        }
        Ok(())
    }
}

// ── Values and notifications ────────────────────────────────────────

/// A typed scalar leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    String(String),
    Uint(u64),
    Int(i64),
    Bool(bool),
}

impl TypedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Unsigned view of a numeric value; negative ints are rejected.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// One path/value pair inside a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub path: Path,
    pub value: TypedValue,
}

/// A batch of updates and deletions from a device agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: u64,
    pub updates: Vec<Update>,
    pub deletes: Vec<Path>,
}

// ── Wire messages ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryRequest {
    Get { paths: Vec<Path> },
    Subscribe { paths: Vec<Path> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryResponse {
    Notification(Notification),
}

// ── Session ─────────────────────────────────────────────────────────

/// A cached connection to one device agent.
#[derive(Clone)]
pub struct TelemetrySession {
    target: Id,
    rpc: RpcClient<TelemetryRequest, TelemetryResponse>,
    op_timeout: Duration,
}

impl TelemetrySession {
    /// Dial the agent serving `target` at `endpoint` (`host:port`).
    pub async fn connect(
        target: Id,
        endpoint: &str,
        tls: &ClientTls,
        op_timeout: Duration,
    ) -> Result<Self, Error> {
        let rpc = RpcClient::connect(endpoint, tls, op_timeout).await?;
        Ok(Self { target, rpc, op_timeout })
    }

    /// The device this session belongs to.
    pub fn target(&self) -> &Id {
        &self.target
    }

    /// Issue a structured get and collect the returned notifications.
    pub async fn get(&self, paths: Vec<Path>) -> Result<Vec<Notification>, Error> {
        let collect = async {
            let mut stream = self.rpc.open(TelemetryRequest::Get { paths })?;
            let mut notifications = Vec::new();
            while let Some(TelemetryResponse::Notification(n)) = stream.recv().await? {
                notifications.push(n);
            }
            Ok(notifications)
        };
        tokio::time::timeout(self.op_timeout, collect)
            .await
            .map_err(|_| Error::Timeout { seconds: self.op_timeout.as_secs() })?
    }

    /// Open a subscription stream for the given paths.
    pub fn subscribe(&self, paths: Vec<Path>) -> Result<NotificationStream, Error> {
        let inner = self.rpc.open(TelemetryRequest::Subscribe { paths })?;
        Ok(NotificationStream { inner })
    }

    /// Fetch the agent's self-published identifier.
    pub async fn agent_id(&self) -> Result<String, Error> {
        let notifications = self.get(vec![Path::parse(AGENT_ID_PATH)?]).await?;
        notifications
            .iter()
            .flat_map(|n| n.updates.iter())
            .find_map(|u| u.value.as_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidPayload("agent-id not received".into()))
    }
}

/// Notification stream of a subscription. `Ok(None)` is a normal closure.
pub struct NotificationStream {
    inner: RpcStream<TelemetryResponse>,
}

impl NotificationStream {
    pub async fn recv(&mut self) -> Result<Option<Notification>, Error> {
        match self.inner.recv().await? {
            None => Ok(None),
            Some(TelemetryResponse::Notification(n)) => Ok(Some(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_path() {
        let path = Path::parse("state/agent-id").unwrap();
        assert_eq!(path.elems.len(), 2);
        assert_eq!(path.elem_name(0), Some("state"));
        assert_eq!(path.leaf(), Some("agent-id"));
    }

    #[test]
    fn parse_keyed_path() {
        let path = Path::parse("interfaces/interface[name=1/0]/state/oper-status").unwrap();
        assert_eq!(path.elems.len(), 4);
        assert_eq!(path.key_at(1, "name"), Some("1/0"));
        assert_eq!(path.leaf(), Some("oper-status"));
        assert_eq!(path.to_string(), "interfaces/interface[name=1/0]/state/oper-status");
    }

    #[test]
    fn parse_wildcard_key() {
        let path = Path::parse("state/link[port=...]").unwrap();
        assert_eq!(path.key_at(1, "port"), Some("..."));
        assert_eq!(path.elem_name(1), Some("link"));
    }

    #[test]
    fn parse_multiple_keys() {
        let path = Path::parse("a/b[x=1][y=2]/c").unwrap();
        assert_eq!(path.key_at(1, "x"), Some("1"));
        assert_eq!(path.key_at(1, "y"), Some("2"));
        assert_eq!(path.to_string(), "a/b[x=1][y=2]/c");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Path::parse("a/b[port=3").is_err());
        assert!(Path::parse("a//b").is_err());
        assert!(Path::parse("").is_err());
        assert!(Path::parse("a/[x=1]").is_err());
    }

    #[test]
    fn value_accessors() {
        assert_eq!(TypedValue::Uint(7).as_u64(), Some(7));
        assert_eq!(TypedValue::Int(7).as_u64(), Some(7));
        assert_eq!(TypedValue::Int(-7).as_u64(), None);
        assert_eq!(TypedValue::String("UP".into()).as_str(), Some("UP"));
        assert_eq!(TypedValue::Bool(true).as_bool(), Some(true));
        assert_eq!(TypedValue::String("UP".into()).as_u64(), None);
    }
}
