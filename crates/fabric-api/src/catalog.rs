// ── Typed catalog client ──
//
// The catalog is a remote object store with query/watch/CRUD operations.
// This wrapper gives the raw transport a typed surface and puts every
// unary operation under a deadline so a wedged catalog cannot stall a
// reconciliation pass indefinitely.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::filter::Filters;
use crate::model::{Id, Object};
use crate::transport::{ClientTls, RpcClient, RpcStream};

/// Default deadline for unary catalog operations.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

// ── Wire messages ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatalogRequest {
    Query { filters: Filters },
    Watch { filters: Filters },
    Get { id: Id },
    Create { object: Object },
    Update { object: Object },
    Delete { id: Id },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatalogResponse {
    Object(Object),
    Event(Event),
    Done,
}

/// A change notification from the catalog watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub object: Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Updated,
    Removed,
}

// ── Client ──────────────────────────────────────────────────────────

/// Client handle for one catalog connection. Cheap to clone.
#[derive(Clone)]
pub struct CatalogClient {
    rpc: RpcClient<CatalogRequest, CatalogResponse>,
    op_timeout: Duration,
}

impl CatalogClient {
    /// Dial the catalog at `address` (`host:port`).
    pub async fn connect(address: &str, tls: &ClientTls, op_timeout: Duration) -> Result<Self, Error> {
        let rpc = RpcClient::connect(address, tls, op_timeout).await?;
        Ok(Self { rpc, op_timeout })
    }

    /// Fetch one object by identifier.
    pub async fn get(&self, id: &Id) -> Result<Object, Error> {
        let resp = self
            .deadline(self.rpc.call(CatalogRequest::Get { id: id.clone() }))
            .await?;
        match resp {
            CatalogResponse::Object(object) => Ok(object),
            other => Err(unexpected(&other)),
        }
    }

    /// Create an object. Fails with an already-exists fault on collision;
    /// callers that want create-if-absent treat that fault as success.
    pub async fn create(&self, object: Object) -> Result<(), Error> {
        let resp = self.deadline(self.rpc.call(CatalogRequest::Create { object })).await?;
        match resp {
            CatalogResponse::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn update(&self, object: Object) -> Result<(), Error> {
        let resp = self.deadline(self.rpc.call(CatalogRequest::Update { object })).await?;
        match resp {
            CatalogResponse::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn delete(&self, id: &Id) -> Result<(), Error> {
        let resp = self
            .deadline(self.rpc.call(CatalogRequest::Delete { id: id.clone() }))
            .await?;
        match resp {
            CatalogResponse::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Stream all objects matching the filters.
    pub fn query(&self, filters: Filters) -> Result<ObjectStream, Error> {
        let inner = self.rpc.open(CatalogRequest::Query { filters })?;
        Ok(ObjectStream { inner })
    }

    /// Stream change events for objects matching the filters. Existing
    /// matches are replayed as `Added` events first.
    pub fn watch(&self, filters: Filters) -> Result<EventStream, Error> {
        let inner = self.rpc.open(CatalogRequest::Watch { filters })?;
        Ok(EventStream { inner })
    }

    async fn deadline<F, T>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Timeout { seconds: self.op_timeout.as_secs() })?
    }
}

fn unexpected(resp: &CatalogResponse) -> Error {
    Error::Protocol(format!("unexpected catalog response {resp:?}"))
}

// ── Streams ─────────────────────────────────────────────────────────

/// Result stream of a `Query`; `Ok(None)` marks the end of the results.
pub struct ObjectStream {
    inner: RpcStream<CatalogResponse>,
}

impl ObjectStream {
    pub async fn recv(&mut self) -> Result<Option<Object>, Error> {
        match self.inner.recv().await? {
            None => Ok(None),
            Some(CatalogResponse::Object(object)) => Ok(Some(object)),
            Some(other) => Err(unexpected(&other)),
        }
    }

    /// Drain the stream into a vector.
    pub async fn collect(mut self) -> Result<Vec<Object>, Error> {
        let mut objects = Vec::new();
        while let Some(object) = self.recv().await? {
            objects.push(object);
        }
        Ok(objects)
    }
}

/// Event stream of a `Watch`; runs until cancelled, dropped, or the
/// connection breaks.
pub struct EventStream {
    inner: RpcStream<CatalogResponse>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Result<Option<Event>, Error> {
        match self.inner.recv().await? {
            None => Ok(None),
            Some(CatalogResponse::Event(event)) => Ok(Some(event)),
            Some(other) => Err(unexpected(&other)),
        }
    }
}
