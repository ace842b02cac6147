//! Identifiers and the error type shared by every store component.

use std::borrow::Borrow;
use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix carried by every identity minted on the client.
pub const CLIENT_ID_PREFIX: &str = "client:";

/// Opaque record identity.
///
/// Server-assigned identities are stable and refetchable; identities starting
/// with [`CLIENT_ID_PREFIX`] were generated locally for objects without an
/// identity of their own.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(String);

impl DataId {
    /// Wraps a raw identity string.
    pub fn new(id: impl Into<String>) -> Self {
        DataId(id.into())
    }

    /// Returns the raw identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this identity was generated on the client.
    pub fn is_client(&self) -> bool {
        self.0.starts_with(CLIENT_ID_PREFIX)
    }

    /// Identity of the edge record linking `node` into the range stored on `range`.
    pub fn client_edge(range: &DataId, node: &DataId) -> Self {
        DataId(format!("{CLIENT_ID_PREFIX}{}:{}", range.0, node.0))
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DataId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DataId {
    fn from(value: &str) -> Self {
        DataId(value.to_owned())
    }
}

impl From<String> for DataId {
    fn from(value: String) -> Self {
        DataId(value)
    }
}

/// Mints `client:<n>` identities, unique for the lifetime of the generator.
#[derive(Debug)]
pub struct ClientIdGenerator {
    next: Cell<u64>,
}

impl ClientIdGenerator {
    /// Creates a generator whose first identity is `client:1`.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a generator starting at `first`; hosts restoring a persisted
    /// cache use this to avoid colliding with identities minted last session.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Cell::new(first),
        }
    }

    /// Returns a fresh client identity.
    pub fn next_id(&self) -> DataId {
        let n = self.next.get();
        self.next.set(n + 1);
        DataId(format!("{CLIENT_ID_PREFIX}{n}"))
    }
}

impl Default for ClientIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced by the record store, writer, cache reader and collector.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Programmer error: the API was driven in a way it never supports.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// A server or mutation payload does not match its selection tree.
    #[error("malformed payload: {0}")]
    InvalidPayload(String),
    /// A record or root call needed to answer the request is unknown.
    #[error("{0} not found")]
    NotFound(String),
    /// The persistent cache manager reported an error.
    #[error("cache: {0}")]
    Cache(String),
    /// I/O error.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A configuration document could not be parsed.
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
}

impl StoreError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        StoreError::Invariant(msg.into())
    }

    pub(crate) fn payload(msg: impl Into<String>) -> Self {
        StoreError::InvalidPayload(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
