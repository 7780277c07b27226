//! Shared connections to remote slots APIs.
//!
//! Every transfer with a slot peer and every manager push needs a client
//! for the peer's slots API. Clients are shared per url: the first
//! [`ConnectionCache::connect`] creates one through the [`PeerConnector`],
//! later calls reuse it, and dropping the last [`ConnectionHandle`] evicts it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::api::SlotsApi;
use crate::status::Status;

/// Opens a client for the slots API at a url.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn SlotsApi>, Status>;
}

struct CacheEntry {
    api: Arc<dyn SlotsApi>,
    refs: usize,
}

/// Reference-counted client cache keyed by url.
pub struct ConnectionCache {
    connector: Arc<dyn PeerConnector>,
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Returns a handle to the shared client for `url`, connecting on first use.
    pub fn connect(&self, url: &str) -> Result<ConnectionHandle, Status> {
        // Entry API keeps check-and-insert atomic per url
        let api = match self.entries.entry(url.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().refs += 1;
                trace!(url, refs = entry.get().refs, "Reusing slots API connection");
                entry.get().api.clone()
            }
            Entry::Vacant(entry) => {
                let api = self.connector.connect(url)?;
                debug!(url, "Opened slots API connection");
                entry.insert(CacheEntry {
                    api: api.clone(),
                    refs: 1,
                });
                api
            }
        };
        Ok(ConnectionHandle {
            url: url.to_string(),
            api,
            entries: self.entries.clone(),
        })
    }

    /// Number of urls with at least one live handle.
    pub fn open_connections(&self) -> usize {
        self.entries.len()
    }

    /// Live handles for `url`.
    pub fn refs(&self, url: &str) -> usize {
        self.entries.get(url).map(|e| e.refs).unwrap_or(0)
    }
}

/// A counted reference to a cached client; derefs to [`SlotsApi`].
pub struct ConnectionHandle {
    url: String,
    api: Arc<dyn SlotsApi>,
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl ConnectionHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn SlotsApi;

    fn deref(&self) -> &Self::Target {
        self.api.as_ref()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.entries.entry(self.url.clone()) {
            entry.get_mut().refs -= 1;
            if entry.get().refs == 0 {
                entry.remove();
                debug!(url = %self.url, "Closed slots API connection");
            }
        }
    }
}

/// In-process "network": urls resolve to registered slots APIs.
#[derive(Default)]
pub struct LocalNetwork {
    apis: DashMap<String, Arc<dyn SlotsApi>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, url: impl Into<String>, api: Arc<dyn SlotsApi>) {
        self.apis.insert(url.into(), api);
    }

    /// Makes `url` unreachable, as if its worker went away.
    pub fn unregister(&self, url: &str) {
        self.apis.remove(url);
    }
}

impl PeerConnector for LocalNetwork {
    fn connect(&self, url: &str) -> Result<Arc<dyn SlotsApi>, Status> {
        self.apis
            .get(url)
            .map(|api| api.clone())
            .ok_or_else(|| Status::unavailable(format!("No slots API reachable at {}", url)))
    }
}
