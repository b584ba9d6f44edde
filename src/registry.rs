//! # Dispatcher Registry
//!
//! One [`Dispatcher`] per container, created on first use and kept until the
//! container is closed or the owning client shuts down. The registry is owned
//! by [`crate::api::BulkClient`]; there is no process-wide cache.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatcher::{Dispatcher, DispatcherParts};
use crate::error::{Error, Result};
use crate::types::ContainerId;

/// Container id → dispatcher.
pub struct DispatcherRegistry {
    parts: DispatcherParts,
    dispatchers: DashMap<ContainerId, Dispatcher>,
    cancel: CancellationToken,
}

impl DispatcherRegistry {
    /// Creates an empty registry. Dispatchers get child tokens of `cancel`.
    pub fn new(parts: DispatcherParts, cancel: CancellationToken) -> Self {
        Self {
            parts,
            dispatchers: DashMap::new(),
            cancel,
        }
    }

    /// Returns the container's dispatcher, creating it if needed.
    pub fn get_or_create(&self, container: &ContainerId) -> Result<Dispatcher> {
        if self.cancel.is_cancelled() {
            return Err(Error::DispatcherClosed);
        }
        match self.dispatchers.entry(container.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                debug!(container = %container, "creating dispatcher");
                let dispatcher =
                    Dispatcher::new(container.clone(), self.parts.clone(), &self.cancel)?;
                Ok(entry.insert(dispatcher).value().clone())
            }
        }
    }

    /// Returns the container's dispatcher if one exists.
    pub fn get(&self, container: &ContainerId) -> Option<Dispatcher> {
        self.dispatchers.get(container).map(|d| d.value().clone())
    }

    /// Removes and closes the container's dispatcher.
    ///
    /// Returns false if there was none.
    pub fn remove(&self, container: &ContainerId) -> bool {
        match self.dispatchers.remove(container) {
            Some((_, dispatcher)) => {
                dispatcher.close();
                true
            }
            None => false,
        }
    }

    /// Closes every dispatcher and refuses new ones.
    pub fn close_all(&self) {
        self.cancel.cancel();
        let dispatchers: Vec<Dispatcher> =
            self.dispatchers.iter().map(|e| e.value().clone()).collect();
        self.dispatchers.clear();
        for dispatcher in dispatchers {
            dispatcher.close();
        }
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}
