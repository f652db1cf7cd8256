//! Path-oriented key operations on top of the store.
//!
//! Keys are absolute paths. Persistent keys carry an empty value and no lease;
//! ephemeral keys are bound to the session lease and vanish with it.

#[cfg(test)]
mod keystore_test;

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::constants::PATH_SEPARATOR;
use crate::lease::LeaseManager;
use crate::store::KvBackend;
use crate::store::StoreResult;
use crate::Error;
use crate::Result;

/// Immediate children of a path, read at one store revision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenSnapshot {
    pub revision: i64,
    /// Full child paths in key order
    pub children: Vec<String>,
}

impl ChildrenSnapshot {
    /// Last path segment of every child
    pub fn names(&self) -> Vec<String> {
        self.children.iter().map(|c| child_name(c).to_string()).collect()
    }
}

pub struct KeyStore {
    backend: Arc<dyn KvBackend>,
    leases: Arc<LeaseManager>,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("request_timeout", &self.request_timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl KeyStore {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        leases: Arc<LeaseManager>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            leases,
            request_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Create `path` without a lease; an existing key is left untouched
    pub async fn create_persistent(
        &self,
        path: &str,
    ) -> Result<()> {
        self.ensure_open(path)?;
        if self.call("check exists", self.backend.exists(path)).await? {
            return Ok(());
        }
        self.call("create persistent", self.backend.put(path, Vec::new(), None)).await?;
        debug!(path, "persistent key created");
        Ok(())
    }

    /// Create `path` bound to the session lease
    pub async fn create_ephemeral(
        &self,
        path: &str,
    ) -> Result<()> {
        self.ensure_open(path)?;
        let result = async {
            let lease_id = self.leases.session_lease().await?;
            self.call("create ephemeral", self.backend.put(path, Vec::new(), Some(lease_id)))
                .await
                .map_err(|e| match e {
                    Error::Store { source, .. } if source.code() == tonic::Code::NotFound => {
                        Error::LeaseExpired(lease_id)
                    }
                    other => other,
                })?;
            debug!(path, lease_id, "ephemeral key created");
            Ok(())
        }
        .await;

        result.map_err(|source| Error::Creation {
            path: path.to_string(),
            source: Box::new(source),
        })
    }

    pub async fn check_exists(
        &self,
        path: &str,
    ) -> Result<bool> {
        self.ensure_open(path)?;
        self.call("check exists", self.backend.exists(path)).await
    }

    /// Immediate children of `path`; deeper descendants are excluded
    pub async fn get_children(
        &self,
        path: &str,
    ) -> Result<ChildrenSnapshot> {
        self.ensure_open(path)?;
        let prefix = child_prefix(path);
        let snapshot = self.call("list children", self.backend.range_prefix(&prefix)).await?;

        let children: Vec<String> = snapshot
            .keys
            .into_iter()
            .filter(|key| is_immediate_child(path, key))
            .collect();
        trace!(path, revision = snapshot.revision, count = children.len(), "children listed");

        Ok(ChildrenSnapshot {
            revision: snapshot.revision,
            children,
        })
    }

    /// Delete `path`; a missing key is not an error
    pub async fn delete(
        &self,
        path: &str,
    ) -> Result<()> {
        self.ensure_open(path)?;
        self.call("delete", self.backend.delete(path)).await?;
        debug!(path, "key deleted");
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(
        &self,
        path: &str,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedClient {
                client: "kv",
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> Result<T> {
        match timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(Error::from_status(operation, status)),
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }
}

/// `path` with exactly one trailing separator
pub(crate) fn child_prefix(path: &str) -> String {
    let mut prefix = path.trim_end_matches(PATH_SEPARATOR).to_string();
    prefix.push(PATH_SEPARATOR);
    prefix
}

/// Whether `key` sits exactly one segment below `parent`
pub(crate) fn is_immediate_child(
    parent: &str,
    key: &str,
) -> bool {
    let prefix = child_prefix(parent);
    match key.strip_prefix(prefix.as_str()) {
        Some(rest) => !rest.is_empty() && !rest.contains(PATH_SEPARATOR),
        None => false,
    }
}

/// Last segment of a path
pub(crate) fn child_name(path: &str) -> &str {
    path.rsplit(PATH_SEPARATOR).next().unwrap_or(path)
}
