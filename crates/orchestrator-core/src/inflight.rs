//! Per-model operation tokens
//!
//! At most one operation runs per model identity. Downloads coalesce: later
//! callers join the running task. Every other operation is rejected with a
//! conflict while something is in flight. Tokens are released when their
//! [`OperationGuard`] is dropped.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use common::error::{Error, Result};
use common::models::ModelIdentity;

use crate::task::{DownloadCompleter, DownloadTask};

/// Operation currently holding a model's token
#[derive(Debug, Clone)]
pub(crate) enum InFlight {
    /// A background download other callers may join
    Download(DownloadTask),
    /// An exclusive operation
    Exclusive(&'static str),
}

impl InFlight {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            InFlight::Download(_) => "download",
            InFlight::Exclusive(operation) => *operation,
        }
    }
}

/// Table of in-flight operations keyed by model identity
#[derive(Debug, Default)]
pub(crate) struct InFlightTable {
    operations: DashMap<ModelIdentity, InFlight>,
}

impl InFlightTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes the token of `identity` for an exclusive operation
    pub(crate) fn acquire(
        self: &Arc<Self>,
        identity: &ModelIdentity,
        operation: &'static str,
    ) -> Result<OperationGuard> {
        match self.operations.entry(identity.clone()) {
            Entry::Occupied(entry) => Err(conflict(identity, operation, entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(InFlight::Exclusive(operation));
                Ok(self.guard(identity))
            }
        }
    }

    /// Joins the running download of `identity`, or calls `start` to begin
    /// one while the token is still held.
    ///
    /// `start` returns `Ok(None)` when there is nothing to download; the
    /// token is then left untouched.
    pub(crate) fn join_or_start<F>(
        self: &Arc<Self>,
        identity: &ModelIdentity,
        start: F,
    ) -> Result<DownloadStart>
    where
        F: FnOnce() -> Result<Option<(DownloadTask, DownloadCompleter)>>,
    {
        match self.operations.entry(identity.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                InFlight::Download(task) => Ok(DownloadStart::Joined(task.clone())),
                other => Err(conflict(identity, "download", other)),
            },
            Entry::Vacant(entry) => match start()? {
                Some((task, completer)) => {
                    entry.insert(InFlight::Download(task.clone()));
                    Ok(DownloadStart::Started(task, completer, self.guard(identity)))
                }
                None => Ok(DownloadStart::NotNeeded),
            },
        }
    }

    /// Running download of `identity`
    pub(crate) fn download(&self, identity: &ModelIdentity) -> Option<DownloadTask> {
        self.operations.get(identity).and_then(|entry| match entry.value() {
            InFlight::Download(task) => Some(task.clone()),
            InFlight::Exclusive(_) => None,
        })
    }

    /// Name of the operation in flight for `identity`
    pub(crate) fn current(&self, identity: &ModelIdentity) -> Option<&'static str> {
        self.operations.get(identity).map(|entry| entry.value().name())
    }

    fn guard(self: &Arc<Self>, identity: &ModelIdentity) -> OperationGuard {
        OperationGuard {
            table: Arc::clone(self),
            identity: identity.clone(),
        }
    }
}

/// Result of [`InFlightTable::join_or_start`]
pub(crate) enum DownloadStart {
    /// Another caller's download is running
    Joined(DownloadTask),
    /// A new download was registered; the guard releases its token
    Started(DownloadTask, DownloadCompleter, OperationGuard),
    /// Nothing to download
    NotNeeded,
}

/// Releases a model's token on drop
#[derive(Debug)]
pub(crate) struct OperationGuard {
    table: Arc<InFlightTable>,
    identity: ModelIdentity,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.table.operations.remove(&self.identity);
    }
}

fn conflict(identity: &ModelIdentity, operation: &'static str, in_flight: &InFlight) -> Error {
    Error::Conflict {
        identity: identity.clone(),
        operation,
        in_flight: in_flight.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::ModelSource;

    fn gpt2() -> ModelIdentity {
        ModelIdentity::new(ModelSource::Hub, "gpt2")
    }

    #[test]
    fn test_exclusive_tokens() {
        let table = InFlightTable::new();

        let guard = table.acquire(&gpt2(), "load").unwrap();
        assert_eq!(table.current(&gpt2()), Some("load"));

        let err = table.acquire(&gpt2(), "delete").unwrap_err();
        assert!(matches!(err, Error::Conflict { operation: "delete", in_flight: "load", .. }));

        // Other identities are independent
        let other = ModelIdentity::new(ModelSource::Daemon, "gpt2");
        let _other_guard = table.acquire(&other, "load").unwrap();

        drop(guard);
        assert_eq!(table.current(&gpt2()), None);
        assert!(table.acquire(&gpt2(), "delete").is_ok());
    }

    #[test]
    fn test_downloads_coalesce() {
        let table = InFlightTable::new();

        let started = table
            .join_or_start(&gpt2(), || Ok(Some(DownloadTask::new(gpt2()))))
            .unwrap();
        let DownloadStart::Started(_, _completer, guard) = started else {
            panic!("expected a new download");
        };

        let joined = table
            .join_or_start(&gpt2(), || panic!("must not start a second download"))
            .unwrap();
        assert!(matches!(joined, DownloadStart::Joined(_)));
        assert!(table.download(&gpt2()).is_some());
        assert!(matches!(
            table.acquire(&gpt2(), "load"),
            Err(Error::Conflict { in_flight: "download", .. })
        ));

        drop(guard);
        assert!(table.download(&gpt2()).is_none());
    }

    #[test]
    fn test_nothing_to_download_keeps_token_free() {
        let table = InFlightTable::new();
        let start = table
            .join_or_start(&gpt2(), || Ok(None))
            .unwrap();
        assert!(matches!(start, DownloadStart::NotNeeded));
        assert_eq!(table.current(&gpt2()), None);
    }
}
