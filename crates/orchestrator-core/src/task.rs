//! Background download tasks

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};
use common::models::{ModelIdentity, ModelState};

type Outcome = Option<Result<ModelState>>;

/// Handle to a download running in the background.
///
/// Clones observe the same download; every waiter receives the same outcome.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Model being downloaded
    identity: ModelIdentity,

    /// Cancels the download
    cancel: CancellationToken,

    /// Final outcome, `None` while running
    outcome: watch::Receiver<Outcome>,
}

/// Publishes the outcome of a [`DownloadTask`]
#[derive(Debug)]
pub(crate) struct DownloadCompleter {
    sender: watch::Sender<Outcome>,
}

impl DownloadTask {
    /// Creates a running task and the completer that finishes it
    pub(crate) fn new(identity: ModelIdentity) -> (Self, DownloadCompleter) {
        let (sender, outcome) = watch::channel(None);
        let task = Self {
            identity,
            cancel: CancellationToken::new(),
            outcome,
        };
        (task, DownloadCompleter { sender })
    }

    /// A task that has nothing to do because the model is already in `state`
    pub fn completed(identity: ModelIdentity, state: ModelState) -> Self {
        let (_sender, outcome) = watch::channel(Some(Ok(state)));
        Self {
            identity,
            cancel: CancellationToken::new(),
            outcome,
        }
    }

    /// Model being downloaded
    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    /// Returns true once the outcome is known
    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Outcome, if finished
    pub fn outcome(&self) -> Option<Result<ModelState>> {
        self.outcome.borrow().clone()
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the download to finish
    pub async fn wait(&self) -> Result<ModelState> {
        let mut outcome = self.outcome.clone();

        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }

            if outcome.changed().await.is_err() {
                // Completer dropped without publishing
                return outcome.borrow().clone().unwrap_or_else(|| {
                    Err(Error::Internal(format!("download of {} was abandoned", self.identity)))
                });
            }
        }
    }
}

impl DownloadCompleter {
    /// Publishes the outcome to every waiter
    pub(crate) fn complete(self, result: Result<ModelState>) {
        self.sender.send_replace(Some(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::DownloadError;
    use common::models::ModelSource;

    fn identity() -> ModelIdentity {
        ModelIdentity::new(ModelSource::Daemon, "llama3")
    }

    #[tokio::test]
    async fn test_all_waiters_see_the_outcome() {
        let (task, completer) = DownloadTask::new(identity());
        let other = task.clone();
        assert!(!task.is_finished());

        let waiter = tokio::spawn(async move { other.wait().await });
        completer.complete(Err(DownloadError::Cancelled.into()));

        let first = task.wait().await.unwrap_err();
        let second = waiter.await.unwrap().unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_completed_task() {
        let task = DownloadTask::completed(identity(), ModelState::Loaded);
        assert!(task.is_finished());
        assert_eq!(task.wait().await.unwrap(), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_abandoned_task() {
        let (task, completer) = DownloadTask::new(identity());
        drop(completer);
        assert!(matches!(task.wait().await, Err(Error::Internal(_))));
    }

    #[test]
    fn test_cancel_is_shared() {
        let (task, _completer) = DownloadTask::new(identity());
        let token = task.cancellation_token();
        task.clone().cancel();
        assert!(token.is_cancelled());
    }
}
