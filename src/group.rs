//! Task group: shared cancellation plus a first-error cell
//!
//! Every application runs its supervision tasks inside one `TaskGroup`.
//! Any member that fails records its error (the first write wins) and
//! cancels the group; every member selects on [`TaskGroup::dying`] and
//! exits once it fires. [`TaskGroup::wait`] joins all members.

use crate::error::AppError;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error};

struct Inner {
    token: CancellationToken,
    error: Mutex<Option<AppError>>,
    live: watch::Sender<usize>,
}

impl Inner {
    fn kill(&self, err: Option<AppError>) {
        if let Some(err) = err {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.token.cancel();
    }
}

/// Cancellation broadcast and joined failure for a set of cooperating tasks
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

impl TaskGroup {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                error: Mutex::new(None),
                live,
            }),
        }
    }

    /// Run `task` as a member of the group.
    ///
    /// An `Err` result is recorded and cancels the group. A panic cancels the
    /// group without recording an error.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        self.inner.live.send_modify(|n| *n += 1);
        let mut member = Member {
            inner: Arc::clone(&self.inner),
            name,
            finished: false,
        };

        tokio::spawn(async move {
            let result = task.await;
            match result {
                Ok(()) => debug!(task = member.name, "Group task finished"),
                Err(err) => {
                    debug!(task = member.name, error = %err, "Group task failed");
                    member.inner.kill(Some(err));
                }
            }
            member.finished = true;
        });
    }

    /// Cancel the group, recording `err` unless an error was already recorded
    pub fn kill(&self, err: Option<AppError>) {
        self.inner.kill(err);
    }

    /// Resolves once the group has been cancelled
    pub fn dying(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    pub fn is_dying(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The cancellation token shared by all members
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// The first recorded error, if any
    pub fn err(&self) -> Option<AppError> {
        self.inner.error.lock().clone()
    }

    /// Number of members still running
    pub fn live(&self) -> usize {
        *self.inner.live.borrow()
    }

    /// Wait until every member has exited, then return the recorded error
    pub async fn wait(&self) -> Option<AppError> {
        let mut rx = self.inner.live.subscribe();
        // The sender lives in `inner`, so this only returns once the count is zero.
        let _ = rx.wait_for(|n| *n == 0).await;
        self.err()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

struct Member {
    inner: Arc<Inner>,
    name: &'static str,
    finished: bool,
}

impl Drop for Member {
    fn drop(&mut self) {
        if !self.finished {
            error!(task = self.name, "Group task panicked, cancelling group");
            self.inner.kill(None);
        }
        self.inner.live.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_error_cancels_siblings() {
        let group = TaskGroup::new();

        let sibling = group.clone();
        group.spawn("waiter", async move {
            sibling.dying().await;
            Ok(())
        });
        group.spawn("failer", async { Err(AppError::DiedBeforeBooting) });

        let err = tokio::time::timeout(Duration::from_secs(2), group.wait())
            .await
            .expect("group should finish");
        assert!(matches!(err, Some(AppError::DiedBeforeBooting)));
        assert!(group.is_dying());
        assert_eq!(group.live(), 0);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let group = TaskGroup::new();
        group.kill(Some(AppError::Killed {
            reason: "purging".into(),
        }));
        group.kill(Some(AppError::DiedBeforeBooting));

        match group.err() {
            Some(AppError::Killed { reason }) => assert_eq!(reason, "purging"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_without_error() {
        let group = TaskGroup::new();
        let member = group.clone();
        group.spawn("waiter", async move {
            member.dying().await;
            Ok(())
        });

        assert!(!group.is_dying());
        group.kill(None);

        let err = tokio::time::timeout(Duration::from_secs(2), group.wait())
            .await
            .expect("group should finish");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_error_recorded_after_plain_kill() {
        let group = TaskGroup::new();
        let member = group.clone();
        group.spawn("poller", async move {
            member.dying().await;
            Err(AppError::DiedBeforeBooting)
        });

        group.kill(None);
        let err = group.wait().await;
        assert!(matches!(err, Some(AppError::DiedBeforeBooting)));
    }

    #[tokio::test]
    async fn test_panic_cancels_group() {
        let group = TaskGroup::new();
        group.spawn("boom", async {
            if group_should_panic() {
                panic!("boom");
            }
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(2), group.wait())
            .await
            .expect("group should finish");
        assert!(group.is_dying());
        assert!(group.err().is_none());
    }

    fn group_should_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn test_wait_on_empty_group_returns_immediately() {
        let group = TaskGroup::new();
        assert!(group.wait().await.is_none());
    }
}
