//! Deadline guard: cleanup-on-timeout for one invocation.
//!
//! The guard is armed once per invocation with the environment's enforced
//! deadline and the invocation's workspace. One background task races a
//! timer set a safety margin before the deadline against a single-fire
//! cancellation signal:
//!
//! - timer fires first: the workspace is deleted, one fatal "invocation
//!   timeout" condition is logged, the `fired` signal is sent, and the task
//!   exits;
//! - cancellation arrives first (normal completion, success or handled
//!   failure): the task exits without touching the workspace.
//!
//! Exactly one of the two happens. The workspace delete itself is
//! idempotent, so the main pipeline's own deferred cleanup racing the guard
//! at the boundary is harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use soci_core::workspace::Workspace;

/// Safety margin before the enforced deadline at which cleanup starts.
pub const DEFAULT_DEADLINE_MARGIN: Duration = Duration::from_secs(10);

/// Armed watcher for one invocation's deadline.
#[derive(Debug)]
pub struct DeadlineGuard {
    cancel_tx: Option<oneshot::Sender<()>>,
    fired_rx: oneshot::Receiver<()>,
    task: Option<JoinHandle<()>>,
}

impl DeadlineGuard {
    /// Arms the guard: the timer fires `margin` before `deadline`. A
    /// deadline already inside the margin fires immediately.
    #[must_use]
    pub fn arm(deadline: DateTime<Utc>, margin: Duration, workspace: Arc<Workspace>) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let (fired_tx, fired_rx) = oneshot::channel::<()>();

        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        let wait = (deadline - margin - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let task = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    if let Err(error) = workspace.remove() {
                        tracing::error!(error = %error, "clean up error");
                    }
                    tracing::error!(
                        workspace = %workspace.path().display(),
                        "invocation timeout: deadline reached before completion"
                    );
                    let _ = fired_tx.send(());
                }
                _ = cancel_rx => {}
            }
        });

        Self {
            cancel_tx: Some(cancel_tx),
            fired_rx,
            task: Some(task),
        }
    }

    /// The timeout signal. Resolves with `Ok` when the timer has fired and
    /// cleanup has run; with an error once the guard exits without firing.
    pub fn fired(&mut self) -> &mut oneshot::Receiver<()> {
        &mut self.fired_rx
    }

    /// Disarms the guard and waits for the background task to exit. Safe to
    /// call after the timer has fired (the signal lands nowhere).
    pub async fn disarm(mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Arc<Workspace>) {
        let base = tempfile::tempdir().expect("base dir");
        let workspace = Arc::new(Workspace::create(base.path(), "guard-test").expect("workspace"));
        (base, workspace)
    }

    #[tokio::test]
    async fn fires_and_removes_workspace_when_deadline_passes() {
        let (_base, workspace) = workspace();

        let deadline = Utc::now() + chrono::Duration::milliseconds(50);
        let mut guard = DeadlineGuard::arm(deadline, Duration::ZERO, Arc::clone(&workspace));

        tokio::time::timeout(Duration::from_secs(5), guard.fired())
            .await
            .expect("guard should fire")
            .expect("fired signal");
        assert!(!workspace.exists());

        // Disarming after the fact is harmless.
        guard.disarm().await;
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately() {
        let (_base, workspace) = workspace();

        let deadline = Utc::now() - chrono::Duration::seconds(30);
        let mut guard = DeadlineGuard::arm(deadline, DEFAULT_DEADLINE_MARGIN, Arc::clone(&workspace));

        tokio::time::timeout(Duration::from_secs(5), guard.fired())
            .await
            .expect("guard should fire")
            .expect("fired signal");
        assert!(!workspace.exists());
        guard.disarm().await;
    }

    #[tokio::test]
    async fn disarm_leaves_workspace_untouched() {
        let (_base, workspace) = workspace();

        let deadline = Utc::now() + chrono::Duration::seconds(3600);
        let guard = DeadlineGuard::arm(deadline, DEFAULT_DEADLINE_MARGIN, Arc::clone(&workspace));
        guard.disarm().await;

        assert!(workspace.exists());
        // The pipeline's own cleanup still runs and succeeds.
        workspace.remove().expect("remove");
    }

    #[tokio::test]
    async fn guard_cleanup_and_pipeline_cleanup_tolerate_each_other() {
        let (_base, workspace) = workspace();

        let deadline = Utc::now();
        let mut guard = DeadlineGuard::arm(deadline, Duration::ZERO, Arc::clone(&workspace));

        tokio::time::timeout(Duration::from_secs(5), guard.fired())
            .await
            .expect("guard should fire")
            .expect("fired signal");

        // The pipeline's deferred delete races the guard's; both succeed.
        workspace.remove().expect("idempotent remove");
        assert!(!workspace.exists());
        guard.disarm().await;
    }
}
