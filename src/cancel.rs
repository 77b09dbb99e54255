use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use tokio::sync::Notify;

use crate::errors::{CancelReason, Error, Result};

/// Idempotent cancellation handle shared by a call and whoever may abort it.
///
/// User aborts and the timeout timer both go through [`CancelHandle::trigger`];
/// the first trigger fixes the reason and later ones are no-ops.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    reason: OnceLock<CancelReason>,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request user cancellation.
    pub fn abort(&self) {
        self.trigger(CancelReason::User);
    }

    /// Returns `true` if this call was the one that cancelled the handle.
    pub fn trigger(&self, reason: CancelReason) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }

    /// Resolves once the handle has been triggered.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Run `fut` until it settles, the handle is triggered, or `timeout` elapses.
    ///
    /// A timeout triggers the handle itself, so observers see `CancelReason::Timeout`.
    pub async fn run<F, T>(&self, timeout: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(reason) = self.reason() {
            return Err(Error::Cancelled(reason));
        }
        let timer = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(Error::Cancelled(reason)),
            _ = timer => {
                self.trigger(CancelReason::Timeout);
                Err(Error::Cancelled(self.reason().unwrap_or(CancelReason::Timeout)))
            }
            out = fut => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_wins() {
        let handle = CancelHandle::new();
        assert!(handle.trigger(CancelReason::Timeout));
        assert!(!handle.trigger(CancelReason::User));
        assert_eq!(handle.reason(), Some(CancelReason::Timeout));
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn run_reports_timeout_reason() {
        let handle = CancelHandle::new();
        let out: Result<()> = handle
            .run(Some(Duration::from_millis(5)), std::future::pending())
            .await;
        assert!(matches!(out, Err(Error::Cancelled(CancelReason::Timeout))));
        assert_eq!(handle.reason(), Some(CancelReason::Timeout));
    }

    #[tokio::test]
    async fn abort_from_another_task_wakes_run() {
        let handle = CancelHandle::new();
        let remote = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            remote.abort();
        });
        let out: Result<()> = handle.run(None, std::future::pending()).await;
        assert!(matches!(out, Err(Error::Cancelled(CancelReason::User))));
    }

    #[tokio::test]
    async fn already_cancelled_short_circuits() {
        let handle = CancelHandle::new();
        handle.abort();
        let out = handle.run(None, async { Ok(1) }).await;
        assert!(matches!(out, Err(Error::Cancelled(CancelReason::User))));
    }
}
