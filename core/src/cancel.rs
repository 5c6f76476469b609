//! Cooperative cancellation for a fetch.
//!
//! The cancelled state lives in a `tokio_util` `CancellationToken`, so async
//! hosts can await it. The task checks it before every hop. Blocking waits
//! (credential prompts, the login bridge) register a hook that wakes them when
//! `cancel` is called; the returned `CancelHook` removes the hook again once
//! the wait is over.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::FetchError;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    pending: Vec<(u64, Hook)>,
}

/// Cloneable handle; every clone observes the same cancellation.
#[derive(Clone, Default)]
pub struct CancelToken {
    token: CancellationToken,
    hooks: Arc<Mutex<Hooks>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and run every registered hook once.
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        let pending = std::mem::take(&mut lock(&self.hooks).pending);
        for (_, hook) in pending {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check(&self) -> Result<(), FetchError> {
        if self.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Run `hook` on cancellation, or right away if already cancelled.
    ///
    /// Dropping the returned guard unregisters a hook that has not run yet.
    #[must_use = "dropping the guard unregisters the hook"]
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelHook {
        let mut hooks = lock(&self.hooks);
        // checked under the lock: `cancel` flips the token before taking hooks
        if self.token.is_cancelled() {
            drop(hooks);
            hook();
            return CancelHook {
                hooks: Weak::new(),
                id: 0,
            };
        }
        hooks.next_id += 1;
        let id = hooks.next_id;
        hooks.pending.push((id, Box::new(hook)));
        CancelHook {
            hooks: Arc::downgrade(&self.hooks),
            id,
        }
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        lock(&self.hooks).pending.len()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Registration returned by [`CancelToken::on_cancel`].
#[derive(Debug)]
pub struct CancelHook {
    hooks: Weak<Mutex<Hooks>>,
    id: u64,
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        if let Some(hooks) = self.hooks.upgrade() {
            lock(&hooks).pending.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(hooks: &Mutex<Hooks>) -> MutexGuard<'_, Hooks> {
    hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn check_fails_after_cancel() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.clone().cancel();
        assert!(matches!(token.check(), Err(FetchError::Cancelled)));
    }

    #[test]
    fn hooks_run_once() {
        let token = CancelToken::new();
        let (count, hook) = counter();
        let _guard = token.on_cancel(hook);
        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_registered_after_cancel_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let (count, hook) = counter();
        let _guard = token.on_cancel(hook);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_guard_unregisters_hook() {
        let token = CancelToken::new();
        let (count, _) = counter();
        for _ in 0..50 {
            let c = count.clone();
            let guard = token.on_cancel(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            drop(guard);
        }
        assert_eq!(token.registered(), 0);

        let (kept, hook) = counter();
        let _guard = token.on_cancel(hook);
        assert_eq!(token.registered(), 1);
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_outliving_token_is_harmless() {
        let token = CancelToken::new();
        let guard = token.on_cancel(|| {});
        drop(token);
        drop(guard);
    }

    #[test]
    fn cancelled_future_resolves_after_cancel() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async move {
            let waiter = token.clone();
            let wait = tokio::spawn(async move { waiter.cancelled().await });
            canceller.cancel();
            wait.await.unwrap();
        });
    }
}
