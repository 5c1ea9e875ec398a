// Concurrency Group Manager
// Serializes or preempts runs that share a resolved concurrency key

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why a waiting run was woken
#[derive(Debug)]
enum Wake {
    Admitted,
    Superseded,
}

struct Holder {
    run_id: String,
    cancel: CancellationToken,
}

struct Pending {
    run_id: String,
    cancel: CancellationToken,
    wake: oneshot::Sender<Wake>,
}

#[derive(Default)]
struct GroupState {
    holder: Option<Holder>,
    pending: Option<Pending>,
}

/// Outcome of asking for a concurrency group
#[derive(Debug)]
pub enum Admission {
    /// The run holds the group until the permit is dropped
    Admitted(ConcurrencyPermit),
    /// A newer run took the pending slot
    Superseded,
    /// The run's own cancellation fired while it waited
    Cancelled,
}

/// Sole arbiter of cross-run serialization.
///
/// Each group has at most one holder and one pending run. Cloning shares
/// the same groups.
#[derive(Clone, Default)]
pub struct ConcurrencyManager {
    groups: Arc<Mutex<HashMap<String, GroupState>>>,
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, GroupState>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run id currently holding `group`
    pub fn holder(&self, group: &str) -> Option<String> {
        self.lock()
            .get(group)
            .and_then(|state| state.holder.as_ref().map(|h| h.run_id.clone()))
    }

    /// Run id waiting for `group`
    pub fn pending(&self, group: &str) -> Option<String> {
        self.lock()
            .get(group)
            .and_then(|state| state.pending.as_ref().map(|p| p.run_id.clone()))
    }

    /// Wait until `run_id` may hold `group`.
    ///
    /// With `cancel_in_progress` the current holder is cancelled first. A
    /// run already waiting is superseded either way. `cancel` is this run's
    /// token: it is what a later preempting run signals.
    pub async fn acquire(
        &self,
        group: &str,
        run_id: &str,
        cancel_in_progress: bool,
        cancel: CancellationToken,
    ) -> Admission {
        let waiter = {
            let mut groups = self.lock();
            let state = groups.entry(group.to_string()).or_default();

            let Some(holder) = &state.holder else {
                state.holder = Some(Holder {
                    run_id: run_id.to_string(),
                    cancel,
                });
                info!(group, run_id, "concurrency group acquired");
                return Admission::Admitted(self.permit(group, run_id));
            };

            if cancel_in_progress {
                info!(group, holder = %holder.run_id, run_id, "cancelling run in progress");
                holder.cancel.cancel();
            }

            if let Some(previous) = state.pending.take() {
                info!(group, superseded = %previous.run_id, run_id, "pending run superseded");
                let _ = previous.wake.send(Wake::Superseded);
            }

            let (tx, rx) = oneshot::channel();
            state.pending = Some(Pending {
                run_id: run_id.to_string(),
                cancel: cancel.clone(),
                wake: tx,
            });
            debug!(group, run_id, "waiting for concurrency group");
            rx
        };

        tokio::select! {
            wake = waiter => match wake {
                Ok(Wake::Admitted) => Admission::Admitted(self.permit(group, run_id)),
                Ok(Wake::Superseded) | Err(_) => Admission::Superseded,
            },
            _ = cancel.cancelled() => {
                let mut groups = self.lock();
                if let Some(state) = groups.get_mut(group) {
                    if state.pending.as_ref().is_some_and(|p| p.run_id == run_id) {
                        state.pending = None;
                    }
                }
                drop(groups);
                // admission may have raced with cancellation
                if self.holder(group).as_deref() == Some(run_id) {
                    self.release(group, run_id);
                }
                Admission::Cancelled
            }
        }
    }

    fn permit(&self, group: &str, run_id: &str) -> ConcurrencyPermit {
        ConcurrencyPermit {
            manager: self.clone(),
            group: group.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Hand the group to the pending run, if any
    fn release(&self, group: &str, run_id: &str) {
        let mut groups = self.lock();
        let Some(state) = groups.get_mut(group) else {
            return;
        };
        if state.holder.as_ref().map(|h| h.run_id.as_str()) != Some(run_id) {
            return;
        }
        state.holder = None;

        if let Some(next) = state.pending.take() {
            if !next.cancel.is_cancelled() {
                let next_id = next.run_id.clone();
                state.holder = Some(Holder {
                    run_id: next.run_id,
                    cancel: next.cancel,
                });
                if next.wake.send(Wake::Admitted).is_ok() {
                    info!(group, run_id = %next_id, "concurrency group handed over");
                } else {
                    state.holder = None;
                }
            }
        }

        if state.holder.is_none() && state.pending.is_none() {
            groups.remove(group);
        }
        debug!(group, run_id, "concurrency group released");
    }
}

/// Held for the lifetime of an admitted run; releases the group on drop
#[derive(Debug)]
pub struct ConcurrencyPermit {
    manager: ConcurrencyManager,
    group: String,
    run_id: String,
}

impl ConcurrencyPermit {
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.manager.release(&self.group, &self.run_id);
    }
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("groups", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_free_group_admits_immediately() {
        let manager = ConcurrencyManager::new();
        let admission = manager
            .acquire("g", "run-1", false, CancellationToken::new())
            .await;
        assert!(matches!(admission, Admission::Admitted(_)));
        assert_eq!(manager.holder("g").as_deref(), Some("run-1"));

        drop(admission);
        assert_eq!(manager.holder("g"), None);
    }

    #[tokio::test]
    async fn test_waiter_admitted_after_release() {
        let manager = ConcurrencyManager::new();
        let first = manager
            .acquire("g", "run-1", false, CancellationToken::new())
            .await;

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("g", "run-2", false, CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pending("g").as_deref(), Some("run-2"));

        drop(first);
        let second = waiting.await.unwrap();
        assert!(matches!(second, Admission::Admitted(_)));
        assert_eq!(manager.holder("g").as_deref(), Some("run-2"));
    }

    #[tokio::test]
    async fn test_cancel_in_progress_signals_holder() {
        let manager = ConcurrencyManager::new();
        let holder_token = CancellationToken::new();
        let first = manager.acquire("g", "run-1", true, holder_token.clone()).await;

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("g", "run-2", true, CancellationToken::new())
                    .await
            })
        };

        tokio::time::timeout(Duration::from_secs(1), holder_token.cancelled())
            .await
            .expect("holder should be cancelled");
        drop(first);

        assert!(matches!(waiting.await.unwrap(), Admission::Admitted(_)));
    }

    #[tokio::test]
    async fn test_newer_arrival_supersedes_pending() {
        let manager = ConcurrencyManager::new();
        let _first = manager
            .acquire("g", "run-1", false, CancellationToken::new())
            .await;

        let second = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("g", "run-2", false, CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let third = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("g", "run-3", false, CancellationToken::new())
                    .await
            })
        };

        assert!(matches!(second.await.unwrap(), Admission::Superseded));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pending("g").as_deref(), Some("run-3"));
        third.abort();
    }

    #[tokio::test]
    async fn test_waiting_run_can_be_cancelled() {
        let manager = ConcurrencyManager::new();
        let _first = manager
            .acquire("g", "run-1", false, CancellationToken::new())
            .await;

        let token = CancellationToken::new();
        let waiting = {
            let manager = manager.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.acquire("g", "run-2", false, token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        assert!(matches!(waiting.await.unwrap(), Admission::Cancelled));
        assert_eq!(manager.pending("g"), None);
    }
}
