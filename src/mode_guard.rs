//! Temporarily route every selector group through `DIRECT` while probing.
//!
//! The previous selection is put back on every exit path of the guarded run,
//! including panics and cancellation.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::{GuardConfig, RestoreScope};
use crate::controller::{ControlClient, ProxyGroup};

/// Guarded runs mutate global daemon state; only one may be active at a time.
/// The lock is held until the last selection has been put back.
static GUARD_LOCK: LazyLock<Arc<Mutex<()>>> = LazyLock::new(|| Arc::new(Mutex::new(())));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSnapshot {
    pub group_name: String,
    pub previous_member: String,
}

#[derive(Debug)]
pub enum GuardOutcome<T> {
    Completed(T),
    Cancelled,
}

/// Result of a guarded run plus any non-fatal restoration problems.
#[derive(Debug)]
pub struct Guarded<T> {
    pub outcome: GuardOutcome<T>,
    pub warnings: Vec<String>,
}

impl<T> Guarded<T> {
    pub fn completed(self) -> Option<T> {
        match self.outcome {
            GuardOutcome::Completed(value) => Some(value),
            GuardOutcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, GuardOutcome::Cancelled)
    }
}

pub struct ModeGuard {
    client: ControlClient,
    settle: Duration,
    direct_member: String,
    scope: RestoreScope,
}

impl ModeGuard {
    pub fn new(client: ControlClient, config: &GuardConfig) -> Self {
        Self {
            client,
            settle: config.settle(),
            direct_member: config.direct_member.clone(),
            scope: config.restore,
        }
    }

    pub async fn with_direct_mode<F, Fut, T>(&self, run: F) -> Guarded<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_direct_mode_until(run, std::future::pending::<()>())
            .await
    }

    /// Like [`with_direct_mode`](Self::with_direct_mode), but stops `run`
    /// as soon as `cancel` resolves. Restoration still happens before return.
    pub async fn with_direct_mode_until<F, Fut, T, C>(&self, run: F, cancel: C) -> Guarded<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        C: Future,
    {
        let serial = Arc::clone(&GUARD_LOCK).lock_owned().await;

        let (selectors, snapshots, mut warnings) = self.snapshot().await;
        let active = !snapshots.is_empty();
        // armed before the first switch so a drop mid-switch still restores
        let pending = PendingRestore {
            client: self.client.clone(),
            snapshots,
            serial: Some(serial),
        };
        if active {
            self.switch_to_direct(&selectors).await;
        }

        let settle = if active { self.settle } else { Duration::ZERO };
        let work = async move {
            if !settle.is_zero() {
                debug!("Waiting {:?} for direct mode to settle", settle);
                tokio::time::sleep(settle).await;
            }
            AssertUnwindSafe(run()).catch_unwind().await
        };

        let result = tokio::select! {
            result = work => Some(result),
            _ = cancel => None,
        };

        warnings.extend(pending.restore().await);

        match result {
            Some(Ok(value)) => Guarded {
                outcome: GuardOutcome::Completed(value),
                warnings,
            },
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => {
                info!("Guarded run cancelled, selection restored");
                Guarded {
                    outcome: GuardOutcome::Cancelled,
                    warnings,
                }
            }
        }
    }

    /// Selector groups, GLOBAL first, and the selections to put back later.
    async fn snapshot(&self) -> (Vec<ProxyGroup>, Vec<SelectionSnapshot>, Vec<String>) {
        let groups = match self.client.list_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                let message = format!("direct mode skipped, cannot read groups: {}", e);
                warn!("{}", message);
                return (Vec::new(), Vec::new(), vec![message]);
            }
        };

        let mut selectors: Vec<ProxyGroup> =
            groups.into_values().filter(|g| g.is_selector()).collect();
        selectors.sort_by(|a, b| {
            (a.name != "GLOBAL", &a.name).cmp(&(b.name != "GLOBAL", &b.name))
        });

        let mut snapshots: Vec<SelectionSnapshot> = selectors
            .iter()
            .filter_map(|group| {
                let current = group.current.as_deref()?;
                (current != self.direct_member).then(|| SelectionSnapshot {
                    group_name: group.name.clone(),
                    previous_member: current.to_string(),
                })
            })
            .collect();
        if self.scope == RestoreScope::First {
            snapshots.truncate(1);
        }

        if snapshots.is_empty() {
            debug!("No active selection, running without direct mode");
        }
        (selectors, snapshots, Vec::new())
    }

    /// Best effort: a group that refuses the switch is only logged.
    async fn switch_to_direct(&self, selectors: &[ProxyGroup]) {
        for group in selectors {
            if !group.has_member(&self.direct_member)
                || group.current.as_deref() == Some(self.direct_member.as_str())
            {
                continue;
            }
            match self.client.set_member(&group.name, &self.direct_member).await {
                Ok(()) => info!("Switched group {} to {}", group.name, self.direct_member),
                Err(e) => warn!(
                    "Failed to switch group {} to {}: {}",
                    group.name, self.direct_member, e
                ),
            }
        }
    }
}

/// Selections still owed back to the daemon, plus the run lock.
///
/// Dropping it with work left (the guarded future was itself dropped)
/// hands the remaining restorations, and the lock, to a task on the
/// current runtime.
struct PendingRestore {
    client: ControlClient,
    snapshots: Vec<SelectionSnapshot>,
    serial: Option<OwnedMutexGuard<()>>,
}

impl PendingRestore {
    async fn restore(mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        while let Some(snapshot) = self.snapshots.first().cloned() {
            if let Err(message) = restore_one(&self.client, &snapshot).await {
                warnings.push(message);
            }
            self.snapshots.remove(0);
        }
        warnings
    }
}

impl Drop for PendingRestore {
    fn drop(&mut self) {
        if self.snapshots.is_empty() {
            return;
        }
        let snapshots = std::mem::take(&mut self.snapshots);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Guarded run dropped, restoring {} selection(s) in background", snapshots.len());
                let client = self.client.clone();
                let serial = self.serial.take();
                handle.spawn(async move {
                    for snapshot in &snapshots {
                        let _ = restore_one(&client, snapshot).await;
                    }
                    drop(serial);
                });
            }
            Err(_) => {
                for snapshot in &snapshots {
                    warn!(
                        "No runtime left, group {} not restored to {}",
                        snapshot.group_name, snapshot.previous_member
                    );
                }
            }
        }
    }
}

async fn restore_one(client: &ControlClient, snapshot: &SelectionSnapshot) -> Result<(), String> {
    match client
        .set_member(&snapshot.group_name, &snapshot.previous_member)
        .await
    {
        Ok(()) => {
            info!(
                "Restored group {} to {}",
                snapshot.group_name, snapshot.previous_member
            );
            Ok(())
        }
        Err(e) => {
            let message = format!(
                "failed to restore group {} to {}: {}",
                snapshot.group_name, snapshot.previous_member, e
            );
            warn!("{}", message);
            Err(message)
        }
    }
}
