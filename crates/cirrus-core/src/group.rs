// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded fan-out of named units of work.
//!
//! A [`ConcurrencyGroup`] spawns each unit as its own tokio task on a
//! [`JoinSet`], handing it a clone of the group's [`RequestContext`]. At most
//! `pool_size` units run at once: every unit waits for a semaphore permit
//! inside its own task, so [`ConcurrencyGroup::spawn`] never blocks.
//!
//! The first unit to fail is recorded with compare-and-set semantics; later
//! failures are only counted. Panics are caught at the join point and treated
//! as failures of the unit that panicked.
//!
//! # Example
//!
//! ```rust,ignore
//! let result = ConcurrencyGroup::scoped(&ctx, |group| {
//!     Box::pin(async move {
//!         for instance in &instances {
//!             let instance = instance.clone();
//!             group.spawn(format!("configure-{}", instance.instance_name), |ctx| async move {
//!                 configure(&ctx, &instance).await
//!             });
//!         }
//!         Ok(())
//!     })
//! })
//! .await;
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tracing::{debug, warn};

use crate::context::RequestContext;

/// The default number of units allowed to run at the same time.
pub const DEFAULT_POOL_SIZE: usize = 1000;

/// Failure reported when a group joins.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GroupError {
    /// At least one unit failed. Carries the first one to fail.
    #[error("An error occurred in thread '{description}': {source}")]
    UnitFailed {
        /// Description given to the unit at spawn time.
        description: String,
        /// How many units failed in total.
        failed_units: usize,
        /// Error returned by (or panic message of) the first failing unit.
        #[source]
        source: anyhow::Error,
    },
}

impl GroupError {
    /// Description of the unit that failed first.
    pub fn failed_unit(&self) -> &str {
        match self {
            Self::UnitFailed { description, .. } => description,
        }
    }
}

struct FirstFailure {
    description: String,
    error: anyhow::Error,
}

#[derive(Default)]
struct FailureSlot {
    first: Option<FirstFailure>,
    count: usize,
}

impl FailureSlot {
    /// Store the failure unless one is already recorded. Returns true if this
    /// call won.
    fn record(slot: &Mutex<FailureSlot>, description: &str, error: anyhow::Error) -> bool {
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.count += 1;
        if guard.first.is_some() {
            return false;
        }
        guard.first = Some(FirstFailure {
            description: description.to_string(),
            error,
        });
        true
    }
}

/// Structured task group with bounded parallelism and first-failure capture.
pub struct ConcurrencyGroup {
    ctx: RequestContext,
    semaphore: Arc<Semaphore>,
    set: JoinSet<()>,
    descriptions: Vec<(Id, String)>,
    failures: Arc<Mutex<FailureSlot>>,
}

impl ConcurrencyGroup {
    /// Create a group that runs up to [`DEFAULT_POOL_SIZE`] units at a time.
    pub fn new(ctx: &RequestContext) -> Self {
        Self::with_pool_size(ctx, DEFAULT_POOL_SIZE)
    }

    /// Create a group with an explicit bound on concurrently running units.
    pub fn with_pool_size(ctx: &RequestContext, pool_size: usize) -> Self {
        Self {
            ctx: ctx.clone(),
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
            set: JoinSet::new(),
            descriptions: Vec::new(),
            failures: Arc::new(Mutex::new(FailureSlot::default())),
        }
    }

    /// Number of units spawned so far.
    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    /// True when nothing has been spawned.
    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    /// Schedule a unit of work. Returns immediately.
    ///
    /// The unit receives its own copy of the group's context.
    pub fn spawn<F, Fut>(&mut self, description: impl Into<String>, unit: F)
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let description = description.into();
        let ctx = self.ctx.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let failures = Arc::clone(&self.failures);
        let unit_description = description.clone();

        let handle = self.set.spawn(async move {
            // The semaphore is owned by the group and never closed.
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            if let Err(error) = unit(ctx).await {
                debug!(unit = %unit_description, error = %error, "Unit failed");
                FailureSlot::record(&failures, &unit_description, error);
            }
        });

        self.descriptions.push((handle.id(), description));
    }

    /// Wait for every spawned unit and report the first failure, if any.
    pub async fn join(mut self) -> Result<(), GroupError> {
        self.drain().await;
        self.into_result()
    }

    /// Join point for code that ran inside the group's scope.
    ///
    /// Always waits for every unit. An error from the scope body is returned
    /// unchanged and any unit failure is discarded; otherwise the first unit
    /// failure is returned.
    pub async fn finish<T>(mut self, body: anyhow::Result<T>) -> anyhow::Result<T> {
        self.drain().await;
        match body {
            Err(error) => {
                if let Err(unit_error) = self.into_result() {
                    debug!(
                        unit = %unit_error.failed_unit(),
                        "Discarding unit failure in favour of scope error"
                    );
                }
                Err(error)
            }
            Ok(value) => {
                self.into_result()?;
                Ok(value)
            }
        }
    }

    /// Run `body` with a fresh group and join it with [`finish`](Self::finish).
    pub async fn scoped<T, F>(ctx: &RequestContext, body: F) -> anyhow::Result<T>
    where
        F: for<'g> FnOnce(&'g mut ConcurrencyGroup) -> BoxFuture<'g, anyhow::Result<T>>,
    {
        let mut group = ConcurrencyGroup::new(ctx);
        let result = body(&mut group).await;
        group.finish(result).await
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.set.join_next().await {
            let Err(join_error) = joined else {
                continue;
            };
            let description = self.description_of(join_error.id());
            let error = if join_error.is_panic() {
                anyhow::anyhow!("unit panicked: {}", panic_message(join_error))
            } else {
                anyhow::anyhow!("unit was cancelled")
            };
            warn!(unit = %description, error = %error, "Unit did not complete");
            FailureSlot::record(&self.failures, &description, error);
        }
    }

    fn description_of(&self, id: Id) -> String {
        self.descriptions
            .iter()
            .find(|(task_id, _)| *task_id == id)
            .map(|(_, description)| description.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn into_result(self) -> Result<(), GroupError> {
        let mut slot = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.first.take() {
            Some(first) => Err(GroupError::UnitFailed {
                description: first.description,
                failed_units: slot.count,
                source: first.error,
            }),
            None => Ok(()),
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("scope body failed")]
    struct ScopeFailure;

    fn ctx() -> RequestContext {
        RequestContext::new("user", "tenant")
    }

    #[tokio::test]
    async fn test_empty_group_joins_immediately() {
        let group = ConcurrencyGroup::new(&ctx());
        assert!(group.is_empty());
        group.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_all_units_succeed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut group = ConcurrencyGroup::new(&ctx());
        for i in 0..10 {
            let counter = Arc::clone(&counter);
            group.spawn(format!("unit-{i}"), move |_ctx| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(group.len(), 10);
        group.join().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_unit_receives_group_context() {
        let parent = ctx();
        let mut group = ConcurrencyGroup::new(&parent);
        let expected = parent.request_id.clone();
        group.spawn("check-ctx", move |mut ctx| async move {
            anyhow::ensure!(ctx.request_id == expected, "context not propagated");
            ctx.current_instance = Some("mutated".to_string());
            Ok(())
        });
        group.join().await.unwrap();
        assert!(parent.current_instance.is_none());
    }

    #[tokio::test]
    async fn test_scope_error_wins_and_children_drain() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = ConcurrencyGroup::new(&ctx());
        for i in 0..5 {
            let finished = Arc::clone(&finished);
            group.spawn(format!("child-{i}"), move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                if i == 3 {
                    anyhow::bail!("child 3 failed");
                }
                Ok(())
            });
        }

        let body: anyhow::Result<()> = Err(ScopeFailure.into());
        let err = group.finish(body).await.unwrap_err();

        assert!(err.downcast_ref::<ScopeFailure>().is_some());
        assert_eq!(finished.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_scoped_reports_child_failure_when_body_succeeds() {
        let err = ConcurrencyGroup::scoped(&ctx(), |group| {
            Box::pin(async move {
                group.spawn("ok", |_ctx| async { Ok(()) });
                group.spawn("broken", |_ctx| async { anyhow::bail!("boom") });
                Ok(())
            })
        })
        .await
        .unwrap_err();

        let group_err = err.downcast_ref::<GroupError>().unwrap();
        assert_eq!(group_err.failed_unit(), "broken");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_single_failure_reported_once_among_many() {
        let failing = (uuid::Uuid::new_v4().as_u128() % 100) as usize;
        let mut group = ConcurrencyGroup::new(&ctx());
        for i in 0..100usize {
            group.spawn(format!("unit-{i}"), move |_ctx| async move {
                let jitter = (i * 7919 % 13) as u64;
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                if i == failing {
                    anyhow::bail!("unit {i} failed");
                }
                Ok(())
            });
        }

        match group.join().await.unwrap_err() {
            GroupError::UnitFailed {
                description,
                failed_units,
                source,
            } => {
                assert_eq!(description, format!("unit-{failing}"));
                assert_eq!(failed_units, 1);
                assert_eq!(source.to_string(), format!("unit {failing} failed"));
            }
        }
    }

    #[tokio::test]
    async fn test_first_of_several_failures_wins() {
        let mut group = ConcurrencyGroup::new(&ctx());
        group.spawn("fast", |_ctx| async { anyhow::bail!("fast failure") });
        group.spawn("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            anyhow::bail!("slow failure")
        });

        let err = group.join().await.unwrap_err();
        assert_eq!(err.failed_unit(), "fast");
        let GroupError::UnitFailed { failed_units, .. } = err;
        assert_eq!(failed_units, 2);
    }

    #[tokio::test]
    async fn test_panicking_unit_is_reported_not_propagated() {
        let mut group = ConcurrencyGroup::new(&ctx());
        group.spawn("panics", |_ctx| async { panic!("kaboom") });
        group.spawn("fine", |_ctx| async { Ok(()) });

        let err = group.join().await.unwrap_err();
        assert_eq!(err.failed_unit(), "panics");
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_pool_size_bounds_running_units() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group = ConcurrencyGroup::with_pool_size(&ctx(), 3);
        for i in 0..12 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            group.spawn(format!("unit-{i}"), move |_ctx| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        group.join().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
