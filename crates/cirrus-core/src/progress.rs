// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning progress: steps and per-instance events.
//!
//! A [`ProvisionStep`] expects `total` events. Its `completed` and
//! `successful` fields are never written directly; [`ProgressTracker::refresh`]
//! derives them from the recorded events:
//!
//! - `completed` is the number of events recorded.
//! - `successful` stays `None` while fewer than `total` events exist. The
//!   first refresh that sees `total` events sets it to whether the first
//!   `total` events (in insertion order) all succeeded.
//! - Steps with `successful` set are skipped by later refreshes, so late
//!   events never change the outcome.
//!
//! Units spawned in parallel share one step through [`ProgressTracker::step_for`],
//! which serializes first callers per cluster, step name and request. A step
//! left incomplete by one operation is never reused by the next.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::model::{ClusterEvent, Instance, ProvisionStep};
use crate::persistence::Persistence;

/// Step type used when the context does not name one.
pub const DEFAULT_STEP_TYPE: &str = "Provisioning";

/// Description of a step a unit of work reports into.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    /// Number of units expected to report.
    pub total: u32,
    /// Record a success event when the unit returns `Ok`. When false, only
    /// failures are recorded automatically.
    pub mark_successful_on_exit: bool,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, total: u32) -> Self {
        Self {
            name: name.into(),
            total,
            mark_successful_on_exit: true,
        }
    }

    pub fn failures_only(mut self) -> Self {
        self.mark_successful_on_exit = false;
        self
    }
}

/// What an event is about.
#[derive(Debug, Clone, Copy)]
pub enum EventTarget<'a> {
    /// Step-level outcome.
    Cluster(&'a str),
    /// Outcome for one node.
    Instance {
        cluster_id: &'a str,
        instance: &'a Instance,
    },
}

impl<'a> EventTarget<'a> {
    pub fn cluster_id(&self) -> &'a str {
        match self {
            Self::Cluster(cluster_id) => cluster_id,
            Self::Instance { cluster_id, .. } => cluster_id,
        }
    }

    pub fn instance(&self) -> Option<&'a Instance> {
        match self {
            Self::Cluster(_) => None,
            Self::Instance { instance, .. } => Some(instance),
        }
    }
}

/// `(cluster_id, step_name, request_id)`: units of one operation share a step.
type StepKey = (String, String, String);

#[derive(Default)]
struct StepSlot {
    /// Held while the first caller creates the step.
    init: tokio::sync::Mutex<()>,
    step_id: Mutex<Option<String>>,
}

impl StepSlot {
    fn step_id(&self) -> Option<String> {
        self.step_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_step_id(&self, step_id: String) {
        *self.step_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(step_id);
    }
}

/// In-flight steps of running operations.
#[derive(Default)]
struct StepRegistry {
    slots: Mutex<HashMap<StepKey, Arc<StepSlot>>>,
}

impl StepRegistry {
    fn slot(&self, cluster_id: &str, step_name: &str, request_id: &str) -> Arc<StepSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry((
                    cluster_id.to_string(),
                    step_name.to_string(),
                    request_id.to_string(),
                ))
                .or_default(),
        )
    }

    /// Forget a finished step so the name can start a new one.
    fn release(&self, cluster_id: &str, step_name: &str, step_id: &str) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(cid, name, _), slot| {
                !(cid == cluster_id
                    && name == step_name
                    && slot.step_id().as_deref() == Some(step_id))
            });
    }

    fn clear_cluster(&self, cluster_id: &str) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(cid, _, _), _| cid != cluster_id);
    }

    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Records provision steps and events and derives step outcomes.
pub struct ProgressTracker {
    persistence: Arc<dyn Persistence>,
    registry: StepRegistry,
    enabled: bool,
}

impl ProgressTracker {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            registry: StepRegistry::default(),
            enabled: true,
        }
    }

    /// Tracker that records nothing; [`wrap`](Self::wrap) just runs the unit.
    pub fn disabled(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            enabled: false,
            ..Self::new(persistence)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Create a step with nothing completed yet.
    ///
    /// Earlier steps of the cluster are refreshed first.
    pub async fn begin_step(
        &self,
        cluster_id: &str,
        step_name: &str,
        step_type: &str,
        total: u32,
    ) -> Result<String, CoreError> {
        self.refresh(cluster_id).await?;

        let step = ProvisionStep {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.to_string(),
            step_name: step_name.to_string(),
            step_type: step_type.to_string(),
            total,
            completed: 0,
            successful: None,
            created_at: Utc::now(),
        };
        self.persistence.add_provision_step(&step).await?;
        debug!(
            cluster_id = %cluster_id,
            step_id = %step.id,
            step_name = %step_name,
            total = total,
            "Provision step started"
        );
        Ok(step.id)
    }

    /// Append one outcome to a step.
    pub async fn record_event(
        &self,
        step_id: &str,
        instance: Option<&Instance>,
        message: &str,
        successful: bool,
    ) -> Result<(), CoreError> {
        let step = self
            .persistence
            .get_provision_step(step_id)
            .await?
            .ok_or_else(|| CoreError::StepNotFound {
                step_id: step_id.to_string(),
            })?;

        let event = ClusterEvent {
            id: uuid::Uuid::new_v4().to_string(),
            step_id: step_id.to_string(),
            cluster_id: step.cluster_id,
            node_group_id: instance.map(|i| i.node_group_id.clone()),
            instance_id: instance.and_then(|i| i.instance_id.clone()),
            instance_name: instance.map(|i| i.instance_name.clone()),
            event_info: message.to_string(),
            successful,
            created_at: Utc::now(),
        };
        self.persistence.add_cluster_event(&event).await
    }

    /// Recompute derived fields of every non-terminal step of a cluster.
    pub async fn refresh(&self, cluster_id: &str) -> Result<(), CoreError> {
        for step in self.persistence.list_provision_steps(cluster_id).await? {
            if step.is_terminal() {
                continue;
            }

            let events = self
                .persistence
                .list_cluster_events(cluster_id, Some(&step.id))
                .await?;
            let completed = u32::try_from(events.len()).unwrap_or(u32::MAX);
            let successful = (completed >= step.total).then(|| {
                events
                    .iter()
                    .take(step.total as usize)
                    .all(|event| event.successful)
            });

            if completed == step.completed && successful.is_none() {
                continue;
            }
            self.persistence
                .update_provision_step(&step.id, completed, successful)
                .await?;

            if let Some(successful) = successful {
                debug!(
                    cluster_id = %cluster_id,
                    step_name = %step.step_name,
                    successful = successful,
                    "Provision step finished"
                );
                self.registry.release(cluster_id, &step.step_name, &step.id);
            }
        }
        Ok(())
    }

    /// Events of a cluster, or of one of its steps, oldest first.
    pub async fn events_for(
        &self,
        cluster_id: &str,
        step_id: Option<&str>,
    ) -> Result<Vec<ClusterEvent>, CoreError> {
        self.persistence
            .list_cluster_events(cluster_id, step_id)
            .await
    }

    /// Most recently created step of a cluster.
    pub async fn current_step(&self, cluster_id: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .persistence
            .list_provision_steps(cluster_id)
            .await?
            .pop()
            .map(|step| step.id))
    }

    /// Step shared by every unit of one operation reporting under `step_name`.
    ///
    /// The first caller creates it; concurrent callers with the same request
    /// id wait for it and reuse the id. A step that finished, or was removed,
    /// is replaced by a new one.
    pub async fn step_for(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        step_name: &str,
        total: u32,
    ) -> Result<String, CoreError> {
        let slot = self.registry.slot(cluster_id, step_name, &ctx.request_id);
        let _init = slot.init.lock().await;
        if let Some(id) = slot.step_id() {
            let open = self
                .persistence
                .get_provision_step(&id)
                .await?
                .is_some_and(|step| !step.is_terminal());
            if open {
                return Ok(id);
            }
        }
        let step_type = ctx.step_type.as_deref().unwrap_or(DEFAULT_STEP_TYPE);
        let id = self
            .begin_step(cluster_id, step_name, step_type, total)
            .await?;
        slot.set_step_id(id.clone());
        Ok(id)
    }

    /// Run `unit` as part of a step and record its outcome.
    ///
    /// Tracking failures are logged and never change the unit's result.
    pub async fn wrap<T, Fut>(
        &self,
        ctx: &RequestContext,
        spec: &StepSpec,
        target: EventTarget<'_>,
        unit: Fut,
    ) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.enabled {
            return unit.await;
        }

        let cluster_id = target.cluster_id();
        let step_id = match self.step_for(ctx, cluster_id, &spec.name, spec.total).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(cluster_id = %cluster_id, step = %spec.name, error = %e, "Failed to begin provision step");
                None
            }
        };

        let result = unit.await;

        if let Some(step_id) = step_id {
            let outcome = match &result {
                Ok(_) if spec.mark_successful_on_exit => Some((String::new(), true)),
                Ok(_) => None,
                Err(e) => Some((format!("{e:#}"), false)),
            };
            if let Some((message, successful)) = outcome
                && let Err(e) = self
                    .record_event(&step_id, target.instance(), &message, successful)
                    .await
            {
                warn!(cluster_id = %cluster_id, step_id = %step_id, error = %e, "Failed to record event");
            }
        }

        result
    }

    /// Record a success for the current unit's node under a shared step.
    pub async fn record_success(
        &self,
        ctx: &RequestContext,
        spec: &StepSpec,
        target: EventTarget<'_>,
    ) -> Result<(), CoreError> {
        if !self.enabled {
            return Ok(());
        }
        let step_id = self
            .step_for(ctx, target.cluster_id(), &spec.name, spec.total)
            .await?;
        self.record_event(&step_id, target.instance(), "", true)
            .await
    }

    /// Forget in-flight steps of a cluster and drop its recorded progress.
    pub async fn clear_cluster(&self, cluster_id: &str) -> Result<(), CoreError> {
        self.registry.clear_cluster(cluster_id);
        self.persistence.delete_cluster_progress(cluster_id).await
    }

    /// Number of `(cluster, step)` pairs currently tracked.
    pub fn in_flight_steps(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cluster, NodeGroup};
    use crate::persistence::MemoryPersistence;

    async fn setup() -> (Arc<MemoryPersistence>, ProgressTracker, String) {
        let db = Arc::new(MemoryPersistence::new());
        let cluster = Cluster::new("c", "t", "fake", "0.1", vec![NodeGroup::new("w", "s", 2)]);
        db.create_cluster(&cluster).await.unwrap();
        let tracker = ProgressTracker::new(db.clone());
        (db, tracker, cluster.id)
    }

    fn instance(name: &str) -> Instance {
        Instance {
            id: name.to_string(),
            node_group_id: "ng".to_string(),
            instance_id: Some(format!("prov-{name}")),
            instance_name: name.to_string(),
            internal_ip: None,
            management_ip: None,
        }
    }

    #[tokio::test]
    async fn test_step_outcome_set_once_when_total_reached() {
        let (db, tracker, cluster_id) = setup().await;
        let step = tracker
            .begin_step(&cluster_id, "Wait for instances", "Engine", 2)
            .await
            .unwrap();

        tracker.record_event(&step, None, "failed", false).await.unwrap();
        tracker.refresh(&cluster_id).await.unwrap();
        let s = db.get_provision_step(&step).await.unwrap().unwrap();
        assert_eq!(s.completed, 1);
        assert_eq!(s.successful, None);

        tracker.record_event(&step, None, "", true).await.unwrap();
        tracker.refresh(&cluster_id).await.unwrap();
        let s = db.get_provision_step(&step).await.unwrap().unwrap();
        assert_eq!(s.completed, 2);
        assert_eq!(s.successful, Some(false));

        tracker.record_event(&step, None, "", true).await.unwrap();
        tracker.refresh(&cluster_id).await.unwrap();
        let s = db.get_provision_step(&step).await.unwrap().unwrap();
        assert_eq!(s.completed, 2);
        assert_eq!(s.successful, Some(false));
    }

    #[tokio::test]
    async fn test_all_successful_events_mark_step_successful() {
        let (db, tracker, cluster_id) = setup().await;
        let step = tracker
            .begin_step(&cluster_id, "Configure", "Plugin", 2)
            .await
            .unwrap();
        let (a, b) = (instance("a"), instance("b"));
        tracker.record_event(&step, Some(&a), "", true).await.unwrap();
        tracker.record_event(&step, Some(&b), "", true).await.unwrap();
        tracker.refresh(&cluster_id).await.unwrap();

        let s = db.get_provision_step(&step).await.unwrap().unwrap();
        assert_eq!(s.successful, Some(true));

        let events = tracker.events_for(&cluster_id, Some(&step)).await.unwrap();
        let names: Vec<_> = events.iter().filter_map(|e| e.instance_name.clone()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(events[0].instance_id.as_deref(), Some("prov-a"));
    }

    #[tokio::test]
    async fn test_current_step_is_latest() {
        let (_db, tracker, cluster_id) = setup().await;
        assert_eq!(tracker.current_step(&cluster_id).await.unwrap(), None);
        tracker.begin_step(&cluster_id, "one", "x", 1).await.unwrap();
        let second = tracker.begin_step(&cluster_id, "two", "x", 1).await.unwrap();
        assert_eq!(
            tracker.current_step(&cluster_id).await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_concurrent_step_for_creates_one_step() {
        let (db, tracker, cluster_id) = setup().await;
        let tracker = Arc::new(tracker);
        let ctx = RequestContext::new("u", "t").with_step_type("Engine: create cluster");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let tracker = Arc::clone(&tracker);
            let ctx = ctx.clone();
            let cluster_id = cluster_id.clone();
            handles.push(tokio::spawn(async move {
                tracker.step_for(&ctx, &cluster_id, "Assign IPs", 20).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let steps = db.list_provision_steps(&cluster_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, "Engine: create cluster");
    }

    #[tokio::test]
    async fn test_wrap_records_one_event_per_invocation() {
        let (db, tracker, cluster_id) = setup().await;
        let ctx = RequestContext::new("u", "t");
        let spec = StepSpec::new("Start processes", 2);
        let (a, b) = (instance("a"), instance("b"));

        let ok = tracker
            .wrap(
                &ctx,
                &spec,
                EventTarget::Instance {
                    cluster_id: &cluster_id,
                    instance: &a,
                },
                async { Ok(1) },
            )
            .await
            .unwrap();
        assert_eq!(ok, 1);

        let err = tracker
            .wrap::<(), _>(
                &ctx,
                &spec,
                EventTarget::Instance {
                    cluster_id: &cluster_id,
                    instance: &b,
                },
                async { anyhow::bail!("datanode did not start") },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("datanode"));

        tracker.refresh(&cluster_id).await.unwrap();
        let steps = db.list_provision_steps(&cluster_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].successful, Some(false));

        let events = tracker.events_for(&cluster_id, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].event_info.contains("datanode did not start"));
        assert_eq!(tracker.in_flight_steps(), 0);
    }

    #[tokio::test]
    async fn test_failures_only_spec_skips_success_events() {
        let (_db, tracker, cluster_id) = setup().await;
        let ctx = RequestContext::new("u", "t");
        let spec = StepSpec::new("Wait", 1).failures_only();

        tracker
            .wrap(&ctx, &spec, EventTarget::Cluster(&cluster_id), async {
                Ok(())
            })
            .await
            .unwrap();

        assert!(tracker.events_for(&cluster_id, None).await.unwrap().is_empty());
        tracker
            .record_success(&ctx, &spec, EventTarget::Cluster(&cluster_id))
            .await
            .unwrap();
        assert_eq!(tracker.events_for(&cluster_id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_tracker_only_runs_unit() {
        let db = Arc::new(MemoryPersistence::new());
        let tracker = ProgressTracker::disabled(db.clone());
        let ctx = RequestContext::new("u", "t");

        let value = tracker
            .wrap(
                &ctx,
                &StepSpec::new("x", 1),
                EventTarget::Cluster("missing-cluster"),
                async { Ok("ran") },
            )
            .await
            .unwrap();

        assert_eq!(value, "ran");
        assert!(db.list_provision_steps("missing-cluster").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_step_is_not_reused_by_next_operation() {
        let (db, tracker, cluster_id) = setup().await;
        let spec = StepSpec::new("Wait for instances to become accessible", 2);
        let a = instance("a");

        // Only one of two units reports; the other never returns.
        let first = RequestContext::new("u", "t");
        tracker
            .wrap(
                &first,
                &spec,
                EventTarget::Instance {
                    cluster_id: &cluster_id,
                    instance: &a,
                },
                async { Ok(()) },
            )
            .await
            .unwrap();

        let second = RequestContext::new("u", "t");
        let spec = StepSpec::new("Wait for instances to become accessible", 1);
        tracker
            .wrap(
                &second,
                &spec,
                EventTarget::Instance {
                    cluster_id: &cluster_id,
                    instance: &a,
                },
                async { Ok(()) },
            )
            .await
            .unwrap();
        tracker.refresh(&cluster_id).await.unwrap();

        let steps = db.list_provision_steps(&cluster_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!((steps[0].total, steps[0].completed), (2, 1));
        assert_eq!(steps[0].successful, None);
        assert_eq!((steps[1].total, steps[1].completed), (1, 1));
        assert_eq!(steps[1].successful, Some(true));
    }

    #[tokio::test]
    async fn test_finished_step_is_replaced_within_operation() {
        let (db, tracker, cluster_id) = setup().await;
        let ctx = RequestContext::new("u", "t");

        let first = tracker.step_for(&ctx, &cluster_id, "Start", 1).await.unwrap();
        tracker.record_event(&first, None, "", true).await.unwrap();
        tracker.refresh(&cluster_id).await.unwrap();
        assert_eq!(tracker.in_flight_steps(), 0);

        let second = tracker.step_for(&ctx, &cluster_id, "Start", 1).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(db.list_provision_steps(&cluster_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_release_while_step_is_being_joined() {
        let (_db, tracker, cluster_id) = setup().await;
        let ctx = RequestContext::new("u", "t");
        let step = tracker.step_for(&ctx, &cluster_id, "Start", 1).await.unwrap();

        let slot = tracker.registry.slot(&cluster_id, "Start", &ctx.request_id);
        let _joining = slot.init.lock().await;
        tracker.record_event(&step, None, "", true).await.unwrap();
        tracker.refresh(&cluster_id).await.unwrap();

        assert_eq!(tracker.in_flight_steps(), 0);
    }

    #[tokio::test]
    async fn test_clear_cluster_forgets_steps() {
        let (db, tracker, cluster_id) = setup().await;
        let ctx = RequestContext::new("u", "t");
        tracker.step_for(&ctx, &cluster_id, "a", 5).await.unwrap();
        assert_eq!(tracker.in_flight_steps(), 1);

        tracker.clear_cluster(&cluster_id).await.unwrap();

        assert_eq!(tracker.in_flight_steps(), 0);
        assert!(db.list_provision_steps(&cluster_id).await.unwrap().is_empty());
    }
}
