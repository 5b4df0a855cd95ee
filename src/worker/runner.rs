//! One control-loop cycle of a convergence worker
//!
//! Every dirty group is converged in its own task. A group is only worked on
//! while this worker holds the group's lock; groups locked by another worker
//! are skipped until the next cycle. The dirty flag is cleared only after a
//! fully successful run, and only at the version seen when the cycle began.

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{warn, Instrument};

use crate::config::ConvergeConfig;
use crate::convergence::{ConvergenceStep, NetworkAddressPolicy, Planner, Request};
use crate::coordination::store::join_path;
use crate::coordination::{
    locked, CallOutcome, CoordinationStore, CreateOrSetError, DirtyFlags, DirtyGroup,
    DistributedLock, GroupKey, MarkCleanOutcome, PollingLock, StoreError,
};
use crate::events::{Event, EventSink};
use crate::observability::{convergence_metrics, OperationTimer};
use crate::telemetry::{create_convergence_span, generate_correlation_id};

use super::traits::{GroupStateSource, RequestExecutor, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub lock_root: String,
    pub poll_interval: Duration,
    pub worker_id: String,
}

impl RunnerSettings {
    pub fn from_config(config: &ConvergeConfig) -> Self {
        Self {
            lock_root: config.coordination.lock_root.clone(),
            poll_interval: config.coordination.poll_interval(),
            worker_id: config.worker.id.clone(),
        }
    }
}

/// What a completed group run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRun {
    pub steps: usize,
    pub status: StepStatus,
    /// `None` when the run was not successful and the flag was left alone
    pub clean: Option<MarkCleanOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Converged(GroupRun),
    /// Another worker holds the group's lock
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub groups: Vec<(GroupKey, GroupOutcome)>,
}

impl CycleReport {
    pub fn outcome(&self, group: &GroupKey) -> Option<&GroupOutcome> {
        self.groups
            .iter()
            .find(|(key, _)| key == group)
            .map(|(_, outcome)| outcome)
    }
}

pub struct ConvergenceRunner {
    store: Arc<dyn CoordinationStore>,
    dirty: DirtyFlags,
    source: Arc<dyn GroupStateSource>,
    executor: Arc<dyn RequestExecutor>,
    planner: Planner,
    sink: Arc<dyn EventSink>,
    settings: RunnerSettings,
}

impl ConvergenceRunner {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        dirty: DirtyFlags,
        source: Arc<dyn GroupStateSource>,
        executor: Arc<dyn RequestExecutor>,
        planner: Planner,
        sink: Arc<dyn EventSink>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            dirty,
            source,
            executor,
            planner,
            sink,
            settings,
        }
    }

    /// Wire a runner from configuration
    pub fn from_config(
        config: &ConvergeConfig,
        store: Arc<dyn CoordinationStore>,
        source: Arc<dyn GroupStateSource>,
        executor: Arc<dyn RequestExecutor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let dirty = DirtyFlags::new(store.clone(), &config.coordination.dirty_root, sink.clone())
            .with_retry_limit(config.coordination.create_or_set_retry_limit);
        let planner = Planner::new(
            config.convergence.build_timeout(),
            Arc::new(NetworkAddressPolicy::new(&config.convergence.address_network)),
        );
        Self::new(
            store,
            dirty,
            source,
            executor,
            planner,
            sink,
            RunnerSettings::from_config(config),
        )
    }

    pub fn dirty_flags(&self) -> &DirtyFlags {
        &self.dirty
    }

    /// The lock serializing convergence of `group` across workers
    pub fn lock_for(&self, group: &GroupKey) -> PollingLock {
        PollingLock::new(
            self.store.clone(),
            join_path(&self.settings.lock_root, &group.to_string()),
            self.settings.worker_id.clone(),
            self.settings.poll_interval,
        )
    }

    /// Ask for `group` to be converged on a later cycle
    pub async fn request_convergence(&self, group: &GroupKey) -> Result<(), CreateOrSetError> {
        self.dirty.mark_dirty(group).await
    }

    /// Converge every dirty group once
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        self.sink.emit(Event::new("converge-all-groups"));
        let dirty = match self.dirty.list_dirty().await {
            Ok(dirty) => dirty,
            Err(e) => {
                self.sink
                    .emit(Event::new("converge-all-groups-error").with_error(&e));
                return Err(e);
            }
        };

        let groups = join_all(dirty.into_iter().map(|dirty| self.run_group(dirty))).await;
        Ok(CycleReport { groups })
    }

    async fn run_group(&self, dirty: DirtyGroup) -> (GroupKey, GroupOutcome) {
        let correlation_id = generate_correlation_id();
        let span = create_convergence_span("converge_group", &dirty.group.to_string(), &correlation_id);
        let group = dirty.group.clone();

        let outcome = async {
            let lock = self.lock_for(&dirty.group);
            let outcome = match locked(
                &lock,
                || self.converge_group(&dirty.group, dirty.version),
                Some("Acquired convergence lock"),
            )
            .await
            {
                Ok((CallOutcome::Called(Ok(run)), _)) => GroupOutcome::Converged(run),
                Ok((CallOutcome::Called(Err(e)), _)) => self.non_fatal(&dirty.group, e),
                Ok((CallOutcome::NotCalled, _)) => {
                    self.sink
                        .emit(group_event("converge-lock-skipped", &dirty.group));
                    GroupOutcome::Skipped
                }
                Err(e) => self.non_fatal(&dirty.group, e.into()),
            };

            if let Err(e) = lock.release().await {
                warn!(group = %dirty.group, error = %e, "Failed to release convergence lock");
            }
            outcome
        }
        .instrument(span)
        .await;

        (group, outcome)
    }

    fn non_fatal(&self, group: &GroupKey, error: anyhow::Error) -> GroupOutcome {
        convergence_metrics().record_run_failure();
        self.sink.emit(
            group_event("converge-non-fatal-error", group).with_error(&format!("{error:#}")),
        );
        GroupOutcome::Failed(error.to_string())
    }

    /// Plan and execute one convergence of `group`. Must run under the
    /// group's lock. `version` is the dirty-flag version observed when the
    /// cycle began.
    pub async fn converge_group(&self, group: &GroupKey, version: i32) -> Result<GroupRun> {
        let timer = OperationTimer::new("converge_group");
        convergence_metrics().record_group_run();

        let (desired, servers, lb_nodes) = tokio::try_join!(
            self.source.desired_state(group),
            self.source.servers(group),
            self.source.load_balancer_nodes(group),
        )?;

        let plan = self.planner.converge(&desired, &servers, &lb_nodes, Utc::now());
        let requests: Vec<Request> = plan.iter().map(ConvergenceStep::as_request).collect();

        self.sink.emit(
            group_event("execute-convergence", group)
                .with("desired", &desired)
                .with("servers", &servers)
                .with("lb_nodes", &lb_nodes)
                .with("steps", plan.steps()),
        );

        let results = join_all(
            requests
                .iter()
                .map(|request| self.executor.execute(group, request)),
        )
        .await;
        let statuses = results.into_iter().zip(&requests).map(|(result, request)| {
            result.unwrap_or_else(|e| {
                warn!(group = %group, request = %request, error = %e, "Request failed");
                StepStatus::Retry
            })
        });
        let status = StepStatus::worst(statuses);
        convergence_metrics().record_steps_executed(requests.len());

        self.sink.emit(
            group_event("execute-convergence-results", group)
                .with("worst_status", status.to_string()),
        );

        let clean = if status == StepStatus::Success {
            Some(self.dirty.mark_clean(group, version).await?)
        } else {
            None
        };

        timer.finish();
        Ok(GroupRun {
            steps: requests.len(),
            status,
            clean,
        })
    }
}

fn group_event(event_type: &str, group: &GroupKey) -> Event {
    Event::new(event_type)
        .with("tenant_id", &group.tenant_id)
        .with("scaling_group_id", &group.group_id)
}
