use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use strata_server::actor::{Actor, ActorAction, ActorContext};

use crate::chunk_tracker::{ChunkAvailabilityTracker, ChunkTrackerOptions, TrackerContext};
use crate::controller::{ControllerActor, ControllerEvent, ControllerOptions, OperationState};
use crate::error::{ControllerError, ControllerResult};
use crate::lifecycle::{
    AbortReason, JobLifecycleManager, LifecycleContext, LifecycleOptions, LifecycleOutcome,
};
use crate::metrics::OperationProgress;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::snapshot::{SnapshotCoordinator, SnapshotOptions};
use crate::task::TaskTable;

impl Actor for ControllerActor {
    type Message = ControllerEvent;
    type Options = ControllerOptions;
    type Error = ControllerError;

    fn new(options: ControllerOptions) -> Self {
        let tasks = TaskTable::default();
        let scheduler = Scheduler::new(SchedulerOptions::from(&options), &tasks);
        let chunk_tracker = ChunkAvailabilityTracker::new(
            ChunkTrackerOptions::from(&options),
            options.input_prober.clone(),
            options.intermediate_prober.clone(),
        );
        let lifecycle = JobLifecycleManager::new(LifecycleOptions::from(&options));
        let snapshots = SnapshotCoordinator::new(SnapshotOptions::from(&options));
        Self {
            options,
            state: OperationState::Preparing,
            tasks,
            scheduler,
            chunk_tracker,
            lifecycle,
            snapshots,
            transactions: vec![],
            known_nodes: HashSet::new(),
        }
    }

    fn start(&mut self, _ctx: &mut ActorContext<Self>) -> ControllerResult<()> {
        debug!("operation controller started");
        Ok(())
    }

    fn receive(
        &mut self,
        ctx: &mut ActorContext<Self>,
        message: ControllerEvent,
    ) -> ControllerResult<ActorAction> {
        debug!("controller received event {}", message.name());
        let action = match message {
            ControllerEvent::Initialize {
                plan,
                clean_start,
                result,
            } => self.handle_initialize(ctx, plan, clean_start, result),
            ControllerEvent::SnapshotDownloaded { plan, data, result } => {
                self.handle_snapshot_downloaded(ctx, plan, data, result)
            }
            ControllerEvent::RevivalValidated {
                plan,
                snapshot,
                alive,
                result,
            } => self.handle_revival_validated(ctx, plan, *snapshot, alive, result),
            ControllerEvent::ScheduleJob { context, result } => {
                self.handle_schedule_job(ctx, context, result)
            }
            ControllerEvent::JobStarted { job_id, time } => self.handle_job_started(job_id, time),
            ControllerEvent::JobRunning(summary) => self.handle_job_running(ctx, summary),
            ControllerEvent::JobCompleted(summary) => self.handle_job_completed(ctx, summary),
            ControllerEvent::JobFailed(summary) => self.handle_job_failed(ctx, summary),
            ControllerEvent::JobAborted(summary) => self.handle_job_aborted(ctx, summary),
            ControllerEvent::InputChunkLocated {
                chunk_id,
                replicas,
                missing,
            } => self.handle_input_chunk_located(ctx, chunk_id, replicas, missing),
            ControllerEvent::IntermediateChunkLocated {
                chunk_id,
                replicas,
                missing,
            } => self.handle_intermediate_chunk_located(ctx, chunk_id, replicas, missing),
            ControllerEvent::ChunkListsAllocated {
                cell_tag,
                count,
                result,
            } => self.handle_chunk_lists_allocated(cell_tag, count, result),
            ControllerEvent::ExecNodesUpdated { nodes } => self.handle_exec_nodes_updated(nodes),
            ControllerEvent::SnapshotTick => self.handle_snapshot_tick(ctx),
            ControllerEvent::SnapshotUploaded { cookie, result } => {
                self.handle_snapshot_uploaded(ctx, cookie, result)
            }
            ControllerEvent::CheckSuspiciousJobs => self.handle_check_suspicious_jobs(ctx),
            ControllerEvent::ObserveProgress { result } => {
                let _ = result.send(self.update_progress());
                ActorAction::Continue
            }
            ControllerEvent::Resume => self.handle_resume(),
            ControllerEvent::AbortOperation { reason } => self.handle_abort_operation(ctx, reason),
            ControllerEvent::Shutdown => ActorAction::Stop,
        };
        self.after_event(ctx);
        Ok(action)
    }

    fn stop(mut self, _ctx: &mut ActorContext<Self>) -> ControllerResult<()> {
        self.chunk_tracker.stop_probers();
        self.snapshots.dispose(self.options.host.as_ref());
        info!(
            "operation controller stopped in state {}",
            self.state.status()
        );
        Ok(())
    }
}

impl ControllerActor {
    pub(super) fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub(super) fn with_lifecycle<T>(
        &mut self,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut JobLifecycleManager, &mut LifecycleContext<'_>) -> T,
    ) -> T {
        let mut cx = LifecycleContext {
            tasks: &mut self.tasks,
            scheduler: &mut self.scheduler,
            chunk_tracker: &mut self.chunk_tracker,
            snapshots: &mut self.snapshots,
            host: self.options.host.as_ref(),
            metrics: self.options.metrics.as_ref(),
            known_nodes: &self.known_nodes,
            now,
        };
        f(&mut self.lifecycle, &mut cx)
    }

    pub(super) fn with_tracker<T>(
        &mut self,
        f: impl FnOnce(&mut ChunkAvailabilityTracker, &mut TrackerContext<'_>) -> T,
    ) -> T {
        let mut cx = TrackerContext {
            tasks: &mut self.tasks,
            scheduler: &mut self.scheduler,
            snapshots: &mut self.snapshots,
        };
        f(&mut self.chunk_tracker, &mut cx)
    }

    /// Applies the result of a job transition to the operation.
    pub(super) fn apply_outcome(
        &mut self,
        ctx: &mut ActorContext<Self>,
        outcome: ControllerResult<LifecycleOutcome>,
    ) -> ActorAction {
        match outcome {
            Ok(LifecycleOutcome::Continue) => ActorAction::Continue,
            Ok(LifecycleOutcome::Suspend(reason)) => {
                self.suspend(reason);
                ActorAction::Continue
            }
            Err(e) => self.fail_operation(ctx, e),
        }
    }

    pub(super) fn suspend(&mut self, reason: String) {
        if self.state != OperationState::Running {
            return;
        }
        warn!("operation is suspended: {reason}");
        self.options.host.on_operation_suspended(&reason);
        self.state = OperationState::Suspended { reason };
    }

    pub(super) fn fail_operation(
        &mut self,
        ctx: &mut ActorContext<Self>,
        error: ControllerError,
    ) -> ActorAction {
        if self.state.is_finished() {
            return ActorAction::warn(format!(
                "ignoring error after the operation has finished: {error}"
            ));
        }
        let error = error.into_operation_failure();
        error!("operation failed: {error}");
        self.state = OperationState::Failed;
        self.abort_all_joblets(AbortReason::Scheduler);
        self.options.host.on_operation_failed(&error);
        self.finalize(ctx);
        ActorAction::Continue
    }

    pub(super) fn abort_operation(&mut self, ctx: &mut ActorContext<Self>, reason: &str) {
        if self.state.is_finished() {
            return;
        }
        info!("operation is aborted: {reason}");
        self.state = OperationState::Aborted;
        self.abort_all_joblets(AbortReason::Scheduler);
        self.options.host.on_operation_aborted(reason);
        self.finalize(ctx);
    }

    fn complete_operation(&mut self, ctx: &mut ActorContext<Self>) {
        info!("operation completed");
        self.state = OperationState::Completed;
        self.options.host.on_operation_completed();
        self.finalize(ctx);
    }

    pub(super) fn abort_all_joblets(&mut self, reason: AbortReason) {
        let result = self.with_lifecycle(Utc::now(), |lifecycle, cx| {
            lifecycle.abort_all_joblets(cx, reason)
        });
        if let Err(e) = result {
            warn!("failed to abort joblets: {e}");
        }
    }

    /// Stops the background work of a finished operation and flushes its node.
    fn finalize(&mut self, ctx: &mut ActorContext<Self>) {
        self.chunk_tracker.stop_probers();
        let host = self.options.host.clone();
        ctx.spawn(async move {
            if let Err(e) = host.flush_operation_node().await {
                error!("failed to flush operation node: {e}");
            }
        });
        self.update_progress();
    }

    fn after_event(&mut self, ctx: &mut ActorContext<Self>) {
        if !self.state.is_active() {
            return;
        }
        if let Err(e) = self.validate() {
            self.fail_operation(ctx, e);
            return;
        }
        if self.update_completion() {
            self.complete_operation(ctx);
            return;
        }
        self.update_progress();
    }

    fn validate(&self) -> ControllerResult<()> {
        if cfg!(debug_assertions) {
            self.scheduler.validate(&self.tasks)?;
            self.chunk_tracker.validate()?;
        }
        Ok(())
    }

    /// Marks finished tasks completed and closes the pools they feed.
    /// Returns whether every task is completed.
    fn update_completion(&mut self) -> bool {
        let mut changed = true;
        while changed {
            changed = false;
            let indices = self.tasks.indices().collect::<Vec<_>>();
            for index in indices {
                let Some(task) = self.tasks.get_mut(index) else {
                    continue;
                };
                if !task.check_completed() {
                    continue;
                }
                changed = true;
                let destination = task.destination();
                self.scheduler.update_task(&mut self.tasks, index);
                let Some(destination) = destination else {
                    continue;
                };
                let Some(target) = self.tasks.get(destination) else {
                    continue;
                };
                let upstream_completed = target
                    .upstream()
                    .iter()
                    .all(|x| self.tasks.get(*x).is_some_and(|t| t.is_completed()));
                if !upstream_completed {
                    continue;
                }
                if let Some(target) = self.tasks.get_mut(destination) {
                    if !target.pool().is_finished() {
                        debug!("input of task {} is complete", target.title());
                        target.pool_mut().finish();
                    }
                }
                self.scheduler.update_task(&mut self.tasks, destination);
            }
        }
        self.tasks.all_completed()
    }

    pub(super) fn update_progress(&self) -> OperationProgress {
        let counters = self.lifecycle.counters();
        let progress = OperationProgress {
            pending: self.tasks.pending_job_count(),
            total: self.tasks.iter().map(|x| x.total_job_count()).sum(),
            running: self.lifecycle.joblet_count(),
            completed: counters.completed,
            failed: counters.failed,
            aborted: counters.aborted,
            lost: self.chunk_tracker.lost_job_count(),
            needed_resources: self.tasks.needed_resources(),
        };
        self.options.progress.update(&progress);
        progress
    }
}
