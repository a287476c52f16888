use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use strata_server::actor::{ActorAction, ActorContext};
use tokio::sync::oneshot;

use crate::chunk::{ChunkReplica, ChunkSlice, ChunkStripe};
use crate::chunk_tracker::ChunkRegistration;
use crate::controller::{ControllerActor, ControllerEvent, OperationPlan, OperationState};
use crate::error::{ControllerError, ControllerResult};
use crate::host::SchedulingContext;
use crate::id::{CellTag, ChunkId, ChunkListId, JobId, NodeId, TaskIndex};
use crate::lifecycle::{
    AbortedJobSummary, CompletedJobSummary, FailedJobSummary, RunningJobSummary,
};
use crate::metrics;
use crate::scheduler::{ScheduleFailReason, ScheduleResult, Scheduler, SchedulerOptions};
use crate::snapshot::SnapshotCookie;
use crate::task::{Task, TaskArgs, TaskTable};

impl ControllerActor {
    pub(super) fn handle_initialize(
        &mut self,
        ctx: &mut ActorContext<Self>,
        plan: OperationPlan,
        clean_start: bool,
        result: oneshot::Sender<ControllerResult<()>>,
    ) -> ActorAction {
        if self.state != OperationState::Preparing {
            let _ = result.send(Err(ControllerError::invalid(format!(
                "cannot initialize an operation in state {}",
                self.state.status()
            ))));
            return ActorAction::Continue;
        }
        if clean_start {
            return self.start_clean(ctx, plan, result);
        }
        if self.snapshots.options().fail_on_job_restart {
            info!("revival is not allowed since fail_on_job_restart is set, starting clean");
            return self.start_clean(ctx, plan, result);
        }
        let storage = Arc::clone(&self.options().snapshot_storage);
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let data = storage.download_snapshot().await;
            let event = ControllerEvent::SnapshotDownloaded { plan, data, result };
            if let Err(e) = handle.send(event).await {
                error!("failed to deliver the downloaded snapshot: {e}");
            }
        });
        ActorAction::Continue
    }

    pub(super) fn start_clean(
        &mut self,
        ctx: &mut ActorContext<Self>,
        plan: OperationPlan,
        result: oneshot::Sender<ControllerResult<()>>,
    ) -> ActorAction {
        match self.prepare(plan) {
            Ok(()) => {
                self.activate(ctx);
                let _ = result.send(Ok(()));
                ActorAction::Continue
            }
            Err(e) => {
                let message = e.to_string();
                let _ = result.send(Err(ControllerError::invalid(message.clone())));
                self.fail_operation(ctx, e);
                ActorAction::warn(format!("failed to prepare operation: {message}"))
            }
        }
    }

    /// Builds the tasks of the plan and registers their input with the chunk tracker.
    fn prepare(&mut self, plan: OperationPlan) -> ControllerResult<()> {
        self.transactions = plan.transactions;
        let mut skipped = HashSet::new();
        for spec in plan.input_chunks {
            let chunk_id = spec.chunk_id;
            if self.chunk_tracker.register_input_chunk(spec)? == ChunkRegistration::Skipped {
                skipped.insert(chunk_id);
            }
        }

        let mut upstream: Vec<Vec<TaskIndex>> = vec![vec![]; plan.tasks.len()];
        for (i, spec) in plan.tasks.iter().enumerate() {
            if let Some(destination) = spec.destination {
                let Some(entry) = upstream.get_mut(destination.index()) else {
                    return Err(ControllerError::invalid(format!(
                        "task {} writes to unknown task {destination}",
                        spec.title
                    )));
                };
                entry.push(TaskIndex::from(i));
            }
        }

        let mut tasks = vec![];
        let mut stripes = vec![];
        for (i, (spec, upstream)) in plan.tasks.into_iter().zip(upstream).enumerate() {
            let index = TaskIndex::from(i);
            let has_upstream = !upstream.is_empty();
            let mut task = Task::new(TaskArgs {
                index,
                group: spec.group,
                title: spec.title,
                job_type: spec.job_type,
                capabilities: spec.capabilities,
                resources: spec.resources,
                memory_reserve: self.options().memory_reserve(),
                user_job_memory_digest: self.options().initial_user_job_digest(),
                job_proxy_memory_digest: self.options().initial_job_proxy_digest(),
                locality_timeout: self.options().locality_timeout,
                output_cells: spec.output_cells,
                destination: spec.destination,
                upstream,
            });
            for chunk_ids in spec.input_stripes {
                let slices = chunk_ids
                    .into_iter()
                    .filter(|x| !skipped.contains(x))
                    .map(|x| self.input_slice(x))
                    .collect::<ControllerResult<Vec<_>>>()?;
                if slices.is_empty() {
                    continue;
                }
                let cookie = task.pool_mut().add_stripe(ChunkStripe::new(slices));
                stripes.push((index, cookie));
            }
            if !has_upstream {
                task.pool_mut().finish();
            }
            tasks.push(task);
        }

        self.tasks = TaskTable::new(tasks);
        self.scheduler = Scheduler::new(SchedulerOptions::from(self.options()), &self.tasks);
        for (index, cookie) in stripes {
            self.chunk_tracker
                .register_input_stripe(&mut self.tasks, index, cookie)?;
        }
        info!("prepared operation with {} tasks", self.tasks.len());
        Ok(())
    }

    fn input_slice(&self, chunk_id: ChunkId) -> ControllerResult<ChunkSlice> {
        let Some(spec) = self.chunk_tracker.input_chunk_spec(chunk_id) else {
            return Err(ControllerError::invalid(format!(
                "input chunk {chunk_id} is not part of the plan"
            )));
        };
        Ok(ChunkSlice {
            chunk_id,
            data_weight: spec.data_weight,
            replicas: spec.replicas.clone(),
        })
    }

    /// Starts scheduling jobs and the periodic background work.
    pub(super) fn activate(&mut self, ctx: &mut ActorContext<Self>) {
        self.scheduler.activate(&self.tasks);
        self.scheduler.add_all_pending_hints(&mut self.tasks);
        self.state = OperationState::Running;
        self.request_chunk_lists(ctx);
        ctx.send_with_delay(
            ControllerEvent::SnapshotTick,
            self.snapshots.options().snapshot_period,
        );
        ctx.send_with_delay(
            ControllerEvent::CheckSuspiciousJobs,
            self.options().suspicious_check_period,
        );
        info!(
            "operation is running with {} pending jobs",
            self.tasks.pending_job_count()
        );
    }

    fn request_chunk_lists(&mut self, ctx: &mut ActorContext<Self>) {
        for (cell_tag, count) in self.scheduler.take_chunk_list_requests() {
            debug!("requesting {count} chunk lists for cell {cell_tag}");
            let host = Arc::clone(&self.options().host);
            let handle = ctx.handle().clone();
            ctx.spawn(async move {
                let result = host.allocate_chunk_lists(cell_tag, count).await;
                let event = ControllerEvent::ChunkListsAllocated {
                    cell_tag,
                    count,
                    result,
                };
                if let Err(e) = handle.send(event).await {
                    error!("failed to deliver allocated chunk lists: {e}");
                }
            });
        }
    }

    pub(super) fn handle_chunk_lists_allocated(
        &mut self,
        cell_tag: CellTag,
        count: usize,
        result: ControllerResult<Vec<ChunkListId>>,
    ) -> ActorAction {
        match result {
            Ok(ids) => {
                debug!("received {} chunk lists for cell {cell_tag}", ids.len());
                self.scheduler.add_chunk_lists(cell_tag, ids);
                ActorAction::Continue
            }
            Err(e) => {
                self.scheduler.cancel_chunk_list_request(cell_tag, count);
                ActorAction::warn(format!(
                    "failed to allocate {count} chunk lists for cell {cell_tag}: {e}"
                ))
            }
        }
    }

    pub(super) fn handle_schedule_job(
        &mut self,
        ctx: &mut ActorContext<Self>,
        context: Box<dyn SchedulingContext>,
        result: oneshot::Sender<ControllerResult<ScheduleResult>>,
    ) -> ActorAction {
        let running = self.state == OperationState::Running;
        let builder = Arc::clone(&self.options().job_spec_builder);
        let outcome = self.scheduler.schedule(
            context.as_ref(),
            &mut self.tasks,
            running,
            builder.as_ref(),
        );
        match outcome {
            Ok(outcome) => {
                for (reason, count) in outcome.result.failures.iter() {
                    self.options()
                        .metrics
                        .schedule_failures
                        .add(*count as u64, &[metrics::reason(reason.status())]);
                }
                if let Some(joblet) = outcome.joblet {
                    debug!(
                        "job {} of type {} is scheduled on node {}",
                        joblet.job_id, joblet.job_type, joblet.node.address
                    );
                    self.lifecycle.register(joblet);
                }
                let _ = result.send(Ok(outcome.result));
                self.request_chunk_lists(ctx);
                ActorAction::Continue
            }
            Err(e) => {
                let mut rejected = ScheduleResult::default();
                rejected.record_fail(ScheduleFailReason::OperationNotRunning);
                rejected.stop_needed = true;
                let _ = result.send(Ok(rejected));
                self.fail_operation(ctx, e)
            }
        }
    }

    pub(super) fn handle_job_started(&mut self, job_id: JobId, time: DateTime<Utc>) -> ActorAction {
        if !self.state.is_active() {
            debug!("ignoring start of job {job_id} in state {}", self.state.status());
            return ActorAction::Continue;
        }
        self.lifecycle.on_job_started(job_id, time);
        ActorAction::Continue
    }

    pub(super) fn handle_job_running(
        &mut self,
        ctx: &mut ActorContext<Self>,
        summary: RunningJobSummary,
    ) -> ActorAction {
        if !self.state.is_active() {
            return ActorAction::Continue;
        }
        let result =
            self.with_lifecycle(summary.time, |lifecycle, cx| lifecycle.on_job_running(cx, summary));
        match result {
            Ok(()) => ActorAction::Continue,
            Err(e) => self.fail_operation(ctx, e),
        }
    }

    pub(super) fn handle_job_completed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        summary: CompletedJobSummary,
    ) -> ActorAction {
        if !self.state.is_active() {
            debug!(
                "ignoring completion of job {} in state {}",
                summary.job_id,
                self.state.status()
            );
            return ActorAction::Continue;
        }
        let outcome = self.with_lifecycle(summary.time, |lifecycle, cx| {
            lifecycle.on_job_completed(cx, summary)
        });
        self.apply_outcome(ctx, outcome)
    }

    pub(super) fn handle_job_failed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        summary: FailedJobSummary,
    ) -> ActorAction {
        if !self.state.is_active() {
            debug!(
                "ignoring failure of job {} in state {}",
                summary.job_id,
                self.state.status()
            );
            return ActorAction::Continue;
        }
        let outcome = self.with_lifecycle(summary.time, |lifecycle, cx| {
            lifecycle.on_job_failed(cx, summary)
        });
        self.apply_outcome(ctx, outcome)
    }

    pub(super) fn handle_job_aborted(
        &mut self,
        ctx: &mut ActorContext<Self>,
        summary: AbortedJobSummary,
    ) -> ActorAction {
        if !self.state.is_active() {
            debug!(
                "ignoring abort of job {} in state {}",
                summary.job_id,
                self.state.status()
            );
            return ActorAction::Continue;
        }
        let outcome = self.with_lifecycle(summary.time, |lifecycle, cx| {
            lifecycle.on_job_aborted(cx, summary)
        });
        self.apply_outcome(ctx, outcome)
    }

    pub(super) fn handle_input_chunk_located(
        &mut self,
        ctx: &mut ActorContext<Self>,
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
        missing: bool,
    ) -> ActorAction {
        if !self.state.is_active() {
            return ActorAction::Continue;
        }
        let result = self.with_tracker(|tracker, cx| {
            tracker.on_input_chunk_located(cx, chunk_id, replicas, missing)
        });
        match result {
            Ok(()) => ActorAction::Continue,
            Err(e) => self.fail_operation(ctx, e),
        }
    }

    pub(super) fn handle_intermediate_chunk_located(
        &mut self,
        ctx: &mut ActorContext<Self>,
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
        missing: bool,
    ) -> ActorAction {
        if !self.state.is_active() {
            return ActorAction::Continue;
        }
        let result = self.with_tracker(|tracker, cx| {
            tracker.on_intermediate_chunk_located(cx, chunk_id, replicas, missing)
        });
        match result {
            Ok(()) => ActorAction::Continue,
            Err(e) => self.fail_operation(ctx, e),
        }
    }

    pub(super) fn handle_exec_nodes_updated(&mut self, nodes: Vec<NodeId>) -> ActorAction {
        let nodes = nodes.into_iter().collect::<HashSet<_>>();
        if nodes == self.known_nodes {
            return ActorAction::Continue;
        }
        debug!("exec nodes changed: {} known nodes", nodes.len());
        self.known_nodes = nodes;
        if self.state.is_active() {
            self.scheduler.reset_task_locality_delays(&self.tasks);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_snapshot_tick(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        if !self.state.is_active() {
            return ActorAction::Continue;
        }
        ctx.send_with_delay(
            ControllerEvent::SnapshotTick,
            self.snapshots.options().snapshot_period,
        );
        let cookie = self.snapshots.on_snapshot_started();
        self.options().metrics.snapshots_started.add(1, &[]);
        let data = match self.build_snapshot().encode() {
            Ok(x) => x,
            Err(e) => {
                self.snapshots.on_snapshot_failed(cookie);
                self.options().metrics.snapshots_failed.add(1, &[]);
                return ActorAction::warn(format!("failed to build snapshot: {e}"));
            }
        };
        debug!(
            "uploading snapshot {} of {} bytes",
            cookie.snapshot_index,
            data.len()
        );
        let storage = Arc::clone(&self.options().snapshot_storage);
        let timeout = self.snapshots.options().snapshot_timeout;
        let handle = ctx.handle().clone();
        ctx.spawn(async move {
            let result = match tokio::time::timeout(timeout, storage.upload_snapshot(data)).await {
                Ok(x) => x,
                Err(_) => Err(ControllerError::SnapshotError(format!(
                    "snapshot {} upload timed out",
                    cookie.snapshot_index
                ))),
            };
            let event = ControllerEvent::SnapshotUploaded { cookie, result };
            if let Err(e) = handle.send(event).await {
                error!("failed to deliver snapshot upload result: {e}");
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_snapshot_uploaded(
        &mut self,
        ctx: &mut ActorContext<Self>,
        cookie: SnapshotCookie,
        result: ControllerResult<()>,
    ) -> ActorAction {
        if let Err(e) = result {
            self.snapshots.on_snapshot_failed(cookie);
            self.options().metrics.snapshots_failed.add(1, &[]);
            return ActorAction::warn(format!(
                "failed to store snapshot {}: {e}",
                cookie.snapshot_index
            ));
        }
        if self.snapshots.recent_snapshot() != Some(cookie) {
            // A newer snapshot covers everything this one would release.
            return ActorAction::warn(format!(
                "snapshot {} was stored after a newer snapshot started",
                cookie.snapshot_index
            ));
        }
        info!("snapshot {} is stored", cookie.snapshot_index);
        self.options().metrics.snapshots_completed.add(1, &[]);
        let host = Arc::clone(&self.options().host);
        match self.snapshots.on_snapshot_completed(cookie, host.as_ref()) {
            Ok(()) => ActorAction::Continue,
            Err(e) => self.fail_operation(ctx, e),
        }
    }

    pub(super) fn handle_check_suspicious_jobs(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> ActorAction {
        if !self.state.is_active() {
            return ActorAction::Continue;
        }
        let count = self.lifecycle.check_suspicious_jobs(Utc::now());
        if count > 0 {
            info!("found {count} new suspicious jobs");
        }
        ctx.send_with_delay(
            ControllerEvent::CheckSuspiciousJobs,
            self.options().suspicious_check_period,
        );
        ActorAction::Continue
    }

    pub(super) fn handle_resume(&mut self) -> ActorAction {
        let OperationState::Suspended { reason } = &self.state else {
            return ActorAction::warn(format!(
                "cannot resume an operation in state {}",
                self.state.status()
            ));
        };
        info!("resuming operation suspended for: {reason}");
        self.state = OperationState::Running;
        ActorAction::Continue
    }

    pub(super) fn handle_abort_operation(
        &mut self,
        ctx: &mut ActorContext<Self>,
        reason: String,
    ) -> ActorAction {
        self.abort_operation(ctx, &reason);
        ActorAction::Continue
    }
}
