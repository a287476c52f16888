use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::chunk::{ChunkSlice, ChunkStripe};
use crate::chunk_tracker::{CompletedJobRecord, TrackerContext};
use crate::error::{ControllerError, ControllerResult, ErrorAttributes};
use crate::host::{ControllerHost, JobNodeRecord};
use crate::id::{ChunkId, ChunkTreeId, JobId, TaskIndex};
use crate::lifecycle::{
    AbortReason, AbortedJobSummary, CompletedJobSummary, FailedJobSummary, InterruptReason,
    JobCounters, JobEvent, JobLifecycleManager, JobState, Joblet, LifecycleContext,
    LifecycleOutcome, LifecycleState, RunningJobSummary, SplitDecision,
};
use crate::metrics;

impl JobLifecycleManager {
    pub fn register(&mut self, joblet: Joblet) {
        self.counters.started += 1;
        self.joblets.insert(joblet.job_id, joblet);
    }

    pub fn joblet(&self, job_id: JobId) -> Option<&Joblet> {
        self.joblets.get(&job_id)
    }

    pub fn joblets(&self) -> impl Iterator<Item = &Joblet> {
        self.joblets.values()
    }

    pub fn joblet_count(&self) -> usize {
        self.joblets.len()
    }

    pub fn counters(&self) -> JobCounters {
        self.counters
    }

    pub fn event_count(&self) -> usize {
        self.events.event_count()
    }

    pub fn on_job_started(&mut self, job_id: JobId, time: DateTime<Utc>) {
        let Some(joblet) = self.joblets.get_mut(&job_id) else {
            warn!("job {job_id} not found");
            return;
        };
        if joblet.state != JobState::Scheduled {
            debug!("job {job_id} is already {}", joblet.state.status());
            return;
        }
        joblet.state = JobState::Running;
        joblet.start_time = Some(time);
        joblet.last_activity_time = time;
        self.events.record(JobEvent::Started, joblet, None);
    }

    pub fn on_job_running(
        &mut self,
        cx: &mut LifecycleContext<'_>,
        summary: RunningJobSummary,
    ) -> ControllerResult<()> {
        let job_id = summary.job_id;
        let Some(joblet) = self.joblets.get_mut(&job_id) else {
            debug!("job {job_id} not found, ignoring its progress");
            return Ok(());
        };
        if joblet.start_time.is_none() {
            joblet.state = JobState::Running;
            joblet.start_time = Some(summary.time);
        }
        if joblet.statistics != summary.statistics {
            joblet.statistics = summary.statistics;
            joblet.last_activity_time = summary.time;
            if joblet.suspicious {
                joblet.suspicious = false;
                info!("job {job_id} is no longer suspicious");
            }
        }
        if cx.tasks.pending_job_count() > 0 {
            return Ok(());
        }
        let Some(task) = cx.tasks.get_mut(joblet.task) else {
            return Err(ControllerError::internal(format!(
                "task {} of job {job_id} not found",
                joblet.task
            )));
        };
        let capabilities = *task.capabilities();
        match self
            .splitter
            .on_job_running(joblet, capabilities.interruptible, summary.time)
        {
            SplitDecision::Split => {
                info!("interrupting job {job_id} of task {} to split it", task.title());
                joblet.interrupted = true;
                cx.host.interrupt_job(job_id, InterruptReason::JobSplit);
            }
            SplitDecision::LaunchSpeculative => {
                if capabilities.supports_speculative
                    && task.pool_mut().register_speculative(joblet.cookie)
                {
                    info!(
                        "requesting a speculative duplicate of job {job_id} of task {}",
                        task.title()
                    );
                    let index = task.index();
                    cx.scheduler.update_task(cx.tasks, index);
                }
            }
            SplitDecision::None => {}
        }
        Ok(())
    }

    /// Flags running jobs whose statistics have not changed for too long.
    pub fn check_suspicious_jobs(&mut self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::TimeDelta::from_std(self.options.suspicious_inactivity_timeout)
            .unwrap_or(chrono::TimeDelta::MAX);
        let mut count = 0;
        for joblet in self.joblets.values_mut() {
            if joblet.state != JobState::Running || joblet.suspicious {
                continue;
            }
            if now - joblet.last_activity_time >= timeout {
                warn!(
                    "job {} is suspicious: no activity since {}",
                    joblet.job_id, joblet.last_activity_time
                );
                joblet.suspicious = true;
                count += 1;
            }
        }
        count
    }

    pub fn on_job_completed(
        &mut self,
        cx: &mut LifecycleContext<'_>,
        summary: CompletedJobSummary,
    ) -> ControllerResult<LifecycleOutcome> {
        let job_id = summary.job_id;
        let Some(joblet) = self.joblets.get(&job_id) else {
            debug!("job {job_id} not found, ignoring its completion");
            return Ok(LifecycleOutcome::Continue);
        };
        let unknown_node = summary
            .output_chunks
            .iter()
            .flat_map(|x| x.replicas.iter())
            .map(|x| x.node_id)
            .find(|x| !cx.known_nodes.contains(x));
        if let Some(node_id) = unknown_node {
            warn!("job {job_id} reported an output replica on unknown node {node_id}, treating it as aborted");
            let mut abort = AbortedJobSummary::new(job_id, AbortReason::UnknownNode, summary.time);
            abort.statistics = summary.statistics;
            return self.on_job_aborted(cx, abort);
        }
        let Some(task) = cx.tasks.get(joblet.task) else {
            return Err(ControllerError::internal(format!(
                "task {} of job {job_id} not found",
                joblet.task
            )));
        };
        if task.should_abort_job(joblet.cookie, job_id) {
            debug!("job {job_id} completed after a competitor for the same stripe");
            let mut abort = AbortedJobSummary::new(job_id, AbortReason::Speculative, summary.time);
            abort.statistics = summary.statistics;
            return self.on_job_aborted(cx, abort);
        }

        let mut joblet = self.remove_joblet(job_id)?;
        joblet.state = JobState::Completed;
        joblet.start_time.get_or_insert(summary.time);
        joblet.finish_time = Some(summary.time);
        joblet.statistics = summary.statistics;
        self.counters.completed += 1;
        cx.metrics.completed_jobs.add(1, &[]);
        if summary.abandoned {
            cx.host.release_jobs(vec![job_id]);
        } else {
            cx.snapshots.push_completed_job(job_id);
        }
        self.splitter.on_job_completed(&joblet);

        let task_index = joblet.task;
        let task = task_mut(cx, task_index)?;
        task.update_memory_digests(&joblet.statistics);
        let input_stripe = task.pool().stripe(joblet.cookie).cloned();
        let competitors = task.pool_mut().completed(joblet.cookie, job_id);
        let title = task.title().to_string();
        let capabilities = *task.capabilities();
        let destination = task.destination();
        for competitor in competitors {
            debug!("aborting job {competitor} since job {job_id} has completed the same stripe");
            cx.host.abort_job(competitor, AbortReason::Speculative);
        }

        if let Some(stripe) = input_stripe.as_ref() {
            let unread = summary.unread_chunks.iter().copied().collect::<HashSet<ChunkId>>();
            if !unread.is_empty() {
                self.split_unread_input(cx, task_index, stripe, &unread)?;
            }
            if stripe.intermediate && !capabilities.restartable {
                cx.snapshots.push_stripe_list(stripe.chunk_ids());
            }
        }

        if let Some(destination) = destination {
            let output = ChunkStripe::intermediate(
                summary
                    .output_chunks
                    .iter()
                    .map(|x| ChunkSlice {
                        chunk_id: x.chunk_id,
                        data_weight: x.data_weight,
                        replicas: x.replicas.clone(),
                    })
                    .collect(),
            );
            let regeneration = cx
                .chunk_tracker
                .take_regeneration_target(task_index, joblet.cookie);
            let target = task_mut(cx, destination)?;
            let input_cookie = match regeneration {
                Some((_, cookie)) => {
                    debug!("job {job_id} regenerated the input of cookie {cookie} of task {}", target.title());
                    target.pool_mut().reset_and_resume(cookie, output);
                    cookie
                }
                None => target.pool_mut().add_stripe(output),
            };
            cx.chunk_tracker.register_intermediate_output(CompletedJobRecord {
                job_id,
                source_task: task_index,
                output_cookie: joblet.cookie,
                destination_task: destination,
                input_cookie,
                restartable: capabilities.restartable,
                suspended: false,
                lost: false,
                chunks: summary.output_chunks.iter().map(|x| x.chunk_id).collect(),
                unavailable_chunks: BTreeSet::new(),
            });
            cx.scheduler.update_task(cx.tasks, destination);
            cx.scheduler.add_task_locality_hints(cx.tasks, destination);
        }
        if capabilities.live_preview && !joblet.chunk_lists.is_empty() {
            cx.host.attach_chunk_trees_to_live_preview(
                &title,
                joblet.chunk_lists.iter().copied().map(ChunkTreeId::from).collect(),
            );
        }
        cx.scheduler.update_task(cx.tasks, task_index);
        self.events.record(JobEvent::Completed, &joblet, None);
        Ok(LifecycleOutcome::Continue)
    }

    /// Returns the input an interrupted job did not read to its task as a new stripe.
    fn split_unread_input(
        &mut self,
        cx: &mut LifecycleContext<'_>,
        task_index: TaskIndex,
        stripe: &ChunkStripe,
        unread: &HashSet<ChunkId>,
    ) -> ControllerResult<()> {
        let slices = stripe
            .slices
            .iter()
            .filter(|x| unread.contains(&x.chunk_id))
            .cloned()
            .collect::<Vec<_>>();
        if slices.is_empty() {
            return Ok(());
        }
        let stripe = ChunkStripe {
            slices,
            intermediate: stripe.intermediate,
        };
        let intermediate = stripe.intermediate;
        let cookie = task_mut(cx, task_index)?.pool_mut().add_stripe(stripe);
        debug!("unread input of task {task_index} is returned as cookie {cookie}");
        if !intermediate {
            cx.chunk_tracker
                .register_input_stripe(cx.tasks, task_index, cookie)?;
        }
        cx.scheduler.add_task_locality_hints(cx.tasks, task_index);
        Ok(())
    }

    pub fn on_job_failed(
        &mut self,
        cx: &mut LifecycleContext<'_>,
        summary: FailedJobSummary,
    ) -> ControllerResult<LifecycleOutcome> {
        let job_id = summary.job_id;
        let Some(joblet) = self.joblets.get(&job_id) else {
            debug!("job {job_id} not found, ignoring its failure");
            return Ok(LifecycleOutcome::Continue);
        };
        if self.options.ignore_job_failures_at_banned_nodes
            && cx.scheduler.is_node_banned(joblet.node.id)
        {
            debug!(
                "job {job_id} failed on banned node {}, treating it as aborted",
                joblet.node.id
            );
            let mut abort = AbortedJobSummary::new(job_id, AbortReason::NodeBanned, summary.time);
            abort.statistics = summary.statistics;
            return self.on_job_aborted(cx, abort);
        }

        let mut joblet = self.remove_joblet(job_id)?;
        joblet.state = JobState::Failed;
        joblet.finish_time = Some(summary.time);
        joblet.statistics = summary.statistics;
        self.counters.failed += 1;
        cx.metrics.failed_jobs.add(1, &[]);
        self.splitter.on_job_finished(job_id);

        let task = task_mut(cx, joblet.task)?;
        task.update_memory_digests(&joblet.statistics);
        task.pool_mut().failed(joblet.cookie, job_id);
        release_job_resources(cx, &joblet, true);
        self.create_job_node(cx.host, &joblet, summary.stderr_chunk);
        if self.options.ban_nodes_with_failed_jobs && cx.scheduler.ban_node(joblet.node.id) {
            info!("node {} is banned after job {job_id} failed", joblet.node.address);
        }
        cx.scheduler.update_task(cx.tasks, joblet.task);
        cx.scheduler.add_task_locality_hints(cx.tasks, joblet.task);
        self.events
            .record(JobEvent::Failed, &joblet, Some(&summary.error));

        let attributes = ErrorAttributes::new()
            .with("job_id", job_id)
            .with("error", &summary.error);
        if self.options.fail_on_job_restart {
            return Err(ControllerError::operation_failed(
                "Job failed; operation failed because fail_on_job_restart is set",
                attributes,
            ));
        }
        if summary.fatal {
            return Err(ControllerError::operation_failed(
                "Job failed with fatal error",
                attributes,
            ));
        }
        if self.counters.failed >= self.options.max_failed_job_count {
            return Err(ControllerError::operation_failed(
                "Failed jobs limit exceeded",
                attributes.with("max_failed_job_count", self.options.max_failed_job_count),
            ));
        }
        Ok(LifecycleOutcome::Continue)
    }

    pub fn on_job_aborted(
        &mut self,
        cx: &mut LifecycleContext<'_>,
        summary: AbortedJobSummary,
    ) -> ControllerResult<LifecycleOutcome> {
        let job_id = summary.job_id;
        let reason = summary.reason;
        if !self.joblets.contains_key(&job_id) {
            debug!("job {job_id} not found, ignoring its abort");
            return Ok(LifecycleOutcome::Continue);
        }
        let mut joblet = self.remove_joblet(job_id)?;
        joblet.state = JobState::Aborted;
        joblet.finish_time = Some(summary.time);
        if !summary.statistics.is_empty() {
            joblet.statistics = summary.statistics;
        }
        self.counters.aborted += 1;
        cx.metrics
            .aborted_jobs
            .add(1, &[metrics::reason(reason.status())]);
        self.splitter.on_job_finished(job_id);

        let task = task_mut(cx, joblet.task)?;
        if reason == AbortReason::ResourceOverdraft {
            task.update_memory_digests_on_overdraft(
                &joblet.statistics,
                joblet.memory_reserve_factors,
                self.options.resource_overdraft_factor,
            );
        } else {
            task.update_memory_digests(&joblet.statistics);
        }
        task.pool_mut().aborted(joblet.cookie, job_id);
        release_job_resources(cx, &joblet, !summary.by_scheduler);
        if reason == AbortReason::UserRequest {
            self.create_job_node(cx.host, &joblet, None);
        }
        cx.scheduler.update_task(cx.tasks, joblet.task);
        cx.scheduler.add_task_locality_hints(cx.tasks, joblet.task);
        self.events
            .record(JobEvent::Aborted, &joblet, Some(reason.status()));

        if reason == AbortReason::FailedChunks {
            let mut tracker = TrackerContext {
                tasks: &mut *cx.tasks,
                scheduler: &mut *cx.scheduler,
                snapshots: &mut *cx.snapshots,
            };
            for chunk_id in summary.failed_chunks {
                cx.chunk_tracker.on_chunk_failed(&mut tracker, chunk_id)?;
            }
        }
        if !reason.is_scheduling() && self.options.fail_on_job_restart {
            return Err(ControllerError::operation_failed(
                "Job aborted; operation failed because fail_on_job_restart is set",
                ErrorAttributes::new()
                    .with("job_id", job_id)
                    .with("reason", reason.status()),
            ));
        }
        if reason == AbortReason::AccountLimitExceeded {
            return Ok(LifecycleOutcome::Suspend(
                "Account limit exceeded".to_string(),
            ));
        }
        Ok(LifecycleOutcome::Continue)
    }

    /// Aborts every joblet on behalf of the controller.
    pub fn abort_all_joblets(
        &mut self,
        cx: &mut LifecycleContext<'_>,
        reason: AbortReason,
    ) -> ControllerResult<()> {
        let job_ids = self.joblets.keys().copied().collect::<Vec<_>>();
        if !job_ids.is_empty() {
            info!("aborting {} joblets with reason {}", job_ids.len(), reason.status());
        }
        for job_id in job_ids {
            cx.host.abort_job(job_id, reason);
            self.on_job_aborted(cx, AbortedJobSummary::new(job_id, reason, cx.now))?;
        }
        Ok(())
    }

    fn remove_joblet(&mut self, job_id: JobId) -> ControllerResult<Joblet> {
        self.joblets
            .shift_remove(&job_id)
            .ok_or_else(|| ControllerError::internal(format!("joblet {job_id} not found")))
    }

    fn create_job_node(
        &mut self,
        host: &dyn ControllerHost,
        joblet: &Joblet,
        stderr_chunk: Option<ChunkId>,
    ) {
        if self.job_node_count >= self.options.max_job_nodes_per_operation {
            debug!("job node limit reached, skipping job node of job {}", joblet.job_id);
            if let Some(chunk_id) = stderr_chunk {
                host.add_chunk_trees_to_unstage_list(vec![ChunkTreeId::from(chunk_id)], false);
            }
            return;
        }
        let stderr_chunk = match stderr_chunk {
            Some(chunk_id) if self.stderr_count < self.options.max_stderr_count => {
                self.stderr_count += 1;
                Some(chunk_id)
            }
            Some(chunk_id) => {
                host.add_chunk_trees_to_unstage_list(vec![ChunkTreeId::from(chunk_id)], false);
                None
            }
            None => None,
        };
        self.job_node_count += 1;
        host.create_job_node(JobNodeRecord {
            job_id: joblet.job_id,
            job_type: joblet.job_type.clone(),
            node_address: joblet.node.address.clone(),
            state: joblet.state.status(),
            stderr_chunk,
        });
    }

    pub fn snapshot(&self) -> LifecycleState {
        LifecycleState {
            joblets: self.joblets.values().cloned().collect(),
            counters: self.counters,
            job_node_count: self.job_node_count,
            stderr_count: self.stderr_count,
        }
    }

    pub fn restore(&mut self, state: LifecycleState) {
        self.joblets = state
            .joblets
            .into_iter()
            .map(|x| (x.job_id, x))
            .collect();
        self.counters = state.counters;
        self.job_node_count = state.job_node_count;
        self.stderr_count = state.stderr_count;
    }
}

fn task_mut<'a>(
    cx: &'a mut LifecycleContext<'_>,
    index: TaskIndex,
) -> ControllerResult<&'a mut crate::task::Task> {
    cx.tasks
        .get_mut(index)
        .ok_or_else(|| ControllerError::internal(format!("task {index} not found")))
}

fn release_job_resources(cx: &mut LifecycleContext<'_>, joblet: &Joblet, release_job: bool) {
    cx.snapshots.release_chunk_trees(
        joblet
            .chunk_lists
            .iter()
            .copied()
            .map(ChunkTreeId::from)
            .collect(),
        false,
        cx.host,
    );
    if release_job {
        cx.host.release_jobs(vec![joblet.job_id]);
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "tests use unwrap for brevity")]
mod tests {
    use super::*;
    use crate::chunk::ChunkReplica;
    use crate::id::{NodeId, PoolCookie};
    use crate::lifecycle::OutputChunk;
    use crate::metrics::ABORTED_JOBS;
    use crate::statistics::JobStatistics;
    use crate::task::tests::{test_stripe, test_task, test_task_args};
    use crate::task::{Task, TaskResources};
    use crate::testing::{at, HostCall, TestController};

    fn resources() -> TaskResources {
        TaskResources {
            user_slots: 1,
            cpu: 1.0,
            network: 0,
            user_job_memory: 100,
            job_proxy_memory: 50,
        }
    }

    /// A task with one stripe per chunk, each chunk stored on the given node.
    fn task(chunks: &[(u64, u64)]) -> Task {
        let mut task = test_task(0, resources());
        for (chunk, node) in chunks {
            task.pool_mut().add_stripe(test_stripe(*chunk, 10, &[*node]));
        }
        task.pool_mut().finish();
        task
    }

    fn completed(job_id: JobId) -> CompletedJobSummary {
        CompletedJobSummary {
            job_id,
            statistics: JobStatistics::new(),
            output_chunks: vec![],
            abandoned: false,
            unread_chunks: vec![],
            time: at(10),
        }
    }

    fn failed(job_id: JobId) -> FailedJobSummary {
        FailedJobSummary {
            job_id,
            statistics: JobStatistics::new(),
            error: "exit code 1".to_string(),
            fatal: false,
            stderr_chunk: None,
            time: at(10),
        }
    }

    fn job_nodes(c: &TestController) -> Vec<JobNodeRecord> {
        c.services
            .host
            .calls()
            .into_iter()
            .filter_map(|x| match x {
                HostCall::CreateJobNode(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_failure_on_banned_node_is_abort() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        assert_eq!(c.tasks.pending_job_count(), 0);
        assert!(c.scheduler.ban_node(NodeId::from(1)));

        let outcome = c
            .with_lifecycle(|l, cx| l.on_job_failed(cx, failed(job_id)))
            .unwrap();
        assert_eq!(outcome, LifecycleOutcome::Continue);
        let counters = c.lifecycle.counters();
        assert_eq!(counters.failed, 0);
        assert_eq!(counters.aborted, 1);
        assert_eq!(c.lifecycle.joblet_count(), 0);
        assert_eq!(c.tasks.pending_job_count(), 1);
        assert_eq!(c.services.host.released_jobs(), vec![job_id]);
        assert!(job_nodes(&c).is_empty());
        assert_eq!(
            c.services
                .metric_tester
                .counter(ABORTED_JOBS, &[metrics::reason("NODE_BANNED")])
                .unwrap(),
            1
        );
        c.validate();
    }

    #[test]
    fn test_completion_is_idempotent() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        c.lifecycle.on_job_started(job_id, at(1));
        assert_eq!(c.lifecycle.joblet(job_id).unwrap().state, JobState::Running);

        for _ in 0..2 {
            let outcome = c
                .with_lifecycle(|l, cx| l.on_job_completed(cx, completed(job_id)))
                .unwrap();
            assert_eq!(outcome, LifecycleOutcome::Continue);
        }
        assert_eq!(c.lifecycle.counters().completed, 1);
        assert_eq!(c.snapshots.queues().completed_jobs.len(), 1);
        // The job is released only once a snapshot covers its completion.
        assert!(c.services.host.released_jobs().is_empty());
        assert!(c.tasks.get_mut(TaskIndex::from(0)).unwrap().check_completed());
        c.validate();
    }

    #[test]
    fn test_abandoned_job_is_released_at_once() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        let mut summary = completed(job_id);
        summary.abandoned = true;
        c.with_lifecycle(|l, cx| l.on_job_completed(cx, summary))
            .unwrap();
        assert_eq!(c.services.host.released_jobs(), vec![job_id]);
        assert!(c.snapshots.queues().completed_jobs.is_empty());
    }

    #[test]
    fn test_output_on_unknown_node_is_abort() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        let mut summary = completed(job_id);
        summary.output_chunks.push(OutputChunk {
            chunk_id: ChunkId::from(100),
            data_weight: 5,
            replicas: vec![ChunkReplica::new(NodeId::from(99))],
        });
        c.with_lifecycle(|l, cx| l.on_job_completed(cx, summary))
            .unwrap();
        assert_eq!(c.lifecycle.counters().completed, 0);
        assert_eq!(c.lifecycle.counters().aborted, 1);
        assert_eq!(
            c.services
                .metric_tester
                .counter(ABORTED_JOBS, &[metrics::reason("UNKNOWN_NODE")])
                .unwrap(),
            1
        );
        assert_eq!(c.tasks.pending_job_count(), 1);
    }

    #[test]
    fn test_failed_jobs_limit() {
        let mut c = TestController::new("[operation]\nmax_failed_job_count = 2", vec![task(&[(1, 1)])]);
        c.activate();

        let job_id = c.start_job(1);
        let mut summary = failed(job_id);
        summary.stderr_chunk = Some(ChunkId::from(7));
        let outcome = c
            .with_lifecycle(|l, cx| l.on_job_failed(cx, summary))
            .unwrap();
        assert_eq!(outcome, LifecycleOutcome::Continue);
        assert_eq!(c.tasks.pending_job_count(), 1);
        assert_eq!(c.services.host.released_jobs(), vec![job_id]);
        let nodes = job_nodes(&c);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].state, "FAILED");
        assert_eq!(nodes[0].stderr_chunk, Some(ChunkId::from(7)));

        let job_id = c.start_job(1);
        let error = c
            .with_lifecycle(|l, cx| l.on_job_failed(cx, failed(job_id)))
            .unwrap_err();
        assert!(matches!(
            &error,
            ControllerError::OperationFailed { message, attributes }
                if message == "Failed jobs limit exceeded"
                    && attributes.get("max_failed_job_count") == Some("2")
        ));
        assert_eq!(c.lifecycle.counters().failed, 2);
    }

    #[test]
    fn test_fatal_failure_fails_operation() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        let mut summary = failed(job_id);
        summary.fatal = true;
        let result = c.with_lifecycle(|l, cx| l.on_job_failed(cx, summary));
        assert!(matches!(
            result,
            Err(ControllerError::OperationFailed { message, .. }) if message == "Job failed with fatal error"
        ));
    }

    #[test]
    fn test_account_limit_suspends_operation() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        let summary = AbortedJobSummary::new(job_id, AbortReason::AccountLimitExceeded, at(5));
        let outcome = c
            .with_lifecycle(|l, cx| l.on_job_aborted(cx, summary))
            .unwrap();
        assert_eq!(
            outcome,
            LifecycleOutcome::Suspend("Account limit exceeded".to_string())
        );
        assert_eq!(c.tasks.pending_job_count(), 1);
        c.validate();
    }

    #[test]
    fn test_fail_on_job_restart_spares_scheduling_aborts() {
        let mut c = TestController::new(
            "[operation]\nfail_on_job_restart = true",
            vec![task(&[(1, 1), (2, 1)])],
        );
        c.activate();
        let first = c.start_job(1);
        let second = c.start_job(1);

        let summary = AbortedJobSummary::new(first, AbortReason::Scheduler, at(5));
        let outcome = c.with_lifecycle(|l, cx| l.on_job_aborted(cx, summary));
        assert_eq!(outcome.unwrap(), LifecycleOutcome::Continue);

        let summary = AbortedJobSummary::new(second, AbortReason::Other, at(5));
        let outcome = c.with_lifecycle(|l, cx| l.on_job_aborted(cx, summary));
        assert!(matches!(outcome, Err(ControllerError::OperationFailed { .. })));
    }

    #[test]
    fn test_abort_by_scheduler_keeps_job() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        let mut summary = AbortedJobSummary::new(job_id, AbortReason::Other, at(5));
        summary.by_scheduler = true;
        c.with_lifecycle(|l, cx| l.on_job_aborted(cx, summary))
            .unwrap();
        assert!(c.services.host.released_jobs().is_empty());
        // A second abort of the same job is ignored.
        let summary = AbortedJobSummary::new(job_id, AbortReason::Other, at(6));
        c.with_lifecycle(|l, cx| l.on_job_aborted(cx, summary))
            .unwrap();
        assert_eq!(c.lifecycle.counters().aborted, 1);
    }

    #[test]
    fn test_intermediate_output_feeds_destination() {
        let mut source = test_task_args(0, resources());
        source.destination = Some(TaskIndex::from(1));
        let mut source = Task::new(source);
        source.pool_mut().add_stripe(test_stripe(1, 10, &[1]));
        source.pool_mut().finish();
        let mut sink = test_task_args(1, resources());
        sink.upstream = vec![TaskIndex::from(0)];
        let sink = Task::new(sink);

        let mut c = TestController::new("", vec![source, sink]);
        c.activate();
        let job_id = c.start_job(1);
        let mut summary = completed(job_id);
        summary.output_chunks.push(OutputChunk {
            chunk_id: ChunkId::from(100),
            data_weight: 5,
            replicas: vec![ChunkReplica::new(NodeId::from(2))],
        });
        c.with_lifecycle(|l, cx| l.on_job_completed(cx, summary))
            .unwrap();

        let sink = c.tasks.get(TaskIndex::from(1)).unwrap();
        assert_eq!(sink.pool().total_count(), 1);
        assert_eq!(sink.pending_job_count(), 1);
        let stripe = sink.pool().stripe(PoolCookie::from(0)).unwrap();
        assert!(stripe.intermediate);
        assert_eq!(stripe.chunk_ids(), vec![ChunkId::from(100)]);
        assert_eq!(c.tasks.pending_job_count(), 1);
        c.validate();
    }

    #[test]
    fn test_unread_input_returns_to_pool() {
        let mut task = test_task(0, resources());
        task.pool_mut().add_stripe(ChunkStripe::new(vec![
            ChunkSlice {
                chunk_id: ChunkId::from(1),
                data_weight: 10,
                replicas: vec![ChunkReplica::new(NodeId::from(1))],
            },
            ChunkSlice {
                chunk_id: ChunkId::from(2),
                data_weight: 10,
                replicas: vec![ChunkReplica::new(NodeId::from(1))],
            },
        ]));
        task.pool_mut().finish();
        let mut c = TestController::new("", vec![task]);
        for chunk in [1, 2] {
            c.chunk_tracker
                .register_input_chunk(crate::chunk::InputChunkSpec {
                    chunk_id: ChunkId::from(chunk),
                    replicas: vec![ChunkReplica::new(NodeId::from(1))],
                    codec: crate::chunk::ErasureCodec::None,
                    data_weight: 10,
                })
                .unwrap();
        }
        c.chunk_tracker
            .register_input_stripe(&mut c.tasks, TaskIndex::from(0), PoolCookie::from(0))
            .unwrap();
        c.activate();

        let job_id = c.start_job(1);
        let mut summary = completed(job_id);
        summary.unread_chunks = vec![ChunkId::from(2)];
        c.with_lifecycle(|l, cx| l.on_job_completed(cx, summary))
            .unwrap();

        let task = c.tasks.get(TaskIndex::from(0)).unwrap();
        assert_eq!(task.pool().total_count(), 2);
        let stripe = task.pool().stripe(PoolCookie::from(1)).unwrap();
        assert_eq!(stripe.chunk_ids(), vec![ChunkId::from(2)]);
        assert_eq!(c.tasks.pending_job_count(), 1);
        c.validate();
    }

    #[test]
    fn test_suspicious_jobs() {
        let mut c = TestController::new("", vec![task(&[(1, 1)])]);
        c.activate();
        let job_id = c.start_job(1);
        c.lifecycle.on_job_started(job_id, at(0));

        assert_eq!(c.lifecycle.check_suspicious_jobs(at(30)), 0);
        assert_eq!(c.lifecycle.check_suspicious_jobs(at(61)), 1);
        assert_eq!(c.lifecycle.check_suspicious_jobs(at(70)), 0);
        assert!(c.lifecycle.joblet(job_id).unwrap().suspicious);

        let summary = RunningJobSummary {
            job_id,
            statistics: JobStatistics::new().with("/data/input/row_count", 10),
            time: at(80),
        };
        c.with_lifecycle(|l, cx| l.on_job_running(cx, summary))
            .unwrap();
        let joblet = c.lifecycle.joblet(job_id).unwrap();
        assert!(!joblet.suspicious);
        assert_eq!(joblet.last_activity_time, at(80));
    }

    #[test]
    fn test_job_node_limits() {
        let mut c = TestController::new(
            "[controller]\nmax_job_nodes_per_operation = 2\nmax_stderr_count = 1",
            vec![task(&[(1, 1)])],
        );
        c.activate();
        for i in 0..3 {
            let job_id = c.start_job(1);
            let mut summary = failed(job_id);
            summary.stderr_chunk = Some(ChunkId::from(10 + i));
            c.with_lifecycle(|l, cx| l.on_job_failed(cx, summary))
                .unwrap();
        }
        let nodes = job_nodes(&c);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].stderr_chunk, Some(ChunkId::from(10)));
        assert_eq!(nodes[1].stderr_chunk, None);
        assert_eq!(
            c.services.host.unstaged(false),
            vec![
                ChunkTreeId::from(ChunkId::from(11)),
                ChunkTreeId::from(ChunkId::from(12))
            ]
        );
    }
}
