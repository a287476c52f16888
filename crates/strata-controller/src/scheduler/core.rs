use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, trace, warn};

use crate::error::{ControllerError, ControllerResult, ErrorAttributes};
use crate::host::{JobSpecBuilder, JobSpecError, SchedulingContext};
use crate::id::{CellTag, ChunkListId, IdGenerator, NodeId, TaskIndex};
use crate::lifecycle::Joblet;
use crate::scheduler::{
    JobStartDescriptor, ScheduleFailReason, ScheduleOutcome, ScheduleResult, Scheduler,
    SchedulerState,
};
use crate::task::TaskTable;
use crate::task_group::Candidacy;

enum Attempt {
    Started(Joblet),
    NotStarted,
    /// No further task should be tried for this offer.
    Stop,
}

impl Scheduler {
    /// Admits every pending task as a non-local candidate, and keeps admitting
    /// new pending tasks from now on.
    pub fn activate(&mut self, tasks: &TaskTable) {
        self.active = true;
        for group in self.groups.iter_mut() {
            group.admit_candidates(|index| {
                tasks
                    .get(index)
                    .map(|x| x.needed_resources().memory)
                    .unwrap_or(0)
            });
        }
    }

    /// Refreshes the cached counters of the task and its place in the group.
    pub fn update_task(&mut self, tasks: &mut TaskTable, index: TaskIndex) {
        tasks.refresh(index);
        let Some(task) = tasks.get(index) else {
            warn!("task {index} not found");
            return;
        };
        let Some(group) = self.groups.get_mut(task.group().index()) else {
            warn!("task group {} not found", task.group());
            return;
        };
        if task.pending_job_count() == 0 {
            group.remove_task(index);
        } else {
            group.add_pending_hint(index, task.needed_resources().memory, self.active);
        }
    }

    pub fn add_task_locality_hints(&mut self, tasks: &TaskTable, index: TaskIndex) {
        if !self.options.enable_locality {
            return;
        }
        let Some(task) = tasks.get(index) else {
            warn!("task {index} not found");
            return;
        };
        if !task.capabilities().has_input_locality || task.pending_job_count() == 0 {
            return;
        }
        let Some(group) = self.groups.get_mut(task.group().index()) else {
            warn!("task group {} not found", task.group());
            return;
        };
        for node_id in task.pool().locality_nodes() {
            group.add_locality_hint(node_id, index);
        }
    }

    pub fn add_all_pending_hints(&mut self, tasks: &mut TaskTable) {
        let indices = tasks.indices().collect::<Vec<_>>();
        for index in indices {
            self.update_task(tasks, index);
            self.add_task_locality_hints(tasks, index);
        }
    }

    /// Moves every delayed task back to the candidates, or drops it when it has
    /// no pending jobs anymore.
    pub fn reset_task_locality_delays(&mut self, tasks: &TaskTable) {
        for group in self.groups.iter_mut() {
            for index in group.delayed_task_indices() {
                match tasks.get(index) {
                    Some(task) if task.pending_job_count() > 0 => {
                        group.undelay(index, task.needed_resources().memory);
                    }
                    _ => group.remove_task(index),
                }
            }
        }
    }

    pub fn candidacy(&self, tasks: &TaskTable, index: TaskIndex) -> Option<Candidacy> {
        let task = tasks.get(index)?;
        self.groups.get(task.group().index())?.candidacy(index)
    }

    pub fn ban_node(&mut self, node_id: NodeId) -> bool {
        let banned = self.banned_nodes.insert(node_id);
        if banned {
            debug!("node {node_id} is banned");
        }
        banned
    }

    pub fn is_node_banned(&self, node_id: NodeId) -> bool {
        self.banned_nodes.contains(&node_id)
    }

    pub fn add_chunk_lists(&mut self, cell_tag: CellTag, chunk_list_ids: Vec<ChunkListId>) {
        self.chunk_lists.add(cell_tag, chunk_list_ids);
    }

    pub fn cancel_chunk_list_request(&mut self, cell_tag: CellTag, count: usize) {
        self.chunk_lists.cancel_request(cell_tag, count);
    }

    pub fn take_chunk_list_requests(&mut self) -> Vec<(CellTag, usize)> {
        self.chunk_lists
            .take_requests(self.options.chunk_list_watermark)
    }

    pub fn schedule(
        &mut self,
        context: &dyn SchedulingContext,
        tasks: &mut TaskTable,
        running: bool,
        builder: &dyn JobSpecBuilder,
    ) -> ControllerResult<ScheduleOutcome> {
        let mut result = ScheduleResult::default();
        let node_id = context.node().id;
        let rejected = if !running {
            Some(ScheduleFailReason::OperationNotRunning)
        } else if tasks.pending_job_count() == 0 {
            Some(ScheduleFailReason::NoPendingJobs)
        } else if self.banned_nodes.contains(&node_id) {
            Some(ScheduleFailReason::NodeBanned)
        } else {
            None
        };
        if let Some(reason) = rejected {
            result.record_fail(reason);
            result.stop_needed = true;
            return Ok(ScheduleOutcome {
                result,
                joblet: None,
            });
        }

        let limits = *context.resource_limits();
        let mut eligible = vec![];
        for (i, group) in self.groups.iter().enumerate() {
            if limits.dominates(group.min_needed_resources()) {
                eligible.push(i);
            } else {
                result.record_fail(ScheduleFailReason::NotEnoughResources);
            }
        }
        if eligible.is_empty() {
            result.stop_needed = true;
            return Ok(ScheduleOutcome {
                result,
                joblet: None,
            });
        }

        let mut attempt = self.schedule_local(context, tasks, &eligible, builder, &mut result)?;
        if matches!(attempt, Attempt::NotStarted) {
            attempt = self.schedule_non_local(context, tasks, &eligible, builder, &mut result)?;
        }
        let joblet = match attempt {
            Attempt::Started(joblet) => Some(joblet),
            Attempt::NotStarted => None,
            Attempt::Stop => {
                result.stop_needed = true;
                None
            }
        };
        Ok(ScheduleOutcome { result, joblet })
    }

    fn schedule_local(
        &mut self,
        context: &dyn SchedulingContext,
        tasks: &mut TaskTable,
        eligible: &[usize],
        builder: &dyn JobSpecBuilder,
        result: &mut ScheduleResult,
    ) -> ControllerResult<Attempt> {
        if !self.options.enable_locality {
            return Ok(Attempt::NotStarted);
        }
        let node_id = context.node().id;
        let limits = *context.resource_limits();
        for i in eligible.iter().copied() {
            let mut best: Option<(TaskIndex, u64)> = None;
            for index in self.groups[i].local_tasks(node_id) {
                let Some(task) = tasks.get(index) else {
                    continue;
                };
                if !limits.dominates(&task.needed_resources()) {
                    result.record_fail(ScheduleFailReason::NotEnoughResources);
                    continue;
                }
                let locality = task.locality(node_id);
                if locality == 0 {
                    self.groups[i].evict_local_task(node_id, index);
                    continue;
                }
                if best.is_none_or(|(_, x)| locality > x) {
                    best = Some((index, locality));
                }
            }
            let Some((index, locality)) = best else {
                continue;
            };
            trace!("trying local job of task {index} on node {node_id} with locality {locality}");
            match self.try_start_job(context, tasks, index, builder, result)? {
                Attempt::Started(joblet) => {
                    if let Some(task) = tasks.get_mut(index) {
                        task.reset_delayed_time();
                    }
                    return Ok(Attempt::Started(joblet));
                }
                Attempt::Stop => return Ok(Attempt::Stop),
                Attempt::NotStarted => {}
            }
        }
        result.record_fail(ScheduleFailReason::NoLocalJobs);
        Ok(Attempt::NotStarted)
    }

    fn schedule_non_local(
        &mut self,
        context: &dyn SchedulingContext,
        tasks: &mut TaskTable,
        eligible: &[usize],
        builder: &dyn JobSpecBuilder,
        result: &mut ScheduleResult,
    ) -> ControllerResult<Attempt> {
        let now = context.now();
        let limits = *context.resource_limits();
        let mut scanned = false;
        for i in eligible.iter().copied() {
            for (deadline, index) in self.groups[i].delayed_tasks() {
                if deadline > now {
                    break;
                }
                let Some(task) = tasks.get(index) else {
                    continue;
                };
                let needed = task.needed_resources();
                if limits.dominates(&needed) {
                    self.groups[i].undelay(index, needed.memory);
                }
            }

            for (memory, index) in self.groups[i].candidates() {
                scanned = true;
                if memory > limits.memory {
                    // Candidates are sorted by memory, so nothing further fits either.
                    result.record_fail(ScheduleFailReason::NotEnoughResources);
                    break;
                }
                let Some(task) = tasks.get_mut(index) else {
                    continue;
                };
                if !limits.dominates(&task.needed_resources()) {
                    result.record_fail(ScheduleFailReason::NotEnoughResources);
                    continue;
                }
                if self.options.enable_locality
                    && task.capabilities().has_input_locality
                    && !task.locality_timeout().is_zero()
                {
                    let delayed_time = match task.delayed_time() {
                        Some(x) => x,
                        None => {
                            task.set_delayed_time(now);
                            now
                        }
                    };
                    let deadline = delay_deadline(delayed_time, task.locality_timeout());
                    if now < deadline {
                        trace!("task {} delayed until {deadline}", task.title());
                        self.groups[i].delay(index, deadline);
                        result.record_fail(ScheduleFailReason::TaskDelayed);
                        continue;
                    }
                }
                match self.try_start_job(context, tasks, index, builder, result)? {
                    Attempt::NotStarted => {}
                    x => return Ok(x),
                }
            }
        }
        if !scanned {
            result.record_fail(ScheduleFailReason::NoCandidateTasks);
        }
        Ok(Attempt::NotStarted)
    }

    fn try_start_job(
        &mut self,
        context: &dyn SchedulingContext,
        tasks: &mut TaskTable,
        index: TaskIndex,
        builder: &dyn JobSpecBuilder,
        result: &mut ScheduleResult,
    ) -> ControllerResult<Attempt> {
        let Some(task) = tasks.get_mut(index) else {
            return Err(ControllerError::internal(format!("task {index} not found")));
        };
        if !self.chunk_lists.has_enough(task.output_cells()) {
            debug!("not enough chunk lists to start a job of task {}", task.title());
            result.record_fail(ScheduleFailReason::NotEnoughChunkLists);
            return Ok(Attempt::Stop);
        }
        let node = context.node();
        let job_id = self.job_ids.next()?;
        let Some(cookie) = task.pool_mut().extract(node.id, job_id) else {
            warn!("task {} has no stripe to extract", task.title());
            return Ok(Attempt::NotStarted);
        };
        let mut joblet = Joblet::new(job_id, task, node.clone(), cookie, context.now());
        let spec = match builder.build_job_spec(&joblet) {
            Ok(x) => x,
            Err(JobSpecError::Throttled) => {
                debug!("job spec building is throttled for task {}", task.title());
                task.pool_mut().aborted(cookie, job_id);
                result.record_fail(ScheduleFailReason::JobSpecThrottling);
                return Ok(Attempt::Stop);
            }
            Err(JobSpecError::Failed(message)) => {
                task.pool_mut().aborted(cookie, job_id);
                return Err(ControllerError::operation_failed(
                    format!("Failed to build job spec: {message}"),
                    ErrorAttributes::new()
                        .with("job_id", job_id)
                        .with("task", task.title()),
                ));
            }
        };
        let Some(chunk_lists) = self.chunk_lists.take(task.output_cells()) else {
            return Err(ControllerError::internal(format!(
                "chunk lists of task {} disappeared while starting job {job_id}",
                task.title()
            )));
        };
        joblet.chunk_lists = chunk_lists;
        debug!(
            "starting job {job_id} of task {} on node {}",
            task.title(),
            node.address
        );
        let start = JobStartDescriptor {
            job_id,
            node: node.clone(),
            job_type: joblet.job_type.clone(),
            resource_limits: joblet.resource_limits,
            spec,
        };
        self.update_task(tasks, index);
        result.start = Some(start);
        Ok(Attempt::Started(joblet))
    }

    pub fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            banned_nodes: self.banned_nodes.clone(),
            next_job_id: self.job_ids.peek(),
            chunk_lists: self.chunk_lists.clone(),
        }
    }

    pub fn restore(&mut self, state: SchedulerState) {
        self.banned_nodes = state.banned_nodes;
        self.job_ids = IdGenerator::starting_at(state.next_job_id);
        self.chunk_lists = state.chunk_lists;
    }

    /// Checks that exactly the tasks with pending jobs have a candidacy.
    pub fn validate(&self, tasks: &TaskTable) -> ControllerResult<()> {
        for group in self.groups.iter() {
            group.validate()?;
        }
        for task in tasks.iter() {
            let pending = task.pending_job_count() > 0;
            let present = self
                .groups
                .get(task.group().index())
                .is_some_and(|x| x.contains(task.index()));
            if pending != present {
                return Err(ControllerError::internal(format!(
                    "task {} has {} pending jobs but its candidacy is {}",
                    task.title(),
                    task.pending_job_count(),
                    if present { "present" } else { "absent" }
                )));
            }
        }
        Ok(())
    }
}

fn delay_deadline(delayed_time: DateTime<Utc>, timeout: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|x| delayed_time.checked_add_signed(x))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "tests use unwrap for brevity")]
mod tests {
    use super::*;
    use crate::host::{NodeDescriptor, SchedulingOffer};
    use crate::id::{ChunkId, JobId, PoolCookie};
    use crate::resources::JobResources;
    use crate::scheduler::SchedulerOptions;
    use crate::task::tests::{test_stripe, test_task_args};
    use crate::task::{StripeState, Task, TaskResources};
    use crate::testing::{at, TestController};

    fn resources() -> TaskResources {
        TaskResources {
            user_slots: 1,
            cpu: 1.0,
            network: 0,
            user_job_memory: 100,
            job_proxy_memory: 0,
        }
    }

    fn task(index: usize, stripes: &[(u64, u64)]) -> Task {
        let mut task = Task::new(test_task_args(index, resources()));
        for (chunk, node) in stripes {
            task.pool_mut().add_stripe(test_stripe(*chunk, 10, &[*node]));
        }
        task.pool_mut().finish();
        task
    }

    fn controller(overrides: &str, tasks: Vec<Task>) -> TestController {
        let mut c = TestController::new(overrides, tasks);
        c.activate();
        c
    }

    fn large() -> JobResources {
        JobResources::new(100.0, 1 << 40)
    }

    #[test]
    fn test_not_enough_resources() {
        let mut c = controller("", vec![task(0, &[(1, 1)])]);

        // Below the floor of every group.
        let outcome = c.offer(1, JobResources::new(1.0, 10));
        assert!(outcome.result.start.is_none());
        assert!(outcome.result.stop_needed);
        assert_eq!(
            outcome.result.failure_count(ScheduleFailReason::NotEnoughResources),
            1
        );
        let outcome = c.offer(1, JobResources::new(0.5, 1 << 20));
        assert!(outcome.result.stop_needed);

        // Above the group floor but below the task demand.
        let outcome = c.offer(1, JobResources::new(1.0, 80));
        assert!(outcome.result.start.is_none());
        assert!(!outcome.result.stop_needed);
        assert!(outcome.result.failure_count(ScheduleFailReason::NotEnoughResources) >= 1);
        assert_eq!(c.tasks.pending_job_count(), 1);

        let outcome = c.offer(1, JobResources::new(1.0, 100));
        assert!(outcome.result.start.is_some());
        c.validate();
    }

    #[test]
    fn test_local_task_is_preferred() {
        let mut c = controller("", vec![task(0, &[(1, 1)]), task(1, &[(2, 2)])]);
        let outcome = c.offer(2, large());
        let joblet = outcome.joblet.unwrap();
        assert_eq!(joblet.task, TaskIndex::from(1));
        assert_eq!(joblet.input_chunks, vec![ChunkId::from(2)]);
        assert_eq!(outcome.result.start.unwrap().job_id, joblet.job_id);
        assert_eq!(c.tasks.get(TaskIndex::from(1)).unwrap().pending_job_count(), 0);
        c.validate();
    }

    #[test]
    fn test_non_local_task_is_delayed() {
        let mut c = controller("", vec![task(0, &[(1, 1), (2, 1)])]);
        let index = TaskIndex::from(0);

        let outcome = c.offer(2, large());
        assert!(outcome.result.start.is_none());
        assert_eq!(outcome.result.failure_count(ScheduleFailReason::TaskDelayed), 1);
        assert_eq!(outcome.result.failure_count(ScheduleFailReason::NoLocalJobs), 1);
        assert_eq!(
            c.scheduler.candidacy(&c.tasks, index),
            Some(Candidacy::Delayed { deadline: at(5) })
        );
        c.validate();

        c.now = at(3);
        let outcome = c.offer(2, large());
        assert!(outcome.result.start.is_none());
        assert_eq!(
            outcome.result.failure_count(ScheduleFailReason::NoCandidateTasks),
            1
        );

        // A local node is served while the task is delayed.
        let outcome = c.offer(1, large());
        assert!(outcome.result.start.is_some());
        assert_eq!(c.tasks.get(index).unwrap().delayed_time(), None);
        c.validate();

        c.now = at(5);
        let outcome = c.offer(2, large());
        assert!(outcome.result.start.is_none());
        assert_eq!(outcome.result.failure_count(ScheduleFailReason::TaskDelayed), 1);

        c.now = at(10);
        let outcome = c.offer(2, large());
        assert!(outcome.result.start.is_some());
        assert_eq!(c.tasks.pending_job_count(), 0);
        c.validate();
    }

    #[test]
    fn test_locality_disabled() {
        let mut c = controller(
            "[operation]\nenable_locality = false",
            vec![task(0, &[(1, 1)])],
        );
        let outcome = c.offer(2, large());
        assert!(outcome.result.start.is_some());
        assert_eq!(outcome.result.failure_count(ScheduleFailReason::TaskDelayed), 0);
    }

    #[test]
    fn test_chunk_lists_are_required() {
        let cell = CellTag::from(7);
        let mut args = test_task_args(0, resources());
        args.output_cells = vec![cell];
        let mut output = Task::new(args);
        output.pool_mut().add_stripe(test_stripe(1, 10, &[1]));
        output.pool_mut().finish();
        let mut c = controller("", vec![output]);

        let outcome = c.offer(1, large());
        assert!(outcome.result.start.is_none());
        assert!(outcome.result.stop_needed);
        assert_eq!(
            outcome.result.failure_count(ScheduleFailReason::NotEnoughChunkLists),
            1
        );
        assert_eq!(c.tasks.pending_job_count(), 1);

        assert_eq!(c.scheduler.take_chunk_list_requests(), vec![(cell, 4)]);
        assert!(c.scheduler.take_chunk_list_requests().is_empty());
        c.scheduler.add_chunk_lists(cell, vec![ChunkListId::from(10)]);
        let outcome = c.offer(1, large());
        assert_eq!(outcome.joblet.unwrap().chunk_lists, vec![ChunkListId::from(10)]);
        assert_eq!(c.scheduler.take_chunk_list_requests(), vec![(cell, 1)]);

        c.scheduler.cancel_chunk_list_request(cell, 3);
        assert_eq!(c.scheduler.take_chunk_list_requests(), vec![(cell, 3)]);
    }

    #[test]
    fn test_job_spec_throttling() {
        let mut c = controller("", vec![task(0, &[(1, 1)])]);
        c.services.job_spec_builder.set_throttled(true);
        let outcome = c.offer(1, large());
        assert!(outcome.result.start.is_none());
        assert!(outcome.result.stop_needed);
        assert_eq!(
            outcome.result.failure_count(ScheduleFailReason::JobSpecThrottling),
            1
        );
        let pool = c.tasks.get(TaskIndex::from(0)).unwrap().pool();
        assert_eq!(pool.pending_count(), 1);
        assert_eq!(pool.running_count(), 0);

        c.services.job_spec_builder.set_throttled(false);
        let job_id = c.start_job(1);
        // The throttled attempt consumed an id.
        assert_eq!(job_id, JobId::from(2));
        c.validate();
    }

    #[test]
    fn test_rejected_offers() {
        let mut c = controller("", vec![task(0, &[(1, 1)])]);
        assert!(c.scheduler.ban_node(NodeId::from(3)));
        assert!(!c.scheduler.ban_node(NodeId::from(3)));
        let outcome = c.offer(3, large());
        assert!(outcome.result.stop_needed);
        assert_eq!(outcome.result.failure_count(ScheduleFailReason::NodeBanned), 1);

        let offer = SchedulingOffer {
            node: NodeDescriptor::new(NodeId::from(1), "node-1".to_string()),
            resource_limits: large(),
            now: at(0),
        };
        let outcome = c
            .scheduler
            .schedule(&offer, &mut c.tasks, false, c.services.job_spec_builder.as_ref())
            .unwrap();
        assert!(outcome.result.stop_needed);
        assert_eq!(
            outcome.result.ranked_failures(),
            vec![(ScheduleFailReason::OperationNotRunning, 1)]
        );

        c.start_job(1);
        let outcome = c.offer(1, large());
        assert!(outcome.result.stop_needed);
        assert_eq!(outcome.result.failure_count(ScheduleFailReason::NoPendingJobs), 1);
    }

    #[test]
    fn test_snapshot_keeps_job_ids_increasing() {
        let mut c = controller("", vec![task(0, &[(1, 1), (2, 1), (3, 1)])]);
        assert_eq!(c.start_job(1), JobId::from(1));
        assert_eq!(c.start_job(1), JobId::from(2));
        c.scheduler.ban_node(NodeId::from(9));
        let state = c.scheduler.snapshot();
        assert_eq!(state.next_job_id, 3);

        let tasks = c.tasks.clone();
        let mut scheduler = Scheduler::new(SchedulerOptions::from(&c.options), &tasks);
        scheduler.restore(state);
        let mut tasks = tasks;
        scheduler.activate(&tasks);
        scheduler.add_all_pending_hints(&mut tasks);
        assert!(scheduler.is_node_banned(NodeId::from(9)));
        c.scheduler = scheduler;
        c.tasks = tasks;
        assert_eq!(c.start_job(1), JobId::from(3));
        c.validate();
    }

    #[test]
    fn test_reset_locality_delays() {
        let mut c = controller("", vec![task(0, &[(1, 1)])]);
        let index = TaskIndex::from(0);
        c.offer(2, large());
        assert!(matches!(
            c.scheduler.candidacy(&c.tasks, index),
            Some(Candidacy::Delayed { .. })
        ));
        c.scheduler.reset_task_locality_delays(&c.tasks);
        assert!(matches!(
            c.scheduler.candidacy(&c.tasks, index),
            Some(Candidacy::Candidate { .. })
        ));
        assert_eq!(
            c.tasks.get(index).unwrap().pool().state(PoolCookie::from(0)),
            Some(&StripeState::Pending)
        );
        c.validate();
    }
}
