use indexmap::IndexSet;
use log::{debug, info, warn};
use strata_common::config::UnavailableChunkTactics;

use crate::chunk::{is_unavailable, ChunkReplica, ErasureCodec, InputChunkSpec};
use crate::chunk_tracker::{
    ChunkAvailabilityTracker, ChunkRegistration, ChunkStripeDescriptor, ChunkTrackerState,
    CompletedJobRecord, InputChunkDescriptor, InputChunkState, TrackerContext,
};
use crate::error::{ControllerError, ControllerResult, ErrorAttributes};
use crate::host::ProbeRequest;
use crate::id::{ChunkId, ChunkTreeId, PoolCookie, TaskIndex};
use crate::task::{StripeState, TaskTable};

impl ChunkAvailabilityTracker {
    pub fn register_input_chunk(
        &mut self,
        spec: InputChunkSpec,
    ) -> ControllerResult<ChunkRegistration> {
        let chunk_id = spec.chunk_id;
        if let Some(descriptor) = self.state.input_chunks.get(&chunk_id) {
            return Ok(registration(descriptor.state));
        }
        let state = if is_unavailable(
            &spec.replicas,
            spec.codec,
            self.options.check_parity_replicas,
        ) {
            match self.options.unavailable_chunk_tactics {
                UnavailableChunkTactics::Fail => {
                    return Err(ControllerError::operation_failed(
                        format!("Input chunk {chunk_id} is unavailable"),
                        ErrorAttributes::new().with("chunk_id", chunk_id),
                    ));
                }
                UnavailableChunkTactics::Skip => {
                    info!("skipping unavailable input chunk {chunk_id}");
                    InputChunkState::Skipped
                }
                UnavailableChunkTactics::Wait => {
                    self.state.waiting_chunk_count += 1;
                    InputChunkState::Waiting
                }
            }
        } else {
            InputChunkState::Active
        };
        self.state.input_chunks.insert(
            chunk_id,
            InputChunkDescriptor {
                spec,
                state,
                stripes: vec![],
            },
        );
        Ok(registration(state))
    }

    pub fn input_chunk_spec(&self, chunk_id: ChunkId) -> Option<&InputChunkSpec> {
        self.state.input_chunks.get(&chunk_id).map(|x| &x.spec)
    }

    /// Links every chunk of the stripe to the stripe descriptor, and suspends the
    /// cookie if some of the chunks are being waited for.
    pub fn register_input_stripe(
        &mut self,
        tasks: &mut TaskTable,
        task_index: TaskIndex,
        cookie: PoolCookie,
    ) -> ControllerResult<()> {
        let Some(task) = tasks.get_mut(task_index) else {
            return Err(ControllerError::internal(format!(
                "task {task_index} not found"
            )));
        };
        let Some(stripe) = task.pool().stripe(cookie) else {
            return Err(ControllerError::internal(format!(
                "stripe {cookie} of task {task_index} not found"
            )));
        };
        let chunk_ids = stripe.chunk_ids();
        let index = self.state.stripes.len();
        let mut waiting_chunk_count = 0;
        for chunk_id in chunk_ids {
            let Some(descriptor) = self.state.input_chunks.get_mut(&chunk_id) else {
                return Err(ControllerError::internal(format!(
                    "input chunk {chunk_id} is not registered"
                )));
            };
            descriptor.stripes.push(index);
            if descriptor.state == InputChunkState::Waiting {
                waiting_chunk_count += 1;
            }
        }
        self.state.stripes.push(ChunkStripeDescriptor {
            task: task_index,
            cookie,
            waiting_chunk_count,
        });
        if waiting_chunk_count > 0 {
            task.pool_mut().suspend(cookie);
        }
        self.update_input_prober(false);
        Ok(())
    }

    pub fn on_input_chunk_located(
        &mut self,
        cx: &mut TrackerContext<'_>,
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
        missing: bool,
    ) -> ControllerResult<()> {
        if missing {
            // The input transaction is expected to lock the chunk.
            return Err(ControllerError::operation_failed(
                format!("Input chunk {chunk_id} is missing"),
                ErrorAttributes::new().with("chunk_id", chunk_id),
            ));
        }
        let Some(descriptor) = self.state.input_chunks.get_mut(&chunk_id) else {
            warn!("input chunk {chunk_id} is not tracked");
            return Ok(());
        };
        let unavailable = is_unavailable(
            &replicas,
            descriptor.spec.codec,
            self.options.check_parity_replicas,
        );
        match (descriptor.state, unavailable) {
            (InputChunkState::Active, true) => self.on_input_chunk_unavailable(cx, chunk_id),
            (InputChunkState::Waiting, false) => {
                self.on_input_chunk_available(cx, chunk_id, replicas)
            }
            (InputChunkState::Active, false) => {
                descriptor.spec.replicas = replicas;
                Ok(())
            }
            (InputChunkState::Waiting, true) | (InputChunkState::Skipped, _) => Ok(()),
        }
    }

    pub fn on_input_chunk_available(
        &mut self,
        cx: &mut TrackerContext<'_>,
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
    ) -> ControllerResult<()> {
        let Some(descriptor) = self.state.input_chunks.get_mut(&chunk_id) else {
            warn!("input chunk {chunk_id} is not tracked");
            return Ok(());
        };
        if descriptor.state != InputChunkState::Waiting {
            return Ok(());
        }
        debug!("input chunk {chunk_id} is available");
        descriptor.state = InputChunkState::Active;
        descriptor.spec.replicas = replicas.clone();
        let stripes = descriptor.stripes.clone();
        self.state.waiting_chunk_count = self.state.waiting_chunk_count.saturating_sub(1);

        let mut touched = IndexSet::new();
        for index in stripes {
            let Some(stripe) = self.state.stripes.get_mut(index) else {
                return Err(ControllerError::internal(format!(
                    "stripe descriptor {index} not found"
                )));
            };
            let Some(task) = cx.tasks.get_mut(stripe.task) else {
                continue;
            };
            task.pool_mut().update_replicas(chunk_id, &replicas);
            if stripe.waiting_chunk_count == 0 {
                warn!(
                    "stripe {} of task {} has no waiting chunks",
                    stripe.cookie, stripe.task
                );
                continue;
            }
            stripe.waiting_chunk_count -= 1;
            if stripe.waiting_chunk_count == 0 {
                task.pool_mut().resume(stripe.cookie);
            }
            touched.insert(stripe.task);
        }
        for task in touched {
            cx.scheduler.update_task(cx.tasks, task);
            cx.scheduler.add_task_locality_hints(cx.tasks, task);
        }
        self.update_input_prober(true);
        Ok(())
    }

    pub fn on_input_chunk_unavailable(
        &mut self,
        cx: &mut TrackerContext<'_>,
        chunk_id: ChunkId,
    ) -> ControllerResult<()> {
        let Some(descriptor) = self.state.input_chunks.get_mut(&chunk_id) else {
            warn!("input chunk {chunk_id} is not tracked");
            return Ok(());
        };
        if descriptor.state != InputChunkState::Active {
            return Ok(());
        }
        debug!("input chunk {chunk_id} is unavailable");
        let stripes = descriptor.stripes.clone();
        match self.options.unavailable_chunk_tactics {
            UnavailableChunkTactics::Fail => Err(ControllerError::operation_failed(
                format!("Input chunk {chunk_id} is unavailable"),
                ErrorAttributes::new().with("chunk_id", chunk_id),
            )),
            UnavailableChunkTactics::Skip => {
                descriptor.state = InputChunkState::Skipped;
                let touched = stripes
                    .iter()
                    .filter_map(|i| self.state.stripes.get(*i).map(|x| x.task))
                    .collect::<IndexSet<_>>();
                for task_index in touched {
                    if let Some(task) = cx.tasks.get_mut(task_index) {
                        let cookies = task.pool_mut().remove_chunk(chunk_id);
                        debug!(
                            "removed chunk {chunk_id} from {} stripes of task {}",
                            cookies.len(),
                            task.title()
                        );
                    }
                    cx.scheduler.update_task(cx.tasks, task_index);
                }
                Ok(())
            }
            UnavailableChunkTactics::Wait => {
                descriptor.state = InputChunkState::Waiting;
                self.state.waiting_chunk_count += 1;
                let mut touched = IndexSet::new();
                for index in stripes {
                    let Some(stripe) = self.state.stripes.get_mut(index) else {
                        return Err(ControllerError::internal(format!(
                            "stripe descriptor {index} not found"
                        )));
                    };
                    stripe.waiting_chunk_count += 1;
                    if stripe.waiting_chunk_count == 1 {
                        if let Some(task) = cx.tasks.get_mut(stripe.task) {
                            task.pool_mut().suspend(stripe.cookie);
                        }
                    }
                    touched.insert(stripe.task);
                }
                for task in touched {
                    cx.scheduler.update_task(cx.tasks, task);
                }
                self.update_input_prober(true);
                Ok(())
            }
        }
    }

    /// Routes a chunk reported as failed by an aborted job.
    pub fn on_chunk_failed(
        &mut self,
        cx: &mut TrackerContext<'_>,
        chunk_id: ChunkId,
    ) -> ControllerResult<()> {
        if self.state.input_chunks.contains_key(&chunk_id) {
            self.on_input_chunk_unavailable(cx, chunk_id)
        } else if self.state.chunk_origins.contains_key(&chunk_id) {
            self.on_intermediate_chunk_unavailable(cx, chunk_id)
        } else {
            warn!("failed chunk {chunk_id} is not tracked");
            Ok(())
        }
    }

    pub fn register_intermediate_output(&mut self, record: CompletedJobRecord) {
        let index = self.state.completed_jobs.len();
        for chunk_id in record.chunks.iter() {
            self.state.chunk_origins.insert(*chunk_id, index);
        }
        self.state.completed_jobs.push(record);
    }

    pub fn on_intermediate_chunk_located(
        &mut self,
        cx: &mut TrackerContext<'_>,
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
        missing: bool,
    ) -> ControllerResult<()> {
        if missing {
            debug!("intermediate chunk {chunk_id} is missing and considered unstaged");
            return Ok(());
        }
        let Some(record) = self.origin(chunk_id) else {
            debug!("intermediate chunk {chunk_id} is not tracked");
            return Ok(());
        };
        let known_unavailable = record.unavailable_chunks.contains(&chunk_id);
        if is_unavailable(&replicas, ErasureCodec::None, false) {
            self.on_intermediate_chunk_unavailable(cx, chunk_id)
        } else if known_unavailable {
            self.on_intermediate_chunk_available(cx, chunk_id, replicas)
        } else {
            Ok(())
        }
    }

    pub fn on_intermediate_chunk_unavailable(
        &mut self,
        cx: &mut TrackerContext<'_>,
        chunk_id: ChunkId,
    ) -> ControllerResult<()> {
        let Some(&index) = self.state.chunk_origins.get(&chunk_id) else {
            warn!("intermediate chunk {chunk_id} is not tracked");
            return Ok(());
        };
        let tactics = self.options.unavailable_chunk_tactics;
        let Some(record) = self.state.completed_jobs.get_mut(index) else {
            return Err(ControllerError::internal(format!(
                "completed job record {index} not found"
            )));
        };
        if record.lost {
            return Ok(());
        }
        let Some(destination) = cx.tasks.get_mut(record.destination_task) else {
            return Err(ControllerError::internal(format!(
                "task {} not found",
                record.destination_task
            )));
        };
        if matches!(
            destination.pool().state(record.input_cookie),
            Some(StripeState::Completed { .. })
        ) {
            debug!("intermediate chunk {chunk_id} is unavailable but already consumed");
            return Ok(());
        }
        if !record.restartable && tactics == UnavailableChunkTactics::Fail {
            return Err(ControllerError::operation_failed(
                format!("Intermediate chunk {chunk_id} is unavailable"),
                ErrorAttributes::new()
                    .with("chunk_id", chunk_id)
                    .with("job_id", record.job_id),
            ));
        }
        if !record.suspended {
            record.suspended = true;
            destination.pool_mut().suspend(record.input_cookie);
        }
        let destination_task = record.destination_task;

        if record.restartable {
            record.lost = true;
            let chunks = record.chunks.clone();
            let source_task = record.source_task;
            let output_cookie = record.output_cookie;
            let job_id = record.job_id;
            for chunk in chunks.iter() {
                self.state.chunk_origins.remove(chunk);
            }
            if let Some(source) = cx.tasks.get_mut(source_task) {
                if source.mark_output_lost(output_cookie) {
                    info!(
                        "job {job_id} is lost, regenerating cookie {output_cookie} of task {}",
                        source.title()
                    );
                }
            }
            self.state.lost_job_count += 1;
            cx.snapshots
                .enqueue_chunk_trees(chunks.into_iter().map(ChunkTreeId::from).collect());
            cx.scheduler.update_task(cx.tasks, source_task);
            cx.scheduler.add_task_locality_hints(cx.tasks, source_task);
            cx.scheduler.update_task(cx.tasks, destination_task);
        } else {
            if record.unavailable_chunks.insert(chunk_id) {
                self.state.unavailable_intermediate_chunk_count += 1;
            }
            cx.scheduler.update_task(cx.tasks, destination_task);
            self.update_intermediate_prober(true);
        }
        Ok(())
    }

    pub fn on_intermediate_chunk_available(
        &mut self,
        cx: &mut TrackerContext<'_>,
        chunk_id: ChunkId,
        replicas: Vec<ChunkReplica>,
    ) -> ControllerResult<()> {
        let Some(&index) = self.state.chunk_origins.get(&chunk_id) else {
            return Ok(());
        };
        let Some(record) = self.state.completed_jobs.get_mut(index) else {
            return Err(ControllerError::internal(format!(
                "completed job record {index} not found"
            )));
        };
        if record.restartable || record.lost || !record.unavailable_chunks.remove(&chunk_id) {
            return Ok(());
        }
        self.state.unavailable_intermediate_chunk_count = self
            .state
            .unavailable_intermediate_chunk_count
            .saturating_sub(1);
        let resume = record.unavailable_chunks.is_empty() && record.suspended;
        if resume {
            record.suspended = false;
        }
        if let Some(destination) = cx.tasks.get_mut(record.destination_task) {
            destination.pool_mut().update_replicas(chunk_id, &replicas);
            if resume {
                destination.pool_mut().resume(record.input_cookie);
            }
        }
        if resume {
            debug!(
                "intermediate output of job {} is available again",
                record.job_id
            );
            cx.scheduler.add_all_pending_hints(cx.tasks);
        }
        self.update_intermediate_prober(true);
        Ok(())
    }

    /// Finds the destination cookie waiting for a regenerated output and detaches it
    /// from the lost record.
    pub fn take_regeneration_target(
        &mut self,
        source_task: TaskIndex,
        output_cookie: PoolCookie,
    ) -> Option<(TaskIndex, PoolCookie)> {
        let record = self.state.completed_jobs.iter_mut().find(|r| {
            r.lost && r.source_task == source_task && r.output_cookie == output_cookie
        })?;
        record.lost = false;
        record.suspended = false;
        record.chunks.clear();
        Some((record.destination_task, record.input_cookie))
    }

    fn origin(&self, chunk_id: ChunkId) -> Option<&CompletedJobRecord> {
        let index = self.state.chunk_origins.get(&chunk_id)?;
        self.state.completed_jobs.get(*index)
    }

    pub fn chunk_state(&self, chunk_id: ChunkId) -> Option<InputChunkState> {
        self.state.input_chunks.get(&chunk_id).map(|x| x.state)
    }

    pub fn waiting_chunk_count(&self) -> usize {
        self.state.waiting_chunk_count
    }

    pub fn stripe_waiting_chunk_count(&self, task: TaskIndex, cookie: PoolCookie) -> Option<usize> {
        self.state
            .stripes
            .iter()
            .find(|x| x.task == task && x.cookie == cookie)
            .map(|x| x.waiting_chunk_count)
    }

    pub fn unavailable_intermediate_chunk_count(&self) -> usize {
        self.state.unavailable_intermediate_chunk_count
    }

    pub fn lost_job_count(&self) -> usize {
        self.state.lost_job_count
    }

    pub fn is_input_prober_running(&self) -> bool {
        self.input_prober_running
    }

    pub fn is_intermediate_prober_running(&self) -> bool {
        self.intermediate_prober_running
    }

    fn waiting_chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids = self
            .state
            .input_chunks
            .iter()
            .filter(|(_, x)| x.state == InputChunkState::Waiting)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn unavailable_intermediate_chunk_ids(&self) -> Vec<ChunkId> {
        let mut ids = self
            .state
            .completed_jobs
            .iter()
            .flat_map(|x| x.unavailable_chunks.iter().copied())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn update_input_prober(&mut self, changed: bool) {
        if self.state.waiting_chunk_count > 0 {
            let request = ProbeRequest {
                chunk_ids: self.waiting_chunk_ids(),
                max_chunks_per_request: self.options.max_chunks_per_request,
            };
            if !self.input_prober_running {
                debug!(
                    "starting input chunk prober for {} chunks",
                    request.chunk_ids.len()
                );
                self.input_prober.start(request);
                self.input_prober_running = true;
            } else if changed {
                self.input_prober.restart(request);
            }
        } else if self.input_prober_running {
            debug!("stopping input chunk prober");
            self.input_prober.stop();
            self.input_prober_running = false;
        }
    }

    fn update_intermediate_prober(&mut self, changed: bool) {
        if self.state.unavailable_intermediate_chunk_count > 0 {
            let request = ProbeRequest {
                chunk_ids: self.unavailable_intermediate_chunk_ids(),
                max_chunks_per_request: self.options.max_chunks_per_request,
            };
            if !self.intermediate_prober_running {
                debug!(
                    "starting intermediate chunk prober for {} chunks",
                    request.chunk_ids.len()
                );
                self.intermediate_prober.start(request);
                self.intermediate_prober_running = true;
            } else if changed {
                self.intermediate_prober.restart(request);
            }
        } else if self.intermediate_prober_running {
            debug!("stopping intermediate chunk prober");
            self.intermediate_prober.stop();
            self.intermediate_prober_running = false;
        }
    }

    pub fn stop_probers(&mut self) {
        if self.input_prober_running {
            self.input_prober.stop();
            self.input_prober_running = false;
        }
        if self.intermediate_prober_running {
            self.intermediate_prober.stop();
            self.intermediate_prober_running = false;
        }
    }

    pub fn snapshot(&self) -> ChunkTrackerState {
        self.state.clone()
    }

    /// Replaces the tracked state and starts the probers that have work to do.
    pub fn restore(&mut self, state: ChunkTrackerState) {
        self.stop_probers();
        self.state = state;
        self.update_input_prober(false);
        self.update_intermediate_prober(false);
    }

    /// Checks that chunk states agree with the stripe counters and the probers.
    pub fn validate(&self) -> ControllerResult<()> {
        let waiting = self
            .state
            .input_chunks
            .values()
            .filter(|x| x.state == InputChunkState::Waiting)
            .collect::<Vec<_>>();
        if waiting.len() != self.state.waiting_chunk_count {
            return Err(ControllerError::internal(format!(
                "{} chunks are waiting but the counter is {}",
                waiting.len(),
                self.state.waiting_chunk_count
            )));
        }
        let contributions: usize = waiting.iter().map(|x| x.stripes.len()).sum();
        let counters: usize = self
            .state
            .stripes
            .iter()
            .map(|x| x.waiting_chunk_count)
            .sum();
        if contributions != counters {
            return Err(ControllerError::internal(format!(
                "waiting chunks contribute {contributions} stripe counts but stripes hold {counters}"
            )));
        }
        if self.input_prober_running != (self.state.waiting_chunk_count > 0) {
            return Err(ControllerError::internal(
                "input prober state does not match the waiting chunk count",
            ));
        }
        Ok(())
    }
}

fn registration(state: InputChunkState) -> ChunkRegistration {
    match state {
        InputChunkState::Skipped => ChunkRegistration::Skipped,
        InputChunkState::Active | InputChunkState::Waiting => ChunkRegistration::Included,
    }
}
