use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use log::warn;

use crate::error::{ControllerError, ControllerResult};
use crate::id::{NodeId, TaskIndex};
use crate::resources::JobResources;
use crate::task_group::{Candidacy, TaskGroup};

impl TaskGroup {
    pub fn min_needed_resources(&self) -> &JobResources {
        &self.min_needed_resources
    }

    pub fn candidacy(&self, task: TaskIndex) -> Option<Candidacy> {
        self.candidacy.get(&task).copied()
    }

    pub fn contains(&self, task: TaskIndex) -> bool {
        self.candidacy.contains_key(&task)
    }

    /// Records that the task has pending jobs with the given minimum memory demand.
    /// New tasks wait in the non-local set until [`TaskGroup::admit_candidates`] runs.
    /// Candidates are re-keyed when their memory demand changes. Delayed tasks keep
    /// their deadline.
    pub fn add_pending_hint(&mut self, task: TaskIndex, min_memory: u64, admit: bool) {
        match self.candidacy.get(&task).copied() {
            None => {
                self.non_local.insert(task);
                self.candidacy.insert(task, Candidacy::AwaitingCandidacy);
                if admit {
                    self.admit(task, min_memory);
                }
            }
            Some(Candidacy::AwaitingCandidacy) => {
                if admit {
                    self.admit(task, min_memory);
                }
            }
            Some(Candidacy::Candidate { min_memory: old }) => {
                if old != min_memory {
                    self.candidates.remove(&(old, task));
                    self.candidates.insert((min_memory, task));
                    self.candidacy
                        .insert(task, Candidacy::Candidate { min_memory });
                }
            }
            Some(Candidacy::Delayed { .. }) => {}
        }
    }

    /// Moves every task awaiting candidacy into the candidate index.
    pub fn admit_candidates(&mut self, min_memory: impl Fn(TaskIndex) -> u64) {
        let awaiting = self.non_local.iter().copied().collect::<Vec<_>>();
        for task in awaiting {
            let memory = min_memory(task);
            self.admit(task, memory);
        }
    }

    fn admit(&mut self, task: TaskIndex, min_memory: u64) {
        self.non_local.shift_remove(&task);
        self.candidates.insert((min_memory, task));
        self.candidacy
            .insert(task, Candidacy::Candidate { min_memory });
    }

    /// Removes the task from every non-local structure.
    pub fn remove_task(&mut self, task: TaskIndex) {
        match self.candidacy.shift_remove(&task) {
            None => {}
            Some(Candidacy::AwaitingCandidacy) => {
                self.non_local.shift_remove(&task);
            }
            Some(Candidacy::Candidate { min_memory }) => {
                self.candidates.remove(&(min_memory, task));
            }
            Some(Candidacy::Delayed { deadline }) => {
                self.delayed.remove(&(deadline, task));
            }
        }
    }

    pub fn add_locality_hint(&mut self, node_id: NodeId, task: TaskIndex) {
        self.node_tasks.entry(node_id).or_default().insert(task);
    }

    pub fn evict_local_task(&mut self, node_id: NodeId, task: TaskIndex) {
        if let Some(tasks) = self.node_tasks.get_mut(&node_id) {
            tasks.shift_remove(&task);
            if tasks.is_empty() {
                self.node_tasks.remove(&node_id);
            }
        }
    }

    pub fn local_tasks(&self, node_id: NodeId) -> Vec<TaskIndex> {
        self.node_tasks
            .get(&node_id)
            .map(|x| x.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The candidates in ascending order of minimum memory demand.
    pub fn candidates(&self) -> Vec<(u64, TaskIndex)> {
        self.candidates.iter().copied().collect()
    }

    pub fn delayed_tasks(&self) -> Vec<(DateTime<Utc>, TaskIndex)> {
        self.delayed.iter().copied().collect()
    }

    /// Moves a candidate into the delay queue.
    pub fn delay(&mut self, task: TaskIndex, deadline: DateTime<Utc>) {
        match self.candidacy.get(&task).copied() {
            Some(Candidacy::Candidate { min_memory }) => {
                self.candidates.remove(&(min_memory, task));
            }
            Some(Candidacy::AwaitingCandidacy) => {
                self.non_local.shift_remove(&task);
            }
            Some(Candidacy::Delayed { deadline: old }) => {
                self.delayed.remove(&(old, task));
            }
            None => {
                warn!("cannot delay task {task} without pending jobs");
                return;
            }
        }
        self.delayed.insert((deadline, task));
        self.candidacy.insert(task, Candidacy::Delayed { deadline });
    }

    /// Moves a delayed task back into the candidate index.
    pub fn undelay(&mut self, task: TaskIndex, min_memory: u64) {
        let Some(Candidacy::Delayed { deadline }) = self.candidacy.get(&task).copied() else {
            return;
        };
        self.delayed.remove(&(deadline, task));
        self.admit(task, min_memory);
    }

    pub fn delayed_task_indices(&self) -> Vec<TaskIndex> {
        self.delayed.iter().map(|(_, task)| *task).collect()
    }

    pub fn non_local_tasks(&self) -> &IndexSet<TaskIndex> {
        &self.non_local
    }

    /// Checks that the candidacy map and its indices agree.
    pub fn validate(&self) -> ControllerResult<()> {
        let count = self.non_local.len() + self.candidates.len() + self.delayed.len();
        if count != self.candidacy.len() {
            return Err(ControllerError::internal(format!(
                "task group indices hold {count} entries for {} pending tasks",
                self.candidacy.len()
            )));
        }
        for (task, candidacy) in self.candidacy.iter() {
            let present = match candidacy {
                Candidacy::AwaitingCandidacy => self.non_local.contains(task),
                Candidacy::Candidate { min_memory } => {
                    self.candidates.contains(&(*min_memory, *task))
                }
                Candidacy::Delayed { deadline } => self.delayed.contains(&(*deadline, *task)),
            };
            if !present {
                return Err(ControllerError::internal(format!(
                    "task {task} is {} but missing from its index",
                    candidacy.status()
                )));
            }
        }
        Ok(())
    }
}
