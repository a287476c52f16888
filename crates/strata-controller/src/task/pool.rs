use std::collections::HashMap;

use indexmap::IndexSet;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkReplica, ChunkStripe};
use crate::id::{ChunkId, JobId, NodeId, PoolCookie};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripeState {
    Pending,
    /// The stripe is processed by one job, or by a job and its speculative duplicates.
    Running { jobs: Vec<JobId> },
    /// The stripe has been processed, or has no data left after chunks were skipped.
    Completed { job_id: Option<JobId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StripeEntry {
    stripe: ChunkStripe,
    state: StripeState,
    /// The stripe cannot be extracted while this is positive.
    suspend_count: usize,
}

impl StripeEntry {
    fn is_extractable(&self) -> bool {
        matches!(self.state, StripeState::Pending) && self.suspend_count == 0
    }
}

/// The per-task pool of input stripes addressed by cookies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPool {
    stripes: Vec<StripeEntry>,
    /// Running cookies for which one speculative duplicate has been requested.
    speculative: IndexSet<PoolCookie>,
    /// Whether no more stripes will be added.
    finished: bool,
    /// Chunks removed from the pool after they were skipped.
    disappeared: HashMap<ChunkId, Vec<PoolCookie>>,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stripe(&mut self, stripe: ChunkStripe) -> PoolCookie {
        let cookie = PoolCookie::from(self.stripes.len());
        let state = if stripe.is_empty() {
            StripeState::Completed { job_id: None }
        } else {
            StripeState::Pending
        };
        self.stripes.push(StripeEntry {
            stripe,
            state,
            suspend_count: 0,
        });
        cookie
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stripe(&self, cookie: PoolCookie) -> Option<&ChunkStripe> {
        self.stripes.get(cookie.index()).map(|x| &x.stripe)
    }

    pub fn state(&self, cookie: PoolCookie) -> Option<&StripeState> {
        self.stripes.get(cookie.index()).map(|x| &x.state)
    }

    pub fn is_suspended(&self, cookie: PoolCookie) -> bool {
        self.stripes
            .get(cookie.index())
            .is_some_and(|x| x.suspend_count > 0)
    }

    pub fn suspend(&mut self, cookie: PoolCookie) {
        let Some(entry) = self.stripes.get_mut(cookie.index()) else {
            warn!("cannot suspend unknown pool cookie {cookie}");
            return;
        };
        entry.suspend_count += 1;
    }

    pub fn resume(&mut self, cookie: PoolCookie) {
        let Some(entry) = self.stripes.get_mut(cookie.index()) else {
            warn!("cannot resume unknown pool cookie {cookie}");
            return;
        };
        if entry.suspend_count == 0 {
            warn!("pool cookie {cookie} is not suspended");
            return;
        }
        entry.suspend_count -= 1;
    }

    /// Replaces the stripe of a cookie that is pending regeneration and resumes it.
    pub fn reset_and_resume(&mut self, cookie: PoolCookie, stripe: ChunkStripe) {
        let Some(entry) = self.stripes.get_mut(cookie.index()) else {
            warn!("cannot reset unknown pool cookie {cookie}");
            return;
        };
        entry.stripe = stripe;
        entry.suspend_count = entry.suspend_count.saturating_sub(1);
    }

    /// The total data weight of extractable stripes with a replica on the node.
    pub fn locality(&self, node_id: NodeId) -> u64 {
        self.stripes
            .iter()
            .filter(|x| x.is_extractable())
            .map(|x| x.stripe.locality(node_id))
            .sum()
    }

    /// The nodes holding replicas of extractable stripes.
    pub fn locality_nodes(&self) -> IndexSet<NodeId> {
        self.stripes
            .iter()
            .filter(|x| x.is_extractable())
            .flat_map(|x| x.stripe.nodes())
            .collect()
    }

    /// Picks the extractable stripe with the most data on the node and marks it running.
    /// Speculative requests are served only when no regular stripe is extractable.
    pub fn extract(&mut self, node_id: NodeId, job_id: JobId) -> Option<PoolCookie> {
        let mut best: Option<(usize, u64)> = None;
        for (i, entry) in self.stripes.iter().enumerate() {
            if !entry.is_extractable() {
                continue;
            }
            let locality = entry.stripe.locality(node_id);
            if best.is_none_or(|(_, x)| locality > x) {
                best = Some((i, locality));
            }
        }
        if let Some((i, _)) = best {
            self.stripes[i].state = StripeState::Running { jobs: vec![job_id] };
            return Some(PoolCookie::from(i));
        }
        let cookie = self.speculative.shift_remove_index(0)?;
        match self.stripes.get_mut(cookie.index()).map(|x| &mut x.state) {
            Some(StripeState::Running { jobs }) => {
                jobs.push(job_id);
                Some(cookie)
            }
            _ => {
                warn!("speculative request for pool cookie {cookie} is stale");
                None
            }
        }
    }

    /// Marks the cookie completed and returns the competing jobs still running for it.
    pub fn completed(&mut self, cookie: PoolCookie, job_id: JobId) -> Vec<JobId> {
        self.speculative.shift_remove(&cookie);
        let Some(entry) = self.stripes.get_mut(cookie.index()) else {
            warn!("cannot complete unknown pool cookie {cookie}");
            return vec![];
        };
        let competitors: Vec<JobId> = match &entry.state {
            StripeState::Running { jobs } => jobs.iter().filter(|x| **x != job_id).copied().collect(),
            _ => vec![],
        };
        entry.state = StripeState::Completed {
            job_id: Some(job_id),
        };
        competitors
    }

    /// Returns the cookie to the pool unless another job still covers it.
    pub fn failed(&mut self, cookie: PoolCookie, job_id: JobId) {
        self.release(cookie, job_id);
    }

    pub fn aborted(&mut self, cookie: PoolCookie, job_id: JobId) {
        self.release(cookie, job_id);
    }

    fn release(&mut self, cookie: PoolCookie, job_id: JobId) {
        let Some(entry) = self.stripes.get_mut(cookie.index()) else {
            warn!("cannot release unknown pool cookie {cookie}");
            return;
        };
        if let StripeState::Running { jobs } = &mut entry.state {
            jobs.retain(|x| *x != job_id);
            if jobs.is_empty() {
                entry.state = StripeState::Pending;
                self.speculative.shift_remove(&cookie);
            }
        }
    }

    /// Returns a completed cookie to the pool after its output was lost.
    pub fn lost(&mut self, cookie: PoolCookie) -> bool {
        let Some(entry) = self.stripes.get_mut(cookie.index()) else {
            warn!("cannot mark unknown pool cookie {cookie} as lost");
            return false;
        };
        match entry.state {
            StripeState::Completed { job_id: Some(_) } => {
                entry.state = StripeState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Requests a speculative duplicate for a cookie processed by exactly one job.
    pub fn register_speculative(&mut self, cookie: PoolCookie) -> bool {
        let Some(entry) = self.stripes.get(cookie.index()) else {
            return false;
        };
        match &entry.state {
            StripeState::Running { jobs } if jobs.len() == 1 => self.speculative.insert(cookie),
            _ => false,
        }
    }

    /// Whether the job lost the race against a competitor for the same cookie.
    pub fn has_competitor_completed(&self, cookie: PoolCookie, job_id: JobId) -> bool {
        matches!(
            self.stripes.get(cookie.index()).map(|x| &x.state),
            Some(StripeState::Completed { job_id: Some(winner) }) if *winner != job_id
        )
    }

    /// Removes every slice of the chunk. Returns the cookies whose stripes were changed.
    pub fn remove_chunk(&mut self, chunk_id: ChunkId) -> Vec<PoolCookie> {
        let mut cookies = vec![];
        for (i, entry) in self.stripes.iter_mut().enumerate() {
            let count = entry.stripe.slices.len();
            entry.stripe.slices.retain(|s| s.chunk_id != chunk_id);
            if entry.stripe.slices.len() == count {
                continue;
            }
            cookies.push(PoolCookie::from(i));
            if entry.stripe.is_empty() && matches!(entry.state, StripeState::Pending) {
                entry.state = StripeState::Completed { job_id: None };
            }
        }
        self.disappeared.insert(chunk_id, cookies.clone());
        cookies
    }

    pub fn is_disappeared(&self, chunk_id: ChunkId) -> bool {
        self.disappeared.contains_key(&chunk_id)
    }

    pub fn update_replicas(&mut self, chunk_id: ChunkId, replicas: &[ChunkReplica]) {
        for entry in self.stripes.iter_mut() {
            for slice in entry.stripe.slices.iter_mut() {
                if slice.chunk_id == chunk_id {
                    slice.replicas = replicas.to_vec();
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.stripes.iter().filter(|x| x.is_extractable()).count() + self.speculative.len()
    }

    pub fn running_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|x| match &x.state {
                StripeState::Running { jobs } => jobs.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn total_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn completed_count(&self) -> usize {
        self.stripes
            .iter()
            .filter(|x| matches!(x.state, StripeState::Completed { .. }))
            .count()
    }

    pub fn is_completed(&self) -> bool {
        self.finished
            && self
                .stripes
                .iter()
                .all(|x| matches!(x.state, StripeState::Completed { .. }))
    }
}
