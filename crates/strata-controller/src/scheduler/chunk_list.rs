use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::{CellTag, ChunkListId};

/// Pre-allocated output chunk lists for each cell the operation writes to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkListPool {
    available: IndexMap<CellTag, VecDeque<ChunkListId>>,
    /// The number of chunk lists requested from the host but not yet received.
    #[serde(skip)]
    requested: HashMap<CellTag, usize>,
}

impl ChunkListPool {
    pub fn register_cell(&mut self, cell_tag: CellTag) {
        self.available.entry(cell_tag).or_default();
    }

    /// Whether there is a chunk list for every output of a job.
    pub fn has_enough(&self, cells: &[CellTag]) -> bool {
        let mut needed: HashMap<CellTag, usize> = HashMap::new();
        for cell in cells {
            *needed.entry(*cell).or_default() += 1;
        }
        needed
            .iter()
            .all(|(cell, count)| self.available.get(cell).is_some_and(|x| x.len() >= *count))
    }

    /// Takes one chunk list for each output. Returns [`None`] without taking
    /// anything when some cell is short of chunk lists.
    pub fn take(&mut self, cells: &[CellTag]) -> Option<Vec<ChunkListId>> {
        if !self.has_enough(cells) {
            return None;
        }
        cells
            .iter()
            .map(|cell| self.available.get_mut(cell).and_then(|x| x.pop_front()))
            .collect()
    }

    pub fn add(&mut self, cell_tag: CellTag, chunk_list_ids: Vec<ChunkListId>) {
        if let Some(requested) = self.requested.get_mut(&cell_tag) {
            *requested = requested.saturating_sub(chunk_list_ids.len());
        }
        self.available
            .entry(cell_tag)
            .or_default()
            .extend(chunk_list_ids);
    }

    /// Forgets a request that the host failed to serve.
    pub fn cancel_request(&mut self, cell_tag: CellTag, count: usize) {
        if let Some(requested) = self.requested.get_mut(&cell_tag) {
            *requested = requested.saturating_sub(count);
        }
    }

    /// Returns the number of chunk lists to request for each cell to reach
    /// the watermark, and records the requests as in flight.
    pub fn take_requests(&mut self, watermark: usize) -> Vec<(CellTag, usize)> {
        let mut requests = vec![];
        for (cell, lists) in self.available.iter() {
            let requested = self.requested.entry(*cell).or_default();
            let count = watermark.saturating_sub(lists.len() + *requested);
            if count > 0 {
                *requested += count;
                requests.push((*cell, count));
            }
        }
        requests
    }

    pub fn available_count(&self, cell_tag: CellTag) -> usize {
        self.available.get(&cell_tag).map(|x| x.len()).unwrap_or(0)
    }
}
