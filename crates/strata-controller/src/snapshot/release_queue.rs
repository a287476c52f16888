use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// A position in the append log of a [`ReleaseQueue`].
pub type ReleaseCookie = u64;

/// An append log of items whose release is deferred until a checkpoint
/// covering them has been durably stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseQueue<T> {
    items: VecDeque<T>,
    /// The log position of the first queued item.
    head: ReleaseCookie,
}

impl<T> Default for ReleaseQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            head: 0,
        }
    }
}

impl<T> ReleaseQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Returns the cookie covering every item pushed so far.
    pub fn checkpoint(&self) -> ReleaseCookie {
        self.head + self.items.len() as ReleaseCookie
    }

    pub fn head_cookie(&self) -> ReleaseCookie {
        self.head
    }

    /// Removes the items pushed before the checkpoint was taken, in push order.
    pub fn release(&mut self, cookie: ReleaseCookie) -> Vec<T> {
        let count = cookie.saturating_sub(self.head).min(self.items.len() as ReleaseCookie);
        self.head += count;
        self.items.drain(..count as usize).collect()
    }

    pub fn release_all(&mut self) -> Vec<T> {
        let cookie = self.checkpoint();
        self.release(cookie)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}
