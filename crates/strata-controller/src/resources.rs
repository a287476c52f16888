use std::fmt;

use serde::{Deserialize, Serialize};

/// A resource vector describing either a job demand or a node offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResources {
    pub user_slots: u32,
    pub cpu: f64,
    pub memory: u64,
    pub network: u32,
}

impl JobResources {
    pub fn new(cpu: f64, memory: u64) -> Self {
        Self {
            user_slots: 1,
            cpu,
            memory,
            network: 0,
        }
    }

    pub fn with_user_slots(mut self, user_slots: u32) -> Self {
        self.user_slots = user_slots;
        self
    }

    pub fn with_network(mut self, network: u32) -> Self {
        self.network = network;
        self
    }

    /// Returns whether `self` is at least `other` along every dimension.
    pub fn dominates(&self, other: &JobResources) -> bool {
        self.user_slots >= other.user_slots
            && self.cpu >= other.cpu
            && self.memory >= other.memory
            && self.network >= other.network
    }

    pub fn component_min(&self, other: &JobResources) -> JobResources {
        JobResources {
            user_slots: self.user_slots.min(other.user_slots),
            cpu: self.cpu.min(other.cpu),
            memory: self.memory.min(other.memory),
            network: self.network.min(other.network),
        }
    }

    pub fn saturating_add(&self, other: &JobResources) -> JobResources {
        JobResources {
            user_slots: self.user_slots.saturating_add(other.user_slots),
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            network: self.network.saturating_add(other.network),
        }
    }

    pub fn saturating_sub(&self, other: &JobResources) -> JobResources {
        JobResources {
            user_slots: self.user_slots.saturating_sub(other.user_slots),
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory.saturating_sub(other.memory),
            network: self.network.saturating_sub(other.network),
        }
    }

    pub fn scale(&self, count: usize) -> JobResources {
        let factor = u32::try_from(count).unwrap_or(u32::MAX);
        JobResources {
            user_slots: self.user_slots.saturating_mul(factor),
            cpu: self.cpu * count as f64,
            memory: self.memory.saturating_mul(count as u64),
            network: self.network.saturating_mul(factor),
        }
    }
}

impl fmt::Display for JobResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{user_slots={}, cpu={}, memory={}, network={}}}",
            self.user_slots, self.cpu, self.memory, self.network
        )
    }
}
