//! The scheduling and bookkeeping core of a distributed operation controller.
//!
//! An operation is split into tasks, each owning a chunk pool of stripes. The
//! [`controller::ControllerActor`] serializes every event of the operation and
//! drives the scheduler, the chunk availability tracker, the job lifecycle and
//! the snapshot coordinator.

pub mod chunk;
pub mod chunk_tracker;
pub mod controller;
pub mod error;
pub mod host;
pub mod id;
pub mod lifecycle;
pub mod metrics;
pub mod resources;
pub mod scheduler;
pub mod snapshot;
pub mod statistics;
pub mod task;
pub mod task_group;

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "tests use unwrap for brevity")]
pub(crate) mod testing;
