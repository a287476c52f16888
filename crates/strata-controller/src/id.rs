use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};

pub trait IdValueType: Sized {
    fn first() -> Self;
    fn next(v: Self) -> ControllerResult<Self>;
}

macro_rules! impl_integer_id_value_type {
    ($type:ty) => {
        impl IdValueType for $type {
            fn first() -> Self {
                1
            }

            fn next(v: Self) -> ControllerResult<Self> {
                v.checked_add(1)
                    .ok_or(ControllerError::InternalError("ID overflow".to_string()))
            }
        }
    };
}

impl_integer_id_value_type!(u64);

pub trait IdType: Sized {
    type Value: IdValueType + From<Self> + Into<Self>;
}

macro_rules! define_id_type {
    ($name:ident, $value_type:ty) => {
        #[derive(
            Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
        )]
        pub struct $name($value_type);

        impl From<$value_type> for $name {
            fn from(id: $value_type) -> Self {
                Self(id)
            }
        }

        impl From<$name> for $value_type {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! define_generated_id_type {
    ($name:ident, $value_type:ty) => {
        define_id_type!($name, $value_type);

        impl IdType for $name {
            type Value = $value_type;
        }
    };
}

define_generated_id_type!(JobId, u64);
define_id_type!(NodeId, u64);
define_id_type!(ChunkId, u64);
define_id_type!(ChunkListId, u64);
define_id_type!(TransactionId, u64);
define_id_type!(CellTag, u64);

// Dense indices into the task and task group tables.
define_id_type!(TaskIndex, usize);
define_id_type!(TaskGroupIndex, usize);
// Identifies one stripe of a task chunk pool, and the output cookie of the jobs
// that process the stripe.
define_id_type!(PoolCookie, usize);

impl TaskIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl TaskGroupIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

impl PoolCookie {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A chunk tree is either a chunk or a chunk list.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ChunkTreeId {
    Chunk(ChunkId),
    ChunkList(ChunkListId),
}

impl From<ChunkId> for ChunkTreeId {
    fn from(id: ChunkId) -> Self {
        ChunkTreeId::Chunk(id)
    }
}

impl From<ChunkListId> for ChunkTreeId {
    fn from(id: ChunkListId) -> Self {
        ChunkTreeId::ChunkList(id)
    }
}

#[derive(Debug)]
pub struct IdGenerator<T: IdType> {
    next_value: T::Value,
    phantom: PhantomData<T>,
}

impl<T: IdType> IdGenerator<T>
where
    T::Value: Copy,
{
    pub fn new() -> Self {
        Self {
            next_value: T::Value::first(),
            phantom: PhantomData,
        }
    }

    /// Creates a generator that continues from a previously observed value.
    pub fn starting_at(value: T::Value) -> Self {
        Self {
            next_value: value,
            phantom: PhantomData,
        }
    }

    pub fn peek(&self) -> T::Value {
        self.next_value
    }

    pub fn next(&mut self) -> ControllerResult<T> {
        let value = self.next_value;
        self.next_value = T::Value::next(value)?;
        Ok(value.into())
    }
}

impl<T: IdType> Default for IdGenerator<T>
where
    T::Value: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "tests use unwrap for brevity")]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator() {
        let mut generator = IdGenerator::<JobId>::new();
        assert_eq!(generator.next().unwrap(), JobId::from(1));
        assert_eq!(generator.next().unwrap(), JobId::from(2));
        assert_eq!(generator.peek(), 3);

        let mut generator = IdGenerator::<JobId>::starting_at(u64::MAX);
        assert_eq!(generator.next().ok(), None);
    }
}
