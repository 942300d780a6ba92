use crate::builder::EntityBuilder;
use crate::core::StableIdentity;

/// Ordered collection of completed builders awaiting persistence.
#[derive(Debug)]
pub struct Batch {
    id: u64,
    capacity: usize,
    builders: Vec<EntityBuilder>,
}

impl Batch {
    pub fn new(id: u64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            capacity,
            builders: Vec::with_capacity(capacity),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Appends a builder; returns whether the batch reached its threshold.
    pub fn push(&mut self, builder: EntityBuilder) -> bool {
        self.builders.push(builder);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.builders.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn contains(&self, identity: StableIdentity) -> bool {
        self.builders.iter().any(|builder| builder.identity() == identity)
    }

    /// Pulls a not-yet-persisted builder back out of the batch.
    pub fn withdraw(&mut self, identity: StableIdentity) -> Option<EntityBuilder> {
        let position = self
            .builders
            .iter()
            .position(|builder| builder.identity() == identity)?;
        Some(self.builders.remove(position))
    }

    pub fn into_builders(self) -> Vec<EntityBuilder> {
        self.builders
    }
}
