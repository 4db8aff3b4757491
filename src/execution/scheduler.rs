//! Execution scheduler - groups a stage's actions into batches

use crate::core::Stage;

/// Strategy for scheduling actions within a wave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Execute actions one at a time
    Sequential,

    /// Execute every action of a wave concurrently
    Parallel,

    /// Limited parallelism (max N concurrent actions)
    LimitedParallel(usize),
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::Parallel
    }
}

impl SchedulingStrategy {
    /// Strategy for an optional concurrency cap
    pub fn from_concurrency(limit: Option<usize>) -> Self {
        match limit {
            None => SchedulingStrategy::Parallel,
            Some(1) => SchedulingStrategy::Sequential,
            Some(n) => SchedulingStrategy::LimitedParallel(n),
        }
    }
}

/// Splits stages into batches of action indices
///
/// Batches run in order; actions within a batch run concurrently. Batches
/// never mix waves, so every action runs after the producers of its inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    pub fn batches(&self, stage: &Stage) -> Vec<Vec<usize>> {
        let size = match self.strategy {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(max) => max.max(1),
        };

        stage
            .waves()
            .into_iter()
            .flat_map(|wave| {
                if size >= wave.len() {
                    vec![wave]
                } else {
                    wave.chunks(size).map(|c| c.to_vec()).collect()
                }
            })
            .collect()
    }
}
