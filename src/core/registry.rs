//! Phase executor registry.
//!
//! Built once at startup and handed to the engine; there is no global
//! registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::{CommandExecutor, CommandSpec, PhaseExecutor};
use crate::domain::Phase;

/// Maps each phase to the executor that computes it
#[derive(Clone, Default)]
pub struct PhaseRegistry {
    executors: BTreeMap<Phase, Arc<dyn PhaseExecutor>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for a phase
    pub fn register(&mut self, phase: Phase, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(phase, executor);
    }

    /// Builder-style `register`
    pub fn with(mut self, phase: Phase, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.register(phase, executor);
        self
    }

    /// Register one executor for every executable phase
    pub fn with_all(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        for phase in Phase::PLAN {
            self.register(phase, Arc::clone(&executor));
        }
        self
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(&phase).cloned()
    }

    /// Executable phases without an executor
    pub fn missing(&self) -> Vec<Phase> {
        Phase::PLAN
            .into_iter()
            .filter(|phase| !self.executors.contains_key(phase))
            .collect()
    }

    /// Subprocess executors from the `executors` config section
    pub fn from_commands<'a>(commands: impl IntoIterator<Item = (&'a Phase, &'a CommandSpec)>) -> Self {
        let mut registry = Self::new();
        for (phase, spec) in commands {
            registry.register(*phase, Arc::new(CommandExecutor::new(spec.clone())));
        }
        registry
    }
}

impl std::fmt::Debug for PhaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.executors.iter().map(|(phase, executor)| (phase, executor.name())))
            .finish()
    }
}
