//! `ProcessConfiguration` and the process-type registry (§4.L, §7
//! REDESIGN FLAGS): one concrete manager parameterized by a
//! `processType -> ProcessConfiguration` map, rather than a class
//! hierarchy. Built once at startup and read-only thereafter (§5).

use std::collections::HashMap;
use std::sync::Arc;

use relaycore_shared::errors::{PlatformError, PlatformResult};

use crate::process::graph::ProcessGraph;

/// A retryability classifier for a single step; defaults to "always
/// retryable" when a configuration does not override it.
pub type IsRetryable = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ProcessConfiguration {
    pub process_type: String,
    pub graph: ProcessGraph,
    pub is_retryable: IsRetryable,
    /// Overrides `processManager.maxRetriesPerStep` for this process type.
    pub max_retries_per_step: Option<u32>,
}

impl std::fmt::Debug for ProcessConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConfiguration")
            .field("process_type", &self.process_type)
            .field("max_retries_per_step", &self.max_retries_per_step)
            .finish_non_exhaustive()
    }
}

impl ProcessConfiguration {
    pub fn new(process_type: impl Into<String>, graph: ProcessGraph) -> Self {
        Self {
            process_type: process_type.into(),
            graph,
            is_retryable: Arc::new(|_step, _error| true),
            max_retries_per_step: None,
        }
    }

    pub fn with_is_retryable(mut self, f: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Arc::new(f);
        self
    }

    pub fn with_max_retries_per_step(mut self, max: u32) -> Self {
        self.max_retries_per_step = Some(max);
        self
    }

    pub fn max_retries(&self, default_max_retries: u32) -> u32 {
        self.max_retries_per_step.unwrap_or(default_max_retries)
    }
}

/// Process-type -> configuration map, built once at startup from the
/// configured set of sagas the platform knows about.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    configurations: HashMap<String, ProcessConfiguration>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ambiguity here (registering the same process type twice) is a
    /// startup error, mirroring the handler registry's rule (§4.I).
    pub fn register(&mut self, configuration: ProcessConfiguration) -> PlatformResult<()> {
        if self.configurations.contains_key(&configuration.process_type) {
            return Err(PlatformError::InvalidProcessGraph {
                process_type: configuration.process_type.clone(),
                reason: "a configuration for this process type is already registered".to_string(),
            });
        }
        self.configurations.insert(configuration.process_type.clone(), configuration);
        Ok(())
    }

    pub fn get(&self, process_type: &str) -> PlatformResult<&ProcessConfiguration> {
        self.configurations
            .get(process_type)
            .ok_or_else(|| PlatformError::UnknownProcessType(process_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::graph::{ProcessGraphBuilder, ProcessStep, Transition};

    fn trivial_graph() -> ProcessGraph {
        ProcessGraphBuilder::new()
            .initial("Only")
            .step(ProcessStep {
                name: "Only".to_string(),
                compensation: None,
                transition: Transition::Terminal,
            })
            .build("Trivial")
            .unwrap()
    }

    #[test]
    fn registering_the_same_process_type_twice_is_an_error() {
        let mut registry = ProcessRegistry::new();
        registry
            .register(ProcessConfiguration::new("Trivial", trivial_graph()))
            .unwrap();
        let result = registry.register(ProcessConfiguration::new("Trivial", trivial_graph()));
        assert!(matches!(result, Err(PlatformError::InvalidProcessGraph { .. })));
    }

    #[test]
    fn unknown_process_type_is_reported() {
        let registry = ProcessRegistry::new();
        assert!(matches!(
            registry.get("DoesNotExist"),
            Err(PlatformError::UnknownProcessType(_))
        ));
    }

    #[test]
    fn max_retries_falls_back_to_default_when_unset() {
        let configuration = ProcessConfiguration::new("Trivial", trivial_graph());
        assert_eq!(configuration.max_retries(3), 3);
        let configuration = configuration.with_max_retries_per_step(5);
        assert_eq!(configuration.max_retries(3), 5);
    }
}
