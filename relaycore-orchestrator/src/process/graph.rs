//! Declarative process graph (§3 "Process graph (in-memory)", §4.K): an
//! immutable DAG of named steps built once at startup and shared
//! read-only thereafter by every process instance of its type.

use std::collections::HashMap;
use std::sync::Arc;

use relaycore_shared::errors::{PlatformError, PlatformResult};
use serde_json::Value;

/// A predicate over the process's rolling data map, used by `Conditional`.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// How control flows out of a step once its reply has been handled.
#[derive(Clone)]
pub enum Transition {
    /// No successor; a COMPLETED reply on this step finishes the process.
    Terminal,
    /// Unconditional edge to `next`.
    Linear { next: String },
    /// `whenFalse` absent ⇒ "optional step": a false predicate is treated
    /// as if this step did not exist, falling through textually (§4.K).
    Conditional {
        predicate: Predicate,
        when_true: String,
        when_false: Option<String>,
    },
    /// Fan out `branches` in parallel; control rejoins at `join_step` once
    /// every branch has replied COMPLETED (§4.L fail-fast protocol).
    Parallel {
        branches: Vec<String>,
        join_step: String,
    },
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Terminal => write!(f, "Terminal"),
            Transition::Linear { next } => write!(f, "Linear({next})"),
            Transition::Conditional { when_true, when_false, .. } => {
                write!(f, "Conditional(true={when_true}, false={when_false:?})")
            }
            Transition::Parallel { branches, join_step } => {
                write!(f, "Parallel({branches:?} -> {join_step})")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessStep {
    pub name: String,
    pub compensation: Option<String>,
    pub transition: Transition,
}

impl ProcessStep {
    pub fn requires_compensation(&self) -> bool {
        self.compensation.is_some()
    }
}

/// An immutable, validated DAG: `stepName -> ProcessStep`.
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    steps: HashMap<String, ProcessStep>,
    initial_step: String,
}

impl ProcessGraph {
    pub fn step(&self, name: &str) -> Option<&ProcessStep> {
        self.steps.get(name)
    }

    pub fn initial_step(&self) -> &str {
        &self.initial_step
    }

    /// Resolve the next step after `current` completes, given the process's
    /// current data map (§4.L sequential reply handling). Returns `None`
    /// when the process should complete.
    pub fn next_step(&self, current: &str, data: &Value) -> PlatformResult<Option<String>> {
        let step = self
            .steps
            .get(current)
            .ok_or_else(|| PlatformError::UnknownProcessType(current.to_string()))?;

        Ok(match &step.transition {
            Transition::Terminal => None,
            Transition::Linear { next } => Some(next.clone()),
            Transition::Conditional {
                predicate,
                when_true,
                when_false,
            } => {
                if predicate(data) {
                    Some(when_true.clone())
                } else {
                    when_false.clone()
                }
            }
            Transition::Parallel { join_step, .. } => Some(join_step.clone()),
        })
    }
}

/// Builds a [`ProcessGraph`], validating it before it becomes immutable
/// (§7 `InvalidProcessGraph` — registration-time failure).
#[derive(Default)]
pub struct ProcessGraphBuilder {
    steps: HashMap<String, ProcessStep>,
    initial_step: Option<String>,
}

impl ProcessGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial(mut self, step: impl Into<String>) -> Self {
        self.initial_step = Some(step.into());
        self
    }

    pub fn step(mut self, step: ProcessStep) -> Self {
        self.steps.insert(step.name.clone(), step);
        self
    }

    pub fn build(self, process_type: &str) -> PlatformResult<ProcessGraph> {
        let initial_step = self.initial_step.ok_or_else(|| PlatformError::InvalidProcessGraph {
            process_type: process_type.to_string(),
            reason: "no initial step declared".to_string(),
        })?;

        if !self.steps.contains_key(&initial_step) {
            return Err(PlatformError::InvalidProcessGraph {
                process_type: process_type.to_string(),
                reason: format!("initial step {initial_step} is not a declared step"),
            });
        }

        for step in self.steps.values() {
            Self::validate_step(process_type, step, &self.steps)?;
        }

        Ok(ProcessGraph {
            steps: self.steps,
            initial_step,
        })
    }

    fn validate_step(
        process_type: &str,
        step: &ProcessStep,
        steps: &HashMap<String, ProcessStep>,
    ) -> PlatformResult<()> {
        let missing = |target: &str| -> PlatformResult<()> {
            if steps.contains_key(target) {
                Ok(())
            } else {
                Err(PlatformError::InvalidProcessGraph {
                    process_type: process_type.to_string(),
                    reason: format!("step {} references unknown step {target}", step.name),
                })
            }
        };

        match &step.transition {
            Transition::Terminal => Ok(()),
            Transition::Linear { next } => missing(next),
            Transition::Conditional {
                when_true,
                when_false,
                ..
            } => {
                missing(when_true)?;
                if let Some(when_false) = when_false {
                    missing(when_false)?;
                }
                Ok(())
            }
            Transition::Parallel { branches, join_step } => {
                if branches.is_empty() {
                    return Err(PlatformError::InvalidParallelStep {
                        step: step.name.clone(),
                        reason: "no branches declared".to_string(),
                    });
                }
                for branch in branches {
                    missing(branch)?;
                }
                missing(join_step)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminal(name: &str) -> ProcessStep {
        ProcessStep {
            name: name.to_string(),
            compensation: None,
            transition: Transition::Terminal,
        }
    }

    fn linear(name: &str, next: &str) -> ProcessStep {
        ProcessStep {
            name: name.to_string(),
            compensation: None,
            transition: Transition::Linear { next: next.to_string() },
        }
    }

    #[test]
    fn linear_chain_resolves_next_step_in_order() {
        let graph = ProcessGraphBuilder::new()
            .initial("BookLimits")
            .step(linear("BookLimits", "CreateTransaction"))
            .step(linear("CreateTransaction", "CreatePayment"))
            .step(terminal("CreatePayment"))
            .build("SubmitPayment")
            .unwrap();

        assert_eq!(
            graph.next_step("BookLimits", &Value::Null).unwrap(),
            Some("CreateTransaction".to_string())
        );
        assert_eq!(graph.next_step("CreatePayment", &Value::Null).unwrap(), None);
    }

    #[test]
    fn optional_conditional_falls_through_when_false_branch_absent() {
        let graph = ProcessGraphBuilder::new()
            .initial("Start")
            .step(ProcessStep {
                name: "Start".to_string(),
                compensation: None,
                transition: Transition::Conditional {
                    predicate: Arc::new(|data| data.get("requiresFx").and_then(Value::as_bool).unwrap_or(false)),
                    when_true: "ConvertFx".to_string(),
                    when_false: None,
                },
            })
            .step(terminal("ConvertFx"))
            .build("SubmitPayment")
            .unwrap();

        let data = serde_json::json!({ "requiresFx": false });
        assert_eq!(graph.next_step("Start", &data).unwrap(), None);

        let data = serde_json::json!({ "requiresFx": true });
        assert_eq!(graph.next_step("Start", &data).unwrap(), Some("ConvertFx".to_string()));
    }

    #[test]
    fn parallel_step_with_no_branches_is_rejected_at_build_time() {
        let result = ProcessGraphBuilder::new()
            .initial("Start")
            .step(ProcessStep {
                name: "Start".to_string(),
                compensation: None,
                transition: Transition::Parallel {
                    branches: vec![],
                    join_step: "Join".to_string(),
                },
            })
            .step(terminal("Join"))
            .build("ParallelTest");

        assert!(matches!(result, Err(PlatformError::InvalidParallelStep { .. })));
    }

    #[test]
    fn referencing_an_undeclared_step_is_rejected() {
        let result = ProcessGraphBuilder::new()
            .initial("Start")
            .step(linear("Start", "Nowhere"))
            .build("BrokenGraph");

        assert!(matches!(result, Err(PlatformError::InvalidProcessGraph { .. })));
    }
}
