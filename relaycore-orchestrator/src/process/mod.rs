//! Saga/process-manager subsystem (§3 "Process graph", §4.K, §4.L).

pub mod config;
pub mod graph;
pub mod manager;

pub use config::{ProcessConfiguration, ProcessRegistry};
pub use graph::{ProcessGraph, ProcessGraphBuilder, ProcessStep, Transition};
pub use manager::ProcessManager;
