//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational pieces shared across all Conductor
//! crates: the unified error type and the TOML configuration model.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`ConductorConfig`]: Top-level configuration loaded from `conductor.toml`.

/// Configuration model and loading.
pub mod config;

pub use config::{
    AgentPoolConfig, AgentsConfig, ConductorConfig, ConflictsConfig, ExecutorConfig,
    LocksConfig, OptimizerConfig, SupervisorConfig,
};

// --- Error types ---

/// Top-level error type for the Conductor engine.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// The referenced task is not in the task table.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The referenced agent is not registered with the coordinator.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// A state transition was requested that the task state machine forbids.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The operation would touch resources owned by other in-flight work.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A resource lock could not be acquired or released.
    #[error("Lock error: {0}")]
    Lock(String),

    /// The task store failed to load or persist tasks.
    #[error("Store error: {0}")]
    Store(String),

    /// The work executor failed to run a task.
    #[error("Executor error: {0}")]
    Executor(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A generic orchestration failure (cycles, duplicate IDs, spawning).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;
