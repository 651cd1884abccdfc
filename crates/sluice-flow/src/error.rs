//! Error types for the workflow engine.

use sluice_core::{DagInstanceId, TaskInstanceId};

/// The result type used throughout `sluice-flow`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type actions return from their hooks.
///
/// Action failures are recorded onto the failing task instance as a reason
/// string; they never crash the worker.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A store lookup found no matching row.
    #[error("data not found: {resource} with id {id}")]
    DataNotFound {
        /// The kind of entity that was looked up.
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A create collided with an existing id.
    #[error("data conflicted: {resource} with id {id} already exists")]
    DataConflicted {
        /// The kind of entity being created.
        resource: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// The keeper reported no live workers; nothing can be dispatched.
    #[error("no alive nodes")]
    NoAliveNodes,

    /// An unlock was attempted on a mutex the caller does not hold.
    #[error("mutex already unlocked: {key}")]
    MutexAlreadyUnlocked {
        /// The mutex key.
        key: String,
    },

    /// A distributed mutex could not be acquired before the wait deadline.
    #[error("mutex lock timed out: {key}")]
    MutexLockTimeout {
        /// The mutex key.
        key: String,
    },

    /// The task graph contains a cycle.
    #[error("dag has cycle at: {start}")]
    CycleDetected {
        /// Graph id of a task inside the cycle.
        start: String,
    },

    /// A declared dependency does not resolve to a task in the same DAG.
    #[error("does not find task[{task_id}] depend: {depend}")]
    DanglingDependency {
        /// The task declaring the dependency.
        task_id: String,
        /// The dependency that could not be resolved.
        depend: String,
    },

    /// Two tasks in one DAG share an id.
    #[error("task id is repeat, id: {task_id}")]
    DuplicateTaskId {
        /// The repeated id.
        task_id: String,
    },

    /// Every task declares dependencies, so nothing can start.
    #[error("here is no start nodes")]
    NoStartNodes,

    /// A task references an action missing from the registry.
    #[error("action not found: {name}")]
    ActionNotFound {
        /// The unresolved action name.
        name: String,
    },

    /// An action hook returned an error or panicked.
    ///
    /// Recorded onto the task as its failure reason; never crashes the
    /// worker.
    #[error("{message}")]
    ActionFailed {
        /// The wrapped hook failure.
        message: String,
    },

    /// An invalid task state transition was attempted.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The current state label.
        from: String,
        /// The attempted target state label.
        to: String,
    },

    /// A command cannot be applied to the DAG instance in its current state.
    #[error("invalid command: {message}")]
    InvalidCommand {
        /// Why the command was rejected.
        message: String,
    },

    /// A pre-check declaration is malformed.
    #[error("pre-check[{name}] is invalid: {message}")]
    InvalidPreCheck {
        /// The pre-check name.
        name: String,
        /// What made it invalid.
        message: String,
    },

    /// Parameter rendering failed (typically an unresolved placeholder).
    #[error("render failed: {message}")]
    Render {
        /// Description of the failure.
        message: String,
    },

    /// Parameter decoding into an action's typed container failed.
    #[error("decode params failed: {message}")]
    Decode {
        /// Description of the failure.
        message: String,
    },

    /// The parser has no task tree for a DAG instance.
    #[error("dag instance[{dag_ins_id}] does not found task tree")]
    TaskTreeMissing {
        /// The orphaned DAG instance.
        dag_ins_id: DagInstanceId,
    },

    /// A reported task instance has no matching node in its tree.
    #[error("task instance[{task_ins_id}] does not found normal node")]
    TaskNodeMissing {
        /// The unmatched task instance.
        task_ins_id: TaskInstanceId,
    },

    /// Waiting for a command to be consumed timed out.
    #[error("watch command executing timeout")]
    CommandWatchTimeout,

    /// A best-effort batch completed with per-item failures.
    #[error("batch failed: {}", messages.join("; "))]
    Batch {
        /// One message per failed item.
        messages: Vec<String>,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from sluice-core.
    #[error("core error: {0}")]
    Core(#[from] sluice_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new render error.
    #[must_use]
    pub fn render(message: impl Into<String>) -> Self {
        Self::Render {
            message: message.into(),
        }
    }

    /// Creates a new decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error.
    ///
    /// Creation paths tolerate not-found as "absent, must create".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::DataNotFound { .. })
    }
}
