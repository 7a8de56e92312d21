use thiserror::Error;

use crate::workspace::{BranchId, SupervisorId};

/// An error returned when submitting work to a branch that has begun shutting
/// down.
///
/// Once a branch is draining it no longer accepts tasks; the rejected task is
/// dropped at the submission site.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("branch is shutting down and no longer accepts tasks")]
pub struct ShutdownError;

/// Errors surfaced by workspace operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceError {
    /// The workspace has begun shutting down; attach and dispatch are refused.
    #[error("workspace is shutting down")]
    Shutdown,

    /// Dispatch was attempted with no branches attached.
    #[error("workspace has no attached branches to dispatch to")]
    NoBranches,

    /// No branch is attached under the given identifier.
    #[error("no branch attached with id {0}")]
    UnknownBranch(BranchId),

    /// No supervisor is attached under the given identifier.
    #[error("no supervisor attached with id {0}")]
    UnknownSupervisor(SupervisorId),

    /// The branch chosen by dispatch refused the task.
    #[error(transparent)]
    Rejected(#[from] ShutdownError),
}

/// An error returned when attempting to configure the common branch after it
/// has already been initialized.
#[derive(Error, Debug)]
#[error("common branch has already been initialized")]
pub struct CommonAlreadyInitializedError(pub(crate) ());
