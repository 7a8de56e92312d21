use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::debug;

use crate::{error::WorkspaceError, task::Task, Branch, Supervisor};

/// An opaque identifier for a branch attached to a [`Workspace`].
///
/// Identifiers are only meaningful to the workspace instance that issued
/// them, and are never reused within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchId(u64);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque identifier for a supervisor attached to a [`Workspace`].
///
/// Identifiers are only meaningful to the workspace instance that issued
/// them, and are never reused within it. Branch and supervisor identifiers
/// are disjoint spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SupervisorId(u64);

impl fmt::Display for SupervisorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An owning container for branches and supervisors with a load-balanced
/// dispatch entry point.
///
/// Components are attached in exchange for identifiers and can be looked up
/// or detached by identifier later. Tasks submitted through the workspace go
/// to the attached branch with the lightest observed queue, with ties broken
/// round-robin.
///
/// Attaching, detaching, and shutting down require `&mut self`; exclusive
/// access is the synchronization. Dispatch and lookup take `&self` and may be
/// used from several threads once attachment is complete. The least-loaded
/// scan is intentionally not atomic with the submission it leads to, which
/// can occasionally pick a slightly busier branch and is accepted.
///
/// Dropping the workspace stops every supervisor first and only then drains
/// the branches, so a supervisor can never observe a freed branch.
///
/// # Examples
///
/// ```
/// use arbor::{Branch, Workspace};
///
/// let mut workspace = Workspace::new();
///
/// let id = workspace
///     .attach_branch(Branch::builder().name("pool-a").size(2).build())
///     .unwrap();
///
/// let task = workspace.execute(|| 40 + 2).unwrap();
/// assert_eq!(task.join(), 42);
///
/// workspace.branch(id).unwrap().wait();
/// ```
#[derive(Default)]
pub struct Workspace {
    branches: BTreeMap<BranchId, Branch>,
    supervisors: BTreeMap<SupervisorId, Supervisor>,
    next_branch_id: u64,
    next_supervisor_id: u64,
    cursor: AtomicUsize,
    closed: bool,
}

impl Workspace {
    /// Create an empty workspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a branch and return its identifier.
    ///
    /// Fails if the workspace is shutting down.
    pub fn attach_branch(&mut self, branch: Branch) -> Result<BranchId, WorkspaceError> {
        if self.closed {
            return Err(WorkspaceError::Shutdown);
        }

        let id = BranchId(self.next_branch_id);
        self.next_branch_id += 1;

        debug!(branch = %id, name = ?branch.name(), "attached branch");
        self.branches.insert(id, branch);

        Ok(id)
    }

    /// Take ownership of a supervisor and return its identifier.
    ///
    /// Fails if the workspace is shutting down.
    pub fn attach_supervisor(
        &mut self,
        supervisor: Supervisor,
    ) -> Result<SupervisorId, WorkspaceError> {
        if self.closed {
            return Err(WorkspaceError::Shutdown);
        }

        let id = SupervisorId(self.next_supervisor_id);
        self.next_supervisor_id += 1;

        debug!(supervisor = %id, "attached supervisor");
        self.supervisors.insert(id, supervisor);

        Ok(id)
    }

    /// Release ownership of a branch and return it to the caller.
    ///
    /// If the branch is supervised by a workspace-owned supervisor, the
    /// supervisor's weak observation simply lapses when the caller eventually
    /// drops the branch.
    pub fn detach_branch(&mut self, id: BranchId) -> Result<Branch, WorkspaceError> {
        let branch = self
            .branches
            .remove(&id)
            .ok_or(WorkspaceError::UnknownBranch(id))?;

        debug!(branch = %id, "detached branch");
        Ok(branch)
    }

    /// Release ownership of a supervisor and return it to the caller.
    pub fn detach_supervisor(&mut self, id: SupervisorId) -> Result<Supervisor, WorkspaceError> {
        let supervisor = self
            .supervisors
            .remove(&id)
            .ok_or(WorkspaceError::UnknownSupervisor(id))?;

        debug!(supervisor = %id, "detached supervisor");
        Ok(supervisor)
    }

    /// Look up an attached branch.
    pub fn branch(&self, id: BranchId) -> Result<&Branch, WorkspaceError> {
        self.branches
            .get(&id)
            .ok_or(WorkspaceError::UnknownBranch(id))
    }

    /// Look up an attached supervisor.
    pub fn supervisor(&self, id: SupervisorId) -> Result<&Supervisor, WorkspaceError> {
        self.supervisors
            .get(&id)
            .ok_or(WorkspaceError::UnknownSupervisor(id))
    }

    /// Iterate over attached branches in identifier order.
    pub fn branches(&self) -> impl Iterator<Item = (BranchId, &Branch)> {
        self.branches.iter().map(|(id, branch)| (*id, branch))
    }

    /// Iterate over attached supervisors in identifier order.
    pub fn supervisors(&self) -> impl Iterator<Item = (SupervisorId, &Supervisor)> {
        self.supervisors.iter().map(|(id, sup)| (*id, sup))
    }

    /// The number of attached branches.
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// The number of attached supervisors.
    pub fn supervisor_count(&self) -> usize {
        self.supervisors.len()
    }

    /// Apply a closure to every attached branch in identifier order.
    ///
    /// Useful for orchestrating drains:
    ///
    /// ```
    /// # let workspace = arbor::Workspace::new();
    /// workspace.for_each_branch(|branch| {
    ///     branch.wait();
    /// });
    /// ```
    pub fn for_each_branch<F>(&self, mut f: F)
    where
        F: FnMut(&Branch),
    {
        for branch in self.branches.values() {
            f(branch);
        }
    }

    /// Submit a value-less task at normal priority to the least-loaded
    /// attached branch.
    pub fn submit<F>(&self, task: F) -> Result<(), WorkspaceError>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(self.pick()?.submit(task)?)
    }

    /// Submit a value-less task at urgent priority to the least-loaded
    /// attached branch.
    pub fn submit_urgent<F>(&self, task: F) -> Result<(), WorkspaceError>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(self.pick()?.submit_urgent(task)?)
    }

    /// Submit a sequential batch to the least-loaded attached branch.
    pub fn submit_batch<I, F>(&self, tasks: I) -> Result<(), WorkspaceError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        Ok(self.pick()?.submit_batch(tasks)?)
    }

    /// Submit a value-producing task at normal priority to the least-loaded
    /// attached branch.
    pub fn execute<T, F>(&self, task: F) -> Result<Task<T>, WorkspaceError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Ok(self.pick()?.execute(task)?)
    }

    /// Submit a value-producing task at urgent priority to the least-loaded
    /// attached branch.
    pub fn execute_urgent<T, F>(&self, task: F) -> Result<Task<T>, WorkspaceError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Ok(self.pick()?.execute_urgent(task)?)
    }

    /// Pick the dispatch target: the attached branch with the smallest
    /// observed queue depth, ties broken by a round-robin cursor over the
    /// tied branches in identifier order.
    fn pick(&self) -> Result<&Branch, WorkspaceError> {
        if self.closed {
            return Err(WorkspaceError::Shutdown);
        }

        let mut lightest = usize::MAX;
        let mut ties: Vec<&Branch> = Vec::new();

        for branch in self.branches.values() {
            let depth = branch.queued_tasks();

            if depth < lightest {
                lightest = depth;
                ties.clear();
                ties.push(branch);
            } else if depth == lightest {
                ties.push(branch);
            }
        }

        if ties.is_empty() {
            return Err(WorkspaceError::NoBranches);
        }

        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(ties[cursor % ties.len()])
    }

    /// Shut the workspace down: stop and join every supervisor in reverse
    /// attach order, then drain and destroy every branch in reverse attach
    /// order.
    ///
    /// Once shutdown has begun, attach and dispatch fail. Idempotent; implied
    /// by dropping the workspace.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        debug!("workspace shutting down");

        // Supervisors go first so none of them can observe a freed branch.
        while let Some((id, supervisor)) = self.supervisors.pop_last() {
            debug!(supervisor = %id, "stopping supervisor");
            supervisor.stop();
            drop(supervisor);
        }

        while let Some((id, branch)) = self.branches.pop_last() {
            debug!(branch = %id, "draining branch");
            drop(branch);
        }
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("branches", &self.branch_count())
            .field("supervisors", &self.supervisor_count())
            .finish()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.shutdown();
    }
}
