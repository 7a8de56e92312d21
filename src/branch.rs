use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Condvar, Mutex},
    thread::ThreadId,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    error::ShutdownError,
    task::{self, Job, Task},
    worker,
};

/// A builder for constructing a customized branch.
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    size: usize,
    stack_size: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            size: 1,
            stack_size: None,
        }
    }
}

impl Builder {
    /// Set a descriptive name for the branch, also used as the thread name of
    /// its workers. Names do not need to be unique.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("branch name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the initial worker count, which also becomes the branch's target
    /// count. Defaults to 1; a branch of size 0 holds work until it is grown.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the size of the stack (in bytes) for worker threads spawned by
    /// this branch.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Create a branch according to the configuration set with this builder.
    /// Workers are spawned eagerly up to the configured size.
    pub fn build(self) -> Branch {
        let core = Arc::new(Core {
            name: self.name,
            stack_size: self.stack_size,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                workers: HashMap::new(),
                target: 0,
                busy: 0,
                exiting: 0,
                closed: false,
            }),
            work_cvar: Condvar::new(),
            drain_cvar: Condvar::new(),
            exit_cvar: Condvar::new(),
        });

        core.grow(self.size);

        Branch { core }
    }
}

/// A dynamic pool of worker threads feeding off one prioritized task queue.
///
/// Tasks are submitted at normal priority ([`submit`](Branch::submit)), at the
/// head of the queue ([`submit_urgent`](Branch::submit_urgent)), or as a
/// sequential batch occupying a single queue slot
/// ([`submit_batch`](Branch::submit_batch)). Value-producing tasks go through
/// [`execute`](Branch::execute) and return a [`Task`] handle.
///
/// The worker set can be resized at any time with [`grow`](Branch::grow) and
/// [`shrink`](Branch::shrink), either directly or through a
/// [`Supervisor`](crate::Supervisor).
///
/// Dropping the branch stops acceptance of new work, lets the workers drain
/// whatever is queued, and blocks until every worker has exited.
///
/// # Examples
///
/// ```
/// let branch = arbor::Branch::builder().name("background").size(2).build();
///
/// branch.submit(|| println!("running in the background")).unwrap();
///
/// branch.wait();
/// ```
pub struct Branch {
    core: Arc<Core>,
}

impl Default for Branch {
    fn default() -> Self {
        Self::new()
    }
}

impl Branch {
    /// Create a new branch with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Get a builder for creating a customized branch.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The branch's descriptive name, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// Submit a value-less task at normal priority (tail of the queue).
    ///
    /// Fails only if the branch is shutting down, in which case the task is
    /// dropped at the submission site.
    pub fn submit<F>(&self, task: F) -> Result<(), ShutdownError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(Placement::Tail, task::fire_and_forget(task))
    }

    /// Submit a value-less task at urgent priority (head of the queue).
    ///
    /// An urgent task precedes everything queued at the time it arrives,
    /// including earlier urgent tasks still waiting, but does not preempt a
    /// task a worker has already begun.
    pub fn submit_urgent<F>(&self, task: F) -> Result<(), ShutdownError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(Placement::Head, task::fire_and_forget(task))
    }

    /// Submit a group of value-less tasks as one sequential batch.
    ///
    /// The whole batch occupies a single queue slot and executes on a single
    /// worker in the given order, with no re-entry into the queue between
    /// elements. Packaging trivial tasks this way pays the queue
    /// synchronization cost once instead of per task.
    ///
    /// Heterogeneous batches can be expressed with boxed closures
    /// (`Box<dyn FnOnce() + Send>`).
    pub fn submit_batch<I, F>(&self, tasks: I) -> Result<(), ShutdownError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let tasks: Vec<F> = tasks.into_iter().collect();

        if tasks.is_empty() {
            return Ok(());
        }

        self.core.push(Placement::Tail, task::sequence(tasks))
    }

    /// Submit a value-producing task at normal priority and return a handle
    /// to its eventual result.
    ///
    /// If the task panics, the panic is captured and re-raised when the
    /// handle is joined.
    ///
    /// # Examples
    ///
    /// ```
    /// let branch = arbor::Branch::new();
    ///
    /// let task = branch.execute(|| 2 + 2).unwrap();
    ///
    /// assert_eq!(task.join(), 4);
    /// ```
    pub fn execute<T, F>(&self, task: F) -> Result<Task<T>, ShutdownError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (handle, job) = task::with_handle(task);
        self.core.push(Placement::Tail, job)?;
        Ok(handle)
    }

    /// Submit a value-producing task at urgent priority.
    pub fn execute_urgent<T, F>(&self, task: F) -> Result<Task<T>, ShutdownError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (handle, job) = task::with_handle(task);
        self.core.push(Placement::Head, job)?;
        Ok(handle)
    }

    /// Block until the queue is empty and every worker is idle.
    ///
    /// Tasks that arrive while waiting reset the emptiness condition.
    pub fn wait(&self) {
        let mut state = self.core.state.lock().unwrap();

        while !(state.queue.is_empty() && state.busy == 0) {
            state = self.core.drain_cvar.wait(state).unwrap();
        }
    }

    /// Block until the branch is drained or the timeout elapses.
    ///
    /// Returns `true` if the branch drained before the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_deadline(Instant::now() + timeout)
    }

    /// Block until the branch is drained or the deadline passes.
    ///
    /// Returns `true` if the branch drained before the deadline.
    pub fn wait_deadline(&self, deadline: Instant) -> bool {
        let mut state = self.core.state.lock().unwrap();

        while !(state.queue.is_empty() && state.busy == 0) {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };

            state = self
                .core
                .drain_cvar
                .wait_timeout(state, remaining)
                .unwrap()
                .0;
        }

        true
    }

    /// Spawn `count` additional workers immediately, raising the target count
    /// by the same amount. A no-op on a branch that is shutting down.
    pub fn grow(&self, count: usize) {
        self.core.grow(count);
    }

    /// Mark `count` workers to exit once their current task finishes,
    /// lowering the target count by the same amount (clamped to zero).
    ///
    /// Running tasks are never interrupted. A no-op on a branch that is
    /// shutting down.
    pub fn shrink(&self, count: usize) {
        self.core.shrink(count);
    }

    /// Get the number of live workers. An eventually consistent snapshot.
    pub fn workers(&self) -> usize {
        self.core.state.lock().unwrap().workers.len()
    }

    /// Get the worker count the branch is converging toward.
    pub fn target_workers(&self) -> usize {
        self.core.state.lock().unwrap().target
    }

    /// Get the number of tasks queued but not yet started. An eventually
    /// consistent snapshot; a sequential batch counts as one task.
    pub fn queued_tasks(&self) -> usize {
        self.core.state.lock().unwrap().queue.len()
    }

    /// Stop accepting tasks and let the workers drain what is already queued.
    ///
    /// Subsequent submissions fail with [`ShutdownError`]. Idempotent;
    /// dropping the branch implies it.
    pub fn close(&self) {
        self.core.close();
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("name", &self.name())
            .field("workers", &self.workers())
            .field("queued_tasks", &self.queued_tasks())
            .finish()
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        self.core.close();

        let mut state = self.core.state.lock().unwrap();

        while !state.workers.is_empty() {
            state = self.core.exit_cvar.wait(state).unwrap();
        }

        // Anything still queued here had no worker left to drain it; dropping
        // the envelopes resolves their handles to a shutdown error.
    }
}

pub(crate) enum Placement {
    Head,
    Tail,
}

/// Branch state shared by the owner, the workers, and any supervisors
/// observing it weakly.
pub(crate) struct Core {
    pub(crate) name: Option<String>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) state: Mutex<State>,
    /// Workers sleep here for new tasks or exit signals.
    pub(crate) work_cvar: Condvar,
    /// Drain waiters sleep here for empty-and-idle.
    pub(crate) drain_cvar: Condvar,
    /// `Branch::drop` sleeps here for the last worker to leave.
    pub(crate) exit_cvar: Condvar,
}

pub(crate) struct State {
    pub(crate) queue: VecDeque<Job>,
    pub(crate) workers: HashMap<ThreadId, WorkerRecord>,
    pub(crate) target: usize,
    /// Workers currently executing a task.
    pub(crate) busy: usize,
    /// Workers marked for exit that have not left yet.
    pub(crate) exiting: usize,
    pub(crate) closed: bool,
}

pub(crate) struct WorkerRecord {
    /// Asked to exit after the current task.
    pub(crate) exit: bool,
}

impl Core {
    fn push(&self, placement: Placement, job: Job) -> Result<(), ShutdownError> {
        let mut state = self.state.lock().unwrap();

        if state.closed {
            return Err(ShutdownError);
        }

        match placement {
            Placement::Head => state.queue.push_front(job),
            Placement::Tail => state.queue.push_back(job),
        }

        drop(state);
        self.work_cvar.notify_one();

        Ok(())
    }

    pub(crate) fn grow(self: &Arc<Self>, count: usize) {
        if count == 0 {
            return;
        }

        let mut state = self.state.lock().unwrap();

        if state.closed {
            return;
        }

        state.target += count;

        for _ in 0..count {
            worker::spawn_into(self, &mut state);
        }
    }

    pub(crate) fn shrink(&self, count: usize) {
        if count == 0 {
            return;
        }

        let mut state = self.state.lock().unwrap();

        if state.closed {
            return;
        }

        state.target = state.target.saturating_sub(count);

        let mut marked = 0;

        for record in state.workers.values_mut() {
            if marked == count {
                break;
            }

            if !record.exit {
                record.exit = true;
                marked += 1;
            }
        }

        state.exiting += marked;

        drop(state);
        self.work_cvar.notify_all();
    }

    /// One consistent `(queue depth, effective workers)` reading. Workers
    /// already marked for exit are excluded so that a resize decision made
    /// from this reading cannot double-count a pending one.
    pub(crate) fn snapshot(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.queue.len(),
            state.workers.len().saturating_sub(state.exiting),
        )
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap();

        if state.closed {
            return;
        }

        state.closed = true;
        state.target = 0;
        debug!(branch = ?self.name, queued = state.queue.len(), "branch closing");

        drop(state);
        self.work_cvar.notify_all();
    }
}
