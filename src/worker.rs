use std::{sync::Arc, thread};

use tracing::trace;

use crate::branch::{Core, State, WorkerRecord};

/// A worker thread which belongs to a branch and executes its tasks.
pub(crate) struct Worker {
    core: Arc<Core>,
}

impl Worker {
    pub(crate) fn run(self) {
        let id = thread::current().id();
        trace!(worker = ?id, "worker started");

        let mut state = self.core.state.lock().unwrap();

        loop {
            // A missing record means the branch already forgot this worker;
            // treat it the same as an exit request.
            if state.workers.get(&id).map_or(true, |record| record.exit) {
                break;
            }

            if let Some(job) = state.queue.pop_front() {
                state.busy += 1;
                drop(state);

                // The envelope owns the exception policy; nothing unwinds out
                // of this call.
                job();

                state = self.core.state.lock().unwrap();
                state.busy -= 1;

                if state.queue.is_empty() && state.busy == 0 {
                    self.core.drain_cvar.notify_all();
                }

                continue;
            }

            if state.closed {
                break;
            }

            state = self.core.work_cvar.wait(state).unwrap();
        }

        if let Some(record) = state.workers.remove(&id) {
            if record.exit {
                state.exiting -= 1;
            }
        }

        // A marked worker may leave work behind; hand the wakeup that landed
        // on it to a sibling.
        if !state.queue.is_empty() {
            self.core.work_cvar.notify_one();
        }

        self.core.exit_cvar.notify_all();
        drop(state);

        trace!(worker = ?id, "worker exited");
    }
}

/// Spawn a worker into a branch. The caller holds the state lock, so the new
/// thread cannot observe the worker map before its own record is in place.
pub(crate) fn spawn_into(core: &Arc<Core>, state: &mut State) {
    let mut builder = thread::Builder::new();

    if let Some(name) = core.name.as_ref() {
        builder = builder.name(name.clone());
    }

    if let Some(size) = core.stack_size {
        builder = builder.stack_size(size);
    }

    let worker = Worker { core: core.clone() };
    let handle = builder.spawn(move || worker.run()).unwrap();

    state
        .workers
        .insert(handle.thread().id(), WorkerRecord { exit: false });
}
