use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::{branch::Core, sink, Branch};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// A control loop that periodically resizes branches toward a worker-count
/// band.
///
/// Each tick, every supervised branch is inspected: a branch with queued work
/// and fewer than `max` workers is grown by one, and a branch with an empty
/// queue and more than `min` workers is shrunk by one. The single step per
/// tick damps oscillation under bursty load and bounds worker churn.
///
/// Branches are observed weakly; a branch that has been dropped simply
/// disappears from the supervised set on the next tick.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// let branch = arbor::Branch::builder().size(2).build();
///
/// let supervisor = arbor::Supervisor::with_interval(1, 4, Duration::from_millis(100));
/// supervisor.supervise(&branch);
///
/// // submit load; the branch grows toward 4 while its queue stays non-empty
/// ```
pub struct Supervisor {
    shared: Arc<Shared>,
    stop_tx: Sender<()>,
    /// Handed to the controller when it starts.
    stop_rx: Receiver<()>,
}

struct Shared {
    min_workers: usize,
    max_workers: usize,
    interval: Duration,
    state: Mutex<ControlState>,
}

#[derive(Default)]
struct ControlState {
    branches: Vec<Weak<Core>>,
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
    paused: bool,
    stopped: bool,
    controller: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Create a supervisor holding branches to between `min_workers` and
    /// `max_workers` workers, ticking once per second.
    ///
    /// # Panics
    ///
    /// Panics if `min_workers` is zero or larger than `max_workers`.
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self::with_interval(min_workers, max_workers, DEFAULT_TICK_INTERVAL)
    }

    /// Create a supervisor with a custom tick interval.
    ///
    /// # Panics
    ///
    /// Panics if `min_workers` is zero or larger than `max_workers`.
    pub fn with_interval(min_workers: usize, max_workers: usize, interval: Duration) -> Self {
        if min_workers == 0 {
            panic!("supervisor minimum worker count must be non-zero");
        }

        if min_workers > max_workers {
            panic!("supervisor minimum worker count cannot be larger than maximum");
        }

        let (stop_tx, stop_rx) = bounded(1);

        Self {
            shared: Arc::new(Shared {
                min_workers,
                max_workers,
                interval,
                state: Mutex::new(ControlState::default()),
            }),
            stop_tx,
            stop_rx,
        }
    }

    /// The lower bound of the worker-count band.
    pub fn min_workers(&self) -> usize {
        self.shared.min_workers
    }

    /// The upper bound of the worker-count band.
    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// The configured tick interval.
    pub fn tick_interval(&self) -> Duration {
        self.shared.interval
    }

    /// Start supervising a branch.
    ///
    /// The branch is observed by non-owning reference and may be dropped
    /// while supervised. Registering the same branch twice is a no-op. The
    /// first registration starts the controller thread.
    pub fn supervise(&self, branch: &Branch) {
        let core = branch.core();
        let mut state = self.shared.state.lock().unwrap();

        let already_supervised = state
            .branches
            .iter()
            .any(|observed| observed.as_ptr() == Arc::as_ptr(core));

        if already_supervised {
            return;
        }

        state.branches.push(Arc::downgrade(core));
        trace!(branch = ?branch.name(), "supervising branch");

        if state.controller.is_none() && !state.stopped {
            let shared = self.shared.clone();
            let stop = self.stop_rx.clone();

            let controller = thread::Builder::new()
                .name("supervisor".to_owned())
                .spawn(move || run_controller(shared, stop))
                .unwrap();

            state.controller = Some(controller);
            debug!("supervisor controller started");
        }
    }

    /// Install a callback invoked once per tick, after the rebalance pass, on
    /// the controller thread.
    ///
    /// A panic escaping the callback is routed to the report sink; the
    /// controller keeps ticking.
    pub fn on_tick<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.state.lock().unwrap().callback = Some(Arc::new(callback));
    }

    /// Skip the rebalance pass and the tick callback on subsequent ticks.
    /// The controller keeps ticking so [`resume`](Supervisor::resume) takes
    /// effect within one interval.
    pub fn pause(&self) {
        self.shared.state.lock().unwrap().paused = true;
    }

    /// Resume rebalancing after [`pause`](Supervisor::pause).
    pub fn resume(&self) {
        self.shared.state.lock().unwrap().paused = false;
    }

    /// Stop the controller thread and wait for it to exit.
    ///
    /// Idempotent, permanent, and implied by dropping the supervisor.
    pub fn stop(&self) {
        let controller = {
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
            state.controller.take()
        };

        if let Some(controller) = controller {
            let _ = self.stop_tx.try_send(());
            let _ = controller.join();
            debug!("supervisor controller stopped");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_controller(shared: Arc<Shared>, stop: Receiver<()>) {
    loop {
        match stop.recv_timeout(shared.interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let callback = {
            let mut state = shared.state.lock().unwrap();

            if state.paused {
                continue;
            }

            state.branches.retain(|observed| {
                let Some(core) = observed.upgrade() else {
                    trace!("dropping observation of a destroyed branch");
                    return false;
                };

                let (queued, workers) = core.snapshot();

                if queued > 0 && workers < shared.max_workers {
                    trace!(queued, workers, "growing supervised branch");
                    core.grow(1);
                } else if queued == 0 && workers > shared.min_workers {
                    trace!(queued, workers, "shrinking supervised branch");
                    core.shrink(1);
                }

                true
            });

            state.callback.clone()
        };

        // Invoked with the supervisor lock released so a callback may call
        // back into this supervisor.
        if let Some(callback) = callback {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(&*callback)) {
                sink::report("supervisor", &sink::payload_message(&*payload));
            }
        }
    }
}
