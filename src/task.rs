//! Task handles and the job envelopes workers execute.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
    thread,
    time::{Duration, Instant},
};

use crate::{error::ShutdownError, sink};

/// A unit of work as it sits in a branch's queue.
///
/// The exception policy is baked in when the envelope is built, so nothing a
/// task does can unwind into the worker loop.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A handle to the result of a value-producing submission.
///
/// Returned by [`execute`](crate::Branch::execute) and friends. The handle is
/// a one-shot channel: the worker that runs the task delivers either the
/// produced value or the captured panic, and the consumer collects it with one
/// of the [`join`](Task::join) methods or by awaiting the task as a future.
///
/// Dropping the handle detaches the task; it still runs, but its outcome is
/// no longer observable.
///
/// # Examples
///
/// Blocking on a result:
///
/// ```
/// let branch = arbor::Branch::new();
///
/// let task = branch.execute(|| 2 + 2).unwrap();
///
/// assert_eq!(task.join(), 4);
/// ```
pub struct Task<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

struct Inner<T> {
    result: Option<thread::Result<T>>,
    waker: Option<Waker>,
}

impl<T> Task<T> {
    /// Create an unresolved task handle along with the completer that will
    /// resolve it.
    pub(crate) fn pending() -> (Self, Completer<T>) {
        let inner = Arc::new(Mutex::new(Inner {
            result: None,
            waker: None,
        }));

        let completer = Completer {
            inner: Some(inner.clone()),
        };

        (Self { inner }, completer)
    }

    /// Check whether the task has finished.
    ///
    /// If this returns `true`, calling [`join`](Task::join) will not block.
    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().result.is_some()
    }

    /// Block the current thread until the task completes and return the value
    /// it produced.
    ///
    /// # Panics
    ///
    /// If the task panicked, the panic is re-raised here.
    pub fn join(self) -> T {
        match self.join_catch() {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    fn join_catch(self) -> thread::Result<T> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(result) = inner.result.take() {
            result
        } else {
            inner.waker = Some(current_thread_waker());
            drop(inner);

            loop {
                thread::park();

                if let Some(result) = self.inner.lock().unwrap().result.take() {
                    break result;
                }
            }
        }
    }

    /// Block the current thread until the task completes or the timeout
    /// elapses. The handle is returned intact on timeout.
    ///
    /// # Panics
    ///
    /// If the task panicked, the panic is re-raised here.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, Self> {
        self.join_deadline(Instant::now() + timeout)
    }

    /// Block the current thread until the task completes or the deadline
    /// passes. The handle is returned intact on timeout.
    ///
    /// # Panics
    ///
    /// If the task panicked, the panic is re-raised here.
    pub fn join_deadline(self, deadline: Instant) -> Result<T, Self> {
        match {
            let mut inner = self.inner.lock().unwrap();

            if let Some(result) = inner.result.take() {
                result
            } else {
                inner.waker = Some(current_thread_waker());
                drop(inner);

                loop {
                    if let Some(timeout) = deadline.checked_duration_since(Instant::now()) {
                        thread::park_timeout(timeout);
                    } else {
                        return Err(self);
                    }

                    if let Some(result) = self.inner.lock().unwrap().result.take() {
                        break result;
                    }
                }
            }
        } {
            Ok(value) => Ok(value),
            Err(payload) => resume_unwind(payload),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().unwrap();

        match inner.result.take() {
            Some(Ok(value)) => Poll::Ready(value),
            Some(Err(payload)) => resume_unwind(payload),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("done", &self.is_done()).finish()
    }
}

/// The producer side of a task handle, held inside the job envelope.
///
/// If the envelope is discarded without running (the branch shut down with
/// work still queued and no workers left to drain it), dropping the completer
/// resolves the handle to a shutdown error so consumers never hang on a task
/// that will not run.
pub(crate) struct Completer<T> {
    inner: Option<Arc<Mutex<Inner<T>>>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, result: thread::Result<T>) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: thread::Result<T>) {
        if let Some(inner) = self.inner.take() {
            let mut inner = inner.lock().unwrap();
            inner.result = Some(result);

            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.deliver(Err(Box::new(ShutdownError)));
        }
    }
}

/// Creates a waker that unparks the calling thread.
fn current_thread_waker() -> Waker {
    let thread = thread::current();
    waker_fn::waker_fn(move || thread.unpark())
}

/// Wrap a value-less task. A panic is caught and routed to the report sink;
/// the worker carries on.
pub(crate) fn fire_and_forget<F>(task: F) -> Job
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            report_worker_panic(&*payload);
        }
    })
}

/// Wrap a sequential batch into a single envelope.
///
/// The elements run in order on whichever worker pops the envelope, with no
/// re-entry into the queue between them. The batch carries one panic guard: a
/// panic in one element abandons the rest of the batch and produces a single
/// sink report.
pub(crate) fn sequence<F>(tasks: Vec<F>) -> Job
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || {
        let run_all = move || {
            for task in tasks {
                task();
            }
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(run_all)) {
            report_worker_panic(&*payload);
        }
    })
}

/// Wrap a value-producing task, returning the handle its outcome is delivered
/// through. A panic is captured and re-raised when the consumer joins.
pub(crate) fn with_handle<T, F>(task: F) -> (Task<T>, Job)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (handle, completer) = Task::pending();

    let job = Box::new(move || {
        completer.complete(catch_unwind(AssertUnwindSafe(task)));
    });

    (handle, job)
}

fn report_worker_panic(payload: &(dyn Any + Send)) {
    let current = thread::current();

    let source = match current.name() {
        Some(name) => format!("worker[{name}]"),
        None => format!("worker[{:?}]", current.id()),
    };

    sink::report(&source, &sink::payload_message(payload));
}
