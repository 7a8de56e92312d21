//! Process-wide reporting for panics that have no caller left to surface to.
//!
//! A value-less task has discarded its result handle, so a panic inside it
//! cannot be re-raised anywhere. The same goes for a supervisor tick callback.
//! Those panics are routed here instead of being silently dropped.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;

use once_cell::sync::Lazy;

static SINK: Lazy<RwLock<Option<Box<dyn Fn(&str, &str) + Send + Sync>>>> =
    Lazy::new(|| RwLock::new(None));

/// Replace the process-wide report sink.
///
/// The sink receives `(source, description)` pairs for every panic that
/// escapes a value-less task or a tick callback. Install it once during
/// initialization, before submitting work.
///
/// # Examples
///
/// ```
/// arbor::set_report_sink(|source, description| {
///     eprintln!("[{source}] background task failed: {description}");
/// });
/// # arbor::reset_report_sink();
/// ```
pub fn set_report_sink<F>(sink: F)
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    *SINK.write().unwrap() = Some(Box::new(sink));
}

/// Restore the default sink, which writes a single line to standard error.
pub fn reset_report_sink() {
    *SINK.write().unwrap() = None;
}

/// Deliver a report to the installed sink.
///
/// A panic raised by the sink itself is swallowed: there is nowhere left to
/// report it, and it must not take down a worker or controller thread.
pub(crate) fn report(source: &str, description: &str) {
    let guard = SINK.read().unwrap();

    let _ = catch_unwind(AssertUnwindSafe(|| match guard.as_ref() {
        Some(sink) => sink(source, description),
        None => eprintln!("arbor: {source}: {description}"),
    }));
}

/// Best-effort text for a panic payload.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}
