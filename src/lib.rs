//! An embeddable task execution substrate built from three pieces:
//!
//! - A [`Branch`] is a dynamic pool of worker threads feeding off one
//!   prioritized queue. Tasks enter at the tail, jump the line with
//!   [`submit_urgent`](Branch::submit_urgent), or travel as a sequential
//!   batch in a single queue slot. Value-producing tasks return a [`Task`]
//!   handle carrying either the value or the captured panic.
//! - A [`Supervisor`] owns a controller thread that periodically nudges each
//!   supervised branch's worker count toward a configured band, one step per
//!   tick, growing under load and shrinking when idle.
//! - A [`Workspace`] owns branches and supervisors by identifier, routes
//!   submitted tasks to the branch with the lightest queue, and tears
//!   everything down in an order that keeps supervisors from ever observing
//!   a freed branch.
//!
//! Panics inside fire-and-forget tasks cannot reach any caller, so they are
//! routed to a process-wide replaceable [report sink](set_report_sink);
//! workers always survive them.
//!
//! # Examples
//!
//! A single self-tuning pool:
//!
//! ```
//! use std::time::Duration;
//!
//! let branch = arbor::Branch::builder().name("crunch").size(2).build();
//!
//! let supervisor = arbor::Supervisor::with_interval(2, 8, Duration::from_millis(250));
//! supervisor.supervise(&branch);
//!
//! let task = branch.execute(|| (1..=10).sum::<u32>()).unwrap();
//! assert_eq!(task.join(), 55);
//!
//! branch.wait();
//! ```
//!
//! Load-balanced dispatch across branches:
//!
//! ```
//! use arbor::{Branch, Workspace};
//!
//! let mut workspace = Workspace::new();
//! workspace.attach_branch(Branch::builder().name("a").build()).unwrap();
//! workspace.attach_branch(Branch::builder().name("b").build()).unwrap();
//!
//! for i in 0..16 {
//!     workspace.submit(move || { let _ = i * i; }).unwrap();
//! }
//!
//! workspace.for_each_branch(|branch| branch.wait());
//! ```

mod branch;
mod common;
mod error;
mod sink;
mod supervisor;
mod task;
mod worker;
mod workspace;

pub use branch::{Branch, Builder};
pub use common::{common, configure_common};
pub use error::{CommonAlreadyInitializedError, ShutdownError, WorkspaceError};
pub use sink::{reset_report_sink, set_report_sink};
pub use supervisor::Supervisor;
pub use task::Task;
pub use workspace::{BranchId, SupervisorId, Workspace};
