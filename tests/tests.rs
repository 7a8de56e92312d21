use std::{
    panic::catch_unwind,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex, Once,
    },
    thread,
    time::{Duration, Instant},
};

use arbor::{Branch, ShutdownError, Supervisor, Workspace, WorkspaceError};
use futures::executor::block_on;
use once_cell::sync::Lazy;

fn single_worker() -> Branch {
    Branch::builder().size(1).build()
}

/// Poll a condition until it holds or the timeout passes.
fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(5));
    }

    condition()
}

/// The report sink is process-global and tests run concurrently, so every
/// test that needs it shares one capturing sink and filters by a marker
/// unique to that test.
static REPORTS: Lazy<Mutex<Vec<(String, String)>>> = Lazy::new(|| Mutex::new(Vec::new()));
static CAPTURE: Once = Once::new();

fn install_capture_sink() {
    CAPTURE.call_once(|| {
        arbor::set_report_sink(|source, description| {
            REPORTS
                .lock()
                .unwrap()
                .push((source.to_owned(), description.to_owned()));
        });
    });
}

fn reports_containing(marker: &str) -> Vec<(String, String)> {
    REPORTS
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, description)| description.contains(marker))
        .cloned()
        .collect()
}

#[test]
#[should_panic(expected = "branch name must not contain null bytes")]
fn name_with_null_bytes_panics() {
    Branch::builder().name("uh\0oh").build();
}

#[test]
#[should_panic(expected = "supervisor minimum worker count must be non-zero")]
fn supervisor_zero_minimum_panics() {
    Supervisor::new(0, 4);
}

#[test]
#[should_panic(expected = "supervisor minimum worker count cannot be larger than maximum")]
fn supervisor_inverted_bounds_panic() {
    Supervisor::new(4, 2);
}

#[test]
fn execute_returns_the_value() {
    let branch = Branch::builder().size(2).build();

    let task = branch.execute(|| 2023).unwrap();
    assert_eq!(task.join(), 2023);

    branch.wait();
    assert!(branch.wait_timeout(Duration::from_millis(10)));
}

#[test]
fn submitting_n_tasks_runs_exactly_n() {
    let branch = Branch::builder().size(3).build();
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let count = count.clone();
        branch
            .submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    branch.wait();
    assert_eq!(count.load(Ordering::SeqCst), 100);
}

#[test]
fn urgent_tasks_jump_the_queue() {
    let branch = single_worker();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy the only worker so everything below queues behind the gate.
    branch.submit(move || gate_rx.recv().unwrap()).unwrap();
    assert!(eventually(Duration::from_secs(2), || branch.queued_tasks() == 0));

    let normal = order.clone();
    branch.submit(move || normal.lock().unwrap().push("B")).unwrap();

    let urgent = order.clone();
    branch
        .submit_urgent(move || urgent.lock().unwrap().push("A"))
        .unwrap();

    gate_tx.send(()).unwrap();
    branch.wait();

    assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
}

#[test]
fn later_urgent_tasks_precede_earlier_ones() {
    let branch = single_worker();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let order = Arc::new(Mutex::new(Vec::new()));

    branch.submit(move || gate_rx.recv().unwrap()).unwrap();
    assert!(eventually(Duration::from_secs(2), || branch.queued_tasks() == 0));

    for label in ["N", "U1", "U2"] {
        let order = order.clone();
        let record = move || order.lock().unwrap().push(label);

        if label == "N" {
            branch.submit(record).unwrap();
        } else {
            branch.submit_urgent(record).unwrap();
        }
    }

    gate_tx.send(()).unwrap();
    branch.wait();

    assert_eq!(*order.lock().unwrap(), vec!["U2", "U1", "N"]);
}

#[test]
fn sequential_batch_runs_in_order_as_one_queue_entry() {
    let branch = single_worker();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let order = Arc::new(Mutex::new(Vec::new()));

    branch.submit(move || gate_rx.recv().unwrap()).unwrap();
    assert!(eventually(Duration::from_secs(2), || branch.queued_tasks() == 0));

    let batch: Vec<_> = (1..=4)
        .map(|index| {
            let order = order.clone();
            move || order.lock().unwrap().push(index)
        })
        .collect();

    branch.submit_batch(batch).unwrap();

    // The whole batch occupies a single queue slot.
    assert_eq!(branch.queued_tasks(), 1);

    gate_tx.send(()).unwrap();
    branch.wait();

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn worker_survives_a_fire_and_forget_panic() {
    install_capture_sink();

    let branch = single_worker();

    branch.submit(|| panic!("XXXX-4421")).unwrap();
    branch.wait();

    let reports = reports_containing("XXXX-4421");
    assert_eq!(reports.len(), 1);
    assert!(reports[0].0.contains("worker"));

    // The worker caught the panic and kept going.
    assert_eq!(branch.workers(), 1);
    assert_eq!(branch.execute(|| 7).unwrap().join(), 7);
}

#[test]
fn execute_panic_re_raises_at_join() {
    let branch = single_worker();

    let task = branch.execute(|| -> u32 { panic!("YYYY-9913") }).unwrap();

    let payload = catch_unwind(move || task.join()).unwrap_err();
    let message = payload.downcast_ref::<&str>().unwrap();
    assert!(message.contains("YYYY-9913"));
}

#[test]
fn batch_panic_abandons_the_rest_of_the_batch() {
    install_capture_sink();

    let branch = single_worker();
    let order = Arc::new(Mutex::new(Vec::new()));

    let batch: Vec<Box<dyn FnOnce() + Send>> = vec![
        {
            let order = order.clone();
            Box::new(move || order.lock().unwrap().push(1))
        },
        Box::new(|| panic!("ZZZZ-0044")),
        {
            let order = order.clone();
            Box::new(move || order.lock().unwrap().push(3))
        },
    ];

    branch.submit_batch(batch).unwrap();
    branch.wait();

    assert_eq!(*order.lock().unwrap(), vec![1]);
    assert_eq!(reports_containing("ZZZZ-0044").len(), 1);
}

#[test]
fn wait_on_an_idle_branch_returns_immediately() {
    let branch = single_worker();

    assert!(branch.wait_timeout(Duration::from_millis(10)));
    assert!(branch.wait_timeout(Duration::from_millis(10)));
    branch.wait();
}

#[test]
fn wait_times_out_while_a_task_runs() {
    let branch = single_worker();

    branch
        .submit(|| thread::sleep(Duration::from_millis(100)))
        .unwrap();

    assert!(!branch.wait_timeout(Duration::from_millis(10)));
    assert!(branch.wait_timeout(Duration::from_secs(2)));
}

#[test]
fn grow_and_shrink_adjust_the_worker_set() {
    let branch = single_worker();
    assert_eq!(branch.workers(), 1);

    branch.grow(2);
    assert_eq!(branch.target_workers(), 3);
    assert_eq!(branch.workers(), 3);

    branch.shrink(2);
    assert_eq!(branch.target_workers(), 1);
    assert!(eventually(Duration::from_secs(2), || branch.workers() == 1));
}

#[test]
fn shrink_past_zero_marks_every_worker() {
    let branch = Branch::builder().size(2).build();

    branch.shrink(10);
    assert_eq!(branch.target_workers(), 0);
    assert!(eventually(Duration::from_secs(2), || branch.workers() == 0));

    // Not shut down: work is still accepted and held until the branch grows.
    branch.submit(|| {}).unwrap();
    assert_eq!(branch.queued_tasks(), 1);

    branch.grow(1);
    branch.wait();
    assert_eq!(branch.queued_tasks(), 0);
}

#[test]
fn close_refuses_new_submissions() {
    let branch = Branch::builder().size(2).build();
    let count = Arc::new(AtomicUsize::new(0));

    let queued = count.clone();
    branch
        .submit(move || {
            queued.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    branch.close();

    fn noop() {}

    assert_eq!(branch.submit(|| {}).unwrap_err(), ShutdownError);
    assert_eq!(branch.submit_urgent(|| {}).unwrap_err(), ShutdownError);
    assert_eq!(branch.submit_batch([noop, noop]).unwrap_err(), ShutdownError);
    assert!(branch.execute(|| 1).is_err());

    // Work accepted before the close still drains.
    assert!(eventually(Duration::from_secs(2), || branch.workers() == 0));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn discarded_tasks_resolve_to_shutdown_errors() {
    let branch = Branch::builder().size(0).build();

    let task = branch.execute(|| 5).unwrap();
    drop(branch);

    let payload = catch_unwind(move || task.join()).unwrap_err();
    assert!(payload.downcast_ref::<ShutdownError>().is_some());
}

#[test]
fn branch_name_is_used_for_worker_threads() {
    let branch = Branch::builder().name("foo").build();

    let name = branch
        .execute(|| thread::current().name().unwrap().to_owned())
        .unwrap()
        .join();

    assert_eq!(name, "foo");
}

#[test]
fn task_can_be_awaited() {
    let branch = single_worker();

    let task = branch.execute(|| 3 * 3).unwrap();

    assert_eq!(block_on(task), 9);
}

#[test]
fn task_join_timeout_expires() {
    let branch = single_worker();

    let task = branch
        .execute(|| thread::sleep(Duration::from_millis(100)))
        .unwrap();

    let result = task.join_timeout(Duration::from_millis(10));
    assert!(result.is_err());

    // The handle comes back intact and can still be joined.
    result.unwrap_err().join();
}

#[test]
fn workspace_balances_load_between_branches() {
    let mut workspace = Workspace::new();

    workspace
        .attach_branch(Branch::builder().name("balance-a").size(1).build())
        .unwrap();
    workspace
        .attach_branch(Branch::builder().name("balance-b").size(1).build())
        .unwrap();

    let a_count = Arc::new(AtomicUsize::new(0));
    let b_count = Arc::new(AtomicUsize::new(0));

    for _ in 0..300 {
        let a_count = a_count.clone();
        let b_count = b_count.clone();

        workspace
            .submit(move || {
                match thread::current().name() {
                    Some("balance-a") => a_count.fetch_add(1, Ordering::SeqCst),
                    Some("balance-b") => b_count.fetch_add(1, Ordering::SeqCst),
                    _ => unreachable!("workers inherit their branch's name"),
                };

                thread::sleep(Duration::from_millis(2));
            })
            .unwrap();
    }

    workspace.for_each_branch(|branch| branch.wait());

    let a = a_count.load(Ordering::SeqCst);
    let b = b_count.load(Ordering::SeqCst);

    assert_eq!(a + b, 300);

    // Balanced to within 20% of an even split.
    assert!((120..=180).contains(&a), "branch a ran {a} of 300");
    assert!((120..=180).contains(&b), "branch b ran {b} of 300");
}

#[test]
fn workspace_components_are_attachable_and_supervisable() {
    let mut workspace = Workspace::new();

    let branch_id = workspace
        .attach_branch(Branch::builder().size(1).build())
        .unwrap();
    let supervisor_id = workspace
        .attach_supervisor(Supervisor::with_interval(1, 2, Duration::from_millis(20)))
        .unwrap();

    let branch = workspace.branch(branch_id).unwrap();
    workspace.supervisor(supervisor_id).unwrap().supervise(branch);

    assert_eq!(workspace.branch_count(), 1);
    assert_eq!(workspace.supervisor_count(), 1);

    // Detaching hands the branch back; the supervisor's weak observation
    // lapses once the caller drops it.
    let branch = workspace.detach_branch(branch_id).unwrap();
    drop(branch);
    thread::sleep(Duration::from_millis(60));

    assert_eq!(
        workspace.branch(branch_id).unwrap_err(),
        WorkspaceError::UnknownBranch(branch_id)
    );
}

#[test]
fn supervisor_grows_a_loaded_branch_to_the_maximum() {
    let branch = Branch::builder().name("surge").size(2).build();

    let supervisor = Supervisor::with_interval(2, 4, Duration::from_millis(25));
    supervisor.supervise(&branch);

    for _ in 0..600 {
        branch
            .submit(|| thread::sleep(Duration::from_millis(5)))
            .unwrap();
    }

    // One worker per tick until the band's upper bound.
    assert!(eventually(Duration::from_secs(2), || branch.workers() == 4));
    assert!(branch.queued_tasks() > 0);

    branch.wait();

    // Idle again: one worker per tick back down to the lower bound.
    assert!(eventually(Duration::from_secs(2), || branch.workers() == 2));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(branch.workers(), 2, "never shrinks below the minimum");
    assert_eq!(branch.target_workers(), 2);
}

#[test]
fn supervisor_holds_an_idle_branch_at_the_minimum() {
    let branch = Branch::builder().size(2).build();

    let supervisor = Supervisor::with_interval(2, 4, Duration::from_millis(20));
    supervisor.supervise(&branch);
    supervisor.supervise(&branch); // idempotent

    thread::sleep(Duration::from_millis(150));

    assert_eq!(branch.workers(), 2);
    assert_eq!(branch.target_workers(), 2);
}

#[test]
fn tick_callback_fires_after_every_rebalance_pass() {
    install_capture_sink();

    let branch = Branch::builder().size(1).build();
    let ticks = Arc::new(AtomicUsize::new(0));

    let supervisor = Supervisor::with_interval(1, 2, Duration::from_millis(20));

    let counted = ticks.clone();
    supervisor.on_tick(move || {
        counted.fetch_add(1, Ordering::SeqCst);
        panic!("WWWW-7310");
    });

    supervisor.supervise(&branch);

    assert!(eventually(Duration::from_secs(2), || {
        ticks.load(Ordering::SeqCst) >= 3
    }));

    // The callback panicked on every tick, went to the sink each time, and
    // never killed the controller.
    assert!(reports_containing("WWWW-7310").len() >= 3);
}

#[test]
fn pause_suspends_rebalancing() {
    let branch = Branch::builder().size(3).build();

    let supervisor = Supervisor::with_interval(1, 4, Duration::from_millis(20));
    supervisor.pause();
    supervisor.supervise(&branch);

    thread::sleep(Duration::from_millis(120));
    assert_eq!(branch.workers(), 3, "paused supervisor must not resize");

    supervisor.resume();
    assert!(eventually(Duration::from_secs(2), || branch.workers() == 1));
}

#[test]
fn stop_is_idempotent() {
    let branch = Branch::builder().size(1).build();

    let supervisor = Supervisor::with_interval(1, 2, Duration::from_millis(20));
    supervisor.supervise(&branch);

    supervisor.stop();
    supervisor.stop();
    drop(supervisor);
}

#[test]
fn workspace_shutdown_is_orderly() {
    let mut workspace = Workspace::new();

    let branch_id = workspace
        .attach_branch(Branch::builder().size(2).build())
        .unwrap();
    let supervisor_id = workspace
        .attach_supervisor(Supervisor::with_interval(1, 4, Duration::from_millis(20)))
        .unwrap();

    let branch = workspace.branch(branch_id).unwrap();
    workspace.supervisor(supervisor_id).unwrap().supervise(branch);

    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let count = count.clone();
        workspace
            .submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    workspace.shutdown();

    // Shutdown drained the branches before destroying them.
    assert_eq!(count.load(Ordering::SeqCst), 50);
    assert_eq!(workspace.submit(|| {}).unwrap_err(), WorkspaceError::Shutdown);
}

#[test]
fn common_branch_executes_tasks() {
    let result = arbor::common().execute(|| 21 * 2).unwrap().join();
    assert_eq!(result, 42);

    // Too late to configure once the common branch exists.
    assert!(arbor::configure_common(|builder| builder).is_err());
}
