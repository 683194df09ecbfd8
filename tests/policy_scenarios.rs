//! Concurrency policy behavior observed through managed executors.

#[macro_use]
mod common;

use common::*;
use contextflow::runtime::{Job, WorkerPool};
use contextflow::test_utils::Latch;
use contextflow::{
    CompletionStage, Error, ManagedExecutor, MaxPolicy, Ownership, PolicyConfig, PolicyExecutor,
    StageStatus, TaskState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn bounded_policy_runs_two_queues_two_rejects_the_fifth() {
    init_test("bounded_policy_runs_two_queues_two_rejects_the_fifth");
    let executor = bounded_executor("p3", 2, 2);
    let started = Arc::new(Mutex::new(Vec::new()));
    let releases: Vec<Latch> = (0..5).map(|_| Latch::new(1)).collect();

    let stages: Vec<_> = releases
        .iter()
        .enumerate()
        .map(|(index, release)| {
            let started = Arc::clone(&started);
            let release = release.clone();
            executor.supply_async(move || {
                started.lock().push(index);
                release.wait_for(TEST_TIMEOUT);
                index
            })
        })
        .collect();

    test_section!("admission");
    assert!(wait_until(TEST_TIMEOUT, || started.lock().len() == 2));
    let metrics = executor.policy().metrics();
    assert_with_log!(metrics.running == 2, "two running", 2, metrics.running);
    assert_with_log!(metrics.queued == 2, "two queued", 2, metrics.queued);
    let rejected = stages[4].join().expect_err("fifth rejected");
    assert!(
        rejected
            .infrastructure_error()
            .is_some_and(Error::is_capacity_exceeded),
        "{rejected:?}"
    );
    let mut first_two = started.lock().clone();
    first_two.sort_unstable();
    assert_eq!(first_two, vec![0, 1]);

    test_section!("fifo release");
    releases[0].count_down();
    assert!(wait_until(TEST_TIMEOUT, || started.lock().len() == 3));
    assert_eq!(started.lock()[2], 2, "oldest queued task starts first");
    settle_briefly();
    assert_eq!(started.lock().len(), 3, "bound still holds");

    releases[1].count_down();
    assert!(wait_until(TEST_TIMEOUT, || started.lock().len() == 4));
    assert_eq!(started.lock()[3], 3);

    for release in &releases {
        release.count_down();
    }
    for (index, stage) in stages.iter().take(4).enumerate() {
        assert_eq!(stage.get_timeout(TEST_TIMEOUT).expect("admitted"), index);
    }
    let metrics = executor.policy().metrics();
    assert_eq!(metrics.total_rejected, 1);
    assert_eq!(metrics.total_queued, 2);
    test_complete!("bounded_policy_runs_two_queues_two_rejects_the_fifth");
}

#[test]
fn full_queue_runs_on_submitting_thread_with_context() {
    init_test("full_queue_runs_on_submitting_thread_with_context");
    let slots = Slots::new();
    let executor = ManagedExecutor::builder("scenario-1")
        .registry(slots.registry())
        .propagated(["Label"])
        .max_async(1)
        .and_then(|b| b.max_queued(1))
        .expect("bounds")
        .run_if_queue_full(true)
        .build()
        .expect("executor");

    let entered = Latch::new(1);
    let release = Latch::new(1);
    let first = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));
    let second = executor.supply_async(|| "queued");
    assert_eq!(second.status(), StageStatus::Pending);

    let counter = Arc::new(AtomicU32::new(150));
    slots.label.set("submitter".to_string());
    let shared = Arc::clone(&counter);
    let label = slots.label.clone();
    let third = executor.supply_async(move || {
        let after = shared.fetch_add(1, Ordering::SeqCst) + 1;
        (after, std::thread::current().id(), label.get())
    });
    slots.label.clear();

    assert!(third.is_done(), "third ran before supply_async returned");
    let (after, thread, label) = third.get().expect("ran inline");
    assert_with_log!(after == 151, "counter incremented", 151, after);
    assert_eq!(thread, std::thread::current().id());
    assert_eq!(label.as_deref(), Some("submitter"));
    assert_eq!(counter.load(Ordering::SeqCst), 151);
    assert_eq!(executor.policy().metrics().total_run_inline, 1);

    release.count_down();
    assert!(first.get_timeout(TEST_TIMEOUT).is_ok());
    assert_eq!(second.get_timeout(TEST_TIMEOUT).expect("second"), "queued");
    test_complete!("full_queue_runs_on_submitting_thread_with_context");
}

#[test]
fn caller_run_dependent_applies_registration_context_on_completing_thread() {
    init_test("caller_run_dependent_applies_registration_context_on_completing_thread");
    let slots = Slots::new();
    let executor = ManagedExecutor::builder("scenario-1-dependent")
        .registry(slots.registry())
        .propagated(["Label"])
        .max_async(1)
        .and_then(|b| b.max_queued(1))
        .expect("bounds")
        .run_if_queue_full(true)
        .build()
        .expect("executor");

    let entered = Latch::new(1);
    let release = Latch::new(1);
    let first = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));
    let queued = executor.supply_async(|| "queued");

    let prior = executor.new_incomplete_stage::<u32>();
    slots.label.set("registrar".to_string());
    let label = slots.label.clone();
    let dependent =
        prior.then_apply_async(move |v| (v, std::thread::current().id(), label.get()));
    slots.label.clear();

    let completer = prior.clone();
    let label = slots.label.clone();
    let (completer_thread, label_after) = std::thread::spawn(move || {
        label.set("completer".to_string());
        completer.complete(7);
        (std::thread::current().id(), label.get())
    })
    .join()
    .expect("completer thread");

    assert!(dependent.is_done(), "ran before complete returned");
    let (value, ran_on, seen) = dependent.get().expect("ran on the completer");
    assert_eq!(value, 7);
    assert_eq!(ran_on, completer_thread);
    assert_with_log!(
        seen.as_deref() == Some("registrar"),
        "registration-time context applied",
        Some("registrar"),
        seen
    );
    assert_eq!(label_after.as_deref(), Some("completer"), "completer context restored");
    assert_eq!(executor.policy().metrics().total_run_inline, 1);

    release.count_down();
    assert!(first.get_timeout(TEST_TIMEOUT).is_ok());
    assert_eq!(queued.get_timeout(TEST_TIMEOUT).expect("queued"), "queued");
    test_complete!("caller_run_dependent_applies_registration_context_on_completing_thread");
}

/// Runs until interrupted; `interrupted` opens if the sleep was cut short.
fn interruptible(entered: &Latch, interrupted: &Latch) -> impl FnOnce() -> u32 + Send + 'static {
    let entered = entered.clone();
    let interrupted = interrupted.clone();
    move || {
        entered.count_down();
        if !contextflow::types::sleep_interruptibly(TEST_TIMEOUT) {
            interrupted.count_down();
        }
        0
    }
}

#[test]
fn external_completion_interrupts_the_computing_action() {
    init_test("external_completion_interrupts_the_computing_action");
    let executor = bounded_executor("premature", 2, -1);

    let entered = Latch::new(1);
    let interrupted = Latch::new(1);
    let completed = executor.supply_async(interruptible(&entered, &interrupted));
    assert!(entered.wait_for(TEST_TIMEOUT));
    assert!(completed.complete(5));
    assert!(interrupted.wait_for(TEST_TIMEOUT), "complete interrupts");
    assert_eq!(completed.get().expect("external value"), 5);

    let entered = Latch::new(1);
    let interrupted = Latch::new(1);
    let failed = executor.supply_async(interruptible(&entered, &interrupted));
    assert!(entered.wait_for(TEST_TIMEOUT));
    assert!(failed.complete_exceptionally(contextflow::Failure::message("external")));
    assert!(interrupted.wait_for(TEST_TIMEOUT), "complete_exceptionally interrupts");
    assert_eq!(failed.status(), StageStatus::Failed);
    test_complete!("external_completion_interrupts_the_computing_action");
}

#[test]
fn obtruding_a_running_stage_interrupts_its_supplier() {
    init_test("obtruding_a_running_stage_interrupts_its_supplier");
    let executor = bounded_executor("obtrude-running", 1, -1);
    let entered = Latch::new(1);
    let interrupted = Latch::new(1);
    let stage = executor.supply_async(interruptible(&entered, &interrupted));
    assert!(entered.wait_for(TEST_TIMEOUT));

    stage.obtrude_value(77);
    assert!(interrupted.wait_for(TEST_TIMEOUT), "supplier interrupted");
    assert_eq!(stage.get().expect("obtruded"), 77);

    let entered = Latch::new(1);
    let interrupted = Latch::new(1);
    let failing = executor.supply_async(interruptible(&entered, &interrupted));
    assert!(entered.wait_for(TEST_TIMEOUT));
    failing.obtrude_failure(contextflow::Failure::message("forced"));
    assert!(interrupted.wait_for(TEST_TIMEOUT), "supplier interrupted");
    assert_eq!(failing.status(), StageStatus::Failed);
    test_complete!("obtruding_a_running_stage_interrupts_its_supplier");
}

#[test]
fn obtruding_a_queued_stage_frees_its_queue_slot() {
    init_test("obtruding_a_queued_stage_frees_its_queue_slot");
    let executor = bounded_executor("obtrude-queued", 1, 1);
    let entered = Latch::new(1);
    let release = Latch::new(1);
    let busy = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));

    let ran = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ran);
    let queued = executor.supply_async(move || counter.fetch_add(1, Ordering::SeqCst));
    assert_eq!(executor.policy().metrics().queued, 1);

    queued.obtrude_value(5);
    assert_eq!(executor.policy().metrics().queued, 0, "slot freed");
    let next = executor.supply_async(|| 9);
    assert_eq!(next.status(), StageStatus::Pending, "admitted to the queue");

    release.count_down();
    assert!(busy.get_timeout(TEST_TIMEOUT).is_ok());
    assert_eq!(next.get_timeout(TEST_TIMEOUT).expect("next"), 9);
    assert_eq!(queued.get().expect("obtruded"), 5);
    assert_eq!(ran.load(Ordering::SeqCst), 0, "discarded action never ran");
    test_complete!("obtruding_a_queued_stage_frees_its_queue_slot");
}

#[test]
fn cancel_without_interrupt_lets_the_running_action_finish() {
    init_test("cancel_without_interrupt_lets_the_running_action_finish");
    let executor = bounded_executor("cancel-soft", 1, -1);
    let entered = Latch::new(1);
    let release = Latch::new(1);
    let finished = Latch::new(1);
    let interrupted_seen = Arc::new(AtomicU32::new(0));

    let (started, gate, done) = (entered.clone(), release.clone(), finished.clone());
    let seen = Arc::clone(&interrupted_seen);
    let stage = executor.supply_async(move || {
        started.count_down();
        gate.wait_for(TEST_TIMEOUT);
        if contextflow::types::is_interrupted() {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        done.count_down();
        1
    });
    assert!(entered.wait_for(TEST_TIMEOUT));

    assert!(stage.cancel(false));
    assert_cancelled!(stage);
    release.count_down();
    assert!(finished.wait_for(TEST_TIMEOUT), "action ran to completion");
    assert_eq!(interrupted_seen.load(Ordering::SeqCst), 0, "no interrupt requested");
    assert!(stage.is_cancelled(), "late result discarded");
    assert!(wait_until(TEST_TIMEOUT, || executor.policy().metrics().running == 0));
    test_complete!("cancel_without_interrupt_lets_the_running_action_finish");
}

#[test]
fn strict_policy_never_runs_on_caller() {
    init_test("strict_policy_never_runs_on_caller");
    let executor = ManagedExecutor::builder("strict")
        .max_async(1)
        .and_then(|b| b.max_queued(1))
        .expect("bounds")
        .run_if_queue_full(true)
        .max_policy(MaxPolicy::Strict)
        .build()
        .expect("executor");

    let entered = Latch::new(1);
    let release = Latch::new(1);
    let first = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));
    let second = executor.supply_async(|| 2);
    let third = executor.supply_async(|| 3);
    assert!(third.join().is_err());
    assert_eq!(executor.policy().metrics().total_run_inline, 0);

    release.count_down();
    assert!(first.get_timeout(TEST_TIMEOUT).is_ok());
    assert_eq!(second.get_timeout(TEST_TIMEOUT).expect("second"), 2);
    test_complete!("strict_policy_never_runs_on_caller");
}

#[test]
fn executors_sharing_a_policy_share_its_bound() {
    init_test("executors_sharing_a_policy_share_its_bound");
    let config = PolicyConfig::new("shared")
        .max_concurrency(1)
        .and_then(|c| c.max_queue_size(1))
        .expect("bounds");
    let policy = PolicyExecutor::with_shared_pool(config);
    let left = ManagedExecutor::builder("left")
        .policy(policy.clone())
        .build()
        .expect("left");
    let right = ManagedExecutor::builder("right")
        .policy(policy.clone())
        .build()
        .expect("right");

    let entered = Latch::new(1);
    let release = Latch::new(1);
    let running = left.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));
    let queued = right.supply_async(|| "right");
    let rejected = left.supply_async(|| "left");
    assert!(rejected.join().is_err());
    assert_eq!(policy.metrics().queued, 1);

    release.count_down();
    assert!(running.get_timeout(TEST_TIMEOUT).is_ok());
    assert_eq!(queued.get_timeout(TEST_TIMEOUT).expect("queued"), "right");
    assert_eq!(left.policy().name(), right.policy().name());
    test_complete!("executors_sharing_a_policy_share_its_bound");
}

#[test]
fn cancelling_a_queued_dependent_discards_its_task() {
    init_test("cancelling_a_queued_dependent_discards_its_task");
    let executor = bounded_executor("discard", 1, -1);
    let entered = Latch::new(1);
    let release = Latch::new(1);
    let busy = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));

    let ran = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ran);
    let queued = executor.completed_stage(1).then_apply_async(move |v| {
        counter.fetch_add(1, Ordering::SeqCst);
        v
    });
    assert_eq!(executor.policy().metrics().queued, 1);
    assert!(queued.cancel(false));
    assert_eq!(executor.policy().metrics().queued, 0);

    release.count_down();
    assert!(busy.get_timeout(TEST_TIMEOUT).is_ok());
    settle_briefly();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_cancelled!(queued);
    test_complete!("cancelling_a_queued_dependent_discards_its_task");
}

#[test]
fn interrupting_a_running_stage_signals_its_token() {
    init_test("interrupting_a_running_stage_signals_its_token");
    let executor = bounded_executor("interrupt", 1, -1);
    let entered = Latch::new(1);
    let observed = Latch::new(1);
    let started = entered.clone();
    let saw = observed.clone();
    let stage = executor.run_async(move || {
        started.count_down();
        if !contextflow::types::sleep_interruptibly(TEST_TIMEOUT) {
            saw.count_down();
        }
    });
    assert!(entered.wait_for(TEST_TIMEOUT));
    assert!(stage.cancel(true));
    assert!(observed.wait_for(TEST_TIMEOUT), "action saw the interrupt");
    assert_cancelled!(stage);
    test_complete!("interrupting_a_running_stage_signals_its_token");
}

#[test]
fn shutdown_lets_accepted_work_finish() {
    init_test("shutdown_lets_accepted_work_finish");
    let executor = bounded_executor("graceful", 1, -1);
    let entered = Latch::new(1);
    let release = Latch::new(1);
    let running = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));
    let queued = executor.supply_async(|| 9);

    executor.shutdown().expect("user owned");
    assert!(executor.is_shutdown());
    assert!(!executor.is_terminated());
    let late = executor.supply_async(|| 0);
    let failure = late.join().expect_err("rejected after shutdown");
    assert!(matches!(
        failure.infrastructure_error(),
        Some(Error::Shutdown { .. })
    ));
    assert_eq!(
        executor.await_termination(Duration::from_millis(20)).ok(),
        Some(false)
    );

    release.count_down();
    assert!(running.get_timeout(TEST_TIMEOUT).is_ok());
    assert_eq!(queued.get_timeout(TEST_TIMEOUT).expect("queued ran"), 9);
    assert_eq!(executor.await_termination(TEST_TIMEOUT).ok(), Some(true));
    assert!(executor.is_terminated());
    test_complete!("shutdown_lets_accepted_work_finish");
}

#[test]
fn shutdown_now_returns_queued_handles() {
    init_test("shutdown_now_returns_queued_handles");
    let executor = bounded_executor("abrupt", 1, -1);
    let entered = Latch::new(1);
    let release = Latch::new(1);
    let running = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));
    let queued: Vec<_> = (0..3).map(|i| executor.supply_async(move || i)).collect();

    let drained = executor.shutdown_now().expect("user owned");
    assert_eq!(drained.len(), 3);
    assert!(drained.iter().all(|task| task.state() == TaskState::Cancelled));
    for stage in &queued {
        assert_cancelled!(stage);
    }
    release.count_down();
    assert!(running.get_timeout(TEST_TIMEOUT).is_ok());
    assert_eq!(executor.await_termination(TEST_TIMEOUT).ok(), Some(true));
    test_complete!("shutdown_now_returns_queued_handles");
}

#[test]
fn container_owned_executor_refuses_lifecycle_control() {
    init_test("container_owned_executor_refuses_lifecycle_control");
    let executor = ManagedExecutor::builder("container")
        .ownership(Ownership::Container)
        .build()
        .expect("executor");
    let err = executor.shutdown().expect_err("lifecycle violation");
    assert!(matches!(
        err,
        Error::LifecycleViolation {
            operation: "shutdown",
            ..
        }
    ));
    assert!(!executor.is_shutdown());
    let value = executor
        .supply_async(|| 1)
        .then_apply(|v| v + 1)
        .get_timeout(TEST_TIMEOUT)
        .expect("still usable");
    assert_eq!(value, 2);
    test_complete!("container_owned_executor_refuses_lifecycle_control");
}

#[derive(Debug)]
struct NoThreads;

impl WorkerPool for NoThreads {
    fn name(&self) -> &str {
        "no-threads"
    }

    fn spawn(&self, _job: Job) -> Result<(), Error> {
        Err(Error::WorkerStart {
            pool: Arc::from("no-threads"),
            reason: "resource temporarily unavailable".to_string(),
        })
    }
}

#[test]
fn worker_start_failure_fails_the_stage() {
    init_test("worker_start_failure_fails_the_stage");
    let executor = ManagedExecutor::builder("starved")
        .max_async(1)
        .expect("bounds")
        .pool(Arc::new(NoThreads))
        .build()
        .expect("executor");

    let stage = executor.supply_async(|| 1);
    let failure = stage.get_timeout(TEST_TIMEOUT).expect_err("no worker thread");
    assert!(
        matches!(
            failure.failure().and_then(|f| f.infrastructure_error()),
            Some(Error::WorkerStart { .. })
        ),
        "{failure:?}"
    );
    assert!(matches!(
        executor.submit(|| 2),
        Err(Error::WorkerStart { .. })
    ));
    assert_eq!(executor.policy().metrics().running, 0, "slot released");

    let dependent = executor.completed_stage(1).then_apply_async(|v| v + 1);
    assert!(dependent.get_timeout(TEST_TIMEOUT).is_err());
    test_complete!("worker_start_failure_fails_the_stage");
}

#[test]
fn invalid_bounds_are_rejected_at_configuration() {
    init_test("invalid_bounds_are_rejected_at_configuration");
    for value in [0, -2, i64::MIN] {
        assert!(ManagedExecutor::builder("bad").max_async(value).is_err());
        assert!(ManagedExecutor::builder("bad").max_queued(value).is_err());
    }
    assert!(ManagedExecutor::builder("ok").max_async(-1).is_ok());
    test_complete!("invalid_bounds_are_rejected_at_configuration");
}
