//! Completion, cancellation and obtrude properties of managed stages.

#[macro_use]
mod common;

use common::*;
use contextflow::test_utils::Latch;
use contextflow::{CompletionStage, Failure, ManagedStage, StageStatus};
use proptest::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[derive(Debug, Clone)]
enum Op {
    Complete(i32),
    Fail,
    Cancel,
}

impl Op {
    fn apply(&self, stage: &ManagedStage<i32>) -> bool {
        match self {
            Self::Complete(value) => stage.complete(*value),
            Self::Fail => stage.complete_exceptionally(Failure::message("failed")),
            Self::Cancel => stage.cancel(false),
        }
    }

    fn matches(&self, stage: &ManagedStage<i32>) -> bool {
        match (self, stage.join()) {
            (Self::Complete(expected), Ok(value)) => *expected == value,
            (Self::Fail, Err(failure)) => matches!(failure, Failure::Task(_)),
            (Self::Cancel, Err(failure)) => matches!(failure, Failure::Cancelled(_)),
            _ => false,
        }
    }
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<i32>().prop_map(Op::Complete),
        Just(Op::Fail),
        Just(Op::Cancel),
    ]
}

/// Runs every op on its own thread, released together, and returns the winners.
fn race(stage: &ManagedStage<i32>, ops: &[Op]) -> Vec<usize> {
    let barrier = Arc::new(Barrier::new(ops.len()));
    std::thread::scope(|scope| {
        let handles: Vec<_> = ops
            .iter()
            .enumerate()
            .map(|(index, op)| {
                let barrier = Arc::clone(&barrier);
                let stage = stage.clone();
                scope.spawn(move || {
                    barrier.wait();
                    op.apply(&stage).then_some(index)
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().expect("op thread"))
            .collect()
    })
}

#[test]
fn concurrent_completions_have_exactly_one_winner() {
    init_test("concurrent_completions_have_exactly_one_winner");
    let mut ops: Vec<Op> = (0..16)
        .map(|i| match i % 3 {
            0 => Op::Complete(i),
            1 => Op::Fail,
            _ => Op::Cancel,
        })
        .collect();
    for round in 0..50 {
        fastrand::Rng::with_seed(round).shuffle(&mut ops);
        let stage = ManagedStage::<i32>::unmanaged();
        let winners = race(&stage, &ops);
        assert_with_log!(winners.len() == 1, "one winner per round", 1, winners.len());
        assert!(ops[winners[0]].matches(&stage), "round {round}: outcome matches winner");
    }
    test_complete!("concurrent_completions_have_exactly_one_winner");
}

proptest! {
    #![proptest_config(test_proptest_config(64))]

    #[test]
    fn any_op_sequence_has_one_effective_call(ops in prop::collection::vec(op_strategy(), 1..8)) {
        init_test_logging();
        let stage = ManagedStage::<i32>::unmanaged();
        let winners = race(&stage, &ops);
        prop_assert_eq!(winners.len(), 1);
        prop_assert!(ops[winners[0]].matches(&stage));

        // Obtrude is outside the at-most-once rule.
        stage.obtrude_value(-1);
        prop_assert_eq!(stage.join().ok(), Some(-1));
    }
}

#[test]
fn cancelling_the_head_fails_the_whole_chain() {
    init_test("cancelling_the_head_fails_the_whole_chain");
    let executor = bounded_executor("chain", 2, -1);
    let ran = Arc::new(AtomicBool::new(false));

    let a = executor.new_incomplete_stage::<i32>();
    let flag = Arc::clone(&ran);
    let b = a.then_apply(move |v| {
        flag.store(true, Ordering::SeqCst);
        v + 1
    });
    let flag = Arc::clone(&ran);
    let c = b.then_apply_async(move |v| {
        flag.store(true, Ordering::SeqCst);
        v * 2
    });

    assert!(a.cancel(true));
    assert!(a.is_cancelled());

    let c_outcome = c.get_timeout(TEST_TIMEOUT);
    assert!(c_outcome.is_err());
    for (name, status, failure) in [
        ("b", b.status(), b.join().err()),
        ("c", c.status(), c.join().err()),
    ] {
        assert_with_log!(status == StageStatus::Failed, name, StageStatus::Failed, status);
        let failure = failure.expect("dependent failed");
        assert!(failure.is_cancellation(), "{name}: {failure:?}");
        assert!(failure.is_completion(), "{name}: wrapped once");
    }
    assert!(!ran.load(Ordering::SeqCst), "no action ran");
    test_complete!("cancelling_the_head_fails_the_whole_chain");
}

#[test]
fn obtruded_value_reaches_dependent_that_has_not_run() {
    init_test("obtruded_value_reaches_dependent_that_has_not_run");
    let executor = bounded_executor("obtrude", 1, -1);
    let entered = Latch::new(1);
    let release = Latch::new(1);
    let busy = executor.run_async(blocking(&entered, &release));
    assert!(entered.wait_for(TEST_TIMEOUT));

    let a = executor.completed_stage(10);
    let b = a.then_apply_async(|x| x + 1);
    assert_eq!(executor.policy().metrics().queued, 1);

    a.obtrude_value(20);
    release.count_down();

    let value = b.get_timeout(TEST_TIMEOUT).expect("b completes");
    assert_with_log!(value == 21, "dependent sees obtruded value", 21, value);
    assert!(busy.get_timeout(TEST_TIMEOUT).is_ok());
    test_complete!("obtruded_value_reaches_dependent_that_has_not_run");
}

#[test]
fn obtrude_on_pending_stage_fires_dependents() {
    init_test("obtrude_on_pending_stage_fires_dependents");
    let a = ManagedStage::<i32>::unmanaged();
    let b = a.then_apply(|x| x + 1);
    a.obtrude_value(4);
    assert_eq!(b.get().expect("fired"), 5);

    a.obtrude_value(40);
    assert_eq!(b.get().expect("already ran"), 5, "completed dependents are not re-run");
    test_complete!("obtrude_on_pending_stage_fires_dependents");
}

#[test]
fn sibling_dependents_both_complete() {
    init_test("sibling_dependents_both_complete");
    let executor = bounded_executor("siblings", 4, -1);
    let a = executor.completed_stage(3);
    let b = a.then_apply_async(|x| x * 10);
    let c = a.then_apply_async(|x| x * 100);
    assert_eq!(b.get_timeout(TEST_TIMEOUT).expect("b"), 30);
    assert_eq!(c.get_timeout(TEST_TIMEOUT).expect("c"), 300);
    test_complete!("sibling_dependents_both_complete");
}

#[derive(Debug)]
struct ArithmeticError;

impl fmt::Display for ArithmeticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/ by zero")
    }
}

impl std::error::Error for ArithmeticError {}

#[test]
fn failed_prior_skips_action_and_wraps_cause() {
    init_test("failed_prior_skips_action_and_wraps_cause");
    let executor = bounded_executor("arith", -1, -1);
    let a = executor.try_supply_async(|| {
        let divisor: i32 = std::hint::black_box(0);
        10_i32.checked_div(divisor).ok_or(ArithmeticError)
    });
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    let b = a.then_apply(move |v| {
        flag.store(true, Ordering::SeqCst);
        v + 1
    });

    let err = b.get_timeout(TEST_TIMEOUT).expect_err("b fails");
    let failure = err.failure().expect("stage failure");
    assert!(failure.is_completion());
    assert!(failure.downcast_ref::<ArithmeticError>().is_some());
    assert!(b.is_completed_exceptionally());
    assert!(!b.is_cancelled());
    assert!(!invoked.load(Ordering::SeqCst));
    test_complete!("failed_prior_skips_action_and_wraps_cause");
}

#[test]
fn stage_is_awaitable() {
    init_test("stage_is_awaitable");
    let executor = bounded_executor("future", 1, -1);
    let stage = executor.supply_async(|| 6).then_apply(|v| v * 7);
    let outcome = futures_lite::future::block_on(stage.clone());
    assert_eq!(outcome.ok(), Some(42));

    let failed = executor.failed_stage::<u8>(Failure::message("boom"));
    assert!(futures_lite::future::block_on(failed).is_err());
    test_complete!("stage_is_awaitable");
}
