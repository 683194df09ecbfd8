//! Dependent wiring and action dispatch.
//!
//! Every combinator reduces to the same steps: pick the governing facility,
//! capture a snapshot at call time, register a callback on the prior stage,
//! and when the callback fires either settle the dependent directly (a
//! failure short-circuit) or dispatch the action in the requested form.
//!
//! Callbacks hold their prior stage weakly. A stage only fires callbacks
//! while alive, and a pending stage that nobody can complete must not be
//! kept alive by its own dependents.

use super::Outcome;
use super::cell::{Cell, Dependent, Firing};
use super::managed::ManagedStage;
use crate::context::{ContextPropagator, ContextSnapshot};
use crate::error::ContextError;
use crate::executor::Executor;
use crate::runtime::{Runnable, ThreadPool};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::Failure;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Where a dependent action runs.
pub(crate) enum Mode {
    /// On the completing thread, or inline if the prior is already complete.
    Sync,
    /// On the governing stage's default facility.
    Default,
    /// On a caller-supplied executor.
    On(Arc<dyn Executor>),
}

impl Mode {
    pub(crate) fn on<E: Executor + Clone + 'static>(executor: &E) -> Self {
        Self::On(Arc::new(executor.clone()))
    }
}

/// Where and with which captured context a dispatched action runs.
pub(crate) struct Plan {
    executor: Option<Arc<dyn Executor>>,
    snapshot: Option<ContextSnapshot>,
}

fn capture(executor: &dyn Executor) -> Result<Option<ContextSnapshot>, ContextError> {
    executor
        .propagator()
        .map(ContextPropagator::capture)
        .transpose()
}

impl Plan {
    /// Captures context on the calling thread for an action in `mode`.
    pub(crate) fn new(facility: &Arc<dyn Executor>, mode: Mode) -> Result<Self, ContextError> {
        match mode {
            Mode::Sync => Ok(Self {
                snapshot: capture(facility.as_ref())?,
                executor: None,
            }),
            Mode::Default => Ok(Self {
                snapshot: capture(facility.as_ref())?,
                executor: Some(Arc::clone(facility)),
            }),
            Mode::On(executor) => Ok(Self {
                snapshot: capture(executor.as_ref())?,
                executor: Some(executor),
            }),
        }
    }
}

fn weak<T>(stage: &ManagedStage<T>) -> Weak<Cell<T>> {
    Arc::downgrade(&stage.cell)
}

fn upgrade<T>(cell: &Weak<Cell<T>>) -> Option<ManagedStage<T>> {
    cell.upgrade().map(|cell| ManagedStage { cell })
}

/// Chooses the facility of a binary combinator: the managed side wins.
fn governing<T, U>(left: &ManagedStage<T>, right: &ManagedStage<U>) -> Arc<dyn Executor>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    if !left.is_managed() && right.is_managed() {
        Arc::clone(&right.cell.facility)
    } else {
        Arc::clone(&left.cell.facility)
    }
}

pub(crate) fn fail_capture<U: Clone + Send + 'static>(target: &ManagedStage<U>, err: ContextError) {
    warn!(stage = %target.id(), error = %err, "context capture failed");
    target.settle(Err(Failure::infrastructure(err)));
}

/// Runs `work` under `snapshot` and settles `target` with the result.
fn run_action<U, W>(target: &ManagedStage<U>, snapshot: Option<&ContextSnapshot>, work: W)
where
    U: Clone + Send + 'static,
    W: FnOnce() -> Outcome<U>,
{
    if target.is_done() {
        trace!(stage = %target.id(), "stage already complete, action skipped");
        return;
    }
    let outcome = {
        let _guard = match snapshot.map(ContextSnapshot::apply).transpose() {
            Ok(guard) => guard,
            Err(err) => {
                warn!(stage = %target.id(), error = %err, "context apply failed");
                target.settle(Err(Failure::infrastructure(err)));
                return;
            }
        };
        catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| Err(Failure::from_panic(payload)))
    };
    target.settle(outcome);
}

/// Wraps an action for an executor.
///
/// Discarding the runnable (cancelled while queued, or drained by shutdown)
/// cancels `target`.
pub(crate) fn runnable<U, W>(target: ManagedStage<U>, snapshot: Option<ContextSnapshot>, work: W) -> Runnable
where
    U: Clone + Send + 'static,
    W: FnOnce() -> Outcome<U> + Send + 'static,
{
    let discarded = target.clone();
    Runnable::new(move || run_action(&target, snapshot.as_ref(), work)).on_cancel(move |reason| {
        if discarded.settle(Err(Failure::Cancelled(reason))) {
            trace!(stage = %discarded.id(), "queued action discarded");
        }
    })
}

/// Sends an action to `executor`; a rejection fails `target`.
pub(crate) fn submit<U, W>(
    executor: &dyn Executor,
    target: &ManagedStage<U>,
    snapshot: Option<ContextSnapshot>,
    work: W,
) where
    U: Clone + Send + 'static,
    W: FnOnce() -> Outcome<U> + Send + 'static,
{
    match executor.execute(runnable(target.clone(), snapshot, work)) {
        Ok(Some(task)) => target.cell.attach_task(task),
        Ok(None) => {}
        Err(err) => {
            debug!(stage = %target.id(), executor = %executor.name(), error = %err, "dispatch rejected");
            target.settle(Err(Failure::infrastructure(err)));
        }
    }
}

fn dispatch<U, W>(plan: Plan, firing: Firing, target: &ManagedStage<U>, work: W)
where
    U: Clone + Send + 'static,
    W: FnOnce() -> Outcome<U> + Send + 'static,
{
    match plan.executor {
        None => {
            // An already-complete prior runs the action with the caller's own context.
            let snapshot = match firing {
                Firing::Inline => None,
                Firing::Deferred => plan.snapshot,
            };
            run_action(target, snapshot.as_ref(), work);
        }
        Some(executor) => submit(executor.as_ref(), target, plan.snapshot, work),
    }
}

/// Short-circuit that fails the dependent when the prior failed.
pub(crate) fn on_success<T, U>(outcome: &Outcome<T>) -> Option<Outcome<U>> {
    outcome.as_ref().err().map(|failure| Err(failure.clone().propagated()))
}

/// No short-circuit: the action always runs.
pub(crate) fn always<T, U>(_: &Outcome<T>) -> Option<Outcome<U>> {
    None
}

/// Short-circuit that passes a successful value through untouched.
pub(crate) fn on_failure<T: Clone>(outcome: &Outcome<T>) -> Option<Outcome<T>> {
    outcome.as_ref().ok().map(|value| Ok(value.clone()))
}

/// Attaches a unary dependent to `prior`.
///
/// `skip` is consulted when the prior completes and may settle the dependent
/// without dispatching. Otherwise `body` runs in the requested form and reads
/// the prior's outcome at that moment, so an obtruded outcome is seen by
/// actions that have not started yet.
pub(crate) fn attach<T, U, S, B>(prior: &ManagedStage<T>, mode: Mode, skip: S, body: B) -> ManagedStage<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    S: FnOnce(&Outcome<T>) -> Option<Outcome<U>> + Send + 'static,
    B: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
{
    let target = prior.new_incomplete_stage::<U>();
    let plan = match Plan::new(&prior.cell.facility, mode) {
        Ok(plan) => plan,
        Err(err) => {
            fail_capture(&target, err);
            return target;
        }
    };
    let source = weak(prior);
    let dependent = target.clone();
    prior.cell.when_done(Box::new(move |firing| {
        let Some(source) = upgrade(&source) else {
            return;
        };
        if let Some(shortcut) = source.outcome().as_ref().and_then(skip) {
            dependent.settle(shortcut);
            return;
        }
        dispatch(plan, firing, &dependent, move || body(source.join()));
    }));
    target
}

/// Attaches a dependent whose action produces another stage to wait for.
pub(crate) fn compose<T, U, S, B>(prior: &ManagedStage<T>, mode: Mode, skip: S, body: B) -> ManagedStage<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    S: FnOnce(&Outcome<T>) -> Option<Outcome<U>> + Send + 'static,
    B: FnOnce(Outcome<T>) -> Outcome<ManagedStage<U>> + Send + 'static,
{
    let facility = Arc::clone(&prior.cell.facility);
    let inner_facility = Arc::clone(&facility);
    let produced: ManagedStage<ManagedStage<U>> = attach(
        prior,
        mode,
        move |outcome| {
            skip(outcome).map(|shortcut| {
                let stage = ManagedStage::with_facility(inner_facility);
                stage.settle(shortcut);
                Ok(stage)
            })
        },
        body,
    );
    let target = ManagedStage::<U>::with_facility(facility);
    let relay = target.clone();
    let outer = weak(&produced);
    produced.cell.when_done(Box::new(move |_| {
        let Some(outer) = upgrade(&outer) else {
            return;
        };
        match outer.join() {
            Ok(inner) => {
                let source = weak(&inner);
                inner.cell.when_done(Box::new(move |_| {
                    if let Some(inner) = upgrade(&source) {
                        relay.settle(inner.join().map_err(Failure::propagated));
                    }
                }));
            }
            Err(failure) => {
                relay.settle(Err(failure));
            }
        }
    }));
    target
}

struct Join<T, U, B> {
    remaining: AtomicUsize,
    action: Mutex<Option<(Plan, B)>>,
    left: Mutex<Option<ManagedStage<T>>>,
    right: Mutex<Option<ManagedStage<U>>>,
}

/// Attaches a dependent that runs once both stages succeed.
pub(crate) fn attach_both<T, U, V, B>(
    left: &ManagedStage<T>,
    right: &ManagedStage<U>,
    mode: Mode,
    body: B,
) -> ManagedStage<V>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    V: Clone + Send + 'static,
    B: FnOnce(T, U) -> Outcome<V> + Send + 'static,
{
    let facility = governing(left, right);
    let target = ManagedStage::<V>::with_facility(Arc::clone(&facility));
    let plan = match Plan::new(&facility, mode) {
        Ok(plan) => plan,
        Err(err) => {
            fail_capture(&target, err);
            return target;
        }
    };
    let join = Arc::new(Join {
        remaining: AtomicUsize::new(2),
        action: Mutex::new(Some((plan, body))),
        left: Mutex::new(None),
        right: Mutex::new(None),
    });
    left.cell.when_done(both_arm(&join, &target, weak(left), |join, stage| {
        *join.left.lock() = Some(stage);
    }));
    right.cell.when_done(both_arm(&join, &target, weak(right), |join, stage| {
        *join.right.lock() = Some(stage);
    }));
    target
}

fn both_arm<T, U, V, W, B>(
    join: &Arc<Join<T, U, B>>,
    target: &ManagedStage<V>,
    side: Weak<Cell<W>>,
    store: fn(&Join<T, U, B>, ManagedStage<W>),
) -> Dependent
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    V: Clone + Send + 'static,
    W: Clone + Send + 'static,
    B: FnOnce(T, U) -> Outcome<V> + Send + 'static,
{
    let join = Arc::clone(join);
    let target = target.clone();
    Box::new(move |firing| {
        let Some(stage) = upgrade(&side) else {
            return;
        };
        if let Some(Err(failure)) = stage.outcome() {
            if join.action.lock().take().is_some() {
                target.settle(Err(failure.propagated()));
            }
            return;
        }
        store(&join, stage);
        if join.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Some((plan, body)) = join.action.lock().take() else {
            return;
        };
        let (Some(left), Some(right)) = (join.left.lock().take(), join.right.lock().take()) else {
            return;
        };
        dispatch(plan, firing, &target, move || match (left.join(), right.join()) {
            (Ok(a), Ok(b)) => body(a, b),
            (Err(failure), _) | (_, Err(failure)) => Err(failure.propagated()),
        });
    })
}

/// Which stage of an either-combinator completed first.
pub(crate) enum Side<L, R> {
    Left(L),
    Right(R),
}

/// Attaches a dependent that runs when either stage completes.
///
/// The first stage to complete decides: a failure fails the dependent.
pub(crate) fn attach_either<T, U, V, B>(
    left: &ManagedStage<T>,
    right: &ManagedStage<U>,
    mode: Mode,
    body: B,
) -> ManagedStage<V>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    V: Clone + Send + 'static,
    B: FnOnce(Side<T, U>) -> Outcome<V> + Send + 'static,
{
    let facility = governing(left, right);
    let target = ManagedStage::<V>::with_facility(Arc::clone(&facility));
    let plan = match Plan::new(&facility, mode) {
        Ok(plan) => plan,
        Err(err) => {
            fail_capture(&target, err);
            return target;
        }
    };
    let action = Arc::new(Mutex::new(Some((plan, body))));
    left.cell
        .when_done(either_arm(&action, &target, weak(left), Side::Left));
    right
        .cell
        .when_done(either_arm(&action, &target, weak(right), Side::Right));
    target
}

fn either_arm<T, U, V, W, B>(
    action: &Arc<Mutex<Option<(Plan, B)>>>,
    target: &ManagedStage<V>,
    side: Weak<Cell<W>>,
    wrap: fn(W) -> Side<T, U>,
) -> Dependent
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    V: Clone + Send + 'static,
    W: Clone + Send + 'static,
    B: FnOnce(Side<T, U>) -> Outcome<V> + Send + 'static,
{
    let action = Arc::clone(action);
    let target = target.clone();
    Box::new(move |firing| {
        let Some(stage) = upgrade(&side) else {
            return;
        };
        let Some((plan, body)) = action.lock().take() else {
            return;
        };
        if let Some(Err(failure)) = stage.outcome() {
            target.settle(Err(failure.propagated()));
            return;
        }
        dispatch(plan, firing, &target, move || {
            stage
                .join()
                .map_err(Failure::propagated)
                .and_then(|value| body(wrap(value)))
        });
    })
}

/// Runs `supplier` in `mode` and completes `stage` with it if still pending.
pub(crate) fn complete_async<T, F>(stage: &ManagedStage<T>, mode: Mode, supplier: F)
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match Plan::new(&stage.cell.facility, mode) {
        Ok(plan) => dispatch(plan, Firing::Deferred, stage, move || Ok(supplier())),
        Err(err) => fail_capture(stage, err),
    }
}

fn facility_of<T>(stages: &[ManagedStage<T>]) -> Arc<dyn Executor>
where
    T: Clone + Send + 'static,
{
    stages
        .iter()
        .find(|stage| stage.is_managed())
        .or_else(|| stages.first())
        .map_or_else(
            || Arc::new(ThreadPool::shared()) as Arc<dyn Executor>,
            |stage| Arc::clone(&stage.cell.facility),
        )
}

struct Gather<T> {
    remaining: AtomicUsize,
    done: Mutex<Vec<Option<ManagedStage<T>>>>,
}

/// A stage completing with every value, in order, once all stages succeed.
///
/// The first failure fails the result.
pub fn all_of<T>(stages: &[ManagedStage<T>]) -> ManagedStage<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let target = ManagedStage::<Vec<T>>::with_facility(facility_of(stages));
    if stages.is_empty() {
        target.settle(Ok(Vec::new()));
        return target;
    }
    let gather = Arc::new(Gather {
        remaining: AtomicUsize::new(stages.len()),
        done: Mutex::new(vec![None; stages.len()]),
    });
    for (index, stage) in stages.iter().enumerate() {
        let gather = Arc::clone(&gather);
        let target = target.clone();
        let side = weak(stage);
        stage.cell.when_done(Box::new(move |_| {
            let Some(stage) = upgrade(&side) else {
                return;
            };
            if let Some(Err(failure)) = stage.outcome() {
                target.settle(Err(failure.propagated()));
                return;
            }
            gather.done.lock()[index] = Some(stage);
            if gather.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }
            let stages: Vec<ManagedStage<T>> = gather.done.lock().drain(..).flatten().collect();
            let values: Outcome<Vec<T>> = stages
                .iter()
                .map(|stage| stage.join().map_err(Failure::propagated))
                .collect();
            target.settle(values);
        }));
    }
    target
}

/// A stage completing with the outcome of whichever stage completes first.
pub fn any_of<T>(stages: &[ManagedStage<T>]) -> ManagedStage<T>
where
    T: Clone + Send + 'static,
{
    let target = ManagedStage::<T>::with_facility(facility_of(stages));
    for stage in stages {
        let target = target.clone();
        let side = weak(stage);
        stage.cell.when_done(Box::new(move |_| {
            if let Some(stage) = upgrade(&side) {
                target.settle(stage.join().map_err(Failure::propagated));
            }
        }));
    }
    target
}
