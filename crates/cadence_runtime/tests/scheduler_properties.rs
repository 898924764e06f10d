use std::cell::RefCell;
use std::rc::Rc;

use cadence_core::{Priority, WeakRegistry};
use cadence_runtime::{CycleContext, EngineState, Scheduler, SchedulerConfig};
use proptest::prelude::*;

type Trace = Rc<RefCell<Vec<(i32, usize)>>>;

fn recorder(trace: &Trace, key: i32, index: usize) -> impl FnMut(&mut CycleContext<'_>) -> bool + 'static {
    let trace = Rc::clone(trace);
    move |_ctx: &mut CycleContext<'_>| {
        trace.borrow_mut().push((key, index));
        false
    }
}

/// A model object that owns an engine; the engine reaches back into the model
/// through a weak handle.
struct Counter {
    value: Rc<RefCell<u32>>,
    registry: WeakRegistry<Rc<RefCell<u32>>>,
}

impl Counter {
    fn new() -> Self {
        let value = Rc::new(RefCell::new(0));
        let registry = WeakRegistry::new(Rc::clone(&value));
        Self { value, registry }
    }
}

#[test]
fn test_dropped_model_is_seen_as_empty_by_engine() {
    let mut sched = Scheduler::new(SchedulerConfig::unbounded());
    let model = Counter::new();
    let handle = model.registry.handle();
    let observed: Rc<RefCell<Vec<Option<u32>>>> = Rc::default();

    let obs = Rc::clone(&observed);
    let signal = sched.create_signal();
    let engine = sched.add_engine(Priority::DEFAULT, move |_ctx: &mut CycleContext<'_>| {
        let value = handle.with(|v| {
            *v.borrow_mut() += 1;
            *v.borrow()
        });
        obs.borrow_mut().push(value);
        false
    });
    sched.link(engine, signal).unwrap();

    sched.run_pass().unwrap();
    assert_eq!(*model.value.borrow(), 1);

    drop(model);
    sched.fire(signal).unwrap();
    sched.run_pass().unwrap();

    assert_eq!(*observed.borrow(), vec![Some(1), None]);
}

#[test]
fn test_chain_of_signals_settles_in_one_pass() {
    // a -> s1 -> b -> s2 -> c, with strictly increasing priority keys
    let trace: Trace = Rc::default();
    let mut sched = Scheduler::new(SchedulerConfig::unbounded());
    let s1 = sched.create_signal();
    let s2 = sched.create_signal();

    let t = Rc::clone(&trace);
    sched.add_engine(Priority::HIGH, move |ctx: &mut CycleContext<'_>| {
        t.borrow_mut().push((-1, 0));
        ctx.fire(s1).unwrap();
        false
    });
    let t = Rc::clone(&trace);
    let b = sched.add_idle_engine(Priority::DEFAULT, move |ctx: &mut CycleContext<'_>| {
        if ctx.is_signaled(s1) {
            t.borrow_mut().push((0, 1));
            ctx.fire(s2).unwrap();
        }
        false
    });
    let c = sched.add_idle_engine(Priority::LOW, recorder(&trace, 1, 2));
    sched.link(b, s1).unwrap();
    sched.link(c, s2).unwrap();

    let report = sched.run_pass().unwrap();
    assert_eq!(report.cycles, 3);
    assert!(report.is_idle());
    assert_eq!(*trace.borrow(), vec![(-1, 0), (0, 1), (1, 2)]);
    assert_eq!(sched.engine_state(c), Some(EngineState::Idle));
}

#[test]
fn test_mutual_wakeups_terminate_each_pass() {
    let mut sched = Scheduler::new(SchedulerConfig::unbounded());
    let ping = sched.create_signal();
    let pong = sched.create_signal();

    let a = sched.add_engine(Priority::DEFAULT, move |ctx: &mut CycleContext<'_>| {
        ctx.fire(pong).unwrap();
        false
    });
    let b = sched.add_engine(Priority::DEFAULT, move |ctx: &mut CycleContext<'_>| {
        ctx.fire(ping).unwrap();
        false
    });
    sched.link(a, ping).unwrap();
    sched.link(b, pong).unwrap();

    for _ in 0..5 {
        let report = sched.run_pass().unwrap();
        assert!(report.completed);
        assert!(report.cycles <= 2);
    }
    assert!(!sched.is_idle());
}

proptest! {
    #[test]
    fn prop_pass_runs_in_ascending_key_then_creation_order(keys in prop::collection::vec(-3i32..4, 1..40)) {
        let trace: Trace = Rc::default();
        let mut sched = Scheduler::new(SchedulerConfig::unbounded());
        for (index, &key) in keys.iter().enumerate() {
            sched.add_engine(Priority::new(key), recorder(&trace, key, index));
        }

        let report = sched.run_pass().unwrap();
        prop_assert_eq!(report.cycles as usize, keys.len());

        let ran = trace.borrow().clone();
        let mut expected: Vec<(i32, usize)> = keys.iter().copied().enumerate().map(|(i, k)| (k, i)).collect();
        expected.sort();
        prop_assert_eq!(ran, expected);
    }

    #[test]
    fn prop_repeated_fires_cycle_each_engine_once(engines in 1usize..16, fires in 1usize..10) {
        let counts: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(vec![0; engines]));
        let mut sched = Scheduler::new(SchedulerConfig::unbounded());
        let signal = sched.create_signal();

        for index in 0..engines {
            let counts = Rc::clone(&counts);
            let id = sched.add_idle_engine(Priority::DEFAULT, move |_ctx: &mut CycleContext<'_>| {
                counts.borrow_mut()[index] += 1;
                false
            });
            sched.link(id, signal).unwrap();
        }

        for _ in 0..fires {
            sched.fire(signal).unwrap();
        }
        sched.run_pass().unwrap();

        prop_assert!(counts.borrow().iter().all(|&n| n == 1));
        prop_assert!(sched.is_idle());
    }

    #[test]
    fn prop_budgeted_passes_visit_same_order(keys in prop::collection::vec(-2i32..3, 1..30), budget in 1u64..5) {
        let trace: Trace = Rc::default();
        let config = SchedulerConfig::unbounded().with_max_cycles_per_pass(Some(budget));
        let mut sched = Scheduler::new(config);
        for (index, &key) in keys.iter().enumerate() {
            sched.add_engine(Priority::new(key), recorder(&trace, key, index));
        }

        let invocations = sched.run_until_idle(keys.len() + 1).unwrap();
        prop_assert!(invocations <= keys.len());

        let mut expected: Vec<(i32, usize)> = keys.iter().copied().enumerate().map(|(i, k)| (k, i)).collect();
        expected.sort();
        prop_assert_eq!(trace.borrow().clone(), expected);
        prop_assert_eq!(sched.monitor().metrics().passes, 1);
    }
}
