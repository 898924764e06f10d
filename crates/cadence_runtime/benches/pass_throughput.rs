use cadence_core::Priority;
use cadence_runtime::{CycleContext, Scheduler, SchedulerConfig};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

/// Fan-out graph: one source signal wakes `width` engines at mixed priorities.
fn fan_out(width: usize) -> (Scheduler, cadence_core::SignalId) {
    let mut sched = Scheduler::new(SchedulerConfig::unbounded().with_history_limit(0));
    let source = sched.create_signal();
    for i in 0..width {
        let key = (i % 5) as i32 - 2;
        let id = sched.add_idle_engine(Priority::new(key), |_ctx: &mut CycleContext<'_>| false);
        // Linking a fresh engine to a fresh signal cannot fail.
        let _ = sched.link(id, source);
    }
    (sched, source)
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out_pass");
    for width in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let (mut sched, source) = fan_out(width);
            b.iter(|| {
                let _ = sched.fire(source);
                sched.run_pass()
            });
        });
    }
    group.finish();
}

fn bench_self_waking(c: &mut Criterion) {
    let mut sched = Scheduler::new(SchedulerConfig::unbounded().with_history_limit(0));
    for _ in 0..1024 {
        sched.add_engine(Priority::DEFAULT, |_ctx: &mut CycleContext<'_>| true);
    }
    c.bench_function("self_waking_1024", |b| b.iter(|| sched.run_pass()));
}

criterion_group!(benches, bench_fan_out, bench_self_waking);
criterion_main!(benches);
