//! Demo model driven by the host loop.
//!
//! A periodic timer ticks a producer engine, which submits checksum jobs to
//! the worker pool. A collector engine wakes on the queue signal and folds
//! finished results into the stats. Two agents compete for a "cpu" arbiter
//! on every tick; the more urgent one is always granted first.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use cadence_core::{AgentId, EngineId, JobId, JobPriority, Priority, SignalId, TimerId};
use cadence_jobs::{JobContext, JobError, JobQueue, JobRef};
use cadence_runtime::{CycleContext, Engine, Metrics, ResourceArbiter, Scheduler};
use color_eyre::eyre::{Result, WrapErr};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::settings::Settings;

/// Demo parameters that are not part of the configuration file
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Period of the producer timer
    pub tick: Duration,
    /// Jobs submitted per tick
    pub jobs_per_tick: u32,
    /// Terms summed by each job
    pub job_size: u64,
}

/// Counters collected by the demo engines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DemoStats {
    /// Timer ticks seen by the producer
    pub ticks: u64,
    /// Jobs submitted
    pub submitted: u64,
    /// Jobs that returned a value
    pub completed: u64,
    /// Jobs that failed or panicked
    pub failed: u64,
    /// Jobs cancelled
    pub cancelled: u64,
    /// Wrapping sum of all job results
    pub checksum: u64,
    /// Grants per agent name, in grant order of first appearance
    pub grants: IndexMap<String, u64>,
}

/// Logged and printed when the host loop ends
#[derive(Debug, Clone, Serialize)]
pub struct DemoSummary {
    /// Demo counters
    pub stats: DemoStats,
    /// Scheduler counters
    pub metrics: Metrics,
}

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

type Outstanding = Rc<RefCell<IndexMap<JobId, JobRef<u64>>>>;
type Stats = Rc<RefCell<DemoStats>>;

/// Sum of squares below `n`, checking for cancellation every 4096 terms.
fn checksum_job(n: u64, ctx: &JobContext) -> Result<u64, JobError> {
    let mut acc = 0u64;
    for i in 0..n {
        if i % 4096 == 0 {
            ctx.checkpoint()?;
        }
        acc = acc.wrapping_add(i.wrapping_mul(i));
    }
    Ok(acc)
}

struct Producer {
    tick: SignalId,
    queue: Rc<JobQueue<u64>>,
    outstanding: Outstanding,
    stats: Stats,
    jobs_per_tick: u32,
    job_size: u64,
}

impl Engine for Producer {
    fn cycle(&mut self, ctx: &mut CycleContext<'_>) -> bool {
        if !ctx.is_signaled(self.tick) {
            return false;
        }
        let mut stats = self.stats.borrow_mut();
        stats.ticks += 1;
        for i in 0..self.jobs_per_tick {
            let weight = u32::try_from((stats.ticks + u64::from(i)) % 4).unwrap_or(0);
            let size = self.job_size + u64::from(i);
            match self
                .queue
                .submit(JobPriority::new(weight), move |ctx: &JobContext| checksum_job(size, ctx))
            {
                Ok(job) => {
                    stats.submitted += 1;
                    self.outstanding.borrow_mut().insert(job.id(), job);
                }
                Err(err) => {
                    warn!(error = %err, "job submission rejected");
                    break;
                }
            }
        }
        false
    }

    fn name(&self) -> &str {
        "producer"
    }
}

struct Collector {
    queue: Rc<JobQueue<u64>>,
    outstanding: Outstanding,
    stats: Stats,
}

impl Engine for Collector {
    fn cycle(&mut self, _ctx: &mut CycleContext<'_>) -> bool {
        let events = self.queue.drain_events();
        let mut stats = self.stats.borrow_mut();
        let mut outstanding = self.outstanding.borrow_mut();
        for event in events {
            let Some(job) = outstanding.swap_remove(&event.id) else {
                continue;
            };
            match job.take_result() {
                Some(Ok(value)) => {
                    stats.completed += 1;
                    stats.checksum = stats.checksum.wrapping_add(value);
                }
                Some(Err(JobError::Cancelled)) => stats.cancelled += 1,
                Some(Err(err)) => {
                    warn!(job = %event.id, error = %err, "job failed");
                    stats.failed += 1;
                }
                None => debug!(job = %event.id, state = ?event.state, "job result already taken"),
            }
        }
        false
    }

    fn name(&self) -> &str {
        "collector"
    }
}

/// Requests the arbiter on every tick and releases as soon as granted.
struct Contender {
    label: String,
    agent: AgentId,
    grant: SignalId,
    tick: SignalId,
    arbiter: Rc<RefCell<ResourceArbiter>>,
    stats: Stats,
}

impl Engine for Contender {
    fn cycle(&mut self, ctx: &mut CycleContext<'_>) -> bool {
        let mut arbiter = self.arbiter.borrow_mut();
        if ctx.is_signaled(self.grant) && arbiter.has_access(self.agent) {
            *self
                .stats
                .borrow_mut()
                .grants
                .entry(self.label.clone())
                .or_default() += 1;
            if let Err(err) = arbiter.release_access(ctx, self.agent) {
                warn!(agent = %self.label, error = %err, "release failed");
            }
        }
        if ctx.is_signaled(self.tick)
            && !arbiter.has_access(self.agent)
            && !arbiter.is_waiting_for_access(self.agent)
        {
            if let Err(err) = arbiter.request_access(ctx, self.agent) {
                warn!(agent = %self.label, error = %err, "request failed");
            }
        }
        false
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Scheduler plus the demo engines wired into it
pub struct Demo {
    scheduler: Scheduler,
    queue: Rc<JobQueue<u64>>,
    outstanding: Outstanding,
    stats: Stats,
    timer: TimerId,
    collector: EngineId,
}

impl Demo {
    /// Build the engine graph and start the tick timer.
    pub fn new(settings: &Settings, options: &DemoOptions) -> Result<Self> {
        let mut scheduler = Scheduler::new(settings.scheduler.clone());
        let queue = Rc::new(
            JobQueue::attached(settings.jobs.clone(), &mut scheduler)
                .wrap_err("starting job queue")?,
        );
        let stats = Stats::default();
        let outstanding = Outstanding::default();

        let timer = scheduler.create_timer();
        let tick = scheduler.timer_signal(timer)?;

        let producer = scheduler.add_idle_engine(
            Priority::DEFAULT,
            Producer {
                tick,
                queue: Rc::clone(&queue),
                outstanding: Rc::clone(&outstanding),
                stats: Rc::clone(&stats),
                jobs_per_tick: options.jobs_per_tick,
                job_size: options.job_size,
            },
        );
        scheduler.link(producer, tick)?;

        let collector = scheduler.add_idle_engine(
            Priority::HIGH,
            Collector {
                queue: Rc::clone(&queue),
                outstanding: Rc::clone(&outstanding),
                stats: Rc::clone(&stats),
            },
        );
        if let Some(signal) = queue.queue_signal() {
            scheduler.link(collector, signal)?;
        } else {
            warn!("job queue fires no queue signal; results are never collected");
        }

        let arbiter = Rc::new(RefCell::new(ResourceArbiter::new(&mut scheduler, "cpu")));
        for (label, priority) in [("render", Priority::HIGH), ("compact", Priority::LOW)] {
            let agent = arbiter.borrow_mut().register_agent(&mut scheduler, priority);
            let grant = arbiter.borrow().grant_signal(agent)?;
            let engine = scheduler.add_idle_engine(
                Priority::DEFAULT,
                Contender {
                    label: label.to_string(),
                    agent,
                    grant,
                    tick,
                    arbiter: Rc::clone(&arbiter),
                    stats: Rc::clone(&stats),
                },
            );
            scheduler.link(engine, grant)?;
            scheduler.link(engine, tick)?;
        }

        scheduler.start_timer(timer, options.tick, true)?;
        info!(
            engines = scheduler.engine_count(),
            workers = queue.worker_slots(),
            tick = ?options.tick,
            "demo model ready"
        );

        Ok(Self {
            scheduler,
            queue,
            outstanding,
            stats,
            timer,
            collector,
        })
    }

    /// The scheduler, for the host loop
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Snapshot of the demo counters
    pub fn stats(&self) -> DemoStats {
        self.stats.borrow().clone()
    }

    /// Stop the timer, cancel outstanding work and fold every settled job
    /// into the stats.
    pub fn shutdown(mut self, max_passes: usize) -> Result<DemoSummary> {
        self.scheduler.stop_timer(self.timer, true)?;
        let cancelled = self.queue.cancel_all();
        debug!(cancelled, "pending jobs cancelled");

        let jobs: Vec<JobRef<u64>> = self.outstanding.borrow().values().cloned().collect();
        for job in &jobs {
            if job.wait_timeout(SETTLE_TIMEOUT).is_none() {
                warn!(job = %job.id(), state = ?job.state(), "job ignored cancellation");
            }
        }

        // Completion events are recorded with the result, so one collector
        // cycle after the waits sees all of them.
        self.scheduler.wake_up(self.collector)?;
        let passes = self.scheduler.run_until_idle(max_passes)?;
        debug!(passes, unsettled = self.outstanding.borrow().len(), "scheduler settled");

        Ok(DemoSummary {
            stats: self.stats(),
            metrics: self.scheduler.monitor().metrics().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_jobs::JobQueueConfig;
    use cadence_runtime::SchedulerConfig;
    use std::time::Instant;

    fn drive(demo: &mut Demo, ticks: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while demo.stats().ticks < ticks && Instant::now() < deadline {
            demo.scheduler_mut().run_pass().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_checksum_job() {
        let queue = JobQueue::new(JobQueueConfig::default().with_worker_slots(1)).unwrap();
        let job = queue
            .submit(JobPriority::FLOOR, |ctx: &JobContext| checksum_job(4, ctx))
            .unwrap();
        job.wait_timeout(SETTLE_TIMEOUT).unwrap();
        assert_eq!(job.take_result(), Some(Ok(14)));
    }

    #[test]
    fn test_demo_settles_every_job() {
        let settings = Settings {
            scheduler: SchedulerConfig::unbounded(),
            jobs: JobQueueConfig::default(),
        };
        let options = DemoOptions {
            tick: Duration::from_millis(2),
            jobs_per_tick: 3,
            job_size: 1_000,
        };
        let mut demo = Demo::new(&settings, &options).unwrap();
        drive(&mut demo, 5);

        let summary = demo.shutdown(1_000).unwrap();
        let stats = summary.stats;
        assert!(stats.ticks >= 5);
        assert_eq!(stats.submitted, stats.ticks * 3);
        assert_eq!(stats.completed + stats.cancelled + stats.failed, stats.submitted);
        assert_eq!(stats.failed, 0);
        assert!(summary.metrics.timer_fires >= 5);
    }

    #[test]
    fn test_urgent_contender_granted_first() {
        let settings = Settings {
            scheduler: SchedulerConfig::unbounded(),
            jobs: JobQueueConfig::default(),
        };
        let options = DemoOptions {
            tick: Duration::from_millis(2),
            jobs_per_tick: 0,
            job_size: 0,
        };
        let mut demo = Demo::new(&settings, &options).unwrap();
        drive(&mut demo, 3);
        // Let the last round of grants finish.
        for _ in 0..4 {
            demo.scheduler_mut().run_pass().unwrap();
        }

        let stats = demo.shutdown(100).unwrap().stats;
        assert_eq!(stats.grants.keys().next().map(String::as_str), Some("render"));
        assert!(stats.grants.get("render").copied().unwrap_or(0) >= 1);
    }
}
