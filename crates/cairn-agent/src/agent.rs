use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeZone};
use crossbeam_channel::{bounded, select};
use tracing::{debug, error, info};

use cairn_core::context::AppContext;
use cairn_types::error::Result;

use crate::config::Configuration;
use crate::job::{JobRunner, ScheduledJob};
use crate::scheduling::Scheduler;

/// How often the planner loop polls the context for cancellation while
/// idle between events.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Events flowing through the agent's scheduler: job firings and the
/// daily planning tick.
enum AgentEvent {
    Run(ScheduledJob),
    Plan(DateTime<Local>),
}

/// Drives a parsed configuration: expands each job's schedules into
/// concrete firing times one day at a time, enqueues them on the
/// scheduler core, and executes firings through the job runner.
pub struct AgentScheduler {
    ctx: AppContext,
    config: Configuration,
    runner: Arc<JobRunner>,
}

/// Running agent; stop it by cancelling the context or calling `stop`.
pub struct AgentHandle {
    scheduler: Scheduler<AgentEvent>,
    thread: JoinHandle<()>,
}

impl AgentHandle {
    /// Stop the dispatcher and wait for the planner loop to exit.
    /// Running jobs complete naturally; only the dispatcher drains.
    pub fn stop(self) {
        self.scheduler.stop();
        if self.thread.join().is_err() {
            error!("agent planner thread panicked");
        }
    }
}

/// Local midnight of the day after `date`.
fn next_day(date: DateTime<Local>) -> DateTime<Local> {
    let next = date.date_naive() + chrono::Duration::days(1);
    Local
        .with_ymd_and_hms(next.year(), next.month(), next.day(), 0, 0, 0)
        .earliest()
        .unwrap_or(date + chrono::Duration::days(1))
}

/// Enqueue all of a day's firings that are still in the future. Past
/// firings are logged and skipped, never back-filled.
fn plan_for_date(
    config: &Configuration,
    scheduler: &Scheduler<AgentEvent>,
    date: DateTime<Local>,
    now: DateTime<Local>,
) {
    debug!(date = %date.date_naive(), "planning jobs");
    for (name, job) in &config.jobs {
        for schedule in &job.schedules {
            for firing in schedule.plan_for_date(date) {
                if firing < now {
                    debug!(job = name, at = %firing, "ignoring past firing");
                    continue;
                }
                debug!(job = name, at = %firing, "scheduled");
                scheduler.schedule_at(
                    AgentEvent::Run(ScheduledJob {
                        scheduled: firing,
                        job: Arc::clone(job),
                    }),
                    firing,
                );
            }
        }
    }
}

impl AgentScheduler {
    pub fn new(ctx: AppContext, config: Configuration, runner: Arc<JobRunner>) -> Self {
        Self {
            ctx,
            config,
            runner,
        }
    }

    /// Start the scheduler core and the planner loop. Plans today
    /// immediately, then replans at every local midnight.
    pub fn run(self) -> Result<AgentHandle> {
        let (ready_tx, ready_rx) = bounded(1000);
        let scheduler = Scheduler::new(ready_tx);
        let stopped = scheduler.start()?;

        let now = Local::now();
        plan_for_date(&self.config, &scheduler, now, now);
        let midnight = next_day(now);
        scheduler.schedule_at(AgentEvent::Plan(midnight), midnight);

        let ctx = self.ctx;
        let config = self.config;
        let runner = self.runner;
        let scheduler_for_loop = scheduler.clone();
        let thread = std::thread::spawn(move || {
            info!(jobs = config.jobs.len(), "agent scheduler running");
            loop {
                select! {
                    recv(ready_rx) -> event => match event {
                        Ok(AgentEvent::Run(job)) => job.execute(&runner),
                        Ok(AgentEvent::Plan(date)) => {
                            plan_for_date(&config, &scheduler_for_loop, date, Local::now());
                            let midnight = next_day(date);
                            scheduler_for_loop.schedule_at(AgentEvent::Plan(midnight), midnight);
                        }
                        Err(_) => break,
                    },
                    recv(stopped) -> _ => break,
                    default(CANCEL_POLL) => {
                        if ctx.is_cancelled() {
                            scheduler_for_loop.stop();
                        }
                    }
                }
            }
            info!("agent scheduler stopped");
        });

        Ok(AgentHandle { scheduler, thread })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_config;
    use crate::task::RepoResolver;
    use cairn_core::reporter::Reporter;
    use cairn_core::storage::StoreRegistry;
    use cairn_core::Mac;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReporter {
        started: AtomicUsize,
        done: AtomicUsize,
    }

    impl Reporter for CountingReporter {
        fn task_start(&self, _kind: &str, _name: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn task_done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
        fn task_warning(&self, _message: &str) {}
        fn task_failed(&self, _code: i32, _message: &str) {}
        fn with_snapshot_id(&self, _mac: Mac) {}
        fn with_repository_name(&self, _name: &str) {}
    }

    #[test]
    fn next_day_is_local_midnight() {
        let date = Local.with_ymd_and_hms(2026, 8, 2, 23, 59, 55).unwrap();
        let next = next_day(date);
        assert_eq!(
            (next.year(), next.month(), next.day()),
            (2026, 8, 3)
        );
        assert_eq!(next.time(), chrono::NaiveTime::MIN);
    }

    #[test]
    fn agent_fires_and_runs_a_due_job() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(dir.path()).with_max_concurrency(2);
        let registry = Arc::new(StoreRegistry::with_defaults());

        // A check job against an empty repository succeeds quickly; an
        // every-second schedule guarantees a firing within the test
        // window.
        cairn_core::repo::Repository::create(
            &ctx,
            &registry,
            "mem://agent-test",
            cairn_core::repo::CreateOptions::default(),
        )
        .unwrap();

        let config = parse_config(r#"job "beat" check "mem://agent-test" every 1s"#).unwrap();
        let reporter = Arc::new(CountingReporter {
            started: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        });
        let runner = Arc::new(JobRunner::new(
            ctx.clone(),
            Arc::clone(&registry),
            Arc::new(RepoResolver::new()),
            Arc::clone(&reporter) as Arc<dyn Reporter>,
            2,
        ));

        let handle = AgentScheduler::new(ctx.clone(), config, runner).run().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while reporter.done.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        ctx.cancel();
        handle.stop();

        assert!(reporter.started.load(Ordering::SeqCst) >= 1);
        assert!(reporter.done.load(Ordering::SeqCst) >= 1);
    }
}
