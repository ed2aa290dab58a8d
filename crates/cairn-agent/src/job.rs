use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{info, warn};

use cairn_core::context::AppContext;
use cairn_core::reporter::Reporter;
use cairn_core::storage::StoreRegistry;

use crate::schedule::Schedule;
use crate::task::{RepoResolver, Task};

/// A firing later than this past its scheduled time is flagged overdue
/// (typically the machine was suspended). Diagnostic only.
const OVERDUE: Duration = Duration::from_secs(5);

/// A configured job: a task plus the schedules that fire it, and the
/// runtime state used for overlap suppression.
#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub task: Task,
    pub schedules: Vec<Schedule>,
    state: Mutex<JobState>,
}

#[derive(Default, Debug)]
struct JobState {
    running: bool,
    last_scheduled: Option<DateTime<Local>>,
    last_actual_run: Option<DateTime<Local>>,
}

impl Job {
    pub fn new(name: String, task: Task, schedules: Vec<Schedule>) -> Self {
        Self {
            name,
            task,
            schedules,
            state: Mutex::new(JobState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("job state poisoned").running
    }

    pub fn last_actual_run(&self) -> Option<DateTime<Local>> {
        self.state.lock().expect("job state poisoned").last_actual_run
    }

    /// Transition Idle → Running, recording the firing times. Returns
    /// false (and changes nothing) when the previous run is still going.
    fn begin(&self, scheduled: DateTime<Local>) -> bool {
        let mut state = self.state.lock().expect("job state poisoned");
        if state.running {
            return false;
        }
        state.running = true;
        state.last_scheduled = Some(scheduled);
        state.last_actual_run = Some(Local::now());
        true
    }

    fn finish(&self) {
        self.state.lock().expect("job state poisoned").running = false;
    }
}

/// One concrete firing of a job.
pub struct ScheduledJob {
    pub scheduled: DateTime<Local>,
    pub job: Arc<Job>,
}

impl ScheduledJob {
    /// Run the firing on the runner's executor pool.
    ///
    /// If the job is still running from an earlier firing, this one is
    /// dropped with a warning — firings never queue. An execution that
    /// starts more than `OVERDUE` late is logged but still runs.
    pub fn execute(self, runner: &JobRunner) {
        let job = Arc::clone(&self.job);

        if !job.begin(self.scheduled) {
            warn!(job = job.name, "still running, dropping firing");
            return;
        }

        let delay = Local::now().signed_duration_since(self.scheduled);
        if delay > chrono::Duration::from_std(OVERDUE).expect("constant fits") {
            warn!(job = job.name, "overdue by {delay}");
        }

        let ctx = runner.ctx.child();
        let registry = Arc::clone(&runner.registry);
        let resolver = Arc::clone(&runner.resolver);
        let reporter = Arc::clone(&runner.reporter);
        let permits = runner.permits.clone();

        std::thread::spawn(move || {
            // Block here, not in the dispatcher: the pool bound caps how
            // many jobs run, never how many can be dispatched.
            let permit = permits.1.recv();
            if permit.is_err() {
                job.finish();
                return;
            }

            info!(job = job.name, "running");
            reporter.task_start(job.task.kind(), &job.name);
            match job.task.run(&ctx, &registry, &resolver, reporter.as_ref(), &job.name) {
                Ok(()) => {
                    reporter.task_done();
                    info!(job = job.name, "done");
                }
                Err(e) => {
                    reporter.task_failed(1, &format!("{e}"));
                    warn!(job = job.name, "failed: {e}");
                }
            }
            job.finish();
            let _ = permits.0.send(());
        });
    }
}

/// Shared services for job execution plus the executor pool bound.
pub struct JobRunner {
    ctx: AppContext,
    registry: Arc<StoreRegistry>,
    resolver: Arc<RepoResolver>,
    reporter: Arc<dyn Reporter>,
    permits: (Sender<()>, Receiver<()>),
}

impl JobRunner {
    /// `max_jobs` bounds concurrently running jobs; defaults to the
    /// context's concurrency budget when zero.
    pub fn new(
        ctx: AppContext,
        registry: Arc<StoreRegistry>,
        resolver: Arc<RepoResolver>,
        reporter: Arc<dyn Reporter>,
        max_jobs: usize,
    ) -> Self {
        let max_jobs = if max_jobs == 0 {
            ctx.max_concurrency()
        } else {
            max_jobs
        };
        let permits = bounded(max_jobs);
        for _ in 0..max_jobs {
            permits.0.send(()).expect("fresh channel has capacity");
        }
        Self {
            ctx,
            registry,
            resolver,
            reporter,
            permits,
        }
    }
}
