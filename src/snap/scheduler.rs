//! Timer-driven jobs, one thread each, stopped by a shared flag.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Immediately, then every interval after the previous run finished.
    Every(Duration),
    /// At `minute` past every local hour.
    Hourly { minute: u32 },
    /// Once a day at local `hour:minute`.
    Daily { hour: u32, minute: u32 },
}

fn resolve(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
}

impl Schedule {
    pub fn first_run(&self, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        match self {
            Self::Every(_) => now,
            _ => self.next_run(now, tz),
        }
    }

    /// First slot strictly after `now`; local times skipped by DST are passed over.
    pub fn next_run(&self, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = now.with_timezone(&tz).naive_local();
        match *self {
            Self::Every(interval) => {
                now + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::minutes(1))
            }
            Self::Hourly { minute } => {
                let base = local.date().and_hms_opt(local.hour(), minute.min(59), 0);
                (0..48)
                    .filter_map(|step| base.map(|b| b + ChronoDuration::hours(step)))
                    .filter_map(|naive| resolve(tz, naive))
                    .find(|at| *at > now)
                    .unwrap_or(now + ChronoDuration::hours(1))
            }
            Self::Daily { hour, minute } => {
                let base = local.date().and_hms_opt(hour.min(23), minute.min(59), 0);
                (0..3)
                    .filter_map(|step| base.map(|b| b + ChronoDuration::days(step)))
                    .filter_map(|naive| resolve(tz, naive))
                    .find(|at| *at > now)
                    .unwrap_or(now + ChronoDuration::days(1))
            }
        }
    }
}

type Task = Box<dyn Fn() -> Result<()> + Send + 'static>;

pub struct Job {
    pub name: &'static str,
    pub schedule: Schedule,
    task: Task,
}

impl Job {
    pub fn new(
        name: &'static str,
        schedule: Schedule,
        task: impl Fn() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name,
            schedule,
            task: Box::new(task),
        }
    }
}

pub struct Scheduler {
    tz: Tz,
    shutdown: Arc<AtomicBool>,
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new(tz: Tz, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            tz,
            shutdown,
            jobs: Vec::new(),
        }
    }

    pub fn add(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name).collect()
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let tz = self.tz;
        self.jobs
            .into_iter()
            .map(|job| {
                let shutdown = Arc::clone(&self.shutdown);
                thread::spawn(move || run_job(job, tz, &shutdown))
            })
            .collect()
    }
}

fn run_job(job: Job, tz: Tz, shutdown: &AtomicBool) {
    let mut next = job.schedule.first_run(Utc::now(), tz);
    info!(job = job.name, next = %next, "job scheduled");
    while !shutdown.load(Ordering::SeqCst) {
        let now = Utc::now();
        if now < next {
            let wait = (next - now).to_std().unwrap_or_default().min(TICK);
            thread::sleep(wait);
            continue;
        }
        debug!(job = job.name, "job starting");
        if let Err(err) = (job.task)() {
            error!(job = job.name, error = %format!("{err:#}"), "job failed");
        }
        next = job.schedule.next_run(Utc::now(), tz);
    }
    debug!(job = job.name, "job stopped");
}
