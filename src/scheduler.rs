use crate::config::ScheduleConfig;
use crate::errors::Error;
use crate::payout::{PayoutManager, SendOutcome};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use log::{debug, error, info};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cadence {
    Every(ChronoDuration),
    DailyAt(NaiveTime),
}

impl Cadence {
    /// Next fire time strictly after `now`. Computing from "after the run
    /// finished" is what makes an overrunning job skip its missed slot
    /// instead of queueing it.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Cadence::Every(interval) => now + *interval,
            Cadence::DailyAt(at) => {
                let today = now.date_naive().and_time(*at);
                let fire = if today > now.naive_utc() {
                    today
                } else {
                    today + ChronoDuration::days(1)
                };
                Utc.from_utc_datetime(&fire)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Ingest,
    Settle,
    AssociateAll,
    Confirm,
}

impl JobKind {
    fn name(&self) -> &'static str {
        match self {
            JobKind::Ingest => "ingest",
            JobKind::Settle => "settle",
            JobKind::AssociateAll => "associate-all",
            JobKind::Confirm => "confirm",
        }
    }
}

struct Job {
    kind: JobKind,
    cadence: Cadence,
    next_fire: DateTime<Utc>,
}

impl Job {
    fn new(kind: JobKind, cadence: Cadence, now: DateTime<Utc>) -> Self {
        Job {
            kind,
            cadence,
            next_fire: cadence.next_after(now),
        }
    }
}

/// One worker per enabled currency. Jobs of the same currency run strictly
/// sequentially on this thread, so they can never overlap; distinct
/// currencies run in parallel because each worker owns its own manager,
/// store and transports.
pub struct CurrencyWorker {
    manager: PayoutManager,
    jobs: Vec<Job>,
}

impl CurrencyWorker {
    pub fn new(manager: PayoutManager, schedule: &ScheduleConfig) -> Self {
        let now = Utc::now();
        let jobs = vec![
            Job::new(
                JobKind::Ingest,
                Cadence::Every(ChronoDuration::minutes(i64::from(schedule.pull_minutes))),
                now,
            ),
            Job::new(JobKind::Settle, Cadence::DailyAt(schedule.send_at), now),
            Job::new(
                JobKind::AssociateAll,
                Cadence::DailyAt(schedule.associate_at),
                now,
            ),
            Job::new(JobKind::Confirm, Cadence::DailyAt(schedule.confirm_at), now),
        ];
        CurrencyWorker { manager, jobs }
    }

    fn execute(&self, kind: JobKind) -> Result<(), Error> {
        match kind {
            JobKind::Ingest => self.manager.pull_payouts(false).map(|_| ()),
            JobKind::Settle => match self.manager.send_payout(false)? {
                // A payment went out; report it without waiting a day.
                SendOutcome::Paid { .. } => self.manager.associate_all(false),
                _ => Ok(()),
            },
            JobKind::AssociateAll => self.manager.associate_all(false),
            JobKind::Confirm => self.manager.confirm_trans(false).map(|_| ()),
        }
    }

    /// Errors and panics are contained here; a failing job must never take
    /// the worker down with it.
    fn run_job(&self, kind: JobKind) {
        let cc = self.manager.currency_code();
        debug!("run {} for {}", kind.name(), cc);
        match catch_unwind(AssertUnwindSafe(|| self.execute(kind))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} job for {} failed: {}", kind.name(), cc, e),
            Err(_) => error!("{} job for {} panicked", kind.name(), cc),
        }
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(
            "Starting settlement worker for {}",
            self.manager.currency_code()
        );
        while !shutdown.load(Ordering::SeqCst) {
            let now = Utc::now();
            for index in 0..self.jobs.len() {
                if self.jobs[index].next_fire <= now {
                    let kind = self.jobs[index].kind;
                    self.run_job(kind);
                    let cadence = self.jobs[index].cadence;
                    self.jobs[index].next_fire = cadence.next_after(Utc::now());
                }
            }

            let wake = self
                .jobs
                .iter()
                .map(|j| j.next_fire)
                .min()
                .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(1));
            // Sleep in short slices so shutdown stays responsive.
            while !shutdown.load(Ordering::SeqCst) {
                let now = Utc::now();
                if now >= wake {
                    break;
                }
                let remaining = (wake - now)
                    .to_std()
                    .unwrap_or_else(|_| Duration::from_millis(250));
                thread::sleep(remaining.min(Duration::from_secs(1)));
            }
        }
        info!(
            "Settlement worker for {} stopped",
            self.manager.currency_code()
        );
    }
}

pub struct Scheduler {
    workers: Vec<CurrencyWorker>,
}

impl Scheduler {
    pub fn new(workers: Vec<CurrencyWorker>) -> Self {
        Scheduler { workers }
    }

    /// Run every worker on its own thread and block until shutdown. Workers
    /// finish their current job before exiting.
    pub fn run(self, shutdown: Arc<AtomicBool>) {
        info!("{}", "=".repeat(80));
        info!("minepay settlement scheduler starting up...");
        let mut handles = Vec::new();
        for worker in self.workers {
            let flag = shutdown.clone();
            let name = format!("settle-{}", worker.manager.currency_code());
            match thread::Builder::new()
                .name(name)
                .spawn(move || worker.run(flag))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("failed to spawn worker thread: {}", e),
            }
        }
        for handle in handles {
            let _ = handle.join();
        }
        info!("minepay settlement scheduler stopped");
    }
}
