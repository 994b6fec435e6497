//! Cooperative job scheduler
//!
//! One loop dispatches every job. Each run happens on its own task and
//! reports its wall time back to the loop; interval jobs are resized from
//! the observed runtime. A job never overlaps itself: a fire while the
//! previous run is still going is dropped. A job failing with a
//! configuration error stops the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::{ErrorKind, Result, SyncError};
use crate::util::truncate;

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every `interval`, resized from observed runtimes.
    Interval(Duration),
    /// Once a day at a fixed UTC wall-clock time; never resized.
    Daily { at: NaiveTime },
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

/// Interval adaptation from observed runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePolicy {
    pub margin: Duration,
    pub unit: Duration,
}

impl ResizePolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            margin: Duration::from_secs(config.margin_secs),
            unit: Duration::from_secs(config.resize_unit_secs.max(1)),
        }
    }

    fn round_up(&self, runtime: Duration) -> Duration {
        let unit = self.unit.as_millis().max(1);
        let units = runtime.as_millis().div_ceil(unit);
        Duration::from_millis((units * unit) as u64)
    }

    /// New interval after a run of `runtime`. Unchanged while the runtime is
    /// within `margin` of the interval.
    pub fn resize(&self, interval: Duration, runtime: Duration) -> Duration {
        if runtime + self.margin < interval {
            self.round_up(runtime).max(self.unit)
        } else if runtime > interval + self.margin {
            self.round_up(runtime)
        } else {
            interval
        }
    }
}

/// Time from `now` until the next occurrence of `at` (UTC).
pub fn duration_until_next(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

struct Running {
    started: Instant,
    warned: bool,
    handle: JoinHandle<()>,
}

struct Entry {
    job: Arc<dyn Job>,
    trigger: Trigger,
    next: Instant,
    running: Option<Running>,
    runs: u64,
    dropped: u64,
}

impl Entry {
    fn interval(&self) -> Option<Duration> {
        match self.trigger {
            Trigger::Interval(interval) => Some(interval),
            Trigger::Daily { .. } => None,
        }
    }

    fn next_after(&self, now: Instant) -> Instant {
        match self.trigger {
            Trigger::Interval(interval) => now + interval,
            Trigger::Daily { at } => now + duration_until_next(Utc::now(), at),
        }
    }

    /// Soft deadline of the current run, if the job has one.
    fn deadline(&self) -> Option<Instant> {
        let running = self.running.as_ref()?;
        if running.warned {
            return None;
        }
        self.interval().map(|interval| running.started + interval * 2)
    }
}

struct Completion {
    entry: usize,
    runtime: Duration,
    error: Option<SyncError>,
}

/// Job statistics, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStats {
    pub name: String,
    pub trigger: Trigger,
    pub runs: u64,
    pub dropped: u64,
}

pub struct Scheduler {
    entries: Vec<Entry>,
    policy: ResizePolicy,
}

impl Scheduler {
    pub fn new(policy: ResizePolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    /// Register `job`. Interval jobs first fire immediately.
    pub fn add(&mut self, job: Arc<dyn Job>, trigger: Trigger) {
        let mut entry = Entry {
            job,
            trigger,
            next: Instant::now(),
            running: None,
            runs: 0,
            dropped: 0,
        };
        if let Trigger::Daily { .. } = trigger {
            entry.next = entry.next_after(Instant::now());
        }
        self.entries.push(entry);
    }

    pub fn stats(&self) -> Vec<JobStats> {
        self.entries
            .iter()
            .map(|e| JobStats {
                name: e.job.name().to_string(),
                trigger: e.trigger,
                runs: e.runs,
                dropped: e.dropped,
            })
            .collect()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), then
    /// wait for running jobs to finish.
    ///
    /// Returns the error of a job that failed with `ErrorKind::Configuration`;
    /// such a failure would repeat on every run, so dispatch stops.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(jobs = self.entries.len(), "Scheduler started");
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut outcome = Ok(());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            for (position, entry) in self.entries.iter_mut().enumerate() {
                if entry.next > now {
                    continue;
                }
                entry.next = entry.next_after(now);
                if entry.running.is_some() {
                    entry.dropped += 1;
                    tracing::debug!(job = entry.job.name(), "Previous run still active; fire dropped");
                    continue;
                }

                let job = entry.job.clone();
                let done = done_tx.clone();
                let started = Instant::now();
                let handle = tokio::spawn(async move {
                    let error = job.run().await.err();
                    if let Some(error) = &error {
                        tracing::error!(
                            job = job.name(),
                            kind = %error.kind(),
                            error = %error,
                            "Job failed"
                        );
                    }
                    let _ = done.send(Completion {
                        entry: position,
                        runtime: started.elapsed(),
                        error,
                    });
                });
                entry.runs += 1;
                entry.running = Some(Running {
                    started,
                    warned: false,
                    handle,
                });
            }

            for entry in &mut self.entries {
                let Some(deadline) = entry.deadline() else {
                    continue;
                };
                if deadline <= now {
                    if let Some(running) = entry.running.as_mut() {
                        running.warned = true;
                        tracing::warn!(
                            job = entry.job.name(),
                            elapsed_secs = truncate(running.started.elapsed().as_secs_f64(), 2),
                            "Job exceeded its soft deadline"
                        );
                    }
                }
            }

            let wake = self
                .entries
                .iter()
                .flat_map(|e| [Some(e.next), e.deadline()])
                .flatten()
                .min()
                .unwrap_or_else(|| now + Duration::from_secs(60));

            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                Some(done) = done_rx.recv() => {
                    if let Err(error) = self.complete(done) {
                        tracing::error!(error = %error, "Configuration error; scheduler stopping");
                        outcome = Err(error);
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
            }
        }

        for entry in &mut self.entries {
            if let Some(running) = entry.running.take() {
                tracing::info!(job = entry.job.name(), "Waiting for running job");
                let _ = running.handle.await;
            }
        }
        tracing::info!("Scheduler stopped");
        outcome
    }

    /// Record a finished run; hands back a configuration error.
    fn complete(&mut self, done: Completion) -> Result<()> {
        let policy = self.policy;
        let Some(entry) = self.entries.get_mut(done.entry) else {
            return Ok(());
        };
        let Some(running) = entry.running.take() else {
            return Ok(());
        };
        if let Some(error) = done.error {
            if error.kind() == ErrorKind::Configuration {
                return Err(error);
            }
        }
        let runtime_secs = truncate(done.runtime.as_secs_f64(), 2);

        let Trigger::Interval(interval) = entry.trigger else {
            tracing::info!(job = entry.job.name(), runtime_secs, "Job finished");
            return Ok(());
        };
        let resized = policy.resize(interval, done.runtime);
        if resized != interval {
            tracing::info!(
                job = entry.job.name(),
                runtime_secs,
                from_secs = interval.as_secs(),
                to_secs = resized.as_secs(),
                "Job interval resized"
            );
            entry.trigger = Trigger::Interval(resized);
        } else {
            tracing::info!(job = entry.job.name(), runtime_secs, "Job finished");
        }
        entry.next = running.started + resized;
        Ok(())
    }
}
