// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic retry of jobs until each has succeeded once.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::panic_message;

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type Job = Arc<dyn Fn(Context) -> JobFuture + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("jobs cannot be added once the timer has started")]
    AlreadyStarted,
}

enum JobFailure {
    Overran,
    Join(JoinError),
}

struct Jobs {
    started: bool,
    pending: Vec<(String, Job)>,
}

/// Runs every registered job once per tick; a job that succeeds is never
/// run again. A panicking job counts as a failed attempt.
///
/// Each attempt gets a child of the run context whose deadline is one
/// interval away. An attempt still running one interval past that deadline
/// is aborted and counts as failed, so one stuck job cannot hold up the
/// others.
pub struct OnceSuccess {
    interval: Duration,
    jobs: Mutex<Jobs>,
}

impl OnceSuccess {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jobs: Mutex::new(Jobs {
                started: false,
                pending: Vec::new(),
            }),
        }
    }

    pub fn add_job<F, Fut>(&self, name: impl Into<String>, job: F) -> Result<(), TimerError>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.started {
            return Err(TimerError::AlreadyStarted);
        }
        let job: Job = Arc::new(move |ctx: Context| Box::pin(job(ctx)) as JobFuture);
        jobs.pending.push((name.into(), job));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ticks until every job has succeeded or `ctx` is done. Returns the
    /// names of jobs that never succeeded.
    pub async fn run(&self, ctx: &Context) -> Vec<String> {
        let mut pending = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.started = true;
            std::mem::take(&mut jobs.pending)
        };
        if pending.is_empty() || self.interval.is_zero() {
            return pending.into_iter().map(|(name, _)| name).collect();
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = ctx.done() => break,
                _ = ticker.tick() => {}
            }

            let mut still_failing = Vec::with_capacity(pending.len());
            let mut jobs = pending.into_iter();
            while let Some((name, job)) = jobs.next() {
                let attempt = ctx.with_timeout(self.interval);
                let mut task = tokio::spawn(job(attempt.clone()));
                let outcome = tokio::select! {
                    biased;
                    _ = ctx.done() => None,
                    _ = tokio::time::sleep(self.interval.saturating_mul(2)) => {
                        Some(Err(JobFailure::Overran))
                    }
                    res = &mut task => Some(res.map_err(JobFailure::Join)),
                };
                match outcome {
                    None => {
                        // The attempt context is done too; let the job unwind.
                        if tokio::time::timeout(self.interval, &mut task).await.is_err() {
                            task.abort();
                        }
                        still_failing.push((name, job));
                        still_failing.extend(jobs);
                        return still_failing.into_iter().map(|(name, _)| name).collect();
                    }
                    Some(Ok(Ok(()))) => debug!(job = %name, "timer: job succeeded"),
                    Some(Ok(Err(e))) => {
                        warn!(job = %name, error = %e, "timer: job failed, will retry");
                        still_failing.push((name, job));
                    }
                    Some(Err(JobFailure::Overran)) => {
                        task.abort();
                        warn!(job = %name, "timer: job overran its interval, will retry");
                        still_failing.push((name, job));
                    }
                    Some(Err(JobFailure::Join(join))) => {
                        let reason = if join.is_panic() {
                            panic_message(join.into_panic().as_ref())
                        } else {
                            join.to_string()
                        };
                        error!(job = %name, error = %reason, "timer: job panicked, will retry");
                        still_failing.push((name, job));
                    }
                }
            }
            pending = still_failing;
        }
        pending.into_iter().map(|(name, _)| name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let timer = OnceSuccess::new(Duration::from_millis(10));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        timer
            .add_job("flaky", move |_: Context| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("attempt {n}"))
                    } else {
                        Ok(())
                    }
                }
            })
            .unwrap();

        let left = timer.run(&Context::background()).await;
        assert!(left.is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_counts_as_failure() {
        let timer = OnceSuccess::new(Duration::from_millis(10));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        timer
            .add_job("explodes-once", move |_: Context| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("boom");
                    }
                    Ok(())
                }
            })
            .unwrap();

        assert!(timer.run(&Context::background()).await.is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_context_done() {
        let timer = OnceSuccess::new(Duration::from_millis(10));
        timer
            .add_job("never", |_: Context| async { Err("down".to_string()) })
            .unwrap();
        let ctx = Context::background().with_timeout(Duration::from_millis(35));
        assert_eq!(timer.run(&ctx).await, vec!["never".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_job_does_not_starve_others() {
        let timer = OnceSuccess::new(Duration::from_millis(10));
        timer
            .add_job("stuck", |_: Context| std::future::pending::<Result<(), String>>())
            .unwrap();
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();
        timer
            .add_job("healthy", move |_: Context| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(200));
        assert_eq!(timer.run(&ctx).await, vec!["stuck".to_string()]);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_running_job() {
        let timer = Arc::new(OnceSuccess::new(Duration::from_millis(10)));
        let saw_deadline = Arc::new(AtomicUsize::new(0));
        let counter = saw_deadline.clone();
        timer
            .add_job("stuck", move |ctx: Context| {
                if ctx.deadline().is_some() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                std::future::pending::<Result<(), String>>()
            })
            .unwrap();

        let ctx = Context::background();
        let run_ctx = ctx.clone();
        let runner = Arc::clone(&timer);
        let task = tokio::spawn(async move { runner.run(&run_ctx).await });
        tokio::time::sleep(Duration::from_millis(15)).await;
        ctx.cancel();

        let left = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(left, vec!["stuck".to_string()]);
        assert_eq!(saw_deadline.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_after_start_is_rejected() {
        let timer = OnceSuccess::new(Duration::from_millis(10));
        assert!(timer.run(&Context::background()).await.is_empty());
        let err = timer.add_job("late", |_: Context| async { Ok(()) }).unwrap_err();
        assert_eq!(err, TimerError::AlreadyStarted);
    }
}
