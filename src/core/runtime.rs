//! Long-running loops: scheduler, job poller and validation controller,
//! each on its own timer until shutdown.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::controller::ValidationController;
use super::queue::{JobQueue, PollOutcome};
use super::scheduler::{CycleScheduler, TickOutcome};
use crate::config::IntervalsConfig;

pub struct Runtime {
    scheduler: CycleScheduler,
    queue: JobQueue,
    /// `None` runs without the validation loop
    controller: Option<ValidationController>,
    intervals: IntervalsConfig,
}

impl Runtime {
    pub fn new(
        scheduler: CycleScheduler,
        queue: JobQueue,
        controller: Option<ValidationController>,
        intervals: IntervalsConfig,
    ) -> Self {
        Self {
            scheduler,
            queue,
            controller,
            intervals,
        }
    }

    /// Run all loops until Ctrl+C
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested");
            let _ = stop_tx.send(true);
        });
        self.run(stop_rx).await
    }

    /// Run all loops until `shutdown` turns true or its sender is dropped
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            scheduler,
            queue,
            controller,
            intervals,
        } = self;

        let tick = tokio::spawn(every(
            "scheduler",
            Duration::from_secs(intervals.tick_secs.max(1)),
            shutdown.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    match scheduler.tick().await {
                        Ok(TickOutcome::Skipped) => {}
                        Ok(outcome) => info!(?outcome, "Tick finished"),
                        Err(e) => error!(error = %format!("{e:#}"), "Tick failed"),
                    }
                }
            },
        ));

        let work = tokio::spawn(every(
            "worker",
            Duration::from_secs(intervals.worker_poll_secs.max(1)),
            shutdown.clone(),
            move || {
                let queue = queue.clone();
                async move {
                    match queue.poll_once().await {
                        Ok(PollOutcome::Polled { claimed, done, failed }) if claimed > 0 => {
                            info!(claimed, done, failed, "Poll finished")
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Poll failed"),
                    }
                }
            },
        ));

        let mut loops = vec![("scheduler", tick), ("worker", work)];
        if let Some(controller) = controller {
            let validate = tokio::spawn(every(
                "controller",
                Duration::from_secs(intervals.controller_secs.max(1)),
                shutdown,
                move || {
                    let controller = controller.clone();
                    async move {
                        if let Err(e) = controller.run_once().await {
                            error!(error = %format!("{e:#}"), "Controller pass failed");
                        }
                    }
                },
            ));
            loops.push(("controller", validate));
        }

        for (name, handle) in loops {
            if let Err(e) = handle.await {
                error!(loop_name = name, error = %e, "Loop task panicked");
            }
        }
        info!("All loops stopped");
        Ok(())
    }
}

/// Fire `body` every `period`. Each pass runs as its own task, so a slow pass
/// overlaps the next timer and the loop's single-flight guard decides.
/// On shutdown no new pass starts and the in-flight ones are awaited.
async fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut body: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut passes = JoinSet::new();
    info!(loop_name = name, period = ?period, "Loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                while let Some(joined) = passes.try_join_next() {
                    reap(name, joined);
                }
                passes.spawn(body());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if !passes.is_empty() {
        info!(loop_name = name, in_flight = passes.len(), "Waiting for running passes");
    }
    while let Some(joined) = passes.join_next().await {
        reap(name, joined);
    }
    info!(loop_name = name, "Loop stopped");
}

fn reap(name: &'static str, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(loop_name = name, error = %e, "Pass panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_loop_fires_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let counter = Arc::clone(&count);
        let handle = tokio::spawn(every("test", Duration::from_millis(10), stop_rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(55)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_pass() {
        let finished = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let counter = Arc::clone(&finished);
        let handle = tokio::spawn(every("slow", Duration::from_secs(60), stop_rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        // First tick fires immediately; stop while that pass sleeps
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
