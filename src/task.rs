//! Fixed-interval background tasks.
//!
//! A task runs its job once per interval on a dedicated tokio task. Runs
//! never overlap, a panic inside one run is logged and the next run still
//! happens, and the task ends when stopped or when its handle is dropped.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::clock::deadline_after;

/// Handle to a running periodic task.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `job` to run every `period`, first run one period from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, mut stop_rx) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!(task = %task_name, period = ?period, "Starting periodic task");

            let mut ticker = tokio::time::interval_at(deadline_after(Instant::now(), period), period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    // Fires on an explicit stop and when the handle is dropped.
                    _ = stop_rx.changed() => break,
                }

                debug!(task = %task_name, "Task run started");
                let run = AssertUnwindSafe(async { job().await }).catch_unwind().await;
                match run {
                    Ok(()) => debug!(task = %task_name, "Task run finished"),
                    Err(panic) => error!(
                        task = %task_name,
                        panic = %panic_message(panic.as_ref()),
                        "Task run panicked"
                    ),
                }
            }

            info!(task = %task_name, "Periodic task stopped");
        });

        Self {
            name,
            shutdown,
            handle,
        }
    }

    /// Signal the task to stop and wait for an in-flight run to finish.
    pub async fn stop(self) {
        // The task may already be gone, in which case nobody is listening.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(task = %self.name, error = %e, "Periodic task ended abnormally");
        }
    }

    /// The task name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
