//! Tokio timer driver.
//!
//! The multiplexer keeps deadlines but no timers. The driver task sleeps
//! until the earliest deadline (or until an input wakes it because the
//! deadline may have moved) and then calls
//! [`SessionMultiplexer::poll_timers`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::multiplexer::SessionMultiplexer;
use crate::transport::ConnectionTransport;

/// How long the driver sleeps when nothing is scheduled.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Handle to a running timer driver.
#[derive(Debug)]
pub struct TimerDriver {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TimerDriver {
    /// Stops the driver and waits for its task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(target: "synclink", "timer driver task failed: {}", e);
        }
    }

    /// Returns true once the driver task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns the driver for `multiplexer` on the current tokio runtime.
pub fn spawn_timer_driver<T>(multiplexer: Arc<SessionMultiplexer<T>>) -> TimerDriver
where
    T: ConnectionTransport + 'static,
{
    let (tx, mut rx) = oneshot::channel();
    let wake = multiplexer.wake_handle();

    let task = tokio::spawn(async move {
        tracing::debug!(target: "synclink", "timer driver started");
        loop {
            let deadline = match multiplexer.next_deadline() {
                Some(deadline) => tokio::time::Instant::from_std(deadline),
                None => tokio::time::Instant::now() + IDLE_SLEEP,
            };

            tokio::select! {
                _ = &mut rx => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }

            multiplexer.poll_timers();
        }
        tracing::debug!(target: "synclink", "timer driver stopped");
    });

    TimerDriver {
        shutdown: Some(tx),
        task,
    }
}
