//! Task polling loop
//!
//! One task at a time: each tick picks the oldest waiting task and awaits its
//! reconciliation before the next tick is scheduled.

use crate::error::Result;
use crate::reconcile::Reconciler;
use crate::store::TaskStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Default delay between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Abandon a claimed reconciliation that runs longer than this
    pub reconcile_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconcile_timeout: None,
        }
    }
}

/// Feeds waiting tasks to the reconciler
#[derive(Clone)]
pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    reconciler: Reconciler,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(tasks: Arc<dyn TaskStore>, reconciler: Reconciler, config: DispatcherConfig) -> Self {
        Self {
            tasks,
            reconciler: reconciler.with_timeout(config.reconcile_timeout),
            config,
        }
    }

    /// Reconcile the oldest waiting task, if any, and return its ID
    ///
    /// Reconciliation errors are logged, not returned; they are already
    /// recorded on the task.
    pub async fn tick(&self) -> Result<Option<String>> {
        let Some(task) = self.tasks.oldest_waiting().await? else {
            return Ok(None);
        };
        info!("Processing task {} for service {}", task.id, task.service_id);

        if let Err(e) = self.reconciler.run(&task).await {
            error!("Task {} failed: {}", task.id, e);
        }
        Ok(Some(task.id))
    }

    /// Poll until `shutdown` turns true or its sender is dropped
    ///
    /// An in-flight reconciliation is finished before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Dispatcher started, polling every {}ms",
            self.config.poll_interval.as_millis()
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Failed to poll for tasks: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Dispatcher stopped");
    }
}
