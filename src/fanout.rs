//! Fan-out Module
//!
//! Bounded task group used to contact many storage nodes in parallel. At most
//! `width` tasks run at once, each one is cut off after its own timeout, and
//! results are collected per key so the caller can aggregate partial success.
//! A slow or hung node therefore costs at most one timeout, never the whole
//! group.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::shutdown::Shutdown;

/// How one task in the group ended
#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    Completed(T),
    Failed(E),
    TimedOut,
}

/// Aggregated results of a task group
#[derive(Debug)]
pub struct GroupResults<K, T, E> {
    /// Outcomes in completion order
    pub outcomes: Vec<(K, TaskOutcome<T, E>)>,
    /// Shutdown fired before every task finished; unfinished tasks were aborted
    pub cancelled: bool,
}

impl<K, T, E> GroupResults<K, T, E> {
    /// Number of tasks that completed successfully
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TaskOutcome::Completed(_)))
            .count()
    }
}

/// Bounded-width group of keyed tasks with a per-task timeout
pub struct BoundedTaskGroup<K, T, E> {
    tasks: JoinSet<(K, TaskOutcome<T, E>)>,
    permits: Arc<Semaphore>,
    task_timeout: Duration,
}

impl<K, T, E> BoundedTaskGroup<K, T, E>
where
    K: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(width: usize, task_timeout: Duration) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(width.max(1))),
            task_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queue a task. Its timeout starts once it gets a slot.
    pub fn spawn<F>(&mut self, key: K, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let permits = self.permits.clone();
        let task_timeout = self.task_timeout;
        self.tasks.spawn(async move {
            // The semaphore is never closed while the group is alive
            let _permit = permits.acquire_owned().await;
            let outcome = match tokio::time::timeout(task_timeout, task).await {
                Ok(Ok(value)) => TaskOutcome::Completed(value),
                Ok(Err(e)) => TaskOutcome::Failed(e),
                Err(_) => TaskOutcome::TimedOut,
            };
            (key, outcome)
        });
    }

    /// Wait for every task, or abort the rest when `shutdown` fires
    pub async fn join_all(mut self, shutdown: &Shutdown) -> GroupResults<K, T, E> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    cancelled = true;
                    self.tasks.abort_all();
                    break;
                }
                next = self.tasks.join_next() => match next {
                    Some(Ok(result)) => outcomes.push(result),
                    Some(Err(e)) => warn!("Fan-out task ended abnormally: {}", e),
                    None => break,
                },
            }
        }

        // Reap aborted tasks so none outlive the group
        while self.tasks.join_next().await.is_some() {}

        GroupResults {
            outcomes,
            cancelled,
        }
    }
}
