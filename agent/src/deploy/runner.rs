//! Detached workflow runner
//!
//! Workflows for the same app run one at a time in submission order; across
//! apps at most `max_concurrent` run at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Completion signal of the last workflow submitted for an app
struct Tail {
    ticket: u64,
    done: oneshot::Receiver<()>,
}

#[derive(Default)]
struct Queues {
    tails: HashMap<String, Tail>,
    next_ticket: u64,
}

/// Task runner for operation workflows
pub struct OperationRunner {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    queues: Arc<Mutex<Queues>>,
}

impl OperationRunner {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queues: Arc::new(Mutex::new(Queues::default())),
        }
    }

    /// Run `work` in the background after every workflow previously submitted
    /// for the same app, once a slot is open.
    pub fn spawn<F>(&self, app_id: &str, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let (ticket, previous) = {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues.next_ticket += 1;
            let ticket = queues.next_ticket;
            let previous = queues
                .tails
                .insert(app_id.to_string(), Tail { ticket, done: done_rx });
            (ticket, previous)
        };

        let permits = self.permits.clone();
        let queues = self.queues.clone();
        let app_id = app_id.to_string();

        tokio::spawn(async move {
            if let Some(previous) = previous {
                debug!("Waiting for previous workflow of {}", app_id);
                // A dropped sender means the previous workflow died; go ahead
                let _ = previous.done.await;
            }

            match permits.acquire_owned().await {
                Ok(permit) => {
                    debug!("Running workflow for {}", app_id);
                    work.await;
                    drop(permit);
                }
                Err(e) => warn!("Runner closed, dropping workflow for {}: {}", app_id, e),
            }

            {
                let mut queues = queues.lock().unwrap_or_else(|e| e.into_inner());
                if queues.tails.get(&app_id).is_some_and(|t| t.ticket == ticket) {
                    queues.tails.remove(&app_id);
                }
            }
            let _ = done_tx.send(());
        })
    }

    /// Workflows currently holding a slot
    pub fn running(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Apps with a workflow queued or running
    pub fn busy_apps(&self) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.tails.len()
    }
}
