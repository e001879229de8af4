//! Asynchronous task dispatch
//!
//! Tasks for the same private record run strictly in submission order; tasks
//! for different records run concurrently up to a fixed number of permits.
//! Terminal failures are also published on a report channel so nothing is
//! lost when the submitter does not wait on its ticket.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::task::{SyncOutcome, SyncTask};

/// A terminal sync failure
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub task: SyncTask,
    pub error: SyncError,
}

/// Handle to a submitted task
#[derive(Debug)]
pub struct SyncTicket {
    task: SyncTask,
    reply: oneshot::Receiver<Result<SyncOutcome>>,
}

impl SyncTicket {
    pub fn task(&self) -> &SyncTask {
        &self.task
    }

    /// Wait for the task to finish
    pub async fn wait(self) -> Result<SyncOutcome> {
        self.reply.await.unwrap_or(Err(SyncError::Cancelled))
    }
}

/// Wait for every ticket, keeping submission order
pub async fn wait_all(tickets: Vec<SyncTicket>) -> Vec<Result<SyncOutcome>> {
    join_all(tickets.into_iter().map(SyncTicket::wait)).await
}

struct Queued {
    task: SyncTask,
    reply: oneshot::Sender<Result<SyncOutcome>>,
}

struct Inner {
    engine: Arc<SyncEngine>,
    queues: DashMap<String, VecDeque<Queued>>,
    permits: Arc<Semaphore>,
    reports: mpsc::UnboundedSender<SyncReport>,
}

/// Runs sync tasks in the background
#[derive(Clone)]
pub struct SyncDispatcher {
    inner: Arc<Inner>,
}

impl SyncDispatcher {
    /// Create a dispatcher and the receiving end of its failure reports
    pub fn new(engine: Arc<SyncEngine>, concurrency: usize) -> (Self, mpsc::UnboundedReceiver<SyncReport>) {
        let (reports, report_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            inner: Arc::new(Inner {
                engine,
                queues: DashMap::new(),
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                reports,
            }),
        };
        (dispatcher, report_rx)
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    /// Queue `task` behind any pending work for the same record.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, task: SyncTask) -> SyncTicket {
        let (reply, reply_rx) = oneshot::channel();
        let key = queue_key(&task);
        let queued = Queued {
            task: task.clone(),
            reply,
        };

        match self.inner.queues.entry(key.clone()) {
            Entry::Occupied(mut queue) => {
                queue.get_mut().push_back(queued);
                debug!(task = %task, depth = queue.get().len(), "Sync task queued behind pending work");
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([queued]));
                debug!(task = %task, "Sync task queued");
                tokio::spawn(drain_queue(self.inner.clone(), key));
            }
        }

        SyncTicket {
            task,
            reply: reply_rx,
        }
    }

    /// Drop queued tasks for a record. A task already running is unaffected.
    ///
    /// Returns the number of tasks cancelled.
    pub fn cancel_pending(&self, user_id: &str, private_record_id: &str) -> usize {
        let key = format!("{}/{}", user_id, private_record_id);
        let Some(mut queue) = self.inner.queues.get_mut(&key) else {
            return 0;
        };

        let cancelled: Vec<Queued> = queue.drain(..).collect();
        drop(queue);
        for queued in &cancelled {
            debug!(task = %queued.task, "Sync task cancelled");
        }
        let count = cancelled.len();
        for queued in cancelled {
            let _ = queued.reply.send(Err(SyncError::Cancelled));
        }
        if count > 0 {
            info!(user_id, record_id = private_record_id, count, "Cancelled pending sync tasks");
        }
        count
    }

    /// Tasks queued and not yet started
    pub fn pending(&self) -> usize {
        self.inner.queues.iter().map(|q| q.value().len()).sum()
    }

    /// Stop starting new work; queued tasks are cancelled
    pub fn shutdown(&self) {
        self.inner.permits.close();
    }
}

fn queue_key(task: &SyncTask) -> String {
    format!("{}/{}", task.user_id, task.private_record_id)
}

/// Worker owning one record's queue until it runs dry
async fn drain_queue(inner: Arc<Inner>, key: String) {
    loop {
        let permit = inner.permits.clone().acquire_owned().await;

        let next = match inner.queues.entry(key.clone()) {
            Entry::Occupied(mut queue) => match queue.get_mut().pop_front() {
                Some(next) => next,
                None => {
                    queue.remove();
                    return;
                }
            },
            Entry::Vacant(_) => return,
        };

        let Ok(permit) = permit else {
            let _ = next.reply.send(Err(SyncError::Cancelled));
            continue;
        };

        let result = inner.engine.run(&next.task).await;
        drop(permit);

        if let Err(error) = &result {
            warn!(task = %next.task, error = %error, "Sync task failed");
            let _ = inner.reports.send(SyncReport {
                task: next.task.clone(),
                error: error.clone(),
            });
        }
        // Submitter may have dropped its ticket
        let _ = next.reply.send(result);
    }
}
