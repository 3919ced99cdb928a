//! Zero-buffer delivery of jobs to a worker.
//!
//! A worker waiting for work parks a oneshot sender in a shared slot. A
//! delivery only succeeds by taking that parked sender, so a job is never
//! queued: when the worker is busy the job goes straight back to the caller
//! and stays `Pending` in the store.

use crate::job_store::Job;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

#[derive(Default)]
struct Slot {
    waiting: Mutex<Option<oneshot::Sender<Job>>>,
}

impl Slot {
    fn take(&self) -> Option<oneshot::Sender<Job>> {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn park(&self, sender: oneshot::Sender<Job>) {
        *self.waiting.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }
}

/// Inbound endpoint of a worker, handed to the watcher.
#[derive(Clone)]
pub struct JobSender {
    slot: Arc<Slot>,
}

pub struct JobReceiver {
    slot: Arc<Slot>,
}

pub fn channel() -> (JobSender, JobReceiver) {
    let slot = Arc::new(Slot::default());
    (
        JobSender { slot: slot.clone() },
        JobReceiver { slot },
    )
}

impl JobSender {
    /// Hands `job` to the receiver if it is currently waiting, never blocks.
    /// Gives the job back when nobody is waiting.
    pub fn try_deliver(&self, job: Job) -> Result<(), Job> {
        match self.slot.take() {
            Some(sender) => sender.send(job),
            None => Err(job),
        }
    }

    #[cfg(test)]
    pub(crate) fn has_waiting_receiver(&self) -> bool {
        self.slot
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }
}

impl JobReceiver {
    /// Waits for the next delivered job.
    ///
    /// Dropping the returned future leaves a closed sender in the slot, which
    /// makes deliveries fail until the next call.
    pub async fn recv(&mut self) -> Job {
        loop {
            let (sender, receiver) = oneshot::channel();
            self.slot.park(sender);
            if let Ok(job) = receiver.await {
                return job;
            }
        }
    }
}
