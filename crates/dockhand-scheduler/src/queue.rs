//! Bounded in-process job queue.

use dockhand_core::job::JobDescriptor;
use dockhand_core::{Error, Result};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// FIFO queue of job descriptors with a fixed capacity.
///
/// `enqueue` waits while the queue is full; nothing is ever dropped.
pub struct JobQueue {
    sender: Mutex<Option<mpsc::Sender<JobDescriptor>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<JobDescriptor>>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            capacity,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<JobDescriptor>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a job, waiting for a free slot if the queue is full.
    pub async fn enqueue(&self, descriptor: JobDescriptor) -> Result<()> {
        let sender = self.sender().ok_or(Error::QueueClosed)?;
        sender.send(descriptor).await.map_err(|_| Error::QueueClosed)
    }

    /// Next job in submission order. `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<JobDescriptor> {
        self.receiver.lock().await.recv().await
    }

    /// Stop accepting new jobs. Jobs already queued can still be dequeued.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Close the queue for good and return everything still in it.
    ///
    /// Producers waiting for a slot fail with [`Error::QueueClosed`].
    pub async fn drain(&self) -> Vec<JobDescriptor> {
        self.close();
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut drained = Vec::new();
        while let Ok(descriptor) = receiver.try_recv() {
            drained.push(descriptor);
        }
        drained
    }

    /// Jobs currently waiting. Reports zero once closed.
    pub fn len(&self) -> usize {
        self.sender()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
