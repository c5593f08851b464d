//! Bounded FIFO between connection handlers and the event processor.
//!
//! Every `event` frame from every connection funnels through this queue, and
//! exactly one consumer drains it. That single consumer is what makes rule
//! evaluation and saga creation race-free: concurrent arrivals are ordered by
//! arrival at the queue, then processed one at a time.
//!
//! `enqueue` never blocks. When the buffer is saturated it reports rejection
//! and the caller answers the producer with an `error/queue_full` frame.
//! Step acknowledgments do not pass through here; they belong to sagas whose
//! state machines are synchronized independently.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::Envelope;

/// Default buffer capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// An event waiting to be processed.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    /// Registered id of the connection that produced the event.
    pub source_id: String,
    pub envelope: Envelope,
    pub enqueued_at: DateTime<Utc>,
}

/// Single-consumer FIFO with a fixed capacity.
pub struct EventQueue {
    tx: Mutex<Option<mpsc::Sender<QueuedEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<QueuedEvent>>>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            capacity,
        }
    }

    /// Queue an event without blocking.
    ///
    /// Returns `false` when the buffer is full or the queue is closed; the
    /// event is dropped either way and the caller decides how to tell the
    /// producer.
    pub fn enqueue(&self, source_id: impl Into<String>, envelope: Envelope) -> bool {
        let source_id = source_id.into();
        let tx = {
            let guard = lock(&self.tx);
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => {
                    warn!(source = %source_id, "event queue is closed, dropping event");
                    return false;
                }
            }
        };

        let item = QueuedEvent {
            source_id,
            envelope,
            enqueued_at: Utc::now(),
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                warn!(source = %item.source_id, "event queue is full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                warn!(source = %item.source_id, "event queue is closed, dropping event");
                false
            }
        }
    }

    /// Spawn the single consumer.
    ///
    /// Each dequeued item is handed to `processor` synchronously, so at most
    /// one event is ever being evaluated. The task exits once the queue is
    /// closed and drained. Returns `None` if the consumer was already taken.
    pub fn run<F>(&self, mut processor: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(QueuedEvent) + Send + 'static,
    {
        let mut rx = lock(&self.rx).take()?;
        Some(tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                processor(item);
            }
            debug!("event queue consumer exited");
        }))
    }

    /// Stop accepting events. Idempotent; the consumer drains what is
    /// already buffered and then exits.
    pub fn close(&self) {
        let mut guard = lock(&self.tx);
        if guard.take().is_some() {
            debug!("event queue closed");
        }
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        let guard = lock(&self.tx);
        match guard.as_ref() {
            Some(tx) => self.capacity - tx.capacity(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn event_frame(event_type: &str) -> Envelope {
        Envelope {
            kind: "event".to_string(),
            event_type: Some(event_type.to_string()),
            ..Envelope::default()
        }
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        let queue = EventQueue::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            assert!(queue.enqueue("cyber", event_frame(&format!("e{i}"))));
        }

        let seen_clone = seen.clone();
        let handle = queue
            .run(move |item| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push(item.envelope.event_type.unwrap());
            })
            .unwrap();

        queue.close();
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["e0", "e1", "e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_when_full() {
        let queue = EventQueue::new(4);
        for i in 0..4 {
            assert!(queue.enqueue("cyber", event_frame(&format!("e{i}"))));
        }
        // Consumer never started; the fifth event must be rejected, not
        // block.
        assert!(!queue.enqueue("cyber", event_frame("e4")));
        assert_eq!(queue.len(), 4);
    }

    #[tokio::test]
    async fn test_rejected_event_is_not_processed_later() {
        let queue = EventQueue::new(2);
        assert!(queue.enqueue("cyber", event_frame("a")));
        assert!(queue.enqueue("cyber", event_frame("b")));
        assert!(!queue.enqueue("cyber", event_frame("c")));

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handle = queue
            .run(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        queue.close();
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects() {
        let queue = EventQueue::new(4);
        queue.close();
        queue.close();
        assert!(!queue.enqueue("cyber", event_frame("late")));
    }

    #[tokio::test]
    async fn test_run_twice_returns_none() {
        let queue = EventQueue::new(4);
        let first = queue.run(|_| {});
        assert!(first.is_some());
        assert!(queue.run(|_| {}).is_none());
        queue.close();
        first.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_keeps_up() {
        let queue = Arc::new(EventQueue::new(8));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handle = queue
            .run(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        for i in 0..100 {
            // Small capacity, but the consumer drains concurrently; retry
            // briefly instead of asserting every enqueue.
            while !queue.enqueue("cyber", event_frame(&format!("e{i}"))) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        queue.close();
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }
}
