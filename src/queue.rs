//! Bounded transmit queue with TTL reclamation and waiter wakeup.
//!
//! One queue exists per physical link, shared between producers (router
//! threads delivering outbound messages) and the link's transmit worker.
//! Capacity is fixed; a producer that finds the queue full first discards
//! entries whose time-to-live already elapsed, then parks until the consumer
//! makes room, the earliest surviving entry could expire, or the link
//! closes. Parked producers receive a [`WakeReason`] so a closing link can
//! never strand them.

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use tokio::{
    sync::{oneshot, Notify},
    time::Instant,
};
use tracing::trace;

use crate::{error::EnqueueError, message::Message};

/// Why a parked producer was woken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// The consumer dequeued an entry; retry the enqueue.
    RoomAvailable,
    /// The link is shutting down; give up without touching the queue.
    Closing,
}

#[derive(Debug)]
struct Entry {
    msg: Message,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<WakeReason>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closing: bool,
}

#[derive(Debug)]
pub(crate) struct TxQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    wait_ceiling: Duration,
    /// Wakes the transmit worker when the queue transitions from empty to
    /// non-empty, or when the queue closes.
    work: Notify,
}

impl TxQueue {
    pub(crate) fn new(capacity: usize, wait_ceiling: Duration) -> Self {
        TxQueue {
            inner: Mutex::new(Inner::default()),
            capacity,
            wait_ceiling,
            work: Notify::new(),
        }
    }

    /// Appends a message, waiting for room if the queue is full.
    ///
    /// The wait is bounded by the minimum remaining TTL among queued entries
    /// (so the producer re-evaluates as soon as any entry could be
    /// reclaimed), capped at the configured ceiling.
    pub(crate) async fn enqueue(&self, msg: Message) -> Result<(), EnqueueError> {
        let entry = Entry {
            deadline: msg.ttl.map(|ttl| Instant::now() + ttl),
            msg,
        };
        let mut entry = Some(entry);
        loop {
            let (waiter_id, mut rx, max_wait) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.closing {
                    return Err(EnqueueError::Closing);
                }
                if inner.entries.len() < self.capacity {
                    let was_empty = inner.entries.is_empty();
                    inner.entries.push_back(entry.take().unwrap());
                    drop(inner);
                    if was_empty {
                        self.work.notify_one();
                    }
                    return Ok(());
                }

                // Full. Reclaim expired entries, noting how soon the
                // earliest surviving entry could be reclaimed.
                let now = Instant::now();
                let before = inner.entries.len();
                let mut max_wait = self.wait_ceiling;
                inner.entries.retain(|e| match e.deadline {
                    Some(deadline) if deadline <= now => false,
                    Some(deadline) => {
                        max_wait = max_wait.min(deadline - now);
                        true
                    }
                    None => true,
                });
                if inner.entries.len() != before {
                    trace!(
                        reclaimed = before - inner.entries.len(),
                        "dropped expired tx queue entries"
                    );
                }
                if inner.entries.len() < self.capacity {
                    let was_empty = inner.entries.is_empty();
                    inner.entries.push_back(entry.take().unwrap());
                    drop(inner);
                    if was_empty {
                        self.work.notify_one();
                    }
                    return Ok(());
                }

                let id = inner.next_waiter;
                inner.next_waiter += 1;
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter { id, tx });
                (id, rx, max_wait)
            };

            match tokio::time::timeout(max_wait, &mut rx).await {
                Ok(Ok(WakeReason::Closing)) => return Err(EnqueueError::Closing),
                Ok(Ok(WakeReason::RoomAvailable)) => {}
                // The queue was dropped out from under us.
                Ok(Err(_)) => return Err(EnqueueError::Closing),
                Err(_) => {
                    // Timed out; deregister and retry. If the waiter is
                    // already gone a wake raced the timeout and must still
                    // be honored.
                    let found = {
                        let mut inner = self.inner.lock().unwrap();
                        let before = inner.waiters.len();
                        inner.waiters.retain(|w| w.id != waiter_id);
                        inner.waiters.len() != before
                    };
                    if !found && matches!(rx.try_recv(), Ok(WakeReason::Closing)) {
                        return Err(EnqueueError::Closing);
                    }
                }
            }
        }
    }

    /// Removes the oldest entry. Consumer only.
    ///
    /// After removing an entry, exactly one parked producer (if any) is
    /// woken to retry.
    pub(crate) fn dequeue(&self) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.pop_front()?;
        if let Some(waiter) = inner.waiters.pop_front() {
            let _ = waiter.tx.send(WakeReason::RoomAvailable);
        }
        Some(entry.msg)
    }

    /// Rejects all future enqueues and releases every parked producer with
    /// [`WakeReason::Closing`]. Idempotent.
    pub(crate) fn close(&self) {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.closing = true;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(WakeReason::Closing);
        }
        self.work.notify_one();
    }

    /// Waits until the queue has work for the transmit worker (or closed).
    pub(crate) async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::{sleep, timeout};
    use tokio_test::assert_pending;

    use super::*;

    fn msg(serial: u32, ttl: Option<Duration>) -> Message {
        Message {
            serial,
            ttl,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fifo_within_ttl() {
        let queue = TxQueue::new(10, Duration::from_secs(20));
        for serial in 1..=5 {
            queue.enqueue(msg(serial, None)).await.unwrap();
        }
        for serial in 1..=5 {
            assert_eq!(queue.dequeue().unwrap().serial, serial);
        }
        assert!(queue.dequeue().is_none());
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let queue = TxQueue::new(2, Duration::from_secs(20));
        queue.enqueue(msg(1, None)).await.unwrap();
        queue.enqueue(msg(2, None)).await.unwrap();
        // No expired entries to reclaim, so the third enqueue must park.
        let mut blocked = tokio_test::task::spawn(queue.enqueue(msg(3, None)));
        assert_pending!(blocked.poll());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_reclaims_expired_entries() {
        let queue = TxQueue::new(2, Duration::from_secs(20));
        queue
            .enqueue(msg(1, Some(Duration::from_millis(10))))
            .await
            .unwrap();
        queue
            .enqueue(msg(2, Some(Duration::from_millis(10))))
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        // Both entries expired; the enqueue reclaims them without waiting.
        queue.enqueue(msg(3, None)).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap().serial, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_producer_wakes_on_expiry() {
        let queue = Arc::new(TxQueue::new(1, Duration::from_secs(20)));
        queue
            .enqueue(msg(1, Some(Duration::from_millis(30))))
            .await
            .unwrap();
        // The wait is bounded by the queued entry's remaining TTL, not the
        // 20s ceiling.
        timeout(Duration::from_secs(1), queue.enqueue(msg(2, None)))
            .await
            .expect("producer not released by TTL expiry")
            .unwrap();
        assert_eq!(queue.dequeue().unwrap().serial, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_wakes_parked_producer() {
        let queue = Arc::new(TxQueue::new(1, Duration::from_secs(20)));
        queue.enqueue(msg(1, None)).await.unwrap();

        let producer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.enqueue(msg(2, None)).await }
        });
        // Let the producer park on the full queue.
        sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.dequeue().unwrap().serial, 1);
        timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer not woken by dequeue")
            .unwrap()
            .unwrap();
        assert_eq!(queue.dequeue().unwrap().serial, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_every_parked_producer() {
        let queue = Arc::new(TxQueue::new(1, Duration::from_secs(20)));
        queue.enqueue(msg(1, None)).await.unwrap();

        let producers: Vec<_> = (0..4)
            .map(|serial| {
                tokio::spawn({
                    let queue = Arc::clone(&queue);
                    async move { queue.enqueue(msg(serial, None)).await }
                })
            })
            .collect();
        sleep(Duration::from_millis(10)).await;

        queue.close();
        for producer in producers {
            let res = timeout(Duration::from_secs(1), producer)
                .await
                .expect("producer not released by close")
                .unwrap();
            assert_eq!(res, Err(EnqueueError::Closing));
        }
        // The entry that was queued before the close is still there.
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_close_is_rejected() {
        let queue = TxQueue::new(1, Duration::from_secs(20));
        queue.close();
        assert_eq!(queue.enqueue(msg(1, None)).await, Err(EnqueueError::Closing));
    }

    /// Capacity 2; A and B queued; C parks; dequeueing A releases C; the
    /// remaining order is B then C.
    #[tokio::test(start_paused = true)]
    async fn backpressure_preserves_order() {
        let queue = Arc::new(TxQueue::new(2, Duration::from_secs(20)));
        queue
            .enqueue(msg(1, Some(Duration::from_millis(1000))))
            .await
            .unwrap();
        queue
            .enqueue(msg(2, Some(Duration::from_millis(1000))))
            .await
            .unwrap();

        let producer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.enqueue(msg(3, None)).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.dequeue().unwrap().serial, 1);
        timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(queue.dequeue().unwrap().serial, 2);
        assert_eq!(queue.dequeue().unwrap().serial, 3);
    }
}
