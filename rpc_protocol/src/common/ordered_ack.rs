// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ordered acknowledgement release, shared by the command executor and the telemetry receiver.
//!
//! Both sides hand a manual-ack handle off to user code (a command handler, a telemetry
//! callback) that may complete out of order with respect to other in-flight handlers. The
//! underlying MQTT client, however, is expected to observe acks released in the order its
//! publishes arrived. [`OrderedAckQueue`] bridges the two: it tracks a FIFO of slots, each
//! holding the ack token once its handler finishes, and a single acker task drains tokens from
//! the front of the queue as soon as they are available, so a slow handler for an earlier
//! packet holds back the ack of a faster, later one without blocking the later handler's
//! execution.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// A handle identifying one slot in an [`OrderedAckQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckSlotId(u64);

enum SlotState<A> {
    Pending,
    Ready(A),
    Discarded,
}

struct Slot<A> {
    id: AckSlotId,
    state: SlotState<A>,
}

struct Inner<A> {
    queue: VecDeque<Slot<A>>,
    next_id: u64,
}

/// Releases acks for completed slots, draining the queue head-first.
///
/// Construct one alongside the handler dispatch loop that enqueues a slot per received packet.
/// The queue tracks ordering; the closure passed to [`Self::new`] performs the actual ack IO.
pub struct OrderedAckQueue<A> {
    inner: Arc<Mutex<Inner<A>>>,
    release_tx: mpsc::UnboundedSender<A>,
}

impl<A: Send + 'static> OrderedAckQueue<A> {
    /// Creates a queue paired with a background task that calls `ack` for each token, in the
    /// exact order [`Self::enqueue`] was called, as soon as the matching slot is marked ready.
    ///
    /// The background task runs until every [`OrderedAckQueue`] clone has been dropped.
    pub fn new<F, Fut>(ack: F) -> Self
    where
        F: Fn(A) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let (release_tx, mut release_rx) = mpsc::unbounded_channel::<A>();
        tokio::spawn(async move {
            while let Some(token) = release_rx.recv().await {
                ack(token).await;
            }
        });
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                next_id: 0,
            })),
            release_tx,
        }
    }

    /// Records a new packet's arrival and returns a slot representing its place in line.
    ///
    /// The returned [`AckSlot`] must eventually be completed with
    /// [`AckSlot::ready`](AckSlot::ready) or [`AckSlot::discard`](AckSlot::discard); the queue
    /// head never advances past a slot that has not been resolved one way or the other.
    pub async fn enqueue(&self) -> AckSlot<A> {
        let mut inner = self.inner.lock().await;
        let id = AckSlotId(inner.next_id);
        inner.next_id += 1;
        inner.queue.push_back(Slot {
            id,
            state: SlotState::Pending,
        });
        AckSlot {
            id,
            inner: Arc::clone(&self.inner),
            release_tx: self.release_tx.clone(),
        }
    }
}

impl<A> Clone for OrderedAckQueue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            release_tx: self.release_tx.clone(),
        }
    }
}

/// A single reserved place in an [`OrderedAckQueue`]'s FIFO.
///
/// Exactly one of [`Self::ready`] or [`Self::discard`] should be called once the handler
/// associated with this slot has finished (or decided no ack is sendable at all).
pub struct AckSlot<A> {
    id: AckSlotId,
    inner: Arc<Mutex<Inner<A>>>,
    release_tx: mpsc::UnboundedSender<A>,
}

impl<A> AckSlot<A> {
    /// Marks this slot ready, attaching `token` as the value to hand to the queue's ack
    /// closure. If this slot is (or, once marked, becomes) the queue head, this releases it and
    /// every contiguous already-ready slot that follows it, in order.
    pub async fn ready(self, token: A) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.queue.iter_mut().find(|s| s.id == self.id) {
            slot.state = SlotState::Ready(token);
        }
        self.drain_ready_prefix(&mut inner);
    }

    /// Drops this slot from the queue without acking it, e.g. when no response was sendable and
    /// the caller has decided this packet's ack should simply never be released. Subsequent
    /// slots that are already ready can then proceed.
    pub async fn discard(self) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.queue.iter_mut().find(|s| s.id == self.id) {
            slot.state = SlotState::Discarded;
        }
        self.drain_ready_prefix(&mut inner);
    }

    fn drain_ready_prefix(&self, inner: &mut Inner<A>) {
        while let Some(front) = inner.queue.front_mut() {
            match std::mem::replace(&mut front.state, SlotState::Discarded) {
                SlotState::Ready(token) => {
                    inner.queue.pop_front();
                    let _ = self.release_tx.send(token);
                }
                SlotState::Discarded => {
                    inner.queue.pop_front();
                }
                SlotState::Pending => {
                    front.state = SlotState::Pending;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc as test_mpsc;

    #[tokio::test]
    async fn acks_release_in_receive_order() {
        let (tx, mut rx) = test_mpsc::unbounded_channel::<u32>();
        let queue = OrderedAckQueue::new(move |token: u32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(token);
            }
        });

        let slot_a = queue.enqueue().await;
        let slot_b = queue.enqueue().await;
        let slot_c = queue.enqueue().await;

        // Complete out of order: C, then A, then B.
        slot_c.ready(3).await;
        slot_a.ready(1).await;
        slot_b.ready(2).await;

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn discarded_slot_does_not_block_later_ready_slots() {
        let released = Arc::new(AtomicUsize::new(0));
        let released_clone = Arc::clone(&released);
        let queue = OrderedAckQueue::new(move |_: ()| {
            let released = Arc::clone(&released_clone);
            async move {
                released.fetch_add(1, Ordering::SeqCst);
            }
        });

        let slot_a = queue.enqueue().await;
        let slot_b = queue.enqueue().await;

        slot_a.discard().await;
        slot_b.ready(()).await;

        tokio::task::yield_now().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
