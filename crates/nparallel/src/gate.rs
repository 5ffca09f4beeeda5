//! Admission gate bounding how many units of work may run at once.
//!
//! Admission is strictly FIFO: once the gate is saturated, callers queue and
//! a released slot is handed directly to the longest-waiting caller.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

struct GateState {
    occupied: usize,
    waiters: VecDeque<oneshot::Sender<AdmissionPermit>>,
}

struct GateInner {
    capacity: usize,
    state: Mutex<GateState>,
}

impl GateInner {
    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        // Critical sections never panic mid-update, so the state behind a
        // poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock_state();
        while let Some(waiter) = state.waiters.pop_front() {
            // Hand the slot straight to the longest waiter. One holder
            // leaves, one enters: `occupied` stays untouched.
            match waiter.send(AdmissionPermit::new(self)) {
                Ok(()) => return,
                Err(permit) => {
                    // Waiter abandoned before admission. Reclaim the permit
                    // without letting its Drop re-enter the lock, then offer
                    // the slot to the next waiter.
                    tracing::trace!("waiter abandoned before admission, passing slot on");
                    permit.disarm();
                }
            }
        }
        state.occupied -= 1;
    }
}

/// Counting semaphore with a FIFO wait queue.
///
/// Up to `capacity` permits are out at any time. [`admit`](Self::admit)
/// suspends once the gate is saturated and resumes waiters strictly in
/// arrival order. Cloning yields another handle to the same gate.
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl Clone for AdmissionGate {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl AdmissionGate {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                capacity: capacity.get(),
                state: Mutex::new(GateState {
                    occupied: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for admission. Resolves without suspending while the gate has a
    /// free slot; otherwise queues until a released slot is handed over.
    pub async fn admit(&self) -> AdmissionPermit {
        let admission = {
            let mut state = self.inner.lock_state();
            if state.occupied < self.inner.capacity {
                state.occupied += 1;
                return AdmissionPermit::new(&self.inner);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::trace!(
                capacity = self.inner.capacity,
                waiting = state.waiters.len(),
                "gate saturated, queueing"
            );
            rx
        };

        match admission.await {
            Ok(permit) => permit,
            // The sender sits in this gate's waiter queue, and the gate
            // outlives this borrow of it.
            Err(_) => unreachable!("admission gate dropped while a waiter was queued"),
        }
    }

    /// Admission without suspension; `None` when the gate is saturated.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        let mut state = self.inner.lock_state();
        if state.occupied < self.inner.capacity {
            state.occupied += 1;
            Some(AdmissionPermit::new(&self.inner))
        } else {
            None
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of currently admitted holders.
    pub fn occupied(&self) -> usize {
        self.inner.lock_state().occupied
    }

    /// Number of callers suspended in [`admit`](Self::admit).
    pub fn waiting(&self) -> usize {
        self.inner.lock_state().waiters.len()
    }
}

/// Held while a unit of work occupies a gate slot.
///
/// The slot is released on drop, whether the work succeeded or failed; with
/// waiters queued, dropping hands the slot to the next one in line.
pub struct AdmissionPermit {
    gate: Option<Arc<GateInner>>,
}

impl AdmissionPermit {
    fn new(gate: &Arc<GateInner>) -> Self {
        Self {
            gate: Some(Arc::clone(gate)),
        }
    }

    /// Defuse a permit reclaimed from a dead waiter so its Drop does not
    /// release a slot the caller still owns.
    fn disarm(mut self) {
        self.gate = None;
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::pin;
    use std::task::Poll;

    use futures::poll;
    use tokio::sync::mpsc;

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("test capacity is nonzero")
    }

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let gate = AdmissionGate::new(capacity(2));
        assert_eq!(gate.capacity(), 2);

        let p1 = gate.try_admit();
        assert!(p1.is_some());
        let p2 = gate.try_admit();
        assert!(p2.is_some());
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.occupied(), 2);

        drop(p1);
        assert_eq!(gate.occupied(), 1);
        assert!(gate.try_admit().is_some());
    }

    #[tokio::test]
    async fn admit_does_not_suspend_below_capacity() {
        let gate = AdmissionGate::new(capacity(1));
        let permit = gate.admit().await;
        assert_eq!(gate.occupied(), 1);

        drop(permit);
        assert_eq!(gate.occupied(), 0);
    }

    #[tokio::test]
    async fn release_hands_slot_to_head_waiter() {
        let gate = AdmissionGate::new(capacity(1));
        let holder = gate.admit().await;

        let mut first = pin!(gate.admit());
        assert!(poll!(first.as_mut()).is_pending());
        let mut second = pin!(gate.admit());
        assert!(poll!(second.as_mut()).is_pending());
        assert_eq!(gate.waiting(), 2);

        drop(holder);

        // Handoff: the slot went to the head waiter, occupancy unchanged.
        assert_eq!(gate.occupied(), 1);
        assert!(poll!(second.as_mut()).is_pending());
        let first_permit = match poll!(first.as_mut()) {
            Poll::Ready(permit) => permit,
            Poll::Pending => panic!("head waiter was not admitted"),
        };
        assert!(gate.try_admit().is_none());

        drop(first_permit);
        assert!(poll!(second.as_mut()).is_ready());
    }

    #[tokio::test]
    async fn waiters_resume_in_arrival_order() {
        let gate = AdmissionGate::new(capacity(1));
        let holder = gate.admit().await;

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for unit in 0..4u32 {
            let gate = gate.clone();
            let order_tx = order_tx.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.admit().await;
                let _ = order_tx.send(unit);
            }));
            // Let the task reach the gate before spawning the next one.
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.waiting(), 4);

        drop(holder);
        for task in tasks {
            task.await.expect("gate task panicked");
        }

        let mut order = Vec::new();
        while let Ok(unit) = order_rx.try_recv() {
            order.push(unit);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let gate = AdmissionGate::new(capacity(1));
        let holder = gate.admit().await;

        {
            let mut abandoned = pin!(gate.admit());
            assert!(poll!(abandoned.as_mut()).is_pending());
        }
        let mut live = pin!(gate.admit());
        assert!(poll!(live.as_mut()).is_pending());
        assert_eq!(gate.waiting(), 2);

        drop(holder);

        // The dead waiter is passed over; the live one holds the slot.
        assert_eq!(gate.occupied(), 1);
        assert_eq!(gate.waiting(), 0);
        assert!(poll!(live.as_mut()).is_ready());
    }

    #[tokio::test]
    async fn abandoned_last_waiter_frees_the_slot() {
        let gate = AdmissionGate::new(capacity(1));
        let holder = gate.admit().await;

        {
            let mut abandoned = pin!(gate.admit());
            assert!(poll!(abandoned.as_mut()).is_pending());
        }
        drop(holder);

        assert_eq!(gate.occupied(), 0);
        assert!(gate.try_admit().is_some());
    }
}
