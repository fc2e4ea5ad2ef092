use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Per-agent concurrency slots with a bounded FIFO waiting line.
///
/// A released slot is handed directly to the oldest live waiter, so tasks of
/// one agent start in admission order.
#[derive(Debug)]
pub struct SlotPool {
    max: usize,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<SlotGuard>>,
}

impl PoolState {
    fn prune(&mut self) {
        self.waiters.retain(|w| !w.is_closed());
    }
}

/// Result of [`SlotPool::admit`].
#[derive(Debug)]
pub enum Admission {
    /// A slot was free.
    Ready(SlotGuard),
    /// Resolves to a guard once a slot is handed over. Dropping it leaves the line.
    Waiting(oneshot::Receiver<SlotGuard>),
}

/// Holds one slot; dropping it releases the slot.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Option<Arc<SlotPool>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

impl SlotPool {
    /// Pool with `max` concurrent slots.
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Take a free slot or join the line. `Err(queued)` when the line already
    /// holds `queue_limit` waiters.
    pub fn admit(self: &Arc<Self>, queue_limit: usize) -> Result<Admission, usize> {
        let mut state = self.state.lock();
        if state.in_use < self.max {
            state.in_use += 1;
            return Ok(Admission::Ready(SlotGuard {
                pool: Some(Arc::clone(self)),
            }));
        }
        state.prune();
        if state.waiters.len() >= queue_limit {
            return Err(state.waiters.len());
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Ok(Admission::Waiting(rx))
    }

    fn release(self: Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            let guard = SlotGuard {
                pool: Some(Arc::clone(&self)),
            };
            match waiter.send(guard) {
                Ok(()) => return,
                // receiver gone; disarm so the slot is not released twice
                Err(mut unsent) => {
                    unsent.pool = None;
                }
            }
        }
        state.in_use = state.in_use.saturating_sub(1);
    }

    /// Slot count.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Live waiters.
    pub fn queued(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }
}
