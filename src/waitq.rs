use std::sync::Arc;

use log::trace;
use parking_lot::MutexGuard;

use crate::{MTTaskId, MTTaskPri};
use crate::bheap::MTBHeap;
use crate::error::MTError;
use crate::kernel::{current_ctl, MTThreadCtl};
use crate::timeout::MTTimeout;

//

pub(crate) struct MTWaiter<P>
{
    pub(crate) thread: Arc<MTThreadCtl>,
    pub(crate) payload: P
}

/// Threads blocked on one kernel object, ordered by priority then arrival.
pub(crate) struct MTWaitQueue<P = ()>
{
    waiters: MTBHeap<MTWaiter<P>, (MTTaskPri, u64)>,
    seq: u64
}

impl<P> MTWaitQueue<P>
{
    pub(crate) fn new() -> MTWaitQueue<P>
    {
        MTWaitQueue {
            waiters: MTBHeap::new(),
            seq: 0
        }
    }

    pub(crate) fn len(&self) -> usize
    {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool
    {
        self.waiters.is_empty()
    }

    fn insert(&mut self, thread: Arc<MTThreadCtl>, payload: P)
    {
        let key = (thread.priority(), self.seq);
        self.seq += 1;

        self.waiters.push(MTWaiter {thread, payload}, key);
    }

    fn remove(&mut self, tid: MTTaskId) -> Option<MTWaiter<P>>
    {
        self.waiters.remove_by(|w| w.thread.tid() == tid).map(|(w, _)| w)
    }

    /// Priority of the waiter `wake_one` would pick.
    pub(crate) fn head_priority(&self) -> Option<MTTaskPri>
    {
        self.waiters.bheap_h().map(|(_, (pri, _))| *pri)
    }

    /// Dequeues and resumes the highest priority, earliest waiter.
    /// * Must be called inside the critical section that guards this queue.
    /// * Returns the woken waiter so that the caller can complete a hand-off through its payload.
    pub(crate) fn wake_one(&mut self) -> Option<MTWaiter<P>>
    {
        let (waiter, _) = self.waiters.pop_bheap_h()?;

        trace!("waitq: wake tid {}", waiter.thread.tid());
        waiter.thread.unpark();

        Some(waiter)
    }

    /// Resumes every waiter.
    /// * Returns the number of woken threads.
    pub(crate) fn wake_all(&mut self) -> usize
    {
        let mut n = 0;

        while self.wake_one().is_some() {
            n += 1;
        }

        n
    }
}

/// Blocks the calling thread on a wait-queue guarded by `guard`.
/// * `waitq` - selects the queue inside the guarded state.
/// * `payload` - carried by the waiter until it is woken or times out.
/// * The critical section is released while blocked and held again on return.
/// * Returns `Ok` when woken, `MTError::TimedOut` on expiry, or
///   `MTError::WouldBlock` for a `NoWait` timeout without blocking.
pub(crate) fn pend<S, P>(guard: &mut MutexGuard<'_, S>, waitq: fn(&mut S) -> &mut MTWaitQueue<P>,
                         payload: P, timeout: MTTimeout) -> Result<(), MTError>
{
    let deadline = timeout.deadline().ok_or(MTError::WouldBlock)?;
    let ctl = current_ctl();

    ctl.arm();
    waitq(&mut **guard).insert(ctl.clone(), payload);

    let woken = MutexGuard::unlocked(guard, || ctl.park(deadline));

    // a waker that already dequeued us owns the wake-up even if the deadline passed
    let woken = woken || waitq(&mut **guard).remove(ctl.tid()).is_none();

    ctl.disarm();

    if woken {
        Ok(())
    }
    else {
        trace!("waitq: tid {} timed out", ctl.tid());
        Err(MTError::TimedOut)
    }
}
