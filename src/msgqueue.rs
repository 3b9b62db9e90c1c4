use std::mem::size_of;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::bkptpanic::BKUnwrap;
use crate::error::MTError;
use crate::timeout::MTTimeout;
use crate::waitq::{pend, MTWaitQueue};

//

fn wrap_inc(x: usize, bound: usize) -> usize
{
    let y = x + 1;
    if y < bound {y} else {0}
}

// hand-off cell between a blocked thread and the one completing its transfer
type MTSlot<M> = Arc<Mutex<Option<M>>>;

struct MTMsgQueueState<M>
{
    ring: Vec<Option<M>>,
    rd_idx: usize,
    wr_idx: usize,
    used: usize,
    putq: MTWaitQueue<MTSlot<M>>,
    getq: MTWaitQueue<MTSlot<M>>
}

fn msgq_putq<M>(st: &mut MTMsgQueueState<M>) -> &mut MTWaitQueue<MTSlot<M>>
{
    &mut st.putq
}

fn msgq_getq<M>(st: &mut MTMsgQueueState<M>) -> &mut MTWaitQueue<MTSlot<M>>
{
    &mut st.getq
}

impl<M> MTMsgQueueState<M>
{
    fn push(&mut self, msg: M)
    {
        bk_assert!(self.used < self.ring.len());

        self.ring[self.wr_idx] = Some(msg);
        self.wr_idx = wrap_inc(self.wr_idx, self.ring.len());
        self.used += 1;
    }

    fn pop(&mut self) -> M
    {
        bk_assert!(self.used > 0);

        let msg = self.ring[self.rd_idx].take().bk_unwrap();
        self.rd_idx = wrap_inc(self.rd_idx, self.ring.len());
        self.used -= 1;

        msg
    }
}

/// Bounded FIFO message queue for thread-to-thread communication
///
/// Messages are moved in and out by value. A blocked sender keeps its message
/// until a receiver makes room; a blocked receiver gets a message handed over
/// directly by the next sender.
pub struct MTMsgQueue<M>
{
    state: Mutex<MTMsgQueueState<M>>
}

impl<M> MTMsgQueue<M>
where M: Send
{
    /// Creates a message queue.
    /// * `M` - type of the message element.
    /// * `capacity` - number of messages held without blocking a sender.
    pub fn new(capacity: usize) -> MTMsgQueue<M>
    {
        assert!(capacity > 0, "msgqueue: zero capacity");

        MTMsgQueue {
            state: Mutex::new(MTMsgQueueState {
                ring: (0..capacity).map(|_| None).collect(),
                rd_idx: 0,
                wr_idx: 0,
                used: 0,
                putq: MTWaitQueue::new(),
                getq: MTWaitQueue::new()
            })
        }
    }

    /// Sends a message.
    /// * `msg` - the message to be sent.
    /// * `timeout` - waiting mode while the queue is full.
    /// * On failure the message is dropped.
    pub fn put(&self, msg: M, timeout: MTTimeout) -> Result<(), MTError>
    {
        let mut st = self.state.lock();

        if let Some(w) = st.getq.wake_one() {
            trace!("msgqueue: hand-off to tid {}", w.thread.tid());
            *w.payload.lock() = Some(msg);
            return Ok(());
        }

        if st.used < st.ring.len() {
            st.push(msg);
            return Ok(());
        }

        let slot = Arc::new(Mutex::new(Some(msg)));

        pend(&mut st, msgq_putq::<M>, slot, timeout)
    }

    /// Receives a message.
    /// * `timeout` - waiting mode while the queue is empty.
    /// * Returns the oldest message.
    pub fn get(&self, timeout: MTTimeout) -> Result<M, MTError>
    {
        let mut st = self.state.lock();

        if st.used > 0 {
            let msg = st.pop();

            // the freed slot goes to the first blocked sender
            if let Some(w) = st.putq.wake_one() {
                let pending = w.payload.lock().take().bk_unwrap();
                st.push(pending);
            }

            return Ok(msg);
        }

        let slot = Arc::new(Mutex::new(None));

        pend(&mut st, msgq_getq::<M>, slot.clone(), timeout)?;

        let msg = slot.lock().take().bk_unwrap();
        Ok(msg)
    }

    /// Gets a copy of the oldest message without removing it.
    pub fn peek(&self) -> Option<M>
    where M: Clone
    {
        let st = self.state.lock();

        if st.used > 0 {
            st.ring[st.rd_idx].clone()
        }
        else {
            None
        }
    }

    /// Gets the number of queued messages.
    pub fn used(&self) -> usize
    {
        self.state.lock().used
    }

    /// Gets the number of messages that can be sent without blocking.
    pub fn free_slots(&self) -> usize
    {
        let st = self.state.lock();

        st.ring.len() - st.used
    }

    pub fn capacity(&self) -> usize
    {
        self.state.lock().ring.len()
    }

    /// Gets the size in bytes of one message.
    pub fn item_size(&self) -> usize
    {
        size_of::<M>()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::MTKernel;

    #[test]
    fn fifo_within_capacity()
    {
        let q = MTMsgQueue::new(3);

        for v in [10u32, 20, 30] {
            q.put(v, MTTimeout::NoWait).unwrap();
        }
        assert_eq!(q.put(40, MTTimeout::NoWait), Err(MTError::WouldBlock));
        assert_eq!(q.free_slots(), 0);
        assert_eq!(q.peek(), Some(10));

        assert_eq!(q.get(MTTimeout::NoWait), Ok(10));
        q.put(40, MTTimeout::NoWait).unwrap();

        let rest: Vec<_> = (0..3).map(|_| q.get(MTTimeout::NoWait).unwrap()).collect();
        assert_eq!(rest, vec![20, 30, 40]);
        assert_eq!(q.get(MTTimeout::ms(5)), Err(MTError::TimedOut));
        assert_eq!(q.item_size(), 4);
    }

    #[test]
    fn blocked_getter_receives_directly()
    {
        let q = Arc::new(MTMsgQueue::new(1));
        let got = Arc::new(Mutex::new(None));

        let (q2, g2) = (q.clone(), got.clone());
        let th = MTKernel::spawn("getter", 1, move || {
            *g2.lock() = Some(q2.get(MTTimeout::Forever));
        }).unwrap();

        while q.state.lock().getq.is_empty() {
            MTKernel::yield_now();
        }

        q.put(String::from("hello"), MTTimeout::NoWait).unwrap();
        th.join(MTTimeout::Forever).unwrap();

        assert_eq!(*got.lock(), Some(Ok(String::from("hello"))));
        assert_eq!(q.used(), 0);
    }

    #[test]
    fn blocked_putter_refills_on_get()
    {
        let q = Arc::new(MTMsgQueue::new(1));
        q.put(1u8, MTTimeout::NoWait).unwrap();

        let q2 = q.clone();
        let done = Arc::new(Mutex::new(None));
        let d2 = done.clone();
        let th = MTKernel::spawn("putter", 1, move || {
            *d2.lock() = Some(q2.put(2, MTTimeout::Forever));
        }).unwrap();

        while q.state.lock().putq.is_empty() {
            MTKernel::yield_now();
        }

        assert_eq!(q.get(MTTimeout::NoWait), Ok(1));
        assert_eq!(q.used(), 1);
        th.join(MTTimeout::Forever).unwrap();

        assert_eq!(*done.lock(), Some(Ok(())));
        assert_eq!(q.get(MTTimeout::NoWait), Ok(2));
    }
}
