use log::trace;
use parking_lot::Mutex;

use crate::error::MTError;
use crate::timeout::MTTimeout;
use crate::waitq::{pend, MTWaitQueue};

//

struct MTSemState
{
    count: u32,
    waitq: MTWaitQueue
}

fn sem_waitq(st: &mut MTSemState) -> &mut MTWaitQueue
{
    &mut st.waitq
}

/// Counting semaphore
pub struct MTSemaphore
{
    limit: u32,
    state: Mutex<MTSemState>
}

impl MTSemaphore
{
    /// Creates a semaphore.
    /// * `initial` - initial count; must not exceed `limit`.
    /// * `limit` - maximum count; must be positive.
    pub fn new(initial: u32, limit: u32) -> MTSemaphore
    {
        assert!(limit > 0, "semaphore: zero limit");
        assert!(initial <= limit, "semaphore: initial count {} above limit {}", initial, limit);

        MTSemaphore {
            limit,
            state: Mutex::new(MTSemState {
                count: initial,
                waitq: MTWaitQueue::new()
            })
        }
    }

    /// Takes one unit.
    /// * `timeout` - waiting mode while the count is zero.
    pub fn take(&self, timeout: MTTimeout) -> Result<(), MTError>
    {
        let mut st = self.state.lock();

        if st.count > 0 {
            st.count -= 1;
            return Ok(());
        }

        // a give hands its unit straight to the woken waiter
        pend(&mut st, sem_waitq, (), timeout)
    }

    /// Gives one unit.
    /// * Wakes the first waiter if any; otherwise the count is incremented, saturating at the limit.
    pub fn give(&self)
    {
        let mut st = self.state.lock();

        if st.waitq.wake_one().is_some() {
            return;
        }

        if st.count < self.limit {
            st.count += 1;
        }
        else {
            trace!("semaphore: give at limit {}", self.limit);
        }
    }

    pub fn count(&self) -> u32
    {
        self.state.lock().count
    }

    pub fn limit(&self) -> u32
    {
        self.limit
    }

    /// Sets the count to zero. Waiters keep waiting.
    pub fn reset(&self)
    {
        self.state.lock().count = 0;
    }
}
