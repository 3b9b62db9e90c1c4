use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use parking_lot::Mutex;

use crate::MTTaskId;
use crate::bkptpanic::BKUnwrap;
use crate::error::{MTError, MTInvalid};
use crate::kernel::{current_ctl, MTThreadCtl};
use crate::timeout::MTTimeout;
use crate::waitq::{pend, MTWaitQueue};

//

struct MTMutexState
{
    owner: Option<Arc<MTThreadCtl>>,
    depth: u32,
    waitq: MTWaitQueue
}

fn mutex_waitq(st: &mut MTMutexState) -> &mut MTWaitQueue
{
    &mut st.waitq
}

impl MTMutexState
{
    fn is_owner(&self, ctl: &MTThreadCtl) -> bool
    {
        self.owner.as_ref().map_or(false, |o| o.tid() == ctl.tid())
    }
}

static O_MUTEX_KEY: AtomicUsize = AtomicUsize::new(0);

/// Recursive mutex with priority inheritance
///
/// While a thread waits on a locked mutex, the owner runs at the waiter's
/// priority if that is higher. An owner holding several mutexes runs at the
/// best of its base priority and all their waiters' priorities. Inheritance is
/// not transitive across chains of mutexes.
pub struct MTMutex
{
    key: usize,
    state: Mutex<MTMutexState>
}

impl MTMutex
{
    pub fn new() -> MTMutex
    {
        MTMutex {
            key: O_MUTEX_KEY.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(MTMutexState {
                owner: None,
                depth: 0,
                waitq: MTWaitQueue::new()
            })
        }
    }

    /// Locks the mutex.
    /// * `timeout` - waiting mode while another thread owns it.
    /// * The owner locking again only increments the recursion depth.
    pub fn lock(&self, timeout: MTTimeout) -> Result<(), MTError>
    {
        let me = current_ctl();
        let mut st = self.state.lock();

        if st.owner.is_none() {
            st.owner = Some(me);
            st.depth = 1;
            return Ok(());
        }

        if st.is_owner(&me) {
            st.depth += 1;
            return Ok(());
        }

        if timeout.is_no_wait() {
            return Err(MTError::WouldBlock);
        }

        let owner = st.owner.clone().bk_unwrap();
        let pri = st.waitq.head_priority().map_or(me.priority(), |p| p.min(me.priority()));
        if me.priority() < owner.priority() {
            trace!("mutex: tid {} inherits priority {} from tid {}", owner.tid(), me.priority(), me.tid());
        }
        owner.inherit(self.key, Some(pri));

        match pend(&mut st, mutex_waitq, (), timeout) {
            Ok(()) => {
                // ownership was granted by the unlocking thread
                bk_assert!(st.is_owner(&me));
                Ok(())
            },
            Err(e) => {
                if let Some(owner) = &st.owner {
                    owner.inherit(self.key, st.waitq.head_priority());
                }
                Err(e)
            }
        }
    }

    /// Unlocks the mutex once.
    /// * Fails with `MTInvalid::NotOwner` unless the calling thread owns it.
    /// * At depth zero the priority inherited through this mutex is dropped and the first waiter becomes the owner.
    pub fn unlock(&self) -> Result<(), MTError>
    {
        let me = current_ctl();
        let mut st = self.state.lock();

        if !st.is_owner(&me) {
            return Err(MTInvalid::NotOwner.into());
        }

        st.depth -= 1;
        if st.depth > 0 {
            return Ok(());
        }

        me.inherit(self.key, None);

        match st.waitq.wake_one() {
            Some(w) => {
                w.thread.inherit(self.key, st.waitq.head_priority());
                st.owner = Some(w.thread);
                st.depth = 1;
            },
            None => {
                st.owner = None;
            }
        }

        Ok(())
    }

    /// Locks the mutex and returns a guard that unlocks it when dropped.
    pub fn lock_guard(&self, timeout: MTTimeout) -> Result<MTMutexGuard<'_>, MTError>
    {
        self.lock(timeout)?;

        Ok(MTMutexGuard {
            mutex: self,
            phantom: PhantomData
        })
    }

    /// Gets the identifier of the owning thread if locked.
    pub fn owner(&self) -> Option<MTTaskId>
    {
        self.state.lock().owner.as_ref().map(|o| o.tid())
    }

    pub fn is_locked(&self) -> bool
    {
        self.state.lock().owner.is_some()
    }
}

impl Default for MTMutex
{
    fn default() -> MTMutex
    {
        MTMutex::new()
    }
}

//

/// Scoped lock of `MTMutex`
///
/// Bound to the locking thread; it cannot be sent elsewhere.
pub struct MTMutexGuard<'m>
{
    mutex: &'m MTMutex,
    phantom: PhantomData<*const ()>
}

impl Drop for MTMutexGuard<'_>
{
    fn drop(&mut self)
    {
        if self.mutex.unlock().is_err() {
            bk_panic!("mutex guard dropped by a non-owner");
        }
    }
}
