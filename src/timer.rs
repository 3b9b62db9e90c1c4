use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once, Weak};
use std::time::{Duration, Instant};

use log::{error, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::bheap::MTBHeap;
use crate::bkptpanic::BKUnwrap;
use crate::kernel::mtkernel_get;
use crate::timeout::{deadline_after, MTTimeout};
use crate::waitq::{pend, MTWaitQueue};

//

type MTCallback = Box<dyn FnOnce() + Send>;

struct MTTimerEntry
{
    id: u64,
    f: MTCallback
}

struct MTServiceState
{
    bheap: MTBHeap<MTTimerEntry, (Instant, u64)>,
    next_id: u64
}

/// Deadline-ordered callback service, run by one dedicated thread.
///
/// Callbacks run with no kernel lock held, one at a time, and must not block.
pub(crate) struct MTTimerService
{
    name: String,
    state: Mutex<MTServiceState>,
    cv: Condvar,
    started: Once
}

impl MTTimerService
{
    pub(crate) fn new(name: &str) -> MTTimerService
    {
        MTTimerService {
            name: String::from(name),
            state: Mutex::new(MTServiceState {
                bheap: MTBHeap::new(),
                next_id: 0
            }),
            cv: Condvar::new(),
            started: Once::new()
        }
    }

    /// Schedules `f` to run at `at`.
    /// * Returns an identifier for `disarm`.
    pub(crate) fn arm<F>(&'static self, at: Instant, f: F) -> u64
    where F: FnOnce() + Send + 'static
    {
        self.started.call_once(|| {
            let spawned = std::thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || self.run());

            if let Err(e) = spawned {
                bk_panic!("timer: cannot start service thread: {}", e);
            }
        });

        let mut st = self.state.lock();

        let id = st.next_id;
        st.next_id += 1;

        // entries with equal deadlines fire in arming order
        st.bheap.push(MTTimerEntry {id, f: Box::new(f)}, (at, id));
        self.cv.notify_one();

        id
    }

    /// Cancels a scheduled callback.
    /// * Returns `false` if it already ran or was never armed.
    pub(crate) fn disarm(&self, id: u64) -> bool
    {
        self.state.lock().bheap.remove_by(|e| e.id == id).is_some()
    }

    fn run(&self)
    {
        let mut st = self.state.lock();

        loop {
            let head = st.bheap.bheap_h().map(|(_, (at, _))| *at);

            match head {
                None => {
                    self.cv.wait(&mut st);
                },
                Some(at) if at <= Instant::now() => {
                    let (entry, _) = st.bheap.pop_bheap_h().bk_unwrap();

                    trace!("timer: fire {}", entry.id);

                    MutexGuard::unlocked(&mut st, || {
                        if catch_unwind(AssertUnwindSafe(entry.f)).is_err() {
                            error!("timer: callback {} panicked", entry.id);
                        }
                    });
                },
                Some(at) => {
                    self.cv.wait_until(&mut st, at);
                }
            }
        }
    }
}

//

/// Handler of a kernel timer
pub type MTTimerFn = Box<dyn Fn() + Send + Sync>;

struct MTTimerState
{
    gen: u64,
    armed: Option<u64>,
    deadline: Option<Instant>,
    period: Option<Duration>,
    status: u32,
    syncq: MTWaitQueue
}

fn timer_syncq(st: &mut MTTimerState) -> &mut MTWaitQueue
{
    &mut st.syncq
}

struct MTTimerInner
{
    expiry: Option<MTTimerFn>,
    stop: Option<MTTimerFn>,
    state: Mutex<MTTimerState>
}

/// One-shot or periodic kernel timer
///
/// The expiry handler runs in the timer service context each time the timer
/// expires; the stop handler runs in the context calling `stop` on a running timer.
pub struct MTTimer
{
    inner: Arc<MTTimerInner>
}

impl MTTimer
{
    /// Creates a stopped timer.
    /// * `expiry` - handler run on every expiry.
    /// * `stop` - handler run when a running timer is stopped.
    pub fn new(expiry: Option<MTTimerFn>, stop: Option<MTTimerFn>) -> MTTimer
    {
        MTTimer {
            inner: Arc::new(MTTimerInner {
                expiry,
                stop,
                state: Mutex::new(MTTimerState {
                    gen: 0,
                    armed: None,
                    deadline: None,
                    period: None,
                    status: 0,
                    syncq: MTWaitQueue::new()
                })
            })
        }
    }

    fn arm(inner: &Arc<MTTimerInner>, st: &mut MTTimerState, at: Instant)
    {
        let weak = Arc::downgrade(inner);
        let gen = st.gen;

        st.deadline = Some(at);
        st.armed = Some(mtkernel_get().timer().arm(at, move || MTTimer::fire(weak, gen)));
    }

    fn fire(weak: Weak<MTTimerInner>, gen: u64)
    {
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => return
        };

        {
            let mut st = inner.state.lock();

            if st.gen != gen {
                return;
            }

            st.status = st.status.saturating_add(1);
            st.syncq.wake_all();

            match (st.period, st.deadline) {
                (Some(period), Some(prev)) => {
                    MTTimer::arm(&inner, &mut st, deadline_after(prev, period));
                },
                _ => {
                    st.armed = None;
                    st.deadline = None;
                }
            }
        }

        if let Some(f) = &inner.expiry {
            f();
        }
    }

    /// Starts the timer, restarting it if running. The expiry count is reset.
    /// * `duration` - time to the first expiry.
    /// * `period` - interval of the following expiries; `None` or zero for one-shot.
    pub fn start(&self, duration: Duration, period: Option<Duration>)
    {
        let mut st = self.inner.state.lock();

        if let Some(id) = st.armed.take() {
            mtkernel_get().timer().disarm(id);
        }

        st.gen += 1;
        st.status = 0;
        st.period = period.filter(|p| !p.is_zero());

        MTTimer::arm(&self.inner, &mut st, deadline_after(Instant::now(), duration));
    }

    /// Stops the timer.
    /// * Runs the stop handler and releases `status_sync` waiters if the timer was running.
    pub fn stop(&self)
    {
        {
            let mut st = self.inner.state.lock();

            match st.armed.take() {
                Some(id) => {
                    mtkernel_get().timer().disarm(id);
                },
                None => return
            }

            st.gen += 1;
            st.deadline = None;
            st.syncq.wake_all();
        }

        if let Some(f) = &self.inner.stop {
            f();
        }
    }

    pub fn is_running(&self) -> bool
    {
        self.inner.state.lock().armed.is_some()
    }

    /// Gets the time to the next expiry; zero if stopped.
    pub fn remaining(&self) -> Duration
    {
        match self.inner.state.lock().deadline {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::ZERO
        }
    }

    /// Reads and resets the number of expiries since the last read.
    pub fn status_get(&self) -> u32
    {
        std::mem::take(&mut self.inner.state.lock().status)
    }

    /// Blocks until the timer expires at least once or is stopped, then reads
    /// and resets the expiry count.
    /// * Returns immediately if expiries are already counted or the timer is stopped.
    pub fn status_sync(&self) -> u32
    {
        let mut st = self.inner.state.lock();

        if st.status == 0 && st.armed.is_some() {
            if pend(&mut st, timer_syncq, (), MTTimeout::Forever).is_err() {
                bk_panic!("timer: unbounded wait failed");
            }
        }

        std::mem::take(&mut st.status)
    }
}

impl Drop for MTTimer
{
    fn drop(&mut self)
    {
        let mut st = self.inner.state.lock();

        if let Some(id) = st.armed.take() {
            mtkernel_get().timer().disarm(id);
        }

        st.gen += 1;
        st.syncq.wake_all();
    }
}
