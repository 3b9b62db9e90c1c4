use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::MTTaskPri;
use crate::error::{MTError, MTInvalid};
use crate::kernel::mtkernel_get;
use crate::thread::{MTKernel, MTThread};
use crate::timeout::{deadline_after, MTTimeout};

//

/// Deferred callable run by a work queue thread
pub trait MTWorkHandler: Send + Sync
{
    fn execute(&self);
}

impl<F> MTWorkHandler for F
where F: Fn() + Send + Sync
{
    fn execute(&self)
    {
        self()
    }
}

/// Execution state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MTWorkState
{
    Idle,
    /// Waiting for its delay to expire.
    Delayed,
    /// Pending on a work queue.
    Queued,
    /// The handler is executing.
    Running,
    /// Withdrawn before execution.
    Cancelled
}

struct MTWorkInner
{
    state: AtomicCell<MTWorkState>,
    in_list: AtomicBool,
    timer_id: Mutex<Option<u64>>,
    handler: Box<dyn MTWorkHandler>
}

/// Work item
///
/// Clones refer to the same item.
#[derive(Clone)]
pub struct MTWork
{
    inner: Arc<MTWorkInner>
}

impl MTWork
{
    /// Creates an idle work item.
    /// * `handler` - callable run on every execution.
    pub fn new<H>(handler: H) -> MTWork
    where H: MTWorkHandler + 'static
    {
        MTWork {
            inner: Arc::new(MTWorkInner {
                state: AtomicCell::new(MTWorkState::Idle),
                in_list: AtomicBool::new(false),
                timer_id: Mutex::new(None),
                handler: Box::new(handler)
            })
        }
    }

    pub fn state(&self) -> MTWorkState
    {
        self.inner.state.load()
    }

    /// Gets if the item is delayed, queued or running.
    pub fn is_pending(&self) -> bool
    {
        !matches!(self.state(), MTWorkState::Idle | MTWorkState::Cancelled)
    }

    /// Submits the item to the system work queue.
    pub fn submit(&self) -> Result<bool, MTError>
    {
        sys_workq().submit(self)
    }

    /// Schedules the item on the system work queue.
    pub fn schedule(&self, delay: Duration) -> Result<bool, MTError>
    {
        sys_workq().schedule(self, delay)
    }

    /// Withdraws a delayed or queued item so that it does not execute.
    /// * Fails with `MTInvalid::Running` if the handler is already executing; it is not interrupted.
    /// * Succeeds without effect on an idle item.
    pub fn cancel(&self) -> Result<(), MTError>
    {
        let st = &self.inner.state;

        loop {
            let cur = st.load();

            match cur {
                MTWorkState::Idle | MTWorkState::Cancelled => return Ok(()),
                MTWorkState::Running => return Err(MTInvalid::Running.into()),
                MTWorkState::Queued | MTWorkState::Delayed => {
                    if st.compare_exchange(cur, MTWorkState::Cancelled).is_ok() {
                        if cur == MTWorkState::Delayed {
                            self.disarm();
                        }
                        trace!("workq: cancelled {:?} item", cur);
                        return Ok(());
                    }
                }
            }
        }
    }

    fn disarm(&self)
    {
        if let Some(id) = self.inner.timer_id.lock().take() {
            mtkernel_get().timer().disarm(id);
        }
    }

    // ----- ----- Worker context ----- ----- //

    fn run(&self)
    {
        let st = &self.inner.state;

        self.inner.in_list.store(false, Ordering::Release);

        if st.compare_exchange(MTWorkState::Queued, MTWorkState::Running).is_ok() {
            if catch_unwind(AssertUnwindSafe(|| self.inner.handler.execute())).is_err() {
                error!("workq: handler panicked");
            }

            // resubmitted or rescheduled while running: keep that state
            let _ = st.compare_exchange(MTWorkState::Running, MTWorkState::Idle);
        }
        else {
            let _ = st.compare_exchange(MTWorkState::Cancelled, MTWorkState::Idle);
        }
    }
}

impl std::fmt::Debug for MTWork
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("MTWork")
            .field("state", &self.state())
            .finish()
    }
}

//

struct MTWorkQueueInner
{
    name: String,
    ring: ArrayQueue<MTWork>,
    worker: OnceLock<MTThread>,
    stop: AtomicBool
}

impl MTWorkQueueInner
{
    /// Puts an item the caller just moved to `Queued` onto the ring.
    fn enqueue(&self, work: &MTWork) -> Result<(), MTError>
    {
        // already in a slot, e.g. cancelled and resubmitted before the worker got to it
        if !work.inner.in_list.swap(true, Ordering::AcqRel) {
            if self.ring.push(work.clone()).is_err() {
                work.inner.in_list.store(false, Ordering::Release);
                let _ = work.inner.state.compare_exchange(MTWorkState::Queued, MTWorkState::Idle);

                debug!("workq '{}': ring full", self.name);
                return Err(MTError::WouldBlock);
            }
        }

        if let Some(worker) = self.worker.get() {
            worker.kick();
        }

        Ok(())
    }

    fn submit(&self, work: &MTWork) -> Result<bool, MTError>
    {
        let st = &work.inner.state;

        loop {
            let cur = st.load();

            match cur {
                MTWorkState::Queued => return Ok(false),
                _ => {
                    if st.compare_exchange(cur, MTWorkState::Queued).is_ok() {
                        if cur == MTWorkState::Delayed {
                            work.disarm();
                        }
                        break;
                    }
                }
            }
        }

        self.enqueue(work)?;

        Ok(true)
    }

    fn run(&self)
    {
        // set before the first idle so that no kick is lost
        let _ = self.worker.set(MTKernel::current());

        debug!("workq '{}': worker started", self.name);

        loop {
            match self.ring.pop() {
                Some(work) => work.run(),
                None => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    MTKernel::idle();
                }
            }
        }

        debug!("workq '{}': worker stopped", self.name);
    }
}

fn expire(work: MTWork, wq: Weak<MTWorkQueueInner>)
{
    *work.inner.timer_id.lock() = None;

    if work.inner.state.compare_exchange(MTWorkState::Delayed, MTWorkState::Queued).is_err() {
        return;
    }

    match wq.upgrade() {
        Some(wq) => {
            if wq.enqueue(&work).is_err() {
                warn!("workq '{}': delayed item dropped, ring full", wq.name);
            }
        },
        None => {
            work.inner.state.store(MTWorkState::Idle);
            warn!("workq: delayed item dropped, queue is gone");
        }
    }
}

/// Work queue with one dedicated worker thread
///
/// Items run one at a time in submission order. Submission neither blocks nor
/// allocates, so it may be used from timer handlers and other contexts that
/// must not block.
pub struct MTWorkQueue
{
    inner: Arc<MTWorkQueueInner>,
    thread: MTThread
}

impl MTWorkQueue
{
    /// Starts a work queue.
    /// * `name` - name of the worker thread.
    /// * `pri` - priority of the worker thread.
    /// * `len` - number of items that can be pending at once.
    pub fn start(name: &str, pri: MTTaskPri, len: usize) -> Result<MTWorkQueue, MTError>
    {
        assert!(len > 0, "workq: zero length");

        let inner = Arc::new(MTWorkQueueInner {
            name: String::from(name),
            ring: ArrayQueue::new(len),
            worker: OnceLock::new(),
            stop: AtomicBool::new(false)
        });

        let wq = inner.clone();
        let thread = MTKernel::spawn(name, pri, move || wq.run())?;

        Ok(MTWorkQueue {
            inner,
            thread
        })
    }

    /// Submits an item.
    /// * Returns `false` if the item was already queued; it still runs once.
    /// * Fails with `MTError::WouldBlock` if every pending slot is taken.
    pub fn submit(&self, work: &MTWork) -> Result<bool, MTError>
    {
        self.inner.submit(work)
    }

    /// Submits an item after a delay.
    /// * Returns `false` if the item was already delayed or queued; its deadline is kept.
    /// * A zero `delay` submits at once.
    pub fn schedule(&self, work: &MTWork, delay: Duration) -> Result<bool, MTError>
    {
        if delay.is_zero() {
            return self.submit(work);
        }

        let st = &work.inner.state;

        loop {
            let cur = st.load();

            match cur {
                MTWorkState::Delayed | MTWorkState::Queued => return Ok(false),
                _ => {
                    if st.compare_exchange(cur, MTWorkState::Delayed).is_ok() {
                        break;
                    }
                }
            }
        }

        let (w, wq) = (work.clone(), Arc::downgrade(&self.inner));
        let mut timer_id = work.inner.timer_id.lock();
        *timer_id = Some(mtkernel_get().timer().arm(deadline_after(Instant::now(), delay), move || expire(w, wq)));

        Ok(true)
    }

    /// Gets the number of items waiting in the ring.
    pub fn pending(&self) -> usize
    {
        self.inner.ring.len()
    }

    pub fn capacity(&self) -> usize
    {
        self.inner.ring.capacity()
    }

    pub fn thread(&self) -> &MTThread
    {
        &self.thread
    }
}

impl Drop for MTWorkQueue
{
    fn drop(&mut self)
    {
        self.inner.stop.store(true, Ordering::Release);
        self.thread.kick();

        if MTKernel::curr_tid() != self.thread.tid() && self.thread.join(MTTimeout::Forever).is_err() {
            error!("workq '{}': worker join failed", self.inner.name);
        }
    }
}

//

static O_SYSWORKQ: OnceLock<MTWorkQueue> = OnceLock::new();

/// Gets the system work queue, starting it on first use.
pub fn sys_workq() -> &'static MTWorkQueue
{
    O_SYSWORKQ.get_or_init(|| {
        let config = mtkernel_get().config();

        match MTWorkQueue::start("sysworkq", config.sys_workq_pri, config.sys_workq_len) {
            Ok(wq) => wq,
            Err(e) => bk_panic!("workq: cannot start system work queue: {}", e)
        }
    })
}
