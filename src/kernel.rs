use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicI16, AtomicU32, Ordering};
use std::time::Instant;

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::{MTTaskId, MTTaskPri};
use crate::config::MTConfig;
use crate::error::{MTError, MTInvalid};
use crate::timeout::MTTimeout;
use crate::timer::MTTimerService;
use crate::waitq::{pend, MTWaitQueue};

//

static O_MTKERNEL: OnceLock<MTKernelCore> = OnceLock::new();

/// Creates the kernel with `config` unless it already exists.
/// * Returns `false` if the kernel was already created; `config` is discarded then.
pub(crate) fn mtkernel_create(config: MTConfig) -> bool
{
    let mut created = false;

    O_MTKERNEL.get_or_init(|| {
        created = true;
        MTKernelCore::new(config)
    });

    created
}

/// Gets the kernel, creating it with the default configuration on first use.
pub(crate) fn mtkernel_get() -> &'static MTKernelCore
{
    O_MTKERNEL.get_or_init(|| MTKernelCore::new(MTConfig::default()))
}

//

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MTState
{
    /// Runnable, just woken and not yet resumed.
    Ready,
    Running,
    /// Pending on a wait-queue, sleeping or idle.
    Blocked,
    Terminated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MTWake
{
    Idle,
    Pending,
    Woken
}

struct MTPark
{
    wake: MTWake,
    kick_cnt: usize
}

struct MTExit
{
    terminated: bool,
    joinq: MTWaitQueue
}

fn exit_joinq(exit: &mut MTExit) -> &mut MTWaitQueue
{
    &mut exit.joinq
}

//

struct MTPriority
{
    base: MTTaskPri,
    inherited: Vec<(usize, MTTaskPri)>
}

impl MTPriority
{
    fn effective(&self) -> MTTaskPri
    {
        self.inherited.iter().fold(self.base, |pri, (_, p)| pri.min(*p))
    }
}

/// Thread control block
pub(crate) struct MTThreadCtl
{
    tid: MTTaskId,
    name: Mutex<String>,
    pri: AtomicI16,
    base_pri: Mutex<MTPriority>,
    state: AtomicCell<MTState>,
    park: Mutex<MTPark>,
    park_cv: Condvar,
    exit: Mutex<MTExit>
}

impl MTThreadCtl
{
    fn new(tid: MTTaskId, name: &str, pri: MTTaskPri) -> MTThreadCtl
    {
        MTThreadCtl {
            tid,
            name: Mutex::new(String::from(name)),
            pri: AtomicI16::new(pri),
            base_pri: Mutex::new(MTPriority {
                base: pri,
                inherited: Vec::new()
            }),
            state: AtomicCell::new(MTState::Ready),
            park: Mutex::new(MTPark {
                wake: MTWake::Idle,
                kick_cnt: 0
            }),
            park_cv: Condvar::new(),
            exit: Mutex::new(MTExit {
                terminated: false,
                joinq: MTWaitQueue::new()
            })
        }
    }

    pub(crate) fn tid(&self) -> MTTaskId
    {
        self.tid
    }

    pub(crate) fn name(&self) -> String
    {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: &str)
    {
        *self.name.lock() = String::from(name);
    }

    pub(crate) fn priority(&self) -> MTTaskPri
    {
        self.pri.load(Ordering::Acquire)
    }

    /// Sets the base priority; the effective one stays raised while inheriting.
    pub(crate) fn set_priority(&self, pri: MTTaskPri)
    {
        let mut bp = self.base_pri.lock();
        bp.base = pri;
        self.pri.store(bp.effective(), Ordering::Release);
    }

    pub(crate) fn base_priority(&self) -> MTTaskPri
    {
        self.base_pri.lock().base
    }

    /// Records the priority inherited through the owned mutex `key`.
    /// * `pri` - best waiter's priority, or `None` once there is none or the mutex is released.
    pub(crate) fn inherit(&self, key: usize, pri: Option<MTTaskPri>)
    {
        let mut bp = self.base_pri.lock();
        bp.inherited.retain(|(k, _)| *k != key);
        if let Some(pri) = pri {
            bp.inherited.push((key, pri));
        }
        self.pri.store(bp.effective(), Ordering::Release);
    }

    pub(crate) fn state(&self) -> MTState
    {
        self.state.load()
    }

    // ----- ----- Own thread context ----- ----- //

    /// Prepares to park; called inside the critical section before enqueueing.
    pub(crate) fn arm(&self)
    {
        let mut park = self.park.lock();

        bk_assert!(park.wake == MTWake::Idle);
        park.wake = MTWake::Pending;

        self.state.store(MTState::Blocked);
    }

    /// Blocks until `unpark` or the deadline.
    /// * Returns `true` if unparked.
    pub(crate) fn park(&self, deadline: Option<Instant>) -> bool
    {
        let mut park = self.park.lock();

        while park.wake == MTWake::Pending {
            match deadline {
                Some(at) => {
                    if self.park_cv.wait_until(&mut park, at).timed_out() {
                        break;
                    }
                },
                None => {
                    self.park_cv.wait(&mut park);
                }
            }
        }

        park.wake == MTWake::Woken
    }

    pub(crate) fn disarm(&self)
    {
        self.park.lock().wake = MTWake::Idle;

        self.state.store(MTState::Running);
    }

    /// Consumes one kick, blocking while there is none.
    pub(crate) fn idle(&self)
    {
        let mut park = self.park.lock();

        if park.kick_cnt == 0 {
            self.state.store(MTState::Blocked);

            while park.kick_cnt == 0 {
                self.park_cv.wait(&mut park);
            }

            self.state.store(MTState::Running);
        }

        park.kick_cnt -= 1;
    }

    pub(crate) fn sleep_until(&self, deadline: Instant)
    {
        let mut park = self.park.lock();

        self.state.store(MTState::Blocked);

        while Instant::now() < deadline {
            self.park_cv.wait_until(&mut park, deadline);
        }

        self.state.store(MTState::Running);
    }

    // ----- ----- Any context ----- ----- //

    /// Resumes the thread if it is parked; called by a waker inside the critical section.
    pub(crate) fn unpark(&self)
    {
        let mut park = self.park.lock();

        if park.wake == MTWake::Pending {
            park.wake = MTWake::Woken;
            self.state.store(MTState::Ready);
            self.park_cv.notify_all();
        }
    }

    pub(crate) fn kick(&self)
    {
        let mut park = self.park.lock();

        park.kick_cnt += 1;
        self.park_cv.notify_all();
    }

    /// Waits for the thread to terminate.
    pub(crate) fn join(&self, timeout: MTTimeout) -> Result<(), MTError>
    {
        if current_ctl().tid() == self.tid {
            return Err(MTInvalid::SelfJoin.into());
        }

        let mut exit = self.exit.lock();

        if exit.terminated {
            return Ok(());
        }

        pend(&mut exit, exit_joinq, (), timeout)
    }

    fn terminate(&self)
    {
        if let Some(tk) = O_MTKERNEL.get() {
            tk.threads.lock().remove(&self.tid);
        }

        self.state.store(MTState::Terminated);

        let mut exit = self.exit.lock();

        exit.terminated = true;
        exit.joinq.wake_all();
        drop(exit);

        debug!("kernel: tid {} terminated", self.tid);
    }
}

//

struct MTCurrent
{
    ctl: Arc<MTThreadCtl>,
    adopted: bool
}

impl Drop for MTCurrent
{
    fn drop(&mut self)
    {
        // spawned threads terminate through their exit guard instead
        if self.adopted {
            self.ctl.terminate();
        }
    }
}

thread_local! {
    static O_CURRENT: RefCell<Option<MTCurrent>> = const { RefCell::new(None) };
}

fn set_current(ctl: Arc<MTThreadCtl>, adopted: bool)
{
    O_CURRENT.with(|c| {
        *c.borrow_mut() = Some(MTCurrent {ctl, adopted});
    });
}

/// Gets the control block of the calling thread, adopting it on first use.
pub(crate) fn current_ctl() -> Arc<MTThreadCtl>
{
    let found = O_CURRENT.try_with(|c| c.borrow().as_ref().map(|cur| cur.ctl.clone()));

    match found {
        Ok(Some(ctl)) => ctl,
        Ok(None) => {
            let tk = mtkernel_get();
            let name = std::thread::current().name().unwrap_or("adopted").to_string();
            let ctl = tk.register(&name, tk.config.main_pri);

            ctl.state.store(MTState::Running);
            set_current(ctl.clone(), true);

            debug!("kernel: adopted thread '{}' as tid {}", name, ctl.tid);

            ctl
        },
        Err(_) => {
            // thread-local storage already torn down; hand out a detached block
            let tk = mtkernel_get();

            Arc::new(MTThreadCtl::new(tk.next_tid(), "detached", tk.config.main_pri))
        }
    }
}

struct MTExitGuard
{
    ctl: Arc<MTThreadCtl>
}

impl Drop for MTExitGuard
{
    fn drop(&mut self)
    {
        self.ctl.terminate();
    }
}

//

pub(crate) struct MTKernelCore
{
    config: MTConfig,
    boot: Instant,
    next_tid: AtomicU32,
    threads: Mutex<BTreeMap<MTTaskId, Arc<MTThreadCtl>>>,
    timer: MTTimerService
}

impl MTKernelCore
{
    fn new(config: MTConfig) -> MTKernelCore
    {
        debug!("kernel: created with {:?}", config);

        let timer = MTTimerService::new(&config.timer_name);

        MTKernelCore {
            config,
            boot: Instant::now(),
            next_tid: AtomicU32::new(0),
            threads: Mutex::new(BTreeMap::new()),
            timer
        }
    }

    pub(crate) fn config(&self) -> &MTConfig
    {
        &self.config
    }

    pub(crate) fn boot(&self) -> Instant
    {
        self.boot
    }

    pub(crate) fn timer(&'static self) -> &'static MTTimerService
    {
        &self.timer
    }

    fn next_tid(&self) -> MTTaskId
    {
        self.next_tid.fetch_add(1, Ordering::AcqRel)
    }

    fn register(&self, name: &str, pri: MTTaskPri) -> Arc<MTThreadCtl>
    {
        let ctl = Arc::new(MTThreadCtl::new(self.next_tid(), name, pri));

        self.threads.lock().insert(ctl.tid, ctl.clone());

        ctl
    }

    pub(crate) fn thread(&self, tid: MTTaskId) -> Option<Arc<MTThreadCtl>>
    {
        self.threads.lock().get(&tid).cloned()
    }

    /// Starts `f` on a new kernel thread.
    /// * Fails with `MTError::OutOfMemory` if the host cannot create the thread.
    pub(crate) fn spawn<F>(&self, name: &str, pri: MTTaskPri, f: F) -> Result<Arc<MTThreadCtl>, MTError>
    where F: FnOnce() + Send + 'static
    {
        let ctl = self.register(name, pri);
        let guard = MTExitGuard {
            ctl: ctl.clone()
        };

        let spawned = std::thread::Builder::new()
            .name(String::from(name))
            .spawn(move || {
                let guard = guard;

                set_current(guard.ctl.clone(), false);
                guard.ctl.state.store(MTState::Running);

                trace!("kernel: tid {} running", guard.ctl.tid);

                if catch_unwind(AssertUnwindSafe(f)).is_err() {
                    error!("kernel: tid {} panicked", guard.ctl.tid);
                }
            });

        match spawned {
            Ok(_) => {
                debug!("kernel: spawned '{}' as tid {} with priority {}", name, ctl.tid, pri);
                Ok(ctl)
            },
            Err(e) => {
                error!("kernel: cannot spawn '{}': {}", name, e);
                // the closure and its exit guard are gone already
                Err(MTError::OutOfMemory)
            }
        }
    }
}
