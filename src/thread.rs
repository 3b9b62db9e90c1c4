use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{MTTaskId, MTTaskPri};
use crate::config::MTConfig;
use crate::error::MTError;
use crate::kernel::{current_ctl, mtkernel_create, mtkernel_get, MTState, MTThreadCtl};
use crate::timeout::{deadline_after, MTTimeout};

/// Kernel API
pub struct MTKernel;

impl MTKernel
{
    // ----- ----- Main context ----- ----- //

    /// Creates the kernel with a configuration.
    /// * `config` - kernel configuration.
    /// * Returns `false` if the kernel already exists, having been initialized
    ///   before or used with the default configuration; `config` is ignored then.
    pub fn init(config: MTConfig) -> bool
    {
        mtkernel_create(config)
    }

    /// Gets the configuration in effect.
    pub fn config() -> &'static MTConfig
    {
        mtkernel_get().config()
    }

    /// Spawns a closure as a kernel thread.
    /// * `name` - thread name.
    /// * `pri` - thread priority. The lower value is the higher priority.
    /// * `f: F` - thread closure.
    /// * Returns the handle of the thread.
    pub fn spawn<F>(name: &str, pri: MTTaskPri, f: F) -> Result<MTThread, MTError>
    where F: FnOnce() + Send + 'static
    {
        let ctl = mtkernel_get().spawn(name, pri, f)?;

        Ok(MTThread {ctl})
    }

    // ----- ----- Thread context ----- ----- //

    /// Gets the handle of the calling thread.
    pub fn current() -> MTThread
    {
        MTThread {
            ctl: current_ctl()
        }
    }

    pub fn curr_tid() -> MTTaskId
    {
        current_ctl().tid()
    }

    /// Brings the calling thread into an idle state until it is kicked.
    /// * A kick received before `idle` is consumed at once without blocking.
    pub fn idle()
    {
        current_ctl().idle();
    }

    pub fn sleep(d: Duration)
    {
        current_ctl().sleep_until(deadline_after(Instant::now(), d));
    }

    pub fn msleep(ms: u64)
    {
        MTKernel::sleep(Duration::from_millis(ms));
    }

    pub fn yield_now()
    {
        std::thread::yield_now();
    }

    // ----- ----- Thread and Interrupt context ----- ----- //

    /// Wakes up a thread in an idle state.
    /// * `tid` - thread identifier.
    /// * Returns `false` if no such thread is alive.
    pub fn kick(tid: MTTaskId) -> bool
    {
        match mtkernel_get().thread(tid) {
            Some(ctl) => {
                ctl.kick();
                true
            },
            None => false
        }
    }

    /// Gets the handle of a live thread.
    pub fn thread(tid: MTTaskId) -> Option<MTThread>
    {
        mtkernel_get().thread(tid).map(|ctl| MTThread {ctl})
    }

    /// Gets the time since the kernel was created.
    pub fn uptime() -> Duration
    {
        mtkernel_get().boot().elapsed()
    }

    pub fn uptime_ms() -> u64
    {
        MTKernel::uptime().as_millis() as u64
    }
}

//

/// Kernel thread handle
#[derive(Clone)]
pub struct MTThread
{
    ctl: Arc<MTThreadCtl>
}

impl MTThread
{
    pub fn tid(&self) -> MTTaskId
    {
        self.ctl.tid()
    }

    pub fn name(&self) -> String
    {
        self.ctl.name()
    }

    pub fn set_name(&self, name: &str)
    {
        self.ctl.set_name(name);
    }

    /// Gets the effective priority, including any priority inherited through a mutex.
    pub fn priority(&self) -> MTTaskPri
    {
        self.ctl.priority()
    }

    /// Gets the priority set at spawn or by `set_priority`.
    pub fn base_priority(&self) -> MTTaskPri
    {
        self.ctl.base_priority()
    }

    /// Sets the base priority.
    /// * Takes effect at the next wait; a thread already waiting keeps its place.
    /// * While a mutex owned by the thread has waiters, the effective priority stays at least theirs.
    pub fn set_priority(&self, pri: MTTaskPri)
    {
        self.ctl.set_priority(pri);
    }

    pub fn state(&self) -> MTState
    {
        self.ctl.state()
    }

    pub fn kick(&self)
    {
        self.ctl.kick();
    }

    /// Waits for the thread to terminate.
    /// * `timeout` - waiting mode.
    /// * Fails with `MTInvalid::SelfJoin` on the calling thread itself.
    pub fn join(&self, timeout: MTTimeout) -> Result<(), MTError>
    {
        self.ctl.join(timeout)
    }
}

impl std::fmt::Debug for MTThread
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("MTThread")
            .field("tid", &self.tid())
            .field("name", &self.name())
            .field("priority", &self.priority())
            .field("state", &self.state())
            .finish()
    }
}
