use crate::MTTaskPri;

/// Kernel configuration
///
/// Applied once through [`MTKernel::init`](crate::MTKernel::init) before the
/// kernel is first used; the defaults below apply otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MTConfig
{
    /// Size in bytes of the system heap behind `mt_malloc`.
    pub sys_heap_size: usize,
    /// Priority given to OS threads adopted by the kernel on first use.
    pub main_pri: MTTaskPri,
    /// Priority of the system work queue thread.
    pub sys_workq_pri: MTTaskPri,
    /// Number of pending slots of the system work queue.
    pub sys_workq_len: usize,
    /// Name of the timer service thread.
    pub timer_name: String
}

impl Default for MTConfig
{
    fn default() -> MTConfig
    {
        MTConfig {
            sys_heap_size: 4096,
            main_pri: 0,
            sys_workq_pri: -1,
            sys_workq_len: 64,
            timer_name: String::from("mt_timer")
        }
    }
}
