/*!
This crate for Rust provides `mtkernel`, a real-time kernel core that runs hosted on an OS.

# Features

* Threads like those of a typical RTOS
  * `MTKernel` spawns closures as kernel threads with names and priorities.
  * `idle` and `kick`
    * A thread goes into an idle state and other threads or timer handlers wake it up by kicking.
  * Threads that call into the kernel without being spawned are adopted at the configured main priority.
* Priority-ordered waiting
  * Every blocking call takes an `MTTimeout`: no-wait, forever or a bounded duration.
  * Waiters are woken in priority order; the lower value is the higher priority.
  * Waiters of equal priority are woken in arrival order.
* Synchronization
  * `MTSemaphore` - counting semaphore with a limit.
  * `MTMutex` - recursive mutex with priority inheritance.
  * `MTMsgQueue` - bounded FIFO message queue.
* Deferred execution
  * `MTWorkQueue` and `MTWork` - serialized work items, delayed or immediate, submittable from any context.
  * `MTTimer` - one-shot and periodic kernel timers.
* Memory
  * `MTHeap` - first-fit heap over a fixed region with splitting and coalescing.
  * `MTSlab` - lock-free pool of fixed-size blocks.
  * `mt_malloc` and `mt_free` - the system heap.

Allocation never blocks. Errors are reported as `MTError`; the library logs through
the `log` facade and installs no logger.

# Examples
## Usage Outline

```no_run
use std::sync::Arc;
use mtkernel::*;

let q = Arc::new(MTMsgQueue::<u32>::new(4));
let sem = Arc::new(MTSemaphore::new(0, 1));

let (rx, done) = (q.clone(), sem.clone());
let consumer = MTKernel::spawn("consumer", 1, move || {
    while let Ok(v) = rx.get(MTTimeout::ms(100)) {
        println!("got {}", v);
    }
    done.give();
}).unwrap();

for v in 0..8 {
    q.put(v, MTTimeout::Forever).unwrap();
}

sem.take(MTTimeout::Forever).unwrap();
consumer.join(MTTimeout::Forever).unwrap();
```
*/

#[macro_use]
mod bkptpanic;

mod bheap;
mod config;
mod error;
mod heap;
mod kernel;
mod memory;
mod msgqueue;
mod mutex;
mod semaphore;
mod slab;
mod sysheap;
mod thread;
mod timeout;
mod timer;
mod waitq;
mod workq;

/// Thread identifier
pub type MTTaskId = u32;

/// Thread priority; the lower value is the higher priority.
pub type MTTaskPri = i16;

pub use crate::config::MTConfig;
pub use crate::error::{MTError, MTInvalid, MTResult};
pub use crate::heap::{MTHeap, MTHeapStats};
pub use crate::kernel::MTState;
pub use crate::msgqueue::MTMsgQueue;
pub use crate::mutex::{MTMutex, MTMutexGuard};
pub use crate::semaphore::MTSemaphore;
pub use crate::slab::MTSlab;
pub use crate::sysheap::{mt_free, mt_malloc, sysheap_init, sysheap_stats, sysheap_teardown};
pub use crate::thread::{MTKernel, MTThread};
pub use crate::timeout::MTTimeout;
pub use crate::timer::{MTTimer, MTTimerFn};
pub use crate::workq::{sys_workq, MTWork, MTWorkHandler, MTWorkQueue, MTWorkState};
