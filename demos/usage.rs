// Runnable on the host: cargo run --example usage

use std::sync::Arc;
use std::time::Duration;

use log::{LevelFilter, Metadata, Record};

use mtkernel::*;

struct StderrLogger;

impl log::Log for StderrLogger
{
    fn enabled(&self, metadata: &Metadata) -> bool
    {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &Record)
    {
        if self.enabled(record.metadata()) {
            eprintln!("[{:>6} ms {:<5}] {}", MTKernel::uptime_ms(), record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main()
{
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug));

    MTKernel::init(MTConfig {
        sys_heap_size: 1024,
        ..MTConfig::default()
    });

    let q = Arc::new(MTMsgQueue::<u32>::new(4));
    let total = Arc::new(MTMutex::new());
    let sum = Arc::new(parking_lot::Mutex::new(0u32));

    // task0: woken by a periodic timer, sends a value per tick

    let snd = q.clone();
    let task0 = MTKernel::spawn("task0", 1, move || {
        for v in 1..=8 {
            MTKernel::idle();
            snd.put(v, MTTimeout::Forever).unwrap();
        }
    }).unwrap();

    let tid0 = task0.tid();
    let tick = MTTimer::new(Some(Box::new(move || {MTKernel::kick(tid0);})), None);
    tick.start(Duration::from_millis(20), Some(Duration::from_millis(20)));

    // task1: receives and accumulates under the kernel mutex

    let (rcv, m, s) = (q.clone(), total.clone(), sum.clone());
    let task1 = MTKernel::spawn("task1", 1, move || {
        while let Ok(v) = rcv.get(MTTimeout::ms(200)) {
            let _g = m.lock_guard(MTTimeout::Forever).unwrap();
            *s.lock() += v;
            println!("task1: got {}", v);
        }
    }).unwrap();

    // deferred work on the system queue, once at once and once delayed

    let report = {
        let s = sum.clone();
        MTWork::new(move || println!("work: running sum {}", *s.lock()))
    };
    report.submit().unwrap();
    report.schedule(Duration::from_millis(100)).unwrap();

    // scratch buffer from the system heap

    let buf = mt_malloc(64).unwrap();
    println!("sysheap: {:?}", sysheap_stats());
    mt_free(buf).unwrap();

    task0.join(MTTimeout::Forever).unwrap();
    tick.stop();
    task1.join(MTTimeout::Forever).unwrap();

    println!("sum = {} (expected 36), uptime {} ms", *sum.lock(), MTKernel::uptime_ms());
}
