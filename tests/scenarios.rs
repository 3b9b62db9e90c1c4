use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use mtkernel::*;

#[test]
fn heap_alloc_free_restores_capacity()
{
    let heap = MTHeap::new(1024);

    let a = heap.alloc(64).unwrap();
    let b = heap.alloc(128).unwrap();
    let c = heap.alloc(256).unwrap();
    assert_eq!(heap.alloc(800), Err(MTError::OutOfMemory));

    heap.free(b).unwrap();
    heap.free(a).unwrap();
    heap.free(c).unwrap();

    let s = heap.stats();
    assert_eq!(s.free_blocks, 1);
    assert_eq!(s.allocated_blocks, 0);
    assert_eq!(s.free_bytes + s.overhead_bytes, 1024);
    assert!(heap.validate());

    // the whole region is one block again
    assert!(heap.alloc(1024 - 8).is_ok());
}

#[test]
fn slab_exhausts_and_recovers()
{
    let slab = MTSlab::new(32, 8, 8);

    let blocks: Vec<_> = (0..8).map(|_| slab.alloc().unwrap()).collect();
    assert_eq!(slab.alloc(), Err(MTError::OutOfMemory));

    for p in blocks {
        slab.free(p).unwrap();
    }
    assert_eq!(slab.num_free(), 8);
    assert!(slab.alloc().is_ok());
}

#[test]
fn semaphores_bound_producer_consumer()
{
    const ITEMS: u32 = 15;
    const SLOTS: u32 = 5;

    let empty = Arc::new(MTSemaphore::new(SLOTS, SLOTS));
    let full = Arc::new(MTSemaphore::new(0, SLOTS));
    let buf = Arc::new(Mutex::new(VecDeque::new()));

    let (e, f, b) = (empty.clone(), full.clone(), buf.clone());
    let producer = MTKernel::spawn("producer", 2, move || {
        for i in 0..ITEMS {
            e.take(MTTimeout::Forever).unwrap();
            let mut b = b.lock();
            b.push_back(i);
            assert!(b.len() <= SLOTS as usize);
            drop(b);
            f.give();
        }
    }).unwrap();

    let mut got = Vec::new();
    while got.len() < ITEMS as usize {
        full.take(MTTimeout::secs(5)).unwrap();
        got.push(buf.lock().pop_front().unwrap());
        empty.give();

        assert!(empty.count() <= SLOTS);
        assert!(full.count() <= SLOTS);
    }

    producer.join(MTTimeout::secs(5)).unwrap();

    assert_eq!(got, (0..ITEMS).collect::<Vec<_>>());
    assert_eq!(empty.count(), SLOTS);
    assert_eq!(full.count(), 0);
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Record
{
    seq: u32,
    value: f32
}

#[test]
fn msgqueue_keeps_order_under_pressure()
{
    let q = Arc::new(MTMsgQueue::<Record>::new(10));
    let go = Arc::new(MTSemaphore::new(0, 1));
    let got = Arc::new(Mutex::new(Vec::new()));

    let (rx, g, out) = (q.clone(), go.clone(), got.clone());
    let consumer = MTKernel::spawn("consumer", 1, move || {
        g.take(MTTimeout::Forever).unwrap();
        while let Ok(r) = rx.get(MTTimeout::ms(1000)) {
            out.lock().push(r);
            if r.seq == 19 {
                break;
            }
        }
    }).unwrap();

    let mut would_block = 0;
    for seq in 0..20 {
        let r = Record {seq, value: seq as f32 * 0.5};

        loop {
            match q.put(r, MTTimeout::NoWait) {
                Ok(()) => break,
                Err(MTError::WouldBlock) => {
                    would_block += 1;
                    go.give();
                    MTKernel::msleep(1);
                },
                Err(e) => panic!("unexpected {:?}", e)
            }
        }
    }

    consumer.join(MTTimeout::secs(5)).unwrap();

    assert!(would_block > 0);
    let got = got.lock();
    assert_eq!(got.len(), 20);
    assert!(got.iter().enumerate().all(|(i, r)| r.seq == i as u32 && r.value == i as f32 * 0.5));
}

#[test]
fn msgqueue_fifo_per_producer_with_contention()
{
    let q = Arc::new(MTMsgQueue::<(u32, u32)>::new(4));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..3).map(|id| {
        let q = q.clone();
        MTKernel::spawn(&format!("put{}", id), 1 + id as MTTaskPri, move || {
            for seq in 0..100 {
                q.put((id, seq), MTTimeout::Forever).unwrap();
            }
        }).unwrap()
    }).collect();

    let consumers: Vec<_> = (0..2).map(|id| {
        let (q, seen) = (q.clone(), seen.clone());
        MTKernel::spawn(&format!("get{}", id), 1, move || {
            let mut local = Vec::new();
            while let Ok(m) = q.get(MTTimeout::ms(200)) {
                local.push(m);
            }
            seen.lock().push(local);
        }).unwrap()
    }).collect();

    for th in producers.iter().chain(consumers.iter()) {
        th.join(MTTimeout::Forever).unwrap();
    }

    let seen = seen.lock();
    assert_eq!(seen.iter().map(|v| v.len()).sum::<usize>(), 300);

    // every consumer sees each producer's messages in sending order
    for local in seen.iter() {
        let mut last: HashMap<u32, u32> = HashMap::new();
        for (id, seq) in local {
            if let Some(prev) = last.insert(*id, *seq) {
                assert!(prev < *seq);
            }
        }
    }
}

#[test]
fn mutex_serializes_counter()
{
    let m = Arc::new(MTMutex::new());
    let counter = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..2).map(|i| {
        let (m, counter) = (m.clone(), counter.clone());
        MTKernel::spawn(&format!("inc{}", i), 1, move || {
            for _ in 0..10 {
                m.lock(MTTimeout::Forever).unwrap();
                // split read-modify-write, only safe under the mutex
                let v = counter.load(Ordering::SeqCst);
                MTKernel::yield_now();
                counter.store(v + 1, Ordering::SeqCst);
                m.unlock().unwrap();
            }
        }).unwrap()
    }).collect();

    for th in workers {
        th.join(MTTimeout::Forever).unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 20);
    assert!(!m.is_locked());
}

#[test]
fn mutex_hands_ownership_to_waiter()
{
    let m = Arc::new(MTMutex::new());
    let owner_seen = Arc::new(Mutex::new(None));

    let me = MTKernel::current();
    let base = me.priority();

    m.lock(MTTimeout::Forever).unwrap();

    let (m2, seen) = (m.clone(), owner_seen.clone());
    let waiter = MTKernel::spawn("waiter", base - 5, move || {
        m2.lock(MTTimeout::Forever).unwrap();
        *seen.lock() = m2.owner();
        m2.unlock().unwrap();
    }).unwrap();

    // the waiter's priority is inherited once it pends
    while me.priority() != base - 5 {
        MTKernel::yield_now();
    }

    m.unlock().unwrap();
    assert_eq!(me.priority(), base);

    // ownership moved inside the unlock; it never passes through unlocked
    let owner = m.owner();
    assert!(owner == Some(waiter.tid()) || owner.is_none());

    waiter.join(MTTimeout::Forever).unwrap();
    assert_eq!(*owner_seen.lock(), Some(waiter.tid()));
    assert!(!m.is_locked());
}

// waiters expiring while units are handed over must neither lose nor duplicate them

#[test]
fn semaphore_units_survive_expiring_waiters()
{
    const GIVES: u32 = 2000;
    const TAKERS: u32 = 6;

    let sem = Arc::new(MTSemaphore::new(0, GIVES));
    let stop = Arc::new(AtomicBool::new(false));
    let taken = Arc::new(AtomicU32::new(0));

    let takers: Vec<_> = (0..TAKERS).map(|i| {
        let (s, st, t) = (sem.clone(), stop.clone(), taken.clone());
        MTKernel::spawn(&format!("taker{}", i), 1 + (i % 3) as MTTaskPri, move || {
            while !st.load(Ordering::SeqCst) {
                if s.take(MTTimeout::ms(1)).is_ok() {
                    t.fetch_add(1, Ordering::SeqCst);
                }
            }
        }).unwrap()
    }).collect();

    for i in 0..GIVES {
        sem.give();
        if i % 16 == 0 {
            MTKernel::msleep(1);
        }
    }

    stop.store(true, Ordering::SeqCst);
    for th in takers {
        th.join(MTTimeout::Forever).unwrap();
    }

    assert_eq!(taken.load(Ordering::SeqCst) + sem.count(), GIVES);
}

#[test]
fn msgqueue_items_survive_expiring_waiters()
{
    const PRODUCERS: u32 = 3;
    const CONSUMERS: u32 = 3;
    const PER_PRODUCER: u32 = 400;

    let q = Arc::new(MTMsgQueue::<u32>::new(2));
    let stop = Arc::new(AtomicBool::new(false));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..PRODUCERS).map(|p| {
        let (q, sent) = (q.clone(), sent.clone());
        MTKernel::spawn(&format!("put{}", p), 2, move || {
            for i in 0..PER_PRODUCER {
                let v = p * PER_PRODUCER + i;
                if q.put(v, MTTimeout::ms(1)).is_ok() {
                    sent.lock().push(v);
                }
            }
        }).unwrap()
    }).collect();

    let consumers: Vec<_> = (0..CONSUMERS).map(|c| {
        let (q, st, received) = (q.clone(), stop.clone(), received.clone());
        MTKernel::spawn(&format!("get{}", c), 2, move || {
            while !st.load(Ordering::SeqCst) {
                if let Ok(v) = q.get(MTTimeout::ms(1)) {
                    received.lock().push(v);
                }
            }
        }).unwrap()
    }).collect();

    for th in producers {
        th.join(MTTimeout::Forever).unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    for th in consumers {
        th.join(MTTimeout::Forever).unwrap();
    }

    let mut received = received.lock().clone();
    while let Ok(v) = q.get(MTTimeout::NoWait) {
        received.push(v);
    }

    let mut sent = sent.lock().clone();
    sent.sort_unstable();
    received.sort_unstable();
    assert_eq!(received, sent);
    assert_eq!(q.used(), 0);
}

#[test]
fn mutex_stays_consistent_with_expiring_waiters()
{
    const THREADS: u32 = 6;
    const ATTEMPTS: u32 = 300;

    let m = Arc::new(MTMutex::new());
    let inside = Arc::new(AtomicU32::new(0));
    let acquired = Arc::new(AtomicU32::new(0));
    let overlaps = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..THREADS).map(|i| {
        let (m, inside, acquired, overlaps) = (m.clone(), inside.clone(), acquired.clone(), overlaps.clone());
        MTKernel::spawn(&format!("locker{}", i), 1 + (i % 4) as MTTaskPri, move || {
            for _ in 0..ATTEMPTS {
                if m.lock(MTTimeout::ms(1)).is_ok() {
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    acquired.fetch_add(1, Ordering::SeqCst);
                    MTKernel::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    m.unlock().unwrap();
                }
            }
        }).unwrap()
    }).collect();

    for th in &workers {
        th.join(MTTimeout::Forever).unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(acquired.load(Ordering::SeqCst) > 0);
    assert!(!m.is_locked());

    // no priority inherited through the mutex outlives the contention
    for th in &workers {
        assert_eq!(th.priority(), th.base_priority());
    }
}
