//! Contention tests for the CAS-based MPMC ring.

use packetring::CasRing;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 8 producers push 1000 unique values each; one consumer drains all 8000.
/// The popped set must equal the union of the produced sets: no loss, no
/// duplication.
#[test]
fn eight_producers_one_consumer_conservation() {
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 1000;

    let ring = Arc::new(CasRing::with_capacity(1024).unwrap());

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let mut v = p * 1_000_000 + i;
                loop {
                    match ring.try_push(v) {
                        Ok(()) => break,
                        Err(back) => {
                            v = back;
                            thread::yield_now();
                        }
                    }
                }
            }
        }));
    }

    let consumer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            let mut seen = HashSet::new();
            while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
                match ring.try_pop() {
                    Some(v) => {
                        assert!(seen.insert(v), "duplicate value {v}");
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        })
    };

    for h in handles {
        h.join().unwrap();
    }
    let seen = consumer.join().unwrap();

    let mut expected = HashSet::new();
    for p in 0..PRODUCERS {
        for i in 0..PER_PRODUCER {
            expected.insert(p * 1_000_000 + i);
        }
    }
    assert_eq!(seen, expected);
}

/// Per-producer FIFO: values from one producer arrive in its push order
/// even with other producers interleaving.
#[test]
fn per_producer_order_is_preserved() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 500;

    let ring = Arc::new(CasRing::with_capacity(64).unwrap());

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let mut v = p * 1_000_000 + i;
                loop {
                    match ring.try_push(v) {
                        Ok(()) => break,
                        Err(back) => {
                            v = back;
                            thread::yield_now();
                        }
                    }
                }
            }
        }));
    }

    let consumer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            let mut last: Vec<Option<u64>> = vec![None; PRODUCERS as usize];
            let mut total = 0;
            while total < PRODUCERS * PER_PRODUCER {
                if let Some(v) = ring.try_pop() {
                    let p = (v / 1_000_000) as usize;
                    let i = v % 1_000_000;
                    if let Some(prev) = last[p] {
                        assert!(i > prev, "producer {p} reordered: {prev} then {i}");
                    }
                    last[p] = Some(i);
                    total += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    for h in handles {
        h.join().unwrap();
    }
    consumer.join().unwrap();
}

/// Multiple consumers: the multiset of popped values still equals the
/// multiset of pushed values.
#[test]
fn two_consumers_share_the_stream() {
    use std::sync::atomic::{AtomicBool, Ordering};

    const TOTAL: u64 = 4000;

    let ring = Arc::new(CasRing::with_capacity(256).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let ring = Arc::clone(&ring);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..TOTAL {
                let mut v = i;
                loop {
                    match ring.try_push(v) {
                        Ok(()) => break,
                        Err(back) => {
                            v = back;
                            thread::yield_now();
                        }
                    }
                }
            }
            done.store(true, Ordering::Release);
        })
    };

    let spawn_consumer = |ring: Arc<CasRing<u64>>, done: Arc<AtomicBool>| {
        thread::spawn(move || {
            let mut got = Vec::new();
            loop {
                match ring.try_pop() {
                    Some(v) => got.push(v),
                    None => {
                        if done.load(Ordering::Acquire) && ring.is_empty() {
                            break;
                        }
                        thread::sleep(Duration::from_micros(50));
                    }
                }
            }
            got
        })
    };

    let c1 = spawn_consumer(Arc::clone(&ring), Arc::clone(&done));
    let c2 = spawn_consumer(Arc::clone(&ring), Arc::clone(&done));

    producer.join().unwrap();
    let mut all = c1.join().unwrap();
    all.extend(c2.join().unwrap());
    all.sort_unstable();

    let expected: Vec<u64> = (0..TOTAL).collect();
    assert_eq!(all, expected);
}

/// Statistics counters see the traffic.
#[test]
fn stats_reflect_contended_traffic() {
    let ring = Arc::new(CasRing::with_capacity(32).unwrap());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ring = Arc::clone(&ring);
        handles.push(thread::spawn(move || {
            for i in 0..200u64 {
                while ring.try_push(i).is_err() {
                    thread::yield_now();
                }
            }
        }));
    }

    let consumer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            let mut n = 0;
            while n < 800 {
                if ring.try_pop().is_some() {
                    n += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    for h in handles {
        h.join().unwrap();
    }
    consumer.join().unwrap();

    let stats = ring.stats();
    assert_eq!(stats.pushes, 800);
    assert_eq!(stats.pops, 800);
    assert_eq!(stats.current_len, 0);
}
