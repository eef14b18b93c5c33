//! Cross-thread tests for the SPSC ring.

use packetring::SpscRing;
use std::sync::Arc;
use std::thread;

/// One producer pushes 1..=100 through a capacity-8 ring while a consumer
/// drains it; the consumer must observe exactly the production order.
#[test]
fn ping_pong_preserves_order() {
    let ring = Arc::new(SpscRing::with_capacity(8).unwrap());

    let producer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            for i in 1..=100u64 {
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
        })
    };

    let consumer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            let mut received = Vec::with_capacity(100);
            while received.len() < 100 {
                match ring.try_pop() {
                    Some(v) => received.push(v),
                    None => thread::yield_now(),
                }
            }
            received
        })
    };

    producer.join().unwrap();
    let received = consumer.join().unwrap();
    let expected: Vec<u64> = (1..=100).collect();
    assert_eq!(received, expected);
}

/// The externally observed occupancy never leaves [0, capacity] while both
/// sides run.
#[test]
fn occupancy_stays_bounded() {
    let ring = Arc::new(SpscRing::with_capacity(16).unwrap());
    let capacity = ring.capacity();

    let producer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            for i in 0..10_000u64 {
                while ring.try_push(i).is_err() {
                    thread::yield_now();
                }
            }
        })
    };

    let consumer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            let mut seen = 0u64;
            while seen < 10_000 {
                if ring.try_pop().is_some() {
                    seen += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    // Third-party observer: len() is approximate but must stay in range.
    for _ in 0..1_000 {
        let len = ring.len();
        assert!(len <= capacity, "observed len {len} > capacity {capacity}");
    }

    producer.join().unwrap();
    consumer.join().unwrap();
    assert!(ring.is_empty());
}

/// Heap payloads move through without being duplicated or leaked.
#[test]
fn owned_payloads_move_through() {
    let ring = Arc::new(SpscRing::with_capacity(4).unwrap());

    let producer = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || {
            for i in 0..50u32 {
                let mut boxed = Box::new(i);
                loop {
                    match ring.try_push(boxed) {
                        Ok(()) => break,
                        Err(back) => {
                            boxed = back;
                            thread::yield_now();
                        }
                    }
                }
            }
        })
    };

    let mut sum = 0u64;
    let mut count = 0;
    while count < 50 {
        if let Some(boxed) = ring.try_pop() {
            sum += u64::from(*boxed);
            count += 1;
        } else {
            thread::yield_now();
        }
    }

    producer.join().unwrap();
    assert_eq!(sum, (0..50u64).sum());
}
