//! Two-process end-to-end test: pool slots travel through a ring.
//!
//! The same test executable is spawned twice with a role in the environment:
//!
//! ```text
//! [producer]  --[create pool+ring]--[allocate, write, enqueue ...]--[wait for drain]--[drop: unlink]
//!                        |                          |
//!                        v                          v
//! [consumer]  -------[attach]------------[dequeue, verify, release ...]---[done]
//! ```
//!
//! The consumer checks that every sequence number arrives exactly once and in
//! order, and that the payload behind each handle is the one written; the
//! producer checks that every slot came back to the pool.
//!
//! ```bash
//! cargo test -p ferry-icc --test e2e_pool_ring -- --nocapture
//! ```

use ferry_icc::{Attached, Handle, Owned, Pool, PoolConfig, Ring, RingConfig, ShmNamespace};
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "FERRY_E2E_ROLE";
const ENV_DIR: &str = "FERRY_E2E_DIR";
const ROLE_PRODUCER: &str = "producer";
const ROLE_CONSUMER: &str = "consumer";

const POOL_NAME: &str = "e2e_pool";
const RING_NAME: &str = "e2e_ring";

const FRAMES: u64 = 50_000;
/// Smaller than the pool so the producer also sees ring backpressure.
const RING_CAPACITY: usize = 256;
const SLOT_COUNT: usize = 512;
const SLOT_SIZE: usize = 64;
const BURST: usize = 32;

fn run_producer(ns: &ShmNamespace) {
    let mut pool = Pool::<Owned>::create(
        ns,
        POOL_NAME,
        PoolConfig {
            slot_size: SLOT_SIZE,
            slot_count: SLOT_COUNT,
        },
    )
    .expect("producer: create pool");
    let ring = Ring::<Handle, Owned>::create(
        ns,
        RING_NAME,
        RingConfig::new(RING_CAPACITY).single_producer().single_consumer(),
    )
    .expect("producer: create ring");
    log!("[PRODUCER] pool and ring created in {}", ns.root().display());

    let start = Instant::now();
    let mut next: u64 = 0;
    let mut burst = Vec::with_capacity(BURST);
    let mut ring_full = 0u64;

    while next < FRAMES {
        while burst.len() < BURST && next < FRAMES {
            let Some(h) = pool.allocate() else { break };
            let h = pool.write(h, &next.to_le_bytes()).expect("producer: write");
            burst.push(h);
            next += 1;
        }
        let mut sent = 0;
        while sent < burst.len() {
            let n = ring.enqueue_burst(&burst[sent..]);
            if n == 0 {
                ring_full += 1;
                std::hint::spin_loop();
            }
            sent += n;
        }
        burst.clear();
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    while pool.available() < SLOT_COUNT {
        assert!(Instant::now() < deadline, "producer: slots never came back");
        std::thread::sleep(Duration::from_millis(1));
    }

    log!(
        "[PRODUCER] {FRAMES} frames in {:?}, ring full {ring_full} times",
        start.elapsed()
    );
    assert!(ring.is_empty());
}

fn run_consumer(ns: &ShmNamespace) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let (pool, ring) = loop {
        let attached = Pool::<Attached>::attach(ns, POOL_NAME)
            .and_then(|pool| Ring::<Handle, Attached>::attach(ns, RING_NAME).map(|ring| (pool, ring)));
        match attached {
            Ok(pair) => break pair,
            Err(e) if e.is_not_found() && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("[CONSUMER] attach failed: {e}"),
        }
    };
    log!("[CONSUMER] attached");

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut out = [Handle::default(); BURST];
    let mut expected: u64 = 0;
    while expected < FRAMES {
        assert!(Instant::now() < deadline, "consumer: stalled at {expected}");
        let n = ring.dequeue_burst(&mut out);
        for h in &out[..n] {
            let seq = pool
                .read(h, |b| u64::from_le_bytes(b.try_into().expect("8 byte payload")))
                .expect("consumer: read");
            assert_eq!(seq, expected, "out of order or duplicated frame");
            pool.release(*h).expect("consumer: release");
            expected += 1;
        }
        if n == 0 {
            std::hint::spin_loop();
        }
    }
    log!("[CONSUMER] received {expected} frames in order");
}

#[test]
fn e2e_two_process_pool_ring() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let dir = env::var(ENV_DIR).expect("FERRY_E2E_DIR not set");
        let ns = ShmNamespace::new(dir);
        match role.as_str() {
            ROLE_PRODUCER => run_producer(&ns),
            ROLE_CONSUMER => run_consumer(&ns),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let exe = env::current_exe().expect("current exe");

    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_pool_ring")
            .env(ENV_ROLE, role)
            .env(ENV_DIR, dir.path())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("spawn child")
    };

    let mut producer = spawn(ROLE_PRODUCER);
    let mut consumer = spawn(ROLE_CONSUMER);

    let producer_status = producer.wait().expect("wait producer");
    let consumer_status = consumer.wait().expect("wait consumer");

    assert!(producer_status.success(), "producer failed: {producer_status}");
    assert!(consumer_status.success(), "consumer failed: {consumer_status}");

    let ns = ShmNamespace::new(dir.path());
    assert!(!ns.exists(POOL_NAME), "owner did not unlink the pool");
    assert!(!ns.exists(RING_NAME), "owner did not unlink the ring");
}
