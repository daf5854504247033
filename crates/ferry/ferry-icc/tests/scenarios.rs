//! Pool and ring working together the way a producer and a consumer use them.

use ferry_icc::{Attached, Handle, IccError, Owned, Pool, PoolConfig, Ring, RingConfig, ShmNamespace};

fn ns() -> (tempfile::TempDir, ShmNamespace) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ns = ShmNamespace::new(dir.path());
    (dir, ns)
}

fn frame(pool: &mut Pool<Owned>, tag: u8) -> Handle {
    let h = pool.allocate().expect("pool has a free slot");
    pool.write(h, &[tag]).expect("one byte fits")
}

fn tags(pool: &Pool<Owned>, handles: &[Handle]) -> Vec<u8> {
    handles
        .iter()
        .map(|h| pool.read(h, |b| b[0]).expect("live handle"))
        .collect()
}

#[test]
fn full_ring_rejects_until_consumer_drains() {
    let (_dir, ns) = ns();
    let mut pool = Pool::<Owned>::create(&ns, "pool", PoolConfig { slot_size: 8, slot_count: 4 }).unwrap();
    let ring = Ring::<Handle, Owned>::create(&ns, "ring", RingConfig::new(4)).unwrap();
    let consumer = Ring::<Handle, Attached>::attach(&ns, "ring").unwrap();

    let batch: Vec<Handle> = b"ABCD".iter().map(|&t| frame(&mut pool, t)).collect();
    assert_eq!(ring.enqueue_burst(&batch), 4);
    assert!(ring.is_full());

    // the pool is exhausted too, so E reuses a slot once A comes back
    assert_eq!(pool.allocate(), None);
    let stand_in = Handle { index: 0, generation: 0, len: 1 };
    assert_eq!(ring.enqueue_burst(&[stand_in]), 0);

    let mut out = [Handle::default(); 2];
    assert_eq!(consumer.dequeue_burst(&mut out), 2);
    assert_eq!(tags(&pool, &out), b"AB");
    for h in out {
        pool.release(h).unwrap();
    }

    let e = frame(&mut pool, b'E');
    assert_eq!(ring.enqueue_burst(&[e]), 1);

    let mut rest = [Handle::default(); 4];
    assert_eq!(consumer.dequeue_burst(&mut rest), 3);
    assert_eq!(tags(&pool, &rest[..3]), b"CDE");
}

#[test]
fn slot_round_trip_restores_pool() {
    let (_dir, ns) = ns();
    let mut pool = Pool::<Owned>::create(&ns, "pool", PoolConfig { slot_size: 32, slot_count: 8 }).unwrap();
    let ring = Ring::<Handle, Owned>::create(&ns, "ring", RingConfig::new(8)).unwrap();
    let available = pool.available();

    let h = frame(&mut pool, 9);
    assert!(ring.enqueue(h).is_ok());
    let got = ring.dequeue().expect("one entry");
    assert_eq!(got, h);
    pool.release(got).unwrap();

    assert_eq!(pool.available(), available);
    assert!(matches!(pool.release(got), Err(IccError::DoubleRelease { .. })));
}

#[test]
fn attach_reports_missing_objects() {
    let (_dir, ns) = ns();
    assert!(Pool::<Attached>::attach(&ns, "pool").unwrap_err().is_not_found());
    assert!(Ring::<Handle, Attached>::attach(&ns, "ring").unwrap_err().is_not_found());
}

#[test]
fn ring_of_handles_rejects_other_element_types() {
    let (_dir, ns) = ns();
    let _ring = Ring::<Handle, Owned>::create(&ns, "ring", RingConfig::new(8)).unwrap();
    assert!(matches!(
        Ring::<u64, Attached>::attach(&ns, "ring"),
        Err(IccError::InvalidLayout { .. })
    ));
    assert!(matches!(
        Pool::<Attached>::attach(&ns, "ring"),
        Err(IccError::InvalidLayout { .. })
    ));
}

/// Size of the tmpfs behind `dir`, or `None` if it is not a size-limited tmpfs.
#[cfg(target_os = "linux")]
fn tmpfs_bytes(dir: &std::path::Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(dir.as_os_str().as_bytes()).ok()?;
    // SAFETY: statfs is plain old data and fully written on success
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(path.as_ptr(), &mut st) } != 0 || st.f_type as i64 != libc::TMPFS_MAGIC as i64 {
        return None;
    }
    let total = st.f_blocks as u64 * st.f_bsize as u64;
    (total > 0).then_some(total)
}

#[cfg(target_os = "linux")]
#[test]
fn objects_larger_than_the_namespace_fail_to_create() {
    let Some(total) = tmpfs_bytes(std::path::Path::new("/dev/shm")) else {
        eprintln!("/dev/shm is not a size-limited tmpfs, skipping");
        return;
    };
    let dir = tempfile::tempdir_in("/dev/shm").expect("tempdir in /dev/shm");
    let ns = ShmNamespace::new(dir.path());

    let slot_size = 1 << 20;
    let slot_count = (total / slot_size as u64) as usize + 2;
    let err = Pool::<Owned>::create(&ns, "huge-pool", PoolConfig { slot_size, slot_count }).unwrap_err();
    assert!(matches!(err, IccError::ResourceExhausted { .. }), "{err:?}");

    let capacity = ((total / 8) as usize + 1).next_power_of_two();
    let err = Ring::<u64, Owned>::create(&ns, "huge-ring", RingConfig::new(capacity)).unwrap_err();
    assert!(matches!(err, IccError::ResourceExhausted { .. }), "{err:?}");

    // neither the public names nor any staging file are left behind
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}
