//! SIGTERM against a real process. Each test re-runs this test binary as a
//! child filtered to itself; the child sees `FERRY_TEARDOWN_ROLE`, sets up
//! its side, installs the signal handler and forwards until the signal
//! arrives. The parent then checks which names survived.

use ferry_forward::{Forwarder, IdleBackoff, Shutdown};
use ferry_icc::{
    Attached, Handle, NamedSemaphore, Owned, Pool, PoolConfig, Ring, RingConfig, ShmNamespace, SlotChannel,
    free_semaphore_name, ready_semaphore_name,
};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

const ROLE_ENV: &str = "FERRY_TEARDOWN_ROLE";
const DIR_ENV: &str = "FERRY_TEARDOWN_DIR";
const CHANNEL_ENV: &str = "FERRY_TEARDOWN_CHANNEL";

const POOL: &str = "MSG_POOL";
const PRI_TO_SEC: &str = "PRI_2_SEC";
const SEC_TO_PRI: &str = "SEC_2_PRI";
const READY_FILE: &str = "child.ready";
const DEADLINE: Duration = Duration::from_secs(10);

fn pool_cfg() -> PoolConfig {
    PoolConfig {
        slot_size: 64,
        slot_count: 31,
    }
}

struct ChildArgs {
    role: String,
    dir: PathBuf,
    channel: String,
}

fn child_args() -> Option<ChildArgs> {
    Some(ChildArgs {
        role: std::env::var(ROLE_ENV).ok()?,
        dir: std::env::var_os(DIR_ENV)?.into(),
        channel: std::env::var(CHANNEL_ENV).ok()?,
    })
}

/// Body of the child process: set up, report ready, forward until SIGTERM.
/// Returning lets every shared object drop.
fn run_child(args: ChildArgs) {
    let shutdown = Shutdown::install().unwrap();
    let ns = ShmNamespace::new(&args.dir);
    let signal_ready = || std::fs::write(args.dir.join(READY_FILE), b"").unwrap();
    let backoff = IdleBackoff::Sleep(Duration::from_millis(1));

    match args.role.as_str() {
        "owner" => {
            let pool = Pool::<Owned>::create(&ns, POOL, pool_cfg()).unwrap();
            let pri_to_sec = Ring::<Handle, Owned>::create(&ns, PRI_TO_SEC, RingConfig::new(16)).unwrap();
            let sec_to_pri = Ring::<Handle, Owned>::create(&ns, SEC_TO_PRI, RingConfig::new(16)).unwrap();
            let chan = SlotChannel::<u16>::create_or_open(&ns, &args.channel).unwrap();
            assert!(chan.is_owner());
            signal_ready();
            Forwarder::new(&sec_to_pri, &pri_to_sec, &pool, 8).backoff(backoff).run(&shutdown);
        }
        "attached" => {
            let pool = Pool::<Attached>::attach(&ns, POOL).unwrap();
            let pri_to_sec = Ring::<Handle, Attached>::attach(&ns, PRI_TO_SEC).unwrap();
            let sec_to_pri = Ring::<Handle, Attached>::attach(&ns, SEC_TO_PRI).unwrap();
            let chan = SlotChannel::<u16>::create_or_open(&ns, &args.channel).unwrap();
            assert!(!chan.is_owner());
            signal_ready();
            Forwarder::new(&pri_to_sec, &sec_to_pri, &pool, 8).backoff(backoff).run(&shutdown);
        }
        other => panic!("unknown child role {other}"),
    }
}

fn spawn_child(test: &str, role: &str, dir: &Path, channel: &str) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(ROLE_ENV, role)
        .env(DIR_ENV, dir)
        .env(CHANNEL_ENV, channel)
        .spawn()
        .unwrap()
}

fn wait_until_ready(child: &mut Child, dir: &Path) {
    let start = Instant::now();
    while !dir.join(READY_FILE).exists() {
        if let Some(status) = child.try_wait().unwrap() {
            panic!("child exited before it was ready: {status}");
        }
        if start.elapsed() > DEADLINE {
            child.kill().unwrap();
            panic!("child never became ready");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn terminate(mut child: Child) {
    let pid = libc::pid_t::try_from(child.id()).unwrap();
    // SAFETY: pid is our own child, which has not been reaped yet
    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if start.elapsed() > DEADLINE {
            child.kill().unwrap();
            panic!("child ignored SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(5));
    };
    assert!(status.success(), "child exited with {status}");
}

fn channel_name(test: &str) -> String {
    format!("ferry-{test}-{}", std::process::id())
}

#[test]
fn owner_unlinks_every_name_on_sigterm() {
    if let Some(args) = child_args() {
        return run_child(args);
    }
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    let channel = channel_name("owner");

    let mut child = spawn_child("owner_unlinks_every_name_on_sigterm", "owner", dir.path(), &channel);
    wait_until_ready(&mut child, dir.path());
    assert!(Pool::<Attached>::attach(&ns, POOL).is_ok());
    terminate(child);

    assert!(Pool::<Attached>::attach(&ns, POOL).unwrap_err().is_not_found());
    for ring in [PRI_TO_SEC, SEC_TO_PRI] {
        assert!(Ring::<Handle, Attached>::attach(&ns, ring).unwrap_err().is_not_found());
    }
    assert!(!ns.exists(&channel));
    for sem in [ready_semaphore_name(&channel), free_semaphore_name(&channel)] {
        assert!(NamedSemaphore::open(&sem).unwrap_err().is_not_found(), "{sem} survived");
    }
}

#[test]
fn attached_process_leaves_names_on_sigterm() {
    if let Some(args) = child_args() {
        return run_child(args);
    }
    let dir = tempfile::tempdir().unwrap();
    let ns = ShmNamespace::new(dir.path());
    let channel = channel_name("attached");

    let _pool = Pool::<Owned>::create(&ns, POOL, pool_cfg()).unwrap();
    let _pri_to_sec = Ring::<Handle, Owned>::create(&ns, PRI_TO_SEC, RingConfig::new(16)).unwrap();
    let _sec_to_pri = Ring::<Handle, Owned>::create(&ns, SEC_TO_PRI, RingConfig::new(16)).unwrap();
    let chan = SlotChannel::<u16>::create_or_open(&ns, &channel).unwrap();
    assert!(chan.is_owner());

    let mut child = spawn_child("attached_process_leaves_names_on_sigterm", "attached", dir.path(), &channel);
    wait_until_ready(&mut child, dir.path());
    terminate(child);

    assert!(Pool::<Attached>::attach(&ns, POOL).is_ok());
    for ring in [PRI_TO_SEC, SEC_TO_PRI] {
        assert!(Ring::<Handle, Attached>::attach(&ns, ring).is_ok());
    }
    assert!(ns.exists(&channel));
    for sem in [ready_semaphore_name(&channel), free_semaphore_name(&channel)] {
        assert!(NamedSemaphore::open(&sem).is_ok(), "{sem} was removed");
    }
    assert!(chan.send_timeout(7, Duration::from_secs(1)).unwrap());
}
