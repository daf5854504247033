//! Secondary process: attaches to the primary's pool and rings (waiting for
//! them to appear) and runs one consumer role until SIGINT/SIGTERM. It never
//! unlinks anything.
//!
//! ```sh
//! ferry-secondary [config.toml]
//! ```

use anyhow::{Context, Result, bail};
use ferry_config::{FerryConfig, SecondaryRole};
use ferry_forward::{Discard, Forwarder, Shutdown, init_tracing};
use ferry_icc::{Attached, Handle, Pool, Ring, ShmNamespace};
use std::time::Duration;

const ATTACH_BACKOFF_MIN: Duration = Duration::from_millis(1);
const ATTACH_BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Retries `attach` while the object does not exist yet.
fn attach_with_retry<T>(
    what: &str,
    shutdown: &Shutdown,
    mut attach: impl FnMut() -> ferry_icc::Result<T>,
) -> Result<T> {
    let mut delay = ATTACH_BACKOFF_MIN;
    let mut waited = false;
    loop {
        match attach() {
            Ok(obj) => return Ok(obj),
            Err(e) if e.is_not_found() => {
                if !waited {
                    tracing::info!(what, "waiting for primary");
                    waited = true;
                }
                if shutdown.is_requested() {
                    bail!("shut down while waiting for {what}");
                }
                std::thread::sleep(delay);
                delay = (delay * 2).min(ATTACH_BACKOFF_MAX);
            }
            Err(e) => return Err(e).with_context(|| format!("attaching {what}")),
        }
    }
}

fn main() -> Result<()> {
    let cfg = FerryConfig::load_or_default(std::env::args().nth(1)).context("loading configuration")?;
    init_tracing(&cfg.log_level);
    let shutdown = Shutdown::install().context("installing signal handler")?;
    let ns = ShmNamespace::new(&cfg.shm_dir);

    let pool = attach_with_retry(&format!("pool '{}'", cfg.pool.name), &shutdown, || {
        Pool::<Attached>::attach(&ns, &cfg.pool.name)
    })?;
    let pri_to_sec = attach_with_retry(&format!("ring '{}'", cfg.rings.pri_to_sec), &shutdown, || {
        Ring::<Handle, Attached>::attach(&ns, &cfg.rings.pri_to_sec)
    })?;

    let role = cfg.secondary.role;
    tracing::info!(?role, "secondary ready");

    let stats = match role {
        SecondaryRole::Drain => {
            let mut drain = Forwarder::configured(&pri_to_sec, Discard::new(&pool), &pool, &cfg.forward);
            let stats = drain.run(&shutdown);
            tracing::info!(
                frames = drain.sink().frames(),
                bytes = drain.sink().bytes(),
                last_seq = ?drain.sink().last_seq(),
                "drained"
            );
            stats
        }
        SecondaryRole::Echo => {
            let sec_to_pri = attach_with_retry(&format!("ring '{}'", cfg.rings.sec_to_pri), &shutdown, || {
                Ring::<Handle, Attached>::attach(&ns, &cfg.rings.sec_to_pri)
            })?;
            Forwarder::configured(&pri_to_sec, &sec_to_pri, &pool, &cfg.forward).run(&shutdown)
        }
    };

    tracing::info!(
        received = stats.received,
        delivered = stats.delivered,
        reclaimed = stats.reclaimed,
        "secondary exiting"
    );
    Ok(())
}
