//! Writer side of the single-slot channel. Sends a running `u16` counter,
//! one value per turn, until `[channel] count` values are sent or a signal
//! arrives.
//!
//! ```sh
//! ferry-slot-writer [config.toml]
//! ```

use anyhow::{Context, Result};
use ferry_config::FerryConfig;
use ferry_forward::{Shutdown, init_tracing};
use ferry_icc::{ShmNamespace, SlotChannel};
use std::time::Duration;

/// Upper bound on one blocking wait, so a signal is noticed promptly.
const TURN_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive empty waits before checking whether the channel owner left.
const ORPHAN_CHECK_TIMEOUTS: u32 = 10;

fn main() -> Result<()> {
    let cfg = FerryConfig::load_or_default(std::env::args().nth(1)).context("loading configuration")?;
    init_tracing(&cfg.log_level);
    let shutdown = Shutdown::install().context("installing signal handler")?;
    let ns = ShmNamespace::new(&cfg.shm_dir);
    let name = &cfg.channel.name;

    if cfg.reclaim_stale && SlotChannel::<u16>::purge(&ns, name).context("purging stale channel")? {
        tracing::warn!(name = %name, "removed stale channel");
    }

    let chan = SlotChannel::<u16>::create_or_open(&ns, name).with_context(|| format!("opening channel '{name}'"))?;
    tracing::info!(name = %name, owner = chan.is_owner(), "writer ready");

    let mut sent: u64 = 0;
    let mut value: u16 = 0;
    let mut timeouts: u32 = 0;
    while !shutdown.is_requested() && cfg.channel.count.is_none_or(|count| sent < count) {
        if chan.send_timeout(value, TURN_TIMEOUT).context("sending")? {
            tracing::debug!(value, "wrote");
            value = value.wrapping_add(1);
            sent += 1;
            timeouts = 0;
            continue;
        }
        timeouts += 1;
        if timeouts % ORPHAN_CHECK_TIMEOUTS == 0 && chan.is_unlinked() {
            tracing::info!(name = %name, "channel owner is gone");
            break;
        }
    }

    tracing::info!(sent, "writer exiting");
    Ok(())
}
