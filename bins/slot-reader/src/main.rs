//! Reader side of the single-slot channel. Logs every value and flags gaps
//! in the writer's counter.
//!
//! ```sh
//! ferry-slot-reader [config.toml]
//! ```

use anyhow::{Context, Result};
use ferry_config::FerryConfig;
use ferry_forward::{Shutdown, init_tracing};
use ferry_icc::{ShmNamespace, SlotChannel};
use std::time::Duration;

const TURN_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive empty waits before checking whether the channel owner left.
const ORPHAN_CHECK_TIMEOUTS: u32 = 10;

fn main() -> Result<()> {
    let cfg = FerryConfig::load_or_default(std::env::args().nth(1)).context("loading configuration")?;
    init_tracing(&cfg.log_level);
    let shutdown = Shutdown::install().context("installing signal handler")?;
    let ns = ShmNamespace::new(&cfg.shm_dir);
    let name = &cfg.channel.name;

    let chan = SlotChannel::<u16>::create_or_open(&ns, name).with_context(|| format!("opening channel '{name}'"))?;
    tracing::info!(name = %name, owner = chan.is_owner(), "reader ready");

    let mut received: u64 = 0;
    let mut expected: Option<u16> = None;
    let mut timeouts: u32 = 0;
    while !shutdown.is_requested() {
        let Some(value) = chan.receive_timeout(TURN_TIMEOUT).context("receiving")? else {
            timeouts += 1;
            if timeouts % ORPHAN_CHECK_TIMEOUTS == 0 && chan.is_unlinked() {
                tracing::info!(name = %name, "channel owner is gone");
                break;
            }
            continue;
        };
        timeouts = 0;
        tracing::info!(value, "read");
        if let Some(want) = expected.filter(|want| *want != value) {
            tracing::warn!(expected = want, got = value, "counter gap");
        }
        expected = Some(value.wrapping_add(1));
        received += 1;
    }

    tracing::info!(received, "reader exiting");
    Ok(())
}
