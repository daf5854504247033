//! Primary process: creates the pool and both rings, then runs one role
//! until SIGINT/SIGTERM. Dropping the owned objects on the way out unlinks
//! their names.
//!
//! ```sh
//! ferry-primary [config.toml]
//! ```

use anyhow::{Context, Result};
use ferry_config::{FerryConfig, PrimaryRole, RingsSection};
use ferry_forward::{Discard, Forwarder, Generator, RemainderPolicy, Shutdown, init_tracing};
use ferry_icc::{Attached, Handle, Owned, Pool, PoolConfig, Ring, RingConfig, ShmNamespace, SyncMode};

/// Frame size the rx stand-in produces.
const FRAME_LEN: usize = 64;

fn ring_config(rings: &RingsSection) -> Result<RingConfig> {
    let mode = |single: bool| if single { SyncMode::Single } else { SyncMode::Multi };
    Ok(RingConfig::try_new(rings.capacity)?.with_modes(mode(rings.single_producer), mode(rings.single_consumer)))
}

fn main() -> Result<()> {
    let cfg = FerryConfig::load_or_default(std::env::args().nth(1)).context("loading configuration")?;
    init_tracing(&cfg.log_level);
    let shutdown = Shutdown::install().context("installing signal handler")?;
    let ns = ShmNamespace::new(&cfg.shm_dir);

    if cfg.reclaim_stale {
        for name in [&cfg.pool.name, &cfg.rings.pri_to_sec, &cfg.rings.sec_to_pri] {
            if ns.remove(name).with_context(|| format!("removing stale '{name}'"))? {
                tracing::warn!(name = %name, "removed stale shared object");
            }
        }
    }

    let pool = Pool::<Owned>::create(
        &ns,
        &cfg.pool.name,
        PoolConfig {
            slot_size: cfg.pool.slot_size,
            slot_count: cfg.pool.slot_count,
        },
    )
    .with_context(|| format!("creating pool '{}'", cfg.pool.name))?;

    let ring_cfg = ring_config(&cfg.rings)?;
    let pri_to_sec = Ring::<Handle, Owned>::create(&ns, &cfg.rings.pri_to_sec, ring_cfg)
        .with_context(|| format!("creating ring '{}'", cfg.rings.pri_to_sec))?;
    let sec_to_pri = Ring::<Handle, Owned>::create(&ns, &cfg.rings.sec_to_pri, ring_cfg)
        .with_context(|| format!("creating ring '{}'", cfg.rings.sec_to_pri))?;

    let role = cfg.primary.role;
    tracing::info!(?role, shm_dir = %cfg.shm_dir.display(), "primary ready");
    if !cfg.moves_frames() {
        tracing::warn!(?role, secondary = ?cfg.secondary.role, "roles do not move frames on their own");
    }

    let stats = match role {
        PrimaryRole::RxTx => {
            let rx_pool = Pool::<Attached>::attach(&ns, &cfg.pool.name).context("attaching rx pool handle")?;
            let (rx, tx) = std::thread::scope(|s| {
                let rx = s.spawn(|| {
                    Forwarder::configured(Generator::new(rx_pool, FRAME_LEN), &pri_to_sec, &pool, &cfg.forward)
                        .run(&shutdown)
                });
                let mut tx = Forwarder::configured(&sec_to_pri, Discard::new(&pool), &pool, &cfg.forward)
                    .remainder(RemainderPolicy::Release);
                let stats = tx.run(&shutdown);
                tracing::info!(frames = tx.sink().frames(), bytes = tx.sink().bytes(), "transmitted");
                (rx.join(), stats)
            });
            let rx = rx.map_err(|_| anyhow::anyhow!("rx thread panicked"))?;
            tracing::info!(generated = rx.delivered, "rx finished");
            tx
        }
        PrimaryRole::Loopback => Forwarder::configured(&sec_to_pri, &pri_to_sec, &pool, &cfg.forward).run(&shutdown),
        PrimaryRole::Rx => {
            let rx_pool = Pool::<Attached>::attach(&ns, &cfg.pool.name).context("attaching rx pool handle")?;
            let generator = Generator::new(rx_pool, FRAME_LEN);
            Forwarder::configured(generator, &pri_to_sec, &pool, &cfg.forward).run(&shutdown)
        }
        PrimaryRole::Tx => {
            let mut tx = Forwarder::configured(&sec_to_pri, Discard::new(&pool), &pool, &cfg.forward)
                .remainder(RemainderPolicy::Release);
            let stats = tx.run(&shutdown);
            tracing::info!(frames = tx.sink().frames(), bytes = tx.sink().bytes(), "transmitted");
            stats
        }
    };

    tracing::info!(
        received = stats.received,
        delivered = stats.delivered,
        reclaimed = stats.reclaimed,
        pool_in_use = pool.in_use(),
        "primary exiting"
    );
    Ok(())
}
