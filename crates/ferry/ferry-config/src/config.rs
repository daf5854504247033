use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Shared configuration of the primary, secondary and slot channel processes.
///
/// Every field has a default, so an empty file (or no file) is a valid
/// configuration matching the classic two-ring layout.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FerryConfig {
    /// Directory holding the named shared segments.
    #[serde(default = "defaults::shm_dir")]
    pub shm_dir: PathBuf,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Remove names a crashed creator left behind before creating them again.
    #[serde(default)]
    pub reclaim_stale: bool,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub rings: RingsSection,
    #[serde(default)]
    pub forward: ForwardSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub primary: PrimarySection,
    #[serde(default)]
    pub secondary: SecondarySection,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    #[serde(default = "defaults::pool_name")]
    pub name: String,
    #[serde(default = "defaults::slot_size")]
    pub slot_size: usize,
    #[serde(default = "defaults::slot_count")]
    pub slot_count: usize,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RingsSection {
    /// Primary to secondary.
    #[serde(default = "defaults::pri_to_sec")]
    pub pri_to_sec: String,
    /// Secondary to primary.
    #[serde(default = "defaults::sec_to_pri")]
    pub sec_to_pri: String,
    #[serde(default = "defaults::ring_capacity")]
    pub capacity: usize,
    #[serde(default = "defaults::yes")]
    pub single_producer: bool,
    #[serde(default = "defaults::yes")]
    pub single_consumer: bool,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdlePolicy {
    Spin,
    Yield,
    #[default]
    Sleep,
    Exponential,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ForwardSection {
    #[serde(default = "defaults::burst_size")]
    pub burst_size: usize,
    #[serde(default)]
    pub idle: IdlePolicy,
    /// Sleep after an empty poll; the starting sleep for `exponential`.
    #[serde(default = "defaults::idle_sleep_us")]
    pub idle_sleep_us: u64,
    /// Ceiling for `exponential`.
    #[serde(default = "defaults::max_idle_sleep_us")]
    pub max_idle_sleep_us: u64,
    /// Consecutive zero-admission retries before the unaccepted tail of a
    /// burst is released. Absent means retry until shutdown.
    #[serde(default)]
    pub max_stalls: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    #[serde(default = "defaults::channel_name")]
    pub name: String,
    /// Values the writer sends before exiting; absent means until shutdown.
    #[serde(default)]
    pub count: Option<u64>,
}

/// What the primary runs. Pairings that move frames end to end:
///
/// | primary | secondary |
/// |---------|-----------|
/// | `rxtx`  | `echo`    |
/// | `rx`    | `drain`   |
///
/// `loopback` and `tx` only forward what some other producer puts on the
/// secondary to primary ring.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryRole {
    /// Generates frames into the primary to secondary ring and transmits
    /// whatever comes back, one thread each.
    #[default]
    RxTx,
    /// Returns what comes back from the secondary to it again.
    Loopback,
    /// Generates frames into the primary to secondary ring.
    Rx,
    /// Drains the secondary to primary ring into a discarding transmitter.
    Tx,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryRole {
    /// Sends every frame back to the primary.
    #[default]
    Echo,
    /// Consumes and releases every frame.
    Drain,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PrimarySection {
    #[serde(default)]
    pub role: PrimaryRole,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SecondarySection {
    #[serde(default)]
    pub role: SecondaryRole,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    use std::path::PathBuf;

    pub fn shm_dir() -> PathBuf {
        "/dev/shm".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn pool_name() -> String {
        "MSG_POOL".into()
    }

    /// Default mbuf data room plus headroom.
    pub fn slot_size() -> usize {
        2176
    }

    pub fn slot_count() -> usize {
        8191
    }

    pub fn pri_to_sec() -> String {
        "PRI_2_SEC".into()
    }

    pub fn sec_to_pri() -> String {
        "SEC_2_PRI".into()
    }

    pub fn ring_capacity() -> usize {
        2048
    }

    pub fn yes() -> bool {
        true
    }

    pub fn burst_size() -> usize {
        32
    }

    pub fn idle_sleep_us() -> u64 {
        5
    }

    pub fn max_idle_sleep_us() -> u64 {
        1_000
    }

    pub fn channel_name() -> String {
        "ferry_slot".into()
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            name: defaults::pool_name(),
            slot_size: defaults::slot_size(),
            slot_count: defaults::slot_count(),
        }
    }
}

impl Default for RingsSection {
    fn default() -> Self {
        Self {
            pri_to_sec: defaults::pri_to_sec(),
            sec_to_pri: defaults::sec_to_pri(),
            capacity: defaults::ring_capacity(),
            single_producer: true,
            single_consumer: true,
        }
    }
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            burst_size: defaults::burst_size(),
            idle: IdlePolicy::default(),
            idle_sleep_us: defaults::idle_sleep_us(),
            max_idle_sleep_us: defaults::max_idle_sleep_us(),
            max_stalls: None,
        }
    }
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            name: defaults::channel_name(),
            count: None,
        }
    }
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            shm_dir: defaults::shm_dir(),
            log_level: defaults::log_level(),
            reclaim_stale: false,
            pool: PoolSection::default(),
            rings: RingsSection::default(),
            forward: ForwardSection::default(),
            channel: ChannelSection::default(),
            primary: PrimarySection::default(),
            secondary: SecondarySection::default(),
        }
    }
}

impl FerryConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    /// `path` is normally the first command line argument; without one the
    /// built-in defaults apply.
    pub fn load_or_default(path: Option<String>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Parses and validates a configuration document.
    pub fn parse(doc: &str) -> Result<Self, ConfigError> {
        let ferry_config: FerryConfig = toml::from_str(doc)?;
        ferry_config.validate()?;
        Ok(ferry_config)
    }

    /// Whether the primary and secondary roles together produce frames and
    /// consume them, see [`PrimaryRole`].
    pub fn moves_frames(&self) -> bool {
        matches!(
            (self.primary.role, self.secondary.role),
            (PrimaryRole::RxTx, SecondaryRole::Echo) | (PrimaryRole::Rx, SecondaryRole::Drain)
        )
    }

    /// Rejects values the transports would refuse at creation time, so a bad
    /// file fails before any shared object is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pool.slot_size == 0 || self.pool.slot_count == 0 {
            return invalid("pool.slot_size and pool.slot_count must be non-zero".into());
        }
        if self.pool.slot_count >= u32::MAX as usize {
            return invalid(format!("pool.slot_count {} does not fit in 32 bits", self.pool.slot_count));
        }
        if self.pool.slot_size > u32::MAX as usize {
            return invalid(format!("pool.slot_size {} does not fit in 32 bits", self.pool.slot_size));
        }
        if !self.rings.capacity.is_power_of_two() {
            return invalid(format!("rings.capacity {} is not a power of two", self.rings.capacity));
        }
        if self.forward.burst_size == 0 || self.forward.burst_size > self.rings.capacity {
            return invalid(format!(
                "forward.burst_size {} must be between 1 and rings.capacity",
                self.forward.burst_size
            ));
        }
        if self.forward.idle == IdlePolicy::Exponential
            && (self.forward.idle_sleep_us == 0 || self.forward.idle_sleep_us > self.forward.max_idle_sleep_us)
        {
            return invalid("forward.idle_sleep_us must be non-zero and at most forward.max_idle_sleep_us".into());
        }

        let names = [
            ("pool.name", &self.pool.name),
            ("rings.pri_to_sec", &self.rings.pri_to_sec),
            ("rings.sec_to_pri", &self.rings.sec_to_pri),
            ("channel.name", &self.channel.name),
        ];
        for (i, (key, name)) in names.iter().enumerate() {
            if name.is_empty() || name.contains('/') || name.contains('\0') || name.len() > 200 {
                return invalid(format!("{key} '{name}' is not a usable shared object name"));
            }
            if let Some((other, _)) = names[..i].iter().find(|(_, n)| n == name) {
                return invalid(format!("{key} and {other} are both '{name}'"));
            }
        }
        Ok(())
    }
}
