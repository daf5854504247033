mod config;

pub use config::{
    ChannelSection, ConfigError, FerryConfig, ForwardSection, IdlePolicy, PoolSection, PrimaryRole, PrimarySection,
    RingsSection, SecondaryRole, SecondarySection,
};
