//! Engine configuration: structured layers and live property updates.

mod load;
mod props;
mod schema;

pub use load::{ConfigError, apply_env_overrides, load};
pub use props::Properties;
pub use schema::{
    Config, ConfigLayer, MetaClientConfig, MetaClientConfigOverride, ReplicatorConfig,
    ReplicatorConfigOverride, RsReaderConfig, RsReaderConfigOverride,
};
