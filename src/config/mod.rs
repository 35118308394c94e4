//! Layered configuration: an optional file, then `CROSSBAR__*` environment
//! variables, merged over built-in defaults.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, Environment, File};

use crate::utils::Result;

pub use settings::{
    BrokerSettings, DEFAULT_TERMINATION_SECS, LoggingSettings, ServerSettings, Settings,
};

pub const ENV_PREFIX: &str = "CROSSBAR";
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

/// Loads the configuration from `config/default` and the environment.
pub fn load_config() -> Result<Settings> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Loads the configuration from `path` (extension optional, file optional)
/// and the environment, e.g. `CROSSBAR__BROKER__CACHE_MESSAGES=false`.
pub fn load_config_from(path: &str) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_over(Settings::default()))
}
