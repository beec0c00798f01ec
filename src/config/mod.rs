//! Configuration loading.
//!
//! Settings come from an optional `config/default.toml` (or an explicit file),
//! then from `POPCHAT__SECTION__KEY` environment variables, and finally fall
//! back to the defaults in [`Settings::default`].

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ChatSettings, ConsumerSettings, OffsetReset, ProducerSettings,
    ServerSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// and merges it with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load("config/default", false)
}

/// Same as [`load_config`] but reads the given file, which must exist.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    load(path, true)
}

fn load(file: &str, required: bool) -> Result<Settings, ConfigError> {
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name(file).required(required))
        .add_source(
            Environment::with_prefix("POPCHAT")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}
