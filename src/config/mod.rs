mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, ServerSettings, Settings};

/// Prefix of environment overrides, e.g. `MQTTD_SERVER__PORT=1884`.
pub const ENV_PREFIX: &str = "MQTTD";

/// Loads the configuration from `config/default` (if present) and
/// environment variables, merged over default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(File::with_name("config/default").required(false))
}

/// Like `load_config`, but reads the given file, which must exist.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    load(File::with_name(path).required(true))
}

fn load<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge_with_defaults())
}
