use std::path::Path;

use serde::de::DeserializeOwned;

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "QSYNC";

/// Separator between environment variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
///
/// Example: `QSYNC_CONNECTION__HOST` sets the `connection.host` field.
const ENV_SEPARATOR: &str = "__";

/// Loads a job configuration from `path` and applies environment overrides on top.
///
/// Sources are applied in this order, later ones winning:
/// 1. The job's YAML file at `path` (the file format is inferred from the extension).
/// 2. Environment variables prefixed with `QSYNC_`, nested keys separated by `__`.
pub fn load_config<T>(path: &Path) -> Result<T, config::ConfigError>
where
    T: DeserializeOwned,
{
    let environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true);

    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(environment_source)
        .build()?;

    settings.try_deserialize::<T>()
}
