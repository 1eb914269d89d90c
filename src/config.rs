use ::config::{Config, ConfigError};

// Looks up `{name}.{key}` first, then the bare `{key}`.
pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

/// Millisecond values. A missing key yields `default`; a present but
/// malformed key is an error.
pub(crate) fn get_namespaced_millis(
    config: &Config,
    name: &str,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key)) {
        Ok(value) => Ok(value),
        Err(ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err),
    }
}

pub(crate) fn get_namespaced_optional_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<Option<String>, ConfigError> {
    match get_namespaced_value(config, name, key, Config::get_string) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
